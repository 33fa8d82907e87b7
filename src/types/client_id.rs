use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// A client identifier.
///
/// Client ids are URLs. Two partitions get special treatment:
/// - loopback ids (`http://localhost[?...]`) have their metadata synthesized
///   by the loopback policy instead of being fetched;
/// - discoverable ids (any https URL with a path) double as the location of
///   the client metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(client_id: impl Into<String>) -> Result<Self, ClientIdError> {
        let client_id = client_id.into();
        if client_id.is_empty() {
            return Err(ClientIdError::Empty);
        }
        Ok(Self(client_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_loopback(&self) -> bool {
        LoopbackClientId::new(&self.0).is_ok()
    }

    pub fn is_discoverable(&self) -> bool {
        DiscoverableClientId::new(&self.0).is_ok()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ClientIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(client_id: ClientId) -> Self {
        client_id.0
    }
}

/// Errors that can occur when creating a ClientId.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientIdError {
    #[error("Client id cannot be empty")]
    Empty,
    #[error("Client id must be a valid URL")]
    NotAUrl,
    #[error("Loopback client id must use http://localhost")]
    InvalidLoopback,
    #[error("Discoverable client id must be an https URL with a path")]
    InvalidDiscoverable,
    #[error("Client id must not contain credentials")]
    ContainsCredentials,
}

/// A loopback client id: `http://localhost` with an optional query carrying
/// `redirect_uri` (repeatable) and `scope` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackClientId {
    client_id: ClientId,
    redirect_uris: Vec<String>,
    scope: Option<String>,
}

impl LoopbackClientId {
    pub fn new(client_id: impl Into<String>) -> Result<Self, ClientIdError> {
        let client_id = client_id.into();
        let url = Url::parse(&client_id).map_err(|_| ClientIdError::NotAUrl)?;

        if url.scheme() != "http"
            || url.host_str() != Some("localhost")
            || url.port().is_some()
            || (url.path() != "/" && !url.path().is_empty())
            || url.fragment().is_some()
        {
            return Err(ClientIdError::InvalidLoopback);
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ClientIdError::ContainsCredentials);
        }

        let mut redirect_uris = Vec::new();
        let mut scope = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "redirect_uri" => redirect_uris.push(value.into_owned()),
                "scope" => scope = Some(value.into_owned()),
                _ => return Err(ClientIdError::InvalidLoopback),
            }
        }

        Ok(Self {
            client_id: ClientId::new(client_id)?,
            redirect_uris,
            scope,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Redirect URIs declared in the query, or the conventional loopback
    /// defaults when none are given.
    pub fn redirect_uris(&self) -> Vec<String> {
        if self.redirect_uris.is_empty() {
            vec![
                "http://127.0.0.1/".to_string(),
                "http://[::1]/".to_string(),
            ]
        } else {
            self.redirect_uris.clone()
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

/// A discoverable client id: an https URL (non-IP host, no credentials, no
/// fragment) at which the client metadata document is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverableClientId {
    client_id: ClientId,
    url: Url,
}

impl DiscoverableClientId {
    pub fn new(client_id: impl Into<String>) -> Result<Self, ClientIdError> {
        let client_id = client_id.into();
        let url = Url::parse(&client_id).map_err(|_| ClientIdError::NotAUrl)?;

        if url.scheme() != "https" || url.fragment().is_some() {
            return Err(ClientIdError::InvalidDiscoverable);
        }
        match url.host() {
            Some(url::Host::Domain(_)) => {}
            _ => return Err(ClientIdError::InvalidDiscoverable),
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ClientIdError::ContainsCredentials);
        }
        // A bare origin is not a document location.
        if url.path() == "/" || url.path().is_empty() {
            return Err(ClientIdError::InvalidDiscoverable);
        }

        Ok(Self {
            client_id: ClientId::new(client_id)?,
            url,
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_classification() {
        assert!(ClientId::new("http://localhost").unwrap().is_loopback());
        assert!(ClientId::new("http://localhost/").unwrap().is_loopback());
        assert!(!ClientId::new("http://localhost:8080")
            .unwrap()
            .is_loopback());
        assert!(!ClientId::new("https://app.example.com/client-metadata.json")
            .unwrap()
            .is_loopback());
    }

    #[test]
    fn test_loopback_query_parameters() {
        let loopback = LoopbackClientId::new(
            "http://localhost?redirect_uri=http%3A%2F%2F127.0.0.1%3A8080%2Fcb&scope=atproto",
        )
        .unwrap();
        assert_eq!(loopback.redirect_uris(), vec!["http://127.0.0.1:8080/cb"]);
        assert_eq!(loopback.scope(), Some("atproto"));

        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        assert_eq!(
            loopback.redirect_uris(),
            vec!["http://127.0.0.1/", "http://[::1]/"]
        );
        assert_eq!(loopback.scope(), None);
    }

    #[test]
    fn test_loopback_rejects_unknown_parameters() {
        assert_eq!(
            LoopbackClientId::new("http://localhost?foo=bar").unwrap_err(),
            ClientIdError::InvalidLoopback
        );
    }

    #[test]
    fn test_discoverable_classification() {
        assert!(
            ClientId::new("https://app.example.com/client-metadata.json")
                .unwrap()
                .is_discoverable()
        );
        // Bare origins and IP hosts are not discoverable.
        assert!(!ClientId::new("https://app.example.com")
            .unwrap()
            .is_discoverable());
        assert!(!ClientId::new("https://127.0.0.1/client-metadata.json")
            .unwrap()
            .is_discoverable());
        assert!(!ClientId::new("http://app.example.com/client-metadata.json")
            .unwrap()
            .is_discoverable());
    }

    #[test]
    fn test_empty_client_id() {
        assert_eq!(ClientId::new("").unwrap_err(), ClientIdError::Empty);
    }
}
