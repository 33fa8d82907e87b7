use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// The issuer identifier of the authorization server.
///
/// An https origin URL with no credentials, query or fragment. Loopback
/// hosts are allowed over plain http for development setups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Issuer(String);

impl Issuer {
    pub fn new(issuer: impl Into<String>) -> Result<Self, IssuerError> {
        let issuer = issuer.into();
        let url = Url::parse(&issuer).map_err(|_| IssuerError::NotAUrl)?;

        match url.scheme() {
            "https" => {}
            "http" => {
                let host = url.host_str().unwrap_or_default();
                if host != "localhost" && host != "127.0.0.1" && host != "[::1]" {
                    return Err(IssuerError::InsecureScheme);
                }
            }
            _ => return Err(IssuerError::InsecureScheme),
        }

        if !url.username().is_empty() || url.password().is_some() {
            return Err(IssuerError::ContainsCredentials);
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(IssuerError::NotAnOrigin);
        }
        if url.path() != "/" && !url.path().is_empty() {
            return Err(IssuerError::NotAnOrigin);
        }

        // Normalized form without the trailing slash.
        Ok(Self(url.origin().ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Resolve a path under this issuer (used for `htu` checks and
    /// endpoint URLs in the server metadata document).
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.0, path)
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Issuer {
    type Err = IssuerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Issuer {
    type Error = IssuerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Issuer> for String {
    fn from(issuer: Issuer) -> Self {
        issuer.0
    }
}

/// Errors that can occur when creating an Issuer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IssuerError {
    #[error("Issuer must be a valid URL")]
    NotAUrl,
    #[error("Issuer must use the https scheme")]
    InsecureScheme,
    #[error("Issuer must not contain credentials")]
    ContainsCredentials,
    #[error("Issuer must be an origin (no path, query or fragment)")]
    NotAnOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_issuer() {
        let issuer = Issuer::new("https://auth.example.com").unwrap();
        assert_eq!(issuer.as_str(), "https://auth.example.com");
        let issuer = Issuer::new("https://auth.example.com/").unwrap();
        assert_eq!(issuer.as_str(), "https://auth.example.com");
    }

    #[test]
    fn test_loopback_http_allowed() {
        assert!(Issuer::new("http://localhost:2583").is_ok());
        assert!(Issuer::new("http://example.com").is_err());
    }

    #[test]
    fn test_invalid_issuers() {
        assert_eq!(
            Issuer::new("https://user:pw@example.com").unwrap_err(),
            IssuerError::ContainsCredentials
        );
        assert_eq!(
            Issuer::new("https://example.com/auth").unwrap_err(),
            IssuerError::NotAnOrigin
        );
        assert_eq!(
            Issuer::new("https://example.com/?x=1").unwrap_err(),
            IssuerError::NotAnOrigin
        );
        assert_eq!(Issuer::new("not a url").unwrap_err(), IssuerError::NotAUrl);
    }

    #[test]
    fn test_endpoint() {
        let issuer = Issuer::new("https://auth.example.com").unwrap();
        assert_eq!(
            issuer.endpoint("/oauth/token"),
            "https://auth.example.com/oauth/token"
        );
    }
}
