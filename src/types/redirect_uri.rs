use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// A registered redirect URI.
///
/// Three shapes are accepted: https URLs, plain-http URLs on a loopback IP
/// literal (RFC 8252 section 7.3), and private-use schemes with a dotted,
/// reverse-domain scheme name (RFC 8252 section 7.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RedirectUri {
    Https(String),
    Loopback(String),
    PrivateUse(String),
}

impl RedirectUri {
    pub fn new(uri: impl Into<String>) -> Result<Self, RedirectUriError> {
        let uri = uri.into();
        let url = Url::parse(&uri).map_err(|_| RedirectUriError::NotAUrl)?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(RedirectUriError::ContainsCredentials);
        }
        if url.fragment().is_some() {
            return Err(RedirectUriError::ContainsFragment);
        }

        match url.scheme() {
            "https" => Ok(RedirectUri::Https(uri)),
            "http" => match url.host_str() {
                Some("127.0.0.1") | Some("[::1]") => Ok(RedirectUri::Loopback(uri)),
                // rfc8252 section 8.3: "localhost" may listen on non-loopback
                // interfaces; the IP literal is required instead.
                Some("localhost") => Err(RedirectUriError::LocalhostForbidden),
                _ => Err(RedirectUriError::InsecureScheme),
            },
            scheme if scheme.contains('.') => Ok(RedirectUri::PrivateUse(uri)),
            _ => Err(RedirectUriError::InvalidScheme),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RedirectUri::Https(uri) | RedirectUri::Loopback(uri) | RedirectUri::PrivateUse(uri) => {
                uri
            }
        }
    }

    pub fn into_inner(self) -> String {
        match self {
            RedirectUri::Https(uri) | RedirectUri::Loopback(uri) | RedirectUri::PrivateUse(uri) => {
                uri
            }
        }
    }

    pub fn is_https(&self) -> bool {
        matches!(self, RedirectUri::Https(_))
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self, RedirectUri::Loopback(_))
    }

    /// Loopback redirects are compared ignoring the port: native apps bind
    /// an ephemeral port at runtime (RFC 8252 section 7.3).
    pub fn matches(&self, candidate: &RedirectUri) -> bool {
        if self == candidate {
            return true;
        }
        if let (RedirectUri::Loopback(a), RedirectUri::Loopback(b)) = (self, candidate) {
            let (Ok(mut a), Ok(mut b)) = (Url::parse(a), Url::parse(b)) else {
                return false;
            };
            let _ = a.set_port(None);
            let _ = b.set_port(None);
            return a == b;
        }
        false
    }
}

impl fmt::Display for RedirectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for RedirectUri {
    type Err = RedirectUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RedirectUri {
    type Error = RedirectUriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RedirectUri> for String {
    fn from(uri: RedirectUri) -> Self {
        uri.into_inner()
    }
}

/// Errors that can occur when creating a RedirectUri.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RedirectUriError {
    #[error("Redirect URI must be a valid URL")]
    NotAUrl,
    #[error("Redirect URI must not contain credentials")]
    ContainsCredentials,
    #[error("Redirect URI must not contain a fragment")]
    ContainsFragment,
    #[error("Plain http redirect URIs must use a loopback IP literal")]
    InsecureScheme,
    #[error("Use the loopback IP literal instead of \"localhost\"")]
    LocalhostForbidden,
    #[error("Private-use schemes must be in reverse-domain form")]
    InvalidScheme,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes() {
        assert!(RedirectUri::new("https://app.example.com/cb")
            .unwrap()
            .is_https());
        assert!(RedirectUri::new("http://127.0.0.1:49152/cb")
            .unwrap()
            .is_loopback());
        assert!(matches!(
            RedirectUri::new("com.example.app:/callback").unwrap(),
            RedirectUri::PrivateUse(_)
        ));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            RedirectUri::new("http://localhost:8080/cb").unwrap_err(),
            RedirectUriError::LocalhostForbidden
        );
        assert_eq!(
            RedirectUri::new("http://example.com/cb").unwrap_err(),
            RedirectUriError::InsecureScheme
        );
        assert_eq!(
            RedirectUri::new("https://u:p@example.com/cb").unwrap_err(),
            RedirectUriError::ContainsCredentials
        );
        assert_eq!(
            RedirectUri::new("https://example.com/cb#frag").unwrap_err(),
            RedirectUriError::ContainsFragment
        );
        assert_eq!(
            RedirectUri::new("myapp:/callback").unwrap_err(),
            RedirectUriError::InvalidScheme
        );
    }

    #[test]
    fn test_loopback_port_agnostic_match() {
        let registered = RedirectUri::new("http://127.0.0.1/cb").unwrap();
        let presented = RedirectUri::new("http://127.0.0.1:49152/cb").unwrap();
        assert!(registered.matches(&presented));

        let other_path = RedirectUri::new("http://127.0.0.1:49152/other").unwrap();
        assert!(!registered.matches(&other_path));

        let https_a = RedirectUri::new("https://app.example.com/cb").unwrap();
        let https_b = RedirectUri::new("https://app.example.com:8443/cb").unwrap();
        assert!(!https_a.matches(&https_b));
    }
}
