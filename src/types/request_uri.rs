use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// The opaque reference handed out by the PAR endpoint and presented at
/// `/oauth/authorize` (RFC 9126 section 2.2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestUri(String);

impl RequestUri {
    pub fn new(uri: impl Into<String>) -> Result<Self, RequestUriError> {
        let uri = uri.into();
        if uri.is_empty() {
            return Err(RequestUriError::Empty);
        }
        if !uri.starts_with(REQUEST_URI_PREFIX) || uri.len() == REQUEST_URI_PREFIX.len() {
            return Err(RequestUriError::InvalidFormat);
        }
        Ok(Self(uri))
    }

    /// The request-id portion after the URN prefix.
    pub fn request_id_str(&self) -> &str {
        &self.0[REQUEST_URI_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestUri {
    type Err = RequestUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RequestUri {
    type Error = RequestUriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RequestUri> for String {
    fn from(uri: RequestUri) -> Self {
        uri.0
    }
}

/// Errors that can occur when creating a RequestUri.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestUriError {
    #[error("Request URI cannot be empty")]
    Empty,
    #[error("Request URI must start with {REQUEST_URI_PREFIX:?}")]
    InvalidFormat,
}
