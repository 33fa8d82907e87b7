use crate::constants::{CODE_LENGTH, CODE_PREFIX, REQUEST_ID_LENGTH, REQUEST_ID_PREFIX};
use crate::errors::OAuthError;
use crate::provider::account::Sub;
use crate::provider::client::ClientAuth;
use crate::provider::device::DeviceId;
use crate::provider::random_alphanumeric;
use crate::types::{AuthorizationParameters, ClientId, RequestUri, REQUEST_URI_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a stored authorization request, wrapped into a
/// `urn:ietf:params:oauth:request_uri:` URN on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    pub fn new(request_id: impl Into<String>) -> Result<Self, RequestIdError> {
        let request_id = request_id.into();
        if request_id.len() != REQUEST_ID_PREFIX.len() + REQUEST_ID_LENGTH {
            return Err(RequestIdError::InvalidLength);
        }
        if !request_id.starts_with(REQUEST_ID_PREFIX) {
            return Err(RequestIdError::InvalidFormat);
        }
        Ok(Self(request_id))
    }

    pub fn generate() -> Self {
        let val = REQUEST_ID_PREFIX.to_string() + &random_alphanumeric(REQUEST_ID_LENGTH);
        Self::new(val).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Wrap into the wire form.
    pub fn as_request_uri(&self) -> RequestUri {
        RequestUri::new(format!("{REQUEST_URI_PREFIX}{}", self.0)).unwrap()
    }

    /// Unwrap from the wire form.
    pub fn from_request_uri(uri: &RequestUri) -> Result<Self, RequestIdError> {
        Self::new(uri.request_id_str())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RequestId {
    type Error = RequestIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RequestId> for String {
    fn from(request_id: RequestId) -> Self {
        request_id.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestIdError {
    #[error("Invalid request id length")]
    InvalidLength,
    #[error("Invalid request id format")]
    InvalidFormat,
}

/// A single-use authorization code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Code(String);

impl Code {
    pub fn new(code: impl Into<String>) -> Result<Self, CodeError> {
        let code = code.into();
        if code.len() != CODE_PREFIX.len() + CODE_LENGTH {
            return Err(CodeError::InvalidLength);
        }
        if !code.starts_with(CODE_PREFIX) {
            return Err(CodeError::InvalidFormat);
        }
        Ok(Self(code))
    }

    pub fn generate() -> Self {
        let val = CODE_PREFIX.to_string() + &random_alphanumeric(CODE_LENGTH);
        Self::new(val).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_code(value: &str) -> bool {
        Self::new(value).is_ok()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Code {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Code {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Code> for String {
    fn from(code: Code) -> Self {
        code.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("Invalid code length")]
    InvalidLength,
    #[error("Invalid code format")]
    InvalidFormat,
}

/// Stored state of an authorization request.
///
/// The lifecycle is encoded in the optional fields: `device_id` set means
/// the request is bound to a user agent; `sub` and `code` set mean it was
/// authorized. Consumption deletes the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub client_id: ClientId,
    pub client_auth: ClientAuth,
    pub parameters: AuthorizationParameters,
    pub expires_at: DateTime<Utc>,
    pub device_id: Option<DeviceId>,
    pub sub: Option<Sub>,
    pub code: Option<Code>,
}

impl RequestData {
    pub fn is_authorized(&self) -> bool {
        self.sub.is_some() && self.code.is_some()
    }
}

/// An authorized request as handed to the token endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizedRequestData {
    pub client_id: ClientId,
    pub client_auth: ClientAuth,
    pub parameters: AuthorizationParameters,
    pub device_id: DeviceId,
    pub sub: Sub,
}

/// What interactive endpoints need to know about a live request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub uri: RequestUri,
    pub client_id: ClientId,
    pub client_auth: ClientAuth,
    pub parameters: AuthorizationParameters,
    pub expires_at: DateTime<Utc>,
}

/// Partial update applied to a stored request.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequestData {
    pub expires_at: Option<DateTime<Utc>>,
    pub device_id: Option<DeviceId>,
    pub sub: Option<Sub>,
    pub code: Option<Code>,
}

pub struct FoundRequest {
    pub id: RequestId,
    pub data: RequestData,
}

/// Persistence for authorization requests. Single-key operations must be
/// atomic; the managers never assume cross-key transactions.
pub trait RequestStore: Send + Sync {
    fn create_request(&mut self, id: RequestId, data: RequestData) -> Result<(), OAuthError>;

    /// Expired requests **can** be returned so the caller can yield a more
    /// precise error than "not found".
    fn read_request(&self, id: &RequestId) -> Result<Option<RequestData>, OAuthError>;

    fn update_request(&mut self, id: &RequestId, update: UpdateRequestData)
        -> Result<(), OAuthError>;

    fn delete_request(&mut self, id: &RequestId) -> Result<(), OAuthError>;

    /// Consume the request holding `code`: the record is removed and
    /// returned in one step so a code can never be spent twice.
    fn consume_request_by_code(&mut self, code: &Code) -> Result<Option<FoundRequest>, OAuthError>;
}

/// Reference store used by tests and development setups.
#[derive(Default)]
pub struct RequestStoreMemory {
    requests: HashMap<RequestId, RequestData>,
}

impl RequestStoreMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RequestStore for RequestStoreMemory {
    fn create_request(&mut self, id: RequestId, data: RequestData) -> Result<(), OAuthError> {
        self.requests.insert(id, data);
        Ok(())
    }

    fn read_request(&self, id: &RequestId) -> Result<Option<RequestData>, OAuthError> {
        Ok(self.requests.get(id).cloned())
    }

    fn update_request(
        &mut self,
        id: &RequestId,
        update: UpdateRequestData,
    ) -> Result<(), OAuthError> {
        let data = self
            .requests
            .get_mut(id)
            .ok_or_else(|| OAuthError::InvalidGrant("Unknown request".to_string()))?;
        if let Some(expires_at) = update.expires_at {
            data.expires_at = expires_at;
        }
        if let Some(device_id) = update.device_id {
            data.device_id = Some(device_id);
        }
        if let Some(sub) = update.sub {
            data.sub = Some(sub);
        }
        if let Some(code) = update.code {
            data.code = Some(code);
        }
        Ok(())
    }

    fn delete_request(&mut self, id: &RequestId) -> Result<(), OAuthError> {
        self.requests.remove(id);
        Ok(())
    }

    fn consume_request_by_code(&mut self, code: &Code) -> Result<Option<FoundRequest>, OAuthError> {
        let id = self
            .requests
            .iter()
            .find(|(_, data)| data.code.as_ref() == Some(code))
            .map(|(id, _)| id.clone());
        Ok(id.map(|id| {
            let data = self.requests.remove(&id).unwrap();
            FoundRequest { id, data }
        }))
    }
}
