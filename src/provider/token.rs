use crate::constants::{
    REFRESH_TOKEN_LENGTH, REFRESH_TOKEN_PREFIX, TOKEN_ID_LENGTH, TOKEN_ID_PREFIX,
};
use crate::errors::OAuthError;
use crate::provider::account::{Account, DeviceAccountInfo, Sub};
use crate::provider::client::ClientAuth;
use crate::provider::device::DeviceId;
use crate::provider::random_alphanumeric;
use crate::provider::request::Code;
use crate::types::{AuthorizationParameters, ClientId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Opaque token identifier; doubles as the `jti` of JWT access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TokenId(String);

impl TokenId {
    pub fn new(token_id: impl Into<String>) -> Result<Self, TokenIdError> {
        let token_id = token_id.into();
        if token_id.len() != TOKEN_ID_PREFIX.len() + TOKEN_ID_LENGTH {
            return Err(TokenIdError::InvalidLength);
        }
        if !token_id.starts_with(TOKEN_ID_PREFIX) {
            return Err(TokenIdError::InvalidFormat);
        }
        Ok(Self(token_id))
    }

    pub fn generate() -> Self {
        let val = TOKEN_ID_PREFIX.to_string() + &random_alphanumeric(TOKEN_ID_LENGTH);
        Self::new(val).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_token_id(value: &str) -> bool {
        Self::new(value).is_ok()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TokenId {
    type Err = TokenIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TokenId {
    type Error = TokenIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TokenId> for String {
    fn from(token_id: TokenId) -> Self {
        token_id.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenIdError {
    #[error("Invalid token id length")]
    InvalidLength,
    #[error("Invalid token id format")]
    InvalidFormat,
}

/// A single-use refresh token. Rotated-out values stay linked to the token
/// record so their reuse can be detected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Result<Self, RefreshTokenError> {
        let token = token.into();
        if token.len() != REFRESH_TOKEN_PREFIX.len() + REFRESH_TOKEN_LENGTH {
            return Err(RefreshTokenError::InvalidLength);
        }
        if !token.starts_with(REFRESH_TOKEN_PREFIX) {
            return Err(RefreshTokenError::InvalidFormat);
        }
        Ok(Self(token))
    }

    pub fn generate() -> Self {
        let val = REFRESH_TOKEN_PREFIX.to_string() + &random_alphanumeric(REFRESH_TOKEN_LENGTH);
        Self::new(val).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn is_refresh_token(value: &str) -> bool {
        Self::new(value).is_ok()
    }
}

impl fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for RefreshToken {
    type Error = RefreshTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RefreshToken> for String {
    fn from(token: RefreshToken) -> Self {
        token.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RefreshTokenError {
    #[error("Invalid refresh token length")]
    InvalidLength,
    #[error("Invalid refresh token format")]
    InvalidFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client_id: ClientId,
    pub client_auth: ClientAuth,
    pub device_id: Option<DeviceId>,
    pub sub: Sub,
    pub parameters: AuthorizationParameters,
    pub details: Option<serde_json::Value>,
    pub code: Option<Code>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub id: TokenId,
    pub data: TokenData,
    pub account: Account,
    pub info: Option<DeviceAccountInfo>,
    pub current_refresh_token: Option<RefreshToken>,
}

/// Fields replaced on refresh rotation.
#[derive(Debug, Clone)]
pub struct NewTokenData {
    pub client_auth: ClientAuth,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Token persistence. Rotation must be conditional on the predecessor still
/// existing, which linearizes racing refresh attempts per token.
pub trait TokenStore: Send + Sync {
    fn create_token(
        &mut self,
        token_id: TokenId,
        data: TokenData,
        account: Account,
        info: Option<DeviceAccountInfo>,
        refresh_token: Option<RefreshToken>,
    ) -> Result<(), OAuthError>;

    fn read_token(&self, token_id: &TokenId) -> Result<Option<TokenInfo>, OAuthError>;

    fn delete_token(&mut self, token_id: &TokenId) -> Result<(), OAuthError>;

    fn rotate_token(
        &mut self,
        token_id: &TokenId,
        new_token_id: TokenId,
        new_refresh_token: RefreshToken,
        new_data: NewTokenData,
    ) -> Result<(), OAuthError>;

    /// Find a token by refresh token. Rotated-out refresh tokens also
    /// resolve; the caller compares against `current_refresh_token` to
    /// detect replays.
    fn find_token_by_refresh_token(
        &self,
        refresh_token: &RefreshToken,
    ) -> Result<Option<TokenInfo>, OAuthError>;

    fn find_token_by_code(&self, code: &Code) -> Result<Option<TokenInfo>, OAuthError>;
}

struct TokenEntry {
    data: TokenData,
    account: Account,
    info: Option<DeviceAccountInfo>,
    current_refresh_token: Option<RefreshToken>,
    rotated_refresh_tokens: HashSet<RefreshToken>,
}

impl TokenEntry {
    fn to_info(&self, id: TokenId) -> TokenInfo {
        TokenInfo {
            id,
            data: self.data.clone(),
            account: self.account.clone(),
            info: self.info.clone(),
            current_refresh_token: self.current_refresh_token.clone(),
        }
    }
}

/// Reference store used by tests and development setups.
#[derive(Default)]
pub struct TokenStoreMemory {
    tokens: HashMap<TokenId, TokenEntry>,
}

impl TokenStoreMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for TokenStoreMemory {
    fn create_token(
        &mut self,
        token_id: TokenId,
        data: TokenData,
        account: Account,
        info: Option<DeviceAccountInfo>,
        refresh_token: Option<RefreshToken>,
    ) -> Result<(), OAuthError> {
        self.tokens.insert(
            token_id,
            TokenEntry {
                data,
                account,
                info,
                current_refresh_token: refresh_token,
                rotated_refresh_tokens: HashSet::new(),
            },
        );
        Ok(())
    }

    fn read_token(&self, token_id: &TokenId) -> Result<Option<TokenInfo>, OAuthError> {
        Ok(self
            .tokens
            .get(token_id)
            .map(|entry| entry.to_info(token_id.clone())))
    }

    fn delete_token(&mut self, token_id: &TokenId) -> Result<(), OAuthError> {
        self.tokens.remove(token_id);
        Ok(())
    }

    fn rotate_token(
        &mut self,
        token_id: &TokenId,
        new_token_id: TokenId,
        new_refresh_token: RefreshToken,
        new_data: NewTokenData,
    ) -> Result<(), OAuthError> {
        let mut entry = self
            .tokens
            .remove(token_id)
            .ok_or_else(|| OAuthError::InvalidGrant("Token was revoked".to_string()))?;

        if let Some(previous) = entry.current_refresh_token.take() {
            entry.rotated_refresh_tokens.insert(previous);
        }
        entry.current_refresh_token = Some(new_refresh_token);
        entry.data.client_auth = new_data.client_auth;
        entry.data.expires_at = new_data.expires_at;
        entry.data.updated_at = new_data.updated_at;

        self.tokens.insert(new_token_id, entry);
        Ok(())
    }

    fn find_token_by_refresh_token(
        &self,
        refresh_token: &RefreshToken,
    ) -> Result<Option<TokenInfo>, OAuthError> {
        Ok(self
            .tokens
            .iter()
            .find(|(_, entry)| {
                entry.current_refresh_token.as_ref() == Some(refresh_token)
                    || entry.rotated_refresh_tokens.contains(refresh_token)
            })
            .map(|(id, entry)| entry.to_info(id.clone())))
    }

    fn find_token_by_code(&self, code: &Code) -> Result<Option<TokenInfo>, OAuthError> {
        Ok(self
            .tokens
            .iter()
            .find(|(_, entry)| entry.data.code.as_ref() == Some(code))
            .map(|(id, entry)| entry.to_info(id.clone())))
    }
}
