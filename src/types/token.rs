use crate::types::Scope;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    Bearer,
    DPoP,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Bearer => "Bearer".fmt(f),
            TokenType::DPoP => "DPoP".fmt(f),
        }
    }
}

/// Body of the token endpoint, discriminated by `grant_type`.
///
/// Password and client-credentials grants are parsed so that they can be
/// refused with `unsupported_grant_type` rather than a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "grant_type")]
pub enum TokenRequest {
    #[serde(rename = "authorization_code")]
    AuthorizationCode {
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect_uri: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code_verifier: Option<String>,
    },
    #[serde(rename = "refresh_token")]
    RefreshToken { refresh_token: String },
    #[serde(rename = "password")]
    Password {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    #[serde(rename = "client_credentials")]
    ClientCredentials {},
}

/// Successful token endpoint response (RFC 6749 section 5.1, RFC 9449
/// section 5 for the DPoP token type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    pub token_type: TokenType,

    pub expires_in: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    /// Subject the tokens were issued for. Decentralized-identity clients
    /// use this to bind the session to an account identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

/// Body of the revocation and introspection endpoints (RFC 7009 / RFC 7662).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenIdentification {
    pub token: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type_hint: Option<TokenTypeHint>,
}

/// Introspection response (RFC 7662 section 2.2). Anything that is not a
/// currently-active token collapses to `{"active": false}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntrospectionResponse {
    Active(ActiveTokenInfo),
    Inactive { active: bool },
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        IntrospectionResponse::Inactive { active: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTokenInfo {
    /// Always `true` for this variant.
    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_details: Option<serde_json::Value>,
}
