use crate::types::{ClientId, RedirectUri, RequestUri, ResponseType, Scope};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PKCE code challenge methods. `S256` is the only method public clients may
/// use; `plain` survives in the type so it can be rejected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "S256")]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodeChallengeMethod::S256 => "S256".fmt(f),
            CodeChallengeMethod::Plain => "plain".fmt(f),
        }
    }
}

/// Prompt options for the authorization endpoint (OIDC core section 3.1.2.1,
/// applied here to plain OAuth semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl FromStr for Prompt {
    type Err = PromptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Prompt::None),
            "login" => Ok(Prompt::Login),
            "consent" => Ok(Prompt::Consent),
            "select_account" => Ok(Prompt::SelectAccount),
            _ => Err(PromptError::Unknown(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("Unknown prompt value: {0}")]
    Unknown(String),
}

/// The validated parameter set of an authorization request.
///
/// Parsed from the PAR body, a JAR payload, or the authorize query string;
/// persisted with the authorization request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationParameters {
    pub client_id: ClientId,

    pub response_type: ResponseType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<RedirectUri>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<CodeChallengeMethod>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Prompt>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_locales: Option<String>,

    /// RFC 9396 authorization details, passed through opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_details: Option<serde_json::Value>,
}

impl AuthorizationParameters {
    pub fn new(client_id: ClientId, response_type: ResponseType) -> Self {
        AuthorizationParameters {
            client_id,
            response_type,
            redirect_uri: None,
            scope: None,
            state: None,
            code_challenge: None,
            code_challenge_method: None,
            dpop_jkt: None,
            login_hint: None,
            prompt: None,
            ui_locales: None,
            authorization_details: None,
        }
    }
}

/// Body of a pushed authorization request: either bare parameters or a
/// signed request object (JAR) carrying them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParRequest {
    Jar { request: String },
    Parameters(AuthorizationParameters),
}

/// Query of a GET `/oauth/authorize`: a `request_uri` produced by PAR, an
/// inline JAR, or bare parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthorizationQuery {
    Uri {
        client_id: ClientId,
        request_uri: RequestUri,
    },
    Jar {
        client_id: ClientId,
        request: String,
    },
    Parameters(AuthorizationParameters),
}

impl AuthorizationQuery {
    pub fn client_id(&self) -> &ClientId {
        match self {
            AuthorizationQuery::Uri { client_id, .. } => client_id,
            AuthorizationQuery::Jar { client_id, .. } => client_id,
            AuthorizationQuery::Parameters(parameters) => &parameters.client_id,
        }
    }
}

/// Response of the PAR endpoint (RFC 9126 section 2.2), status 201.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParResponse {
    pub request_uri: RequestUri,
    pub expires_in: u64,
}
