use crate::types::TokenType;
use rocket::http::{Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde::Serialize;
use std::io::Cursor;

/// The OAuth error taxonomy. Every fallible path in the provider resolves to
/// one of these variants; the wire mapping (error code, status, headers) is
/// total over the enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidClient(String),
    #[error("{0}")]
    InvalidGrant(String),
    #[error("{0}")]
    UnauthorizedClient(String),
    #[error("{0}")]
    UnsupportedGrantType(String),
    #[error("{0}")]
    InvalidScope(String),
    #[error("{0}")]
    InvalidClientMetadata(String),
    #[error("{0}")]
    InvalidRedirectUri(String),
    #[error("{0}")]
    InvalidParameters(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("Login is required")]
    LoginRequired,
    #[error("Consent is required")]
    ConsentRequired,
    #[error("Account selection is required")]
    AccountSelectionRequired,
    #[error("{1}")]
    InvalidToken(TokenType, String),
    #[error("{0}")]
    InvalidDpopProof(String),
    #[error("The DPoP proof does not match the expected key binding")]
    InvalidDpopKeyBinding,
    #[error("Use the DPoP nonce provided in the DPoP-Nonce header")]
    UseDpopNonce(Option<String>),
    #[error("{0}")]
    ServerError(String),
    #[error("{0}")]
    TemporarilyUnavailable(String),
}

impl OAuthError {
    /// RFC 6749 / 9126 / 9449 error code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnauthorizedClient(_) => "unauthorized_client",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::InvalidClientMetadata(_) => "invalid_client_metadata",
            OAuthError::InvalidRedirectUri(_) => "invalid_request",
            OAuthError::InvalidParameters(_) => "invalid_request",
            OAuthError::AccessDenied(_) => "access_denied",
            OAuthError::LoginRequired => "login_required",
            OAuthError::ConsentRequired => "consent_required",
            OAuthError::AccountSelectionRequired => "account_selection_required",
            OAuthError::InvalidToken(_, _) => "invalid_token",
            OAuthError::InvalidDpopProof(_) => "invalid_dpop_proof",
            OAuthError::InvalidDpopKeyBinding => "invalid_dpop_key_binding",
            OAuthError::UseDpopNonce(_) => "use_dpop_nonce",
            OAuthError::ServerError(_) => "server_error",
            OAuthError::TemporarilyUnavailable(_) => "temporarily_unavailable",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            OAuthError::InvalidClient(_) | OAuthError::InvalidToken(_, _) => Status::Unauthorized,
            OAuthError::AccessDenied(_) => Status::Forbidden,
            OAuthError::ServerError(_) => Status::InternalServerError,
            OAuthError::TemporarilyUnavailable(_) => Status::ServiceUnavailable,
            _ => Status::BadRequest,
        }
    }

    /// Errors that may only surface through user interaction are downgraded
    /// when returned to a non-interactive caller (RFC 9126 section 2.3).
    pub fn downgrade_for_par(self) -> OAuthError {
        match self {
            OAuthError::AccessDenied(msg) => OAuthError::InvalidRequest(msg),
            OAuthError::LoginRequired
            | OAuthError::ConsentRequired
            | OAuthError::AccountSelectionRequired => {
                OAuthError::InvalidRequest("Interaction is not possible on this endpoint".into())
            }
            other => other,
        }
    }

    fn www_authenticate(&self) -> Option<String> {
        match self {
            OAuthError::InvalidToken(token_type, message) => Some(format!(
                "{token_type} error=\"invalid_token\", error_description={message:?}"
            )),
            OAuthError::InvalidClient(_) => Some("Basic realm=\"oauth\"".to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub error: &'static str,
    pub error_description: String,
}

impl From<&OAuthError> for ErrorPayload {
    fn from(error: &OAuthError) -> Self {
        ErrorPayload {
            error: error.code(),
            error_description: error.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for OAuthError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let payload = ErrorPayload::from(&self);
        let body = serde_json::to_string(&payload).map_err(|_| Status::InternalServerError)?;

        let mut builder = Response::build();
        builder
            .status(self.status())
            .header(Header::new("Content-Type", "application/json"))
            .header(Header::new("Cache-Control", "no-store"))
            .header(Header::new("Pragma", "no-cache"));
        if let Some(challenge) = self.www_authenticate() {
            builder.header(Header::new("WWW-Authenticate", challenge));
        }
        builder.sized_body(body.len(), Cursor::new(body));
        Ok(builder.finalize())
    }
}
