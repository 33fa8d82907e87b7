mod authorize;
mod public;

pub use authorize::*;
pub use public::*;

use crate::errors::{ErrorPayload, OAuthError};
use crate::provider::device::{DeviceId, RequestMetadata};
use crate::provider::provider::Provider;
use crate::types::RequestUri;
use rocket::data::ToByteUnit;
use rocket::http::{Cookie, CookieJar, Header, SameSite, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder, Response};
use rocket::{Data, Route};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Largest accepted OAuth request body.
const MAX_BODY_BYTES: u64 = 64 * 1024;

pub fn get_routes() -> Vec<Route> {
    rocket::routes![
        oauth_well_known,
        oauth_jwks,
        oauth_preflight,
        oauth_par,
        oauth_token,
        oauth_revoke,
        oauth_introspect,
        oauth_authorize,
        oauth_authorize_sign_in,
        oauth_authorize_sign_up,
        oauth_authorize_verify_handle,
        oauth_authorize_reset_password_request,
        oauth_authorize_reset_password_confirm,
        oauth_authorize_accept,
        oauth_authorize_reject,
    ]
}

/// Response wrapper for the non-interactive endpoints: JSON body or OAuth
/// error payload, `Cache-Control: no-store`, permissive CORS and the
/// rotating `DPoP-Nonce` header.
pub struct ApiResponse<T> {
    pub body: Result<T, OAuthError>,
    pub status: Status,
    pub dpop_nonce: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn new(body: Result<T, OAuthError>, dpop_nonce: Option<String>) -> Self {
        ApiResponse {
            body,
            status: Status::Ok,
            dpop_nonce,
        }
    }

    pub fn created(body: Result<T, OAuthError>, dpop_nonce: Option<String>) -> Self {
        ApiResponse {
            body,
            status: Status::Created,
            dpop_nonce,
        }
    }
}

impl<'r, T: Serialize> Responder<'r, 'static> for ApiResponse<T> {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let (status, body) = match &self.body {
            Ok(value) => (
                self.status,
                serde_json::to_string(value).map_err(|_| Status::InternalServerError)?,
            ),
            Err(error) => (
                error.status(),
                serde_json::to_string(&ErrorPayload::from(error))
                    .map_err(|_| Status::InternalServerError)?,
            ),
        };

        let mut builder = Response::build();
        builder
            .status(status)
            .header(Header::new("Content-Type", "application/json"))
            .header(Header::new("Cache-Control", "no-store"))
            .header(Header::new("Pragma", "no-cache"))
            .header(Header::new("Access-Control-Allow-Origin", "*"))
            .header(Header::new(
                "Access-Control-Allow-Headers",
                "Content-Type,Authorization,DPoP",
            ))
            .header(Header::new(
                "Access-Control-Expose-Headers",
                "DPoP-Nonce,WWW-Authenticate",
            ));
        if let Some(nonce) = self.dpop_nonce {
            builder.header(Header::new("DPoP-Nonce", nonce));
        }
        if let Err(error) = &self.body {
            if let OAuthError::InvalidToken(token_type, message) = error {
                builder.header(Header::new(
                    "WWW-Authenticate",
                    format!("{token_type} error=\"invalid_token\", error_description={message:?}"),
                ));
            }
        }
        if status != Status::NoContent {
            builder.sized_body(body.len(), Cursor::new(body));
        }
        Ok(builder.finalize())
    }
}

/// The raw `DPoP` header, if any. Proof validation happens in the handler,
/// which knows the target URL.
pub struct DpopProof(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for DpopProof {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(DpopProof(
            req.headers().get_one("DPoP").map(str::to_string),
        ))
    }
}

/// Fetch-metadata and origin headers of the request, for the same-origin
/// checks on interactive endpoints.
pub struct FetchMetadata {
    pub sec_fetch_site: Option<String>,
    pub sec_fetch_mode: Option<String>,
    pub origin: Option<String>,
    pub referer: Option<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for FetchMetadata {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let header = |name: &str| req.headers().get_one(name).map(str::to_string);
        Outcome::Success(FetchMetadata {
            sec_fetch_site: header("Sec-Fetch-Site"),
            sec_fetch_mode: header("Sec-Fetch-Mode"),
            origin: header("Origin"),
            referer: header("Referer"),
        })
    }
}

impl FetchMetadata {
    /// Interactive POST endpoints only answer the authorize page itself.
    pub fn require_same_origin(&self, issuer_origin: &str) -> Result<(), OAuthError> {
        if let Some(site) = &self.sec_fetch_site {
            if site != "same-origin" {
                return Err(OAuthError::AccessDenied(
                    "Cross-site requests are not allowed".to_string(),
                ));
            }
            return Ok(());
        }
        // No fetch metadata (older user agent): fall back to Origin/Referer.
        let presented = self
            .origin
            .as_deref()
            .or(self.referer.as_deref())
            .ok_or_else(|| {
                OAuthError::AccessDenied("Origin could not be established".to_string())
            })?;
        if !presented.starts_with(issuer_origin) {
            return Err(OAuthError::AccessDenied(
                "Cross-origin requests are not allowed".to_string(),
            ));
        }
        Ok(())
    }

    /// GET navigations (authorize, accept, reject) must be top-level
    /// navigations, not fetches.
    pub fn require_navigation(&self) -> Result<(), OAuthError> {
        match self.sec_fetch_mode.as_deref() {
            None | Some("navigate") => Ok(()),
            Some(_) => Err(OAuthError::AccessDenied(
                "Expected a navigation request".to_string(),
            )),
        }
    }
}

/// Resolves the device for interactive requests, creating or rotating the
/// cookie pair.
pub struct DeviceSession(pub DeviceId);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for DeviceSession {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(provider) = req.rocket().state::<Provider>() else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let metadata = RequestMetadata {
            user_agent: req.headers().get_one("User-Agent").map(str::to_string),
            ip_address: req
                .client_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        match provider.device_manager.load(req.cookies(), metadata).await {
            Ok(device_id) => Outcome::Success(DeviceSession(device_id)),
            Err(error) => {
                tracing::error!(%error, "failed to load device session");
                Outcome::Error((Status::InternalServerError, ()))
            }
        }
    }
}

fn csrf_cookie_name(request_uri: &RequestUri) -> String {
    format!("csrf-{}", request_uri.request_id_str())
}

/// Issue the double-submit cookie for a freshly rendered authorize page.
pub fn setup_csrf_cookie(cookies: &CookieJar<'_>, request_uri: &RequestUri) -> String {
    let token = crate::provider::random_alphanumeric(24);
    cookies.add(
        Cookie::build((csrf_cookie_name(request_uri), token.clone()))
            .path("/oauth/authorize")
            .secure(true)
            .http_only(false)
            .same_site(SameSite::Lax),
    );
    token
}

/// Double-submit check: the token presented in the request must match the
/// cookie scoped to this request_uri.
pub fn validate_csrf_token(
    cookies: &CookieJar<'_>,
    request_uri: &RequestUri,
    csrf_token: &str,
    clear: bool,
) -> Result<(), OAuthError> {
    let name = csrf_cookie_name(request_uri);
    let cookie = cookies
        .get(&name)
        .ok_or_else(|| OAuthError::AccessDenied("Missing CSRF cookie".to_string()))?;
    if cookie.value() != csrf_token || csrf_token.is_empty() {
        return Err(OAuthError::AccessDenied("Invalid CSRF token".to_string()));
    }
    if clear {
        cookies.remove(Cookie::build(name).path("/oauth/authorize"));
    }
    Ok(())
}

/// Read a bounded request body as text, honoring the two encodings OAuth
/// endpoints accept.
pub async fn read_oauth_body<'r>(
    req: &'r Request<'_>,
    data: Data<'r>,
) -> Result<(BodyEncoding, String), OAuthError> {
    let content_type = req
        .headers()
        .get_one(http::header::CONTENT_TYPE.as_str())
        .unwrap_or_default();
    let encoding = if content_type.starts_with("application/x-www-form-urlencoded") {
        BodyEncoding::Form
    } else if content_type.starts_with("application/json") {
        BodyEncoding::Json
    } else {
        return Err(OAuthError::InvalidRequest(format!(
            "Unsupported content type {content_type:?}"
        )));
    };

    let body = data
        .open(MAX_BODY_BYTES.bytes())
        .into_string()
        .await
        .map_err(|e| OAuthError::InvalidRequest(format!("Unreadable request body: {e}")))?;
    if !body.is_complete() {
        return Err(OAuthError::InvalidRequest("Request body too large".to_string()));
    }
    Ok((encoding, body.into_inner()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Form,
    Json,
}

/// Parse one logical value out of the (possibly shared) body.
pub fn parse_oauth_body<T: DeserializeOwned>(
    encoding: BodyEncoding,
    body: &str,
    what: &str,
) -> Result<T, OAuthError> {
    let result = match encoding {
        BodyEncoding::Form => serde_urlencoded::from_str::<T>(body)
            .map_err(|e| e.to_string()),
        BodyEncoding::Json => serde_json::from_str::<T>(body).map_err(|e| e.to_string()),
    };
    result.map_err(|error| {
        tracing::debug!(%error, what, "request body validation failed");
        OAuthError::InvalidRequest(format!("Validation of {what} parameter failed"))
    })
}
