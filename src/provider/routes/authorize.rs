use crate::errors::OAuthError;
use crate::provider::account::{
    Account, ResetPasswordConfirmInput, ResetPasswordRequestInput, SignInCredentials, SignUpInput,
    Sub,
};
use crate::provider::provider::{AuthorizationPage, AuthorizeOutcome, Provider};
use crate::provider::routes::{
    setup_csrf_cookie, validate_csrf_token, DeviceSession, FetchMetadata,
};
use crate::types::{
    AuthorizationParameters, AuthorizationQuery, ClientId, CodeChallengeMethod, Prompt,
    RedirectUri, RequestUri, ResponseType, Scope,
};
use rocket::http::CookieJar;
use rocket::response::content::RawHtml;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};

#[derive(rocket::Responder)]
pub enum AuthorizeResponse {
    Redirect(Redirect),
    Html(RawHtml<String>),
}

fn invalid<E: std::fmt::Display>(what: &str) -> impl Fn(E) -> OAuthError + '_ {
    move |error| OAuthError::InvalidRequest(format!("Validation of {what} parameter failed: {error}"))
}

/// Interactive authorization start. Either redirects straight back to the
/// client (auto-authorization, prompt=none, errors after redirect-URI
/// validation) or renders the interaction page.
#[allow(clippy::too_many_arguments)]
#[get("/oauth/authorize?<client_id>&<request_uri>&<request>&<response_type>&<redirect_uri>&<scope>&<state>&<code_challenge>&<code_challenge_method>&<login_hint>&<prompt>&<dpop_jkt>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    device: DeviceSession,
    cookies: &CookieJar<'_>,
    client_id: String,
    request_uri: Option<String>,
    request: Option<String>,
    response_type: Option<String>,
    redirect_uri: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    login_hint: Option<String>,
    prompt: Option<String>,
    dpop_jkt: Option<String>,
) -> Result<AuthorizeResponse, OAuthError> {
    fetch.require_navigation()?;

    let client_id = ClientId::new(client_id).map_err(invalid("client_id"))?;
    let query = if let Some(request_uri) = request_uri {
        AuthorizationQuery::Uri {
            client_id,
            request_uri: RequestUri::new(request_uri).map_err(invalid("request_uri"))?,
        }
    } else if let Some(request) = request {
        AuthorizationQuery::Jar { client_id, request }
    } else {
        let response_type = match response_type.as_deref() {
            Some("code") => ResponseType::Code,
            Some(_) | None => {
                return Err(OAuthError::InvalidRequest(
                    "Validation of response_type parameter failed".to_string(),
                ))
            }
        };
        let mut parameters = AuthorizationParameters::new(client_id, response_type);
        parameters.redirect_uri = redirect_uri
            .map(RedirectUri::new)
            .transpose()
            .map_err(invalid("redirect_uri"))?;
        parameters.scope = scope.map(Scope::new).transpose().map_err(invalid("scope"))?;
        parameters.state = state;
        parameters.code_challenge = code_challenge;
        parameters.code_challenge_method = code_challenge_method
            .map(|method| match method.as_str() {
                "S256" => Ok(CodeChallengeMethod::S256),
                "plain" => Ok(CodeChallengeMethod::Plain),
                other => Err(OAuthError::InvalidRequest(format!(
                    "Validation of code_challenge_method parameter failed: {other:?}"
                ))),
            })
            .transpose()?;
        parameters.login_hint = login_hint;
        parameters.prompt = prompt
            .map(|prompt| prompt.parse::<Prompt>())
            .transpose()
            .map_err(invalid("prompt"))?;
        parameters.dpop_jkt = dpop_jkt;
        AuthorizationQuery::Parameters(parameters)
    };

    match provider.authorize(&device.0, &query).await? {
        AuthorizeOutcome::Redirect(url) => Ok(AuthorizeResponse::Redirect(Redirect::to(url))),
        AuthorizeOutcome::Page(page) => {
            let csrf_token = setup_csrf_cookie(cookies, &page.uri);
            Ok(AuthorizeResponse::Html(RawHtml(build_authorize_document(
                &page, &csrf_token,
            ))))
        }
    }
}

/// Render the interaction page shell. The JSON island carries everything
/// the frontend needs; assets are served by the embedding application.
fn build_authorize_document(page: &AuthorizationPage, csrf_token: &str) -> String {
    let data = serde_json::json!({
        "csrfToken": csrf_token,
        "requestUri": page.uri,
        "clientId": page.client_id,
        "clientMetadata": {
            "client_name": page.client_metadata.client_name,
            "client_uri": page.client_metadata.client_uri,
            "logo_uri": page.client_metadata.logo_uri,
            "tos_uri": page.client_metadata.tos_uri,
            "policy_uri": page.client_metadata.policy_uri,
        },
        "clientFirstParty": page.client_first_party,
        "scope": page.parameters.scope,
        "loginHint": page.parameters.login_hint,
        "sessions": page.sessions.iter().map(|session| serde_json::json!({
            "sub": session.account.sub,
            "handle": session.account.preferred_username,
            "selected": session.selected,
            "loginRequired": session.login_required,
            "consentRequired": session.consent_required,
        })).collect::<Vec<_>>(),
    });
    // "</" must not appear inside an inline script element.
    let data = data.to_string().replace("</", "<\\/");

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <meta name=\"robots\" content=\"noindex\">\n\
         <title>Authorize</title>\n\
         <link rel=\"stylesheet\" href=\"/oauth/assets/app.css\">\n\
         </head>\n<body>\n\
         <div id=\"root\"></div>\n\
         <script id=\"authorize-data\" type=\"application/json\">{data}</script>\n\
         <script type=\"module\" src=\"/oauth/assets/app.js\"></script>\n\
         </body>\n</html>\n"
    )
}

#[derive(Debug, Deserialize)]
pub struct SignInPayload {
    pub csrf_token: String,
    pub request_uri: RequestUri,
    pub client_id: ClientId,
    pub credentials: SignInCredentials,
}

#[derive(Debug, Serialize)]
pub struct SignInBody {
    pub account: Account,
    pub consent_required: bool,
}

#[post("/oauth/authorize/sign-in", data = "<payload>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_sign_in(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    device: DeviceSession,
    cookies: &CookieJar<'_>,
    payload: Json<SignInPayload>,
) -> Result<Json<SignInBody>, OAuthError> {
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;
    let payload = payload.into_inner();
    validate_csrf_token(cookies, &payload.request_uri, &payload.csrf_token, false)?;

    let response = provider
        .sign_in(
            device.0,
            payload.request_uri,
            payload.client_id,
            payload.credentials,
        )
        .await?;
    Ok(Json(SignInBody {
        account: response.account,
        consent_required: response.consent_required,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignUpPayload {
    pub csrf_token: String,
    pub request_uri: RequestUri,
    pub client_id: ClientId,
    pub input: SignUpInput,
}

#[post("/oauth/authorize/sign-up", data = "<payload>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_sign_up(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    device: DeviceSession,
    cookies: &CookieJar<'_>,
    payload: Json<SignUpPayload>,
) -> Result<Json<SignInBody>, OAuthError> {
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;
    let payload = payload.into_inner();
    validate_csrf_token(cookies, &payload.request_uri, &payload.csrf_token, false)?;

    let response = provider
        .sign_up(device.0, payload.request_uri, payload.client_id, payload.input)
        .await?;
    Ok(Json(SignInBody {
        account: response.account,
        consent_required: response.consent_required,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HandleAvailabilityPayload {
    pub handle: String,
}

#[derive(Debug, Serialize)]
pub struct HandleAvailabilityBody {
    pub available: bool,
}

#[post("/oauth/authorize/verify-handle-availability", data = "<payload>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_verify_handle(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    payload: Json<HandleAvailabilityPayload>,
) -> Result<Json<HandleAvailabilityBody>, OAuthError> {
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;
    let available = provider
        .verify_handle_availability(&payload.handle)
        .await?;
    Ok(Json(HandleAvailabilityBody { available }))
}

#[derive(Debug, Serialize)]
pub struct EmptyBody {}

#[post("/oauth/authorize/reset-password-request", data = "<payload>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_reset_password_request(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    payload: Json<ResetPasswordRequestInput>,
) -> Result<Json<EmptyBody>, OAuthError> {
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;
    provider.reset_password_request(payload.into_inner()).await?;
    Ok(Json(EmptyBody {}))
}

#[post("/oauth/authorize/reset-password-confirm", data = "<payload>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_reset_password_confirm(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    payload: Json<ResetPasswordConfirmInput>,
) -> Result<Json<EmptyBody>, OAuthError> {
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;
    provider.reset_password_confirm(payload.into_inner()).await?;
    Ok(Json(EmptyBody {}))
}

/// Consent accepted: 302 back to the client with the code.
#[get("/oauth/authorize/accept?<request_uri>&<client_id>&<account_sub>&<csrf_token>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_accept(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    device: DeviceSession,
    cookies: &CookieJar<'_>,
    request_uri: String,
    client_id: String,
    account_sub: String,
    csrf_token: String,
) -> Result<Redirect, OAuthError> {
    fetch.require_navigation()?;
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;

    let request_uri = RequestUri::new(request_uri).map_err(invalid("request_uri"))?;
    let client_id = ClientId::new(client_id).map_err(invalid("client_id"))?;
    let sub = Sub::new(account_sub).map_err(invalid("account_sub"))?;
    validate_csrf_token(cookies, &request_uri, &csrf_token, true)?;

    let url = provider
        .accept_request(device.0, request_uri, client_id, sub)
        .await?;
    Ok(Redirect::to(url))
}

/// Consent rejected: 302 back to the client with `access_denied`.
#[get("/oauth/authorize/reject?<request_uri>&<client_id>&<csrf_token>")]
#[tracing::instrument(skip_all)]
pub async fn oauth_authorize_reject(
    provider: &State<Provider>,
    fetch: FetchMetadata,
    device: DeviceSession,
    cookies: &CookieJar<'_>,
    request_uri: String,
    client_id: String,
    csrf_token: String,
) -> Result<Redirect, OAuthError> {
    fetch.require_navigation()?;
    fetch.require_same_origin(provider.verifier.issuer.as_str())?;

    let request_uri = RequestUri::new(request_uri).map_err(invalid("request_uri"))?;
    let client_id = ClientId::new(client_id).map_err(invalid("client_id"))?;
    validate_csrf_token(cookies, &request_uri, &csrf_token, true)?;

    let url = provider
        .reject_request(device.0, request_uri, client_id)
        .await?;
    Ok(Redirect::to(url))
}
