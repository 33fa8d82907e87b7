use crate::constants::{AUTHENTICATION_MAX_AGE, INTROSPECTION_TIMING_FLOOR, PAR_EXPIRES_IN};
use crate::errors::OAuthError;
use crate::jose::Keyset;
use crate::provider::account::{
    Account, AccountInfo, AccountManager, AccountStore, DeviceAccountInfo,
    ResetPasswordConfirmInput, ResetPasswordRequestInput, SignInCredentials, SignUpInput, Sub,
};
use crate::provider::client::{Client, ClientAuth};
use crate::provider::client_manager::{ClientManager, ClientStore, LoopbackMetadataGetter};
use crate::provider::device::{DeviceId, DeviceManager, DeviceManagerOptions, DeviceStore};
use crate::provider::dpop::DpopSecretInput;
use crate::provider::hooks::Hooks;
use crate::provider::metadata::{build_metadata, CustomMetadata};
use crate::provider::replay::ReplayStore;
use crate::provider::request::{Code, RequestInfo, RequestStore};
use crate::provider::request_manager::RequestManager;
use crate::provider::signer::{AccessTokenClaims, AccessTokenMode, VerifyTokenClaimsOptions};
use crate::provider::token::{TokenId, TokenStore};
use crate::provider::token_manager::{CodeGrantInput, TokenManager};
use crate::provider::verifier::{Verifier, VerifierOptions};
use crate::types::{
    ApplicationType, AuthorizationParameters, AuthorizationQuery, ClientCredentials, ClientId,
    ClientMetadata, GrantType, IntrospectionResponse, ActiveTokenInfo, Issuer, ParRequest,
    ParResponse, Prompt, RequestUri, ServerMetadata, TokenIdentification, TokenRequest,
    TokenResponse, TokenType,
};
use chrono::Utc;
use jsonwebtoken::jwk::JwkSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct ProviderOptions {
    pub issuer: Issuer,
    pub keyset: Arc<Keyset>,

    pub account_store: Arc<RwLock<dyn AccountStore>>,
    pub device_store: Arc<RwLock<dyn DeviceStore>>,
    pub request_store: Arc<RwLock<dyn RequestStore>>,
    pub token_store: Arc<RwLock<dyn TokenStore>>,
    pub replay_store: Arc<RwLock<dyn ReplayStore>>,
    pub client_store: Option<Arc<RwLock<dyn ClientStore>>>,

    /// Loopback client synthesis policy; `None` disables loopback clients.
    pub loopback_metadata: Option<LoopbackMetadataGetter>,
    pub hooks: Hooks,
    pub metadata: Option<CustomMetadata>,

    /// Maximum age a device/account session can reach before
    /// re-authentication is required, in milliseconds.
    pub authentication_max_age: Option<u64>,
    /// Maximum age of access tokens, in milliseconds.
    pub token_max_age: Option<u64>,
    pub access_token_mode: Option<AccessTokenMode>,

    pub dpop_secret: Option<DpopSecretInput>,
    pub dpop_step: Option<u64>,
    pub device_manager_options: Option<DeviceManagerOptions>,
}

/// One account session on the device, annotated for the authorize UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub account: Account,
    pub selected: bool,
    pub login_required: bool,
    pub consent_required: bool,
    pub matches_hint: bool,
}

/// Data the authorize page renders.
#[derive(Debug, Clone)]
pub struct AuthorizationPage {
    pub issuer: Issuer,
    pub client_id: ClientId,
    pub client_metadata: ClientMetadata,
    pub client_first_party: bool,
    pub uri: RequestUri,
    pub parameters: AuthorizationParameters,
    pub sessions: Vec<SessionSummary>,
}

/// Outcome of GET `/oauth/authorize`: straight back to the client, or show
/// the interaction page.
pub enum AuthorizeOutcome {
    Redirect(String),
    Page(Box<AuthorizationPage>),
}

pub struct SignInResponse {
    pub account: Account,
    pub consent_required: bool,
}

pub struct SignUpResponse {
    pub account: Account,
    pub consent_required: bool,
}

enum RedirectParams {
    Code(Code),
    Error {
        error: &'static str,
        description: String,
    },
}

impl RedirectParams {
    fn from_error(error: &OAuthError) -> Self {
        RedirectParams::Error {
            error: error.code(),
            description: error.to_string(),
        }
    }
}

/// Build the authorization-response redirect, preserving `state` and
/// advertising `iss` (RFC 9207).
fn authorize_redirect_url(
    issuer: &Issuer,
    parameters: &AuthorizationParameters,
    outcome: RedirectParams,
) -> Result<String, OAuthError> {
    let redirect_uri = parameters.redirect_uri.as_ref().ok_or_else(|| {
        OAuthError::ServerError("No redirect_uri on a validated request".to_string())
    })?;

    let mut pairs: Vec<(&str, String)> = vec![("iss", issuer.as_str().to_string())];
    if let Some(state) = &parameters.state {
        pairs.push(("state", state.clone()));
    }
    match outcome {
        RedirectParams::Code(code) => pairs.push(("code", code.into_inner())),
        RedirectParams::Error { error, description } => {
            pairs.push(("error", error.to_string()));
            pairs.push(("error_description", description));
        }
    }

    let query = serde_urlencoded::to_string(&pairs)
        .map_err(|e| OAuthError::ServerError(e.to_string()))?;
    let separator = if redirect_uri.as_str().contains('?') { '&' } else { '?' };
    Ok(format!("{redirect_uri}{separator}{query}"))
}

/// Composes the managers into the endpoint surface.
pub struct Provider {
    pub metadata: ServerMetadata,
    pub verifier: Verifier,
    pub device_manager: DeviceManager,

    authentication_max_age: u64,
    client_manager: ClientManager,
    request_manager: RequestManager,
    token_manager: TokenManager,
    account_manager: AccountManager,
}

impl Provider {
    pub fn new(options: ProviderOptions) -> Result<Self, OAuthError> {
        let metadata = build_metadata(&options.issuer, options.metadata);
        let hooks = Arc::new(options.hooks);
        let authentication_max_age = options
            .authentication_max_age
            .unwrap_or(AUTHENTICATION_MAX_AGE);

        let verifier = Verifier::new(VerifierOptions {
            issuer: options.issuer,
            keyset: options.keyset,
            access_token_mode: options.access_token_mode.unwrap_or(AccessTokenMode::Auto),
            replay_store: options.replay_store,
            dpop_secret: options.dpop_secret,
            dpop_step: options.dpop_step,
        })?;

        let client_manager = ClientManager::new(
            metadata.clone(),
            Arc::clone(&hooks),
            options.client_store,
            options.loopback_metadata,
        );
        let request_manager = RequestManager::new(options.request_store, metadata.clone());
        let token_manager = TokenManager::new(
            options.token_store,
            Arc::clone(&verifier.signer),
            verifier.access_token_mode,
            options.token_max_age,
            hooks,
        );
        let account_manager = AccountManager::new(options.account_store);
        let device_manager =
            DeviceManager::new(options.device_store, options.device_manager_options);

        Ok(Provider {
            metadata,
            verifier,
            device_manager,
            authentication_max_age,
            client_manager,
            request_manager,
            token_manager,
            account_manager,
        })
    }

    pub fn get_jwks(&self) -> JwkSet {
        self.verifier.signer.keyset().public_jwks()
    }

    pub async fn next_dpop_nonce(&self) -> Option<String> {
        self.verifier.next_dpop_nonce().await
    }

    fn login_required(&self, info: &DeviceAccountInfo) -> bool {
        let age = Utc::now() - info.authenticated_at;
        // Fool-proof: suspicious timestamps in the future count as stale.
        age < chrono::Duration::zero()
            || age >= chrono::Duration::milliseconds(self.authentication_max_age as i64)
    }

    async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<(Client, ClientAuth), OAuthError> {
        let client = self.client_manager.get_client(credentials.client_id()).await?;
        let (client_auth, nonce) =
            client.verify_credentials(credentials, &self.verifier.issuer)?;

        if client.metadata.application_type == ApplicationType::Native
            && client_auth != ClientAuth::None
        {
            // rfc8252 section 8.4: native apps are public clients and must
            // be registered as such.
            return Err(OAuthError::InvalidGrant(
                "Native clients must authenticate using the \"none\" method".to_string(),
            ));
        }

        if let Some(nonce) = nonce {
            if !self
                .verifier
                .replay_manager
                .unique_auth(&nonce, &client.id)
                .await
            {
                return Err(OAuthError::InvalidGrant(
                    "Client assertion jti was already used".to_string(),
                ));
            }
        }

        Ok((client, client_auth))
    }

    async fn decode_jar(
        &self,
        client: &Client,
        jar: &str,
    ) -> Result<AuthorizationParameters, OAuthError> {
        let decoded = client.decode_request_object(jar, &self.verifier.issuer)?;
        if !self
            .verifier
            .replay_manager
            .unique_jar(&decoded.jti, &client.id)
            .await
        {
            return Err(OAuthError::InvalidParameters(
                "Request object jti is not unique".to_string(),
            ));
        }
        Ok(decoded.parameters)
    }

    /// <https://datatracker.ietf.org/doc/html/rfc9126>
    pub async fn pushed_authorization_request(
        &self,
        credentials: ClientCredentials,
        request: ParRequest,
        dpop_jkt: Option<String>,
    ) -> Result<ParResponse, OAuthError> {
        let result = self
            .pushed_authorization_request_inner(credentials, request, dpop_jkt)
            .await;
        // rfc9126 section 2.3: user-interaction errors make no sense here.
        result.map_err(OAuthError::downgrade_for_par)
    }

    async fn pushed_authorization_request_inner(
        &self,
        credentials: ClientCredentials,
        request: ParRequest,
        dpop_jkt: Option<String>,
    ) -> Result<ParResponse, OAuthError> {
        let (client, client_auth) = self.authenticate_client(&credentials).await?;

        let parameters = match &request {
            ParRequest::Jar { request } => self.decode_jar(&client, request).await?,
            ParRequest::Parameters(parameters) => parameters.clone(),
        };

        let request_info = self
            .request_manager
            .create_authorization_request(&client, &client_auth, &parameters, None, dpop_jkt)
            .await?;

        Ok(ParResponse {
            request_uri: request_info.uri,
            expires_in: PAR_EXPIRES_IN / 1000,
        })
    }

    /// GET `/oauth/authorize`.
    pub async fn authorize(
        &self,
        device_id: &DeviceId,
        query: &AuthorizationQuery,
    ) -> Result<AuthorizeOutcome, OAuthError> {
        let client = self.client_manager.get_client(query.client_id()).await?;

        let request_info = match query {
            AuthorizationQuery::Uri { request_uri, .. } => {
                self.request_manager
                    .get(request_uri, &client.id, device_id)
                    .await?
            }
            AuthorizationQuery::Jar { request, .. } => {
                let parameters = self.decode_jar(&client, request).await?;
                self.request_manager
                    .create_authorization_request(
                        &client,
                        &ClientAuth::None,
                        &parameters,
                        Some(device_id.clone()),
                        None,
                    )
                    .await?
            }
            AuthorizationQuery::Parameters(parameters) => {
                if self.metadata.require_pushed_authorization_requests == Some(true) {
                    return Err(OAuthError::InvalidRequest(
                        "Pushed authorization requests are required; use the PAR endpoint"
                            .to_string(),
                    ));
                }
                self.request_manager
                    .create_authorization_request(
                        &client,
                        &ClientAuth::None,
                        parameters,
                        Some(device_id.clone()),
                        None,
                    )
                    .await?
            }
        };

        // The redirect_uri is validated from here on: failures are reported
        // to the client via redirect rather than rendered as an error page.
        match self.resolve_authorization(&client, device_id, &request_info).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let _ = self.request_manager.delete(&request_info.uri).await;
                Ok(AuthorizeOutcome::Redirect(authorize_redirect_url(
                    &self.verifier.issuer,
                    &request_info.parameters,
                    RedirectParams::from_error(&error),
                )?))
            }
        }
    }

    async fn resolve_authorization(
        &self,
        client: &Client,
        device_id: &DeviceId,
        request_info: &RequestInfo,
    ) -> Result<AuthorizeOutcome, OAuthError> {
        let parameters = &request_info.parameters;
        let sessions = self.get_sessions(client, device_id, parameters).await?;

        if parameters.prompt == Some(Prompt::None) {
            let matching: Vec<&SessionSummary> =
                sessions.iter().filter(|s| s.matches_hint).collect();
            let session = match matching.as_slice() {
                [] => return Err(OAuthError::LoginRequired),
                [session] => *session,
                _ => return Err(OAuthError::AccountSelectionRequired),
            };
            if session.login_required {
                return Err(OAuthError::LoginRequired);
            }
            if session.consent_required {
                return Err(OAuthError::ConsentRequired);
            }
            let code = self
                .request_manager
                .set_authorized(&request_info.uri, device_id, &session.account)
                .await?;
            return Ok(AuthorizeOutcome::Redirect(authorize_redirect_url(
                &self.verifier.issuer,
                parameters,
                RedirectParams::Code(code),
            )?));
        }

        // Silent sign-in: a login_hint naming exactly one healthy session
        // skips the interaction.
        if parameters.prompt.is_none() && parameters.login_hint.is_some() {
            let matching: Vec<&SessionSummary> =
                sessions.iter().filter(|s| s.matches_hint).collect();
            if let [session] = matching.as_slice() {
                if !session.login_required && !session.consent_required {
                    let code = self
                        .request_manager
                        .set_authorized(&request_info.uri, device_id, &session.account)
                        .await?;
                    return Ok(AuthorizeOutcome::Redirect(authorize_redirect_url(
                        &self.verifier.issuer,
                        parameters,
                        RedirectParams::Code(code),
                    )?));
                }
            }
        }

        Ok(AuthorizeOutcome::Page(Box::new(AuthorizationPage {
            issuer: self.verifier.issuer.clone(),
            client_id: client.id.clone(),
            client_metadata: client.metadata.clone(),
            client_first_party: client.info.is_first_party,
            uri: request_info.uri.clone(),
            parameters: parameters.clone(),
            sessions,
        })))
    }

    async fn get_sessions(
        &self,
        client: &Client,
        device_id: &DeviceId,
        parameters: &AuthorizationParameters,
    ) -> Result<Vec<SessionSummary>, OAuthError> {
        let accounts = self.account_manager.list(device_id).await?;
        let hint = parameters.login_hint.as_deref();

        let matches_hint = |account: &Account| -> bool {
            match hint {
                None => true,
                Some(hint) => {
                    account.sub.as_str() == hint
                        || account.preferred_username.as_deref() == Some(hint)
                }
            }
        };
        let hint_matches = accounts
            .iter()
            .filter(|info| matches_hint(&info.account))
            .count();

        Ok(accounts
            .into_iter()
            .map(|AccountInfo { account, info }| {
                let matches = matches_hint(&account);
                SessionSummary {
                    login_required: parameters.prompt == Some(Prompt::Login)
                        || self.login_required(&info),
                    consent_required: parameters.prompt == Some(Prompt::Consent)
                        || !(client.info.is_first_party
                            || info.authorized_clients.contains(&client.id)),
                    selected: parameters.prompt != Some(Prompt::SelectAccount)
                        && matches
                        && hint_matches == 1,
                    matches_hint: matches,
                    account,
                }
            })
            .collect())
    }

    /// POST `/oauth/authorize/sign-in`.
    pub async fn sign_in(
        &self,
        device_id: DeviceId,
        uri: RequestUri,
        client_id: ClientId,
        credentials: SignInCredentials,
    ) -> Result<SignInResponse, OAuthError> {
        let client = self.client_manager.get_client(&client_id).await?;

        // Ensure the request is still valid (and slide its expiration).
        self.request_manager
            .get(&uri, &client_id, &device_id)
            .await?;

        let AccountInfo { account, info } =
            self.account_manager.sign_in(credentials, device_id).await?;

        Ok(SignInResponse {
            consent_required: self.consent_required(&client, &info),
            account,
        })
    }

    /// POST `/oauth/authorize/sign-up`.
    pub async fn sign_up(
        &self,
        device_id: DeviceId,
        uri: RequestUri,
        client_id: ClientId,
        input: SignUpInput,
    ) -> Result<SignUpResponse, OAuthError> {
        let client = self.client_manager.get_client(&client_id).await?;
        self.request_manager
            .get(&uri, &client_id, &device_id)
            .await?;

        let AccountInfo { account, info } =
            self.account_manager.sign_up(input, device_id).await?;

        Ok(SignUpResponse {
            consent_required: self.consent_required(&client, &info),
            account,
        })
    }

    fn consent_required(&self, client: &Client, info: &DeviceAccountInfo) -> bool {
        // NOTE: consent is tracked per client, not per scope: once any
        // scope was consented to, further scopes ride along. Scope-level
        // consent would require remembering the authorized scopes here.
        !(client.info.is_first_party || info.authorized_clients.contains(&client.id))
    }

    pub async fn verify_handle_availability(&self, handle: &str) -> Result<bool, OAuthError> {
        self.account_manager.verify_handle_availability(handle).await
    }

    pub async fn reset_password_request(
        &self,
        input: ResetPasswordRequestInput,
    ) -> Result<(), OAuthError> {
        self.account_manager.reset_password_request(input).await
    }

    pub async fn reset_password_confirm(
        &self,
        input: ResetPasswordConfirmInput,
    ) -> Result<(), OAuthError> {
        self.account_manager.reset_password_confirm(input).await
    }

    /// GET `/oauth/authorize/accept`: the user approved. Returns the
    /// redirect URL carrying the authorization code.
    pub async fn accept_request(
        &self,
        device_id: DeviceId,
        uri: RequestUri,
        client_id: ClientId,
        sub: Sub,
    ) -> Result<String, OAuthError> {
        let client = self.client_manager.get_client(&client_id).await?;
        let request_info = self
            .request_manager
            .get(&uri, &client_id, &device_id)
            .await?;
        let parameters = &request_info.parameters;

        // NOTE: the selected account only needs a device binding, not a
        // remembered one: a sign-in with remember=false can still be picked
        // here for the duration of the authentication max age.
        let account_info = match self.account_manager.get(&device_id, &sub).await {
            Ok(account_info) => account_info,
            Err(error) => {
                let _ = self.request_manager.delete(&uri).await;
                return authorize_redirect_url(
                    &self.verifier.issuer,
                    parameters,
                    RedirectParams::from_error(&OAuthError::AccessDenied(error.to_string())),
                );
            }
        };

        // The user is trying to authorize without a fresh login.
        if self.login_required(&account_info.info) {
            return Err(OAuthError::LoginRequired);
        }

        let code = match self
            .request_manager
            .set_authorized(&uri, &device_id, &account_info.account)
            .await
        {
            Ok(code) => code,
            Err(error) => {
                let _ = self.request_manager.delete(&uri).await;
                return authorize_redirect_url(
                    &self.verifier.issuer,
                    parameters,
                    RedirectParams::from_error(&error),
                );
            }
        };

        self.account_manager
            .add_authorized_client(device_id, &account_info.account, &client.id)
            .await?;

        authorize_redirect_url(&self.verifier.issuer, parameters, RedirectParams::Code(code))
    }

    /// GET `/oauth/authorize/reject`: the user declined. Returns the
    /// redirect URL carrying `access_denied`.
    pub async fn reject_request(
        &self,
        device_id: DeviceId,
        uri: RequestUri,
        client_id: ClientId,
    ) -> Result<String, OAuthError> {
        let request_info = self
            .request_manager
            .get(&uri, &client_id, &device_id)
            .await?;
        self.request_manager.delete(&uri).await?;

        authorize_redirect_url(
            &self.verifier.issuer,
            &request_info.parameters,
            RedirectParams::Error {
                error: "access_denied",
                description: "Access denied".to_string(),
            },
        )
    }

    /// POST `/oauth/token`.
    pub async fn token(
        &self,
        credentials: ClientCredentials,
        request: TokenRequest,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let (client, client_auth) = self.authenticate_client(&credentials).await?;

        let grant_type = match &request {
            TokenRequest::AuthorizationCode { .. } => GrantType::AuthorizationCode,
            TokenRequest::RefreshToken { .. } => GrantType::RefreshToken,
            TokenRequest::Password { .. } | TokenRequest::ClientCredentials {} => {
                return Err(OAuthError::UnsupportedGrantType(
                    "Grant type is not supported by this server".to_string(),
                ));
            }
        };
        if !self.metadata.supports_grant_type(grant_type) {
            return Err(OAuthError::UnsupportedGrantType(format!(
                "Grant type {grant_type} is not supported by this server"
            )));
        }
        if !client.metadata.grant_types.contains(&grant_type) {
            return Err(OAuthError::InvalidGrant(format!(
                "Client is not registered for the {grant_type} grant"
            )));
        }

        match request {
            TokenRequest::AuthorizationCode {
                code,
                code_verifier,
                ..
            } => {
                self.code_grant(&client, &client_auth, code, code_verifier, dpop_jkt)
                    .await
            }
            TokenRequest::RefreshToken { refresh_token } => {
                self.token_manager
                    .refresh(&client, &client_auth, &refresh_token, dpop_jkt)
                    .await
            }
            _ => unreachable!("filtered above"),
        }
    }

    async fn code_grant(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        code: String,
        code_verifier: Option<String>,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let code = Code::new(code)
            .map_err(|_| OAuthError::InvalidGrant("Invalid code".to_string()))?;

        let authorized = match self
            .request_manager
            .find_code(client, client_auth, &code)
            .await
        {
            Ok(authorized) => authorized,
            Err(error) => {
                // A code that cannot be consumed may have been spent
                // already: whatever tokens it produced must die with it.
                let _ = self.token_manager.revoke_by_code(&code).await;
                return Err(error);
            }
        };

        // Enforce a fresh PKCE challenge per authorization. The replay
        // window is bounded, which makes this a coarse guard; the intent is
        // to force clients into generating a new challenge every time.
        if let Some(code_challenge) = &authorized.parameters.code_challenge {
            if !self
                .verifier
                .replay_manager
                .unique_code_challenge(code_challenge)
                .await
            {
                return Err(OAuthError::InvalidGrant(
                    "Code challenge already used".to_string(),
                ));
            }
        }

        let account_info = self
            .account_manager
            .get(&authorized.device_id, &authorized.sub)
            .await?;

        self.token_manager
            .create(
                client,
                client_auth,
                &account_info.account,
                Some((authorized.device_id, account_info.info)),
                authorized.parameters,
                code,
                CodeGrantInput { code_verifier },
                dpop_jkt,
            )
            .await
    }

    /// POST `/oauth/revoke`.
    ///
    /// <https://datatracker.ietf.org/doc/html/rfc7009#section-2.1>
    pub async fn revoke(&self, token: &TokenIdentification) -> Result<(), OAuthError> {
        self.token_manager.revoke(&token.token).await
    }

    /// POST `/oauth/introspect`.
    ///
    /// <https://datatracker.ietf.org/doc/html/rfc7662#section-2.1>
    pub async fn introspect(
        &self,
        credentials: ClientCredentials,
        token: TokenIdentification,
    ) -> Result<IntrospectionResponse, OAuthError> {
        let started_at = tokio::time::Instant::now();

        // rfc7662 section 2.1: the endpoint requires client authentication
        // to prevent token scanning.
        let (client, client_auth) = self.authenticate_client(&credentials).await?;
        if client_auth == ClientAuth::None {
            return Err(OAuthError::UnauthorizedClient(
                "Client authentication required".to_string(),
            ));
        }

        let result = self
            .token_manager
            .client_token_info(&client, &client_auth, &token)
            .await;

        // Pad to a fixed floor so invalid tokens are indistinguishable from
        // slow lookups.
        let floor = Duration::from_millis(INTROSPECTION_TIMING_FLOOR);
        let elapsed = started_at.elapsed();
        if elapsed < floor {
            tokio::time::sleep(floor - elapsed).await;
        }

        let token_info = match result {
            Ok(token_info) => token_info,
            // Never say why.
            Err(_) => return Ok(IntrospectionResponse::inactive()),
        };

        let data = &token_info.data;
        Ok(IntrospectionResponse::Active(ActiveTokenInfo {
            active: true,
            scope: data.parameters.scope.as_ref().map(|s| s.as_str().to_string()),
            client_id: Some(data.client_id.as_str().to_string()),
            username: token_info.account.preferred_username.clone(),
            token_type: Some(match data.parameters.dpop_jkt {
                Some(_) => TokenType::DPoP,
                None => TokenType::Bearer,
            }),
            aud: Some(token_info.account.aud.clone()),
            exp: Some(data.expires_at.timestamp()),
            iat: Some(data.updated_at.timestamp()),
            iss: Some(self.verifier.issuer.as_str().to_string()),
            jti: Some(token_info.id.as_str().to_string()),
            sub: Some(data.sub.as_str().to_string()),
            authorization_details: data.details.clone(),
        }))
    }

    /// Resource-server-side token validation: opaque ids hit the store,
    /// JWTs verify statelessly.
    pub async fn authenticate_token(
        &self,
        token_type: TokenType,
        token: &str,
        dpop_jkt: Option<&str>,
        options: &VerifyTokenClaimsOptions,
    ) -> Result<AccessTokenClaims, OAuthError> {
        if let Ok(token_id) = TokenId::new(token) {
            let (_, claims) = self
                .token_manager
                .authenticate_token_id(token_type, &token_id, dpop_jkt, options)
                .await?;
            return Ok(claims);
        }
        self.verifier
            .authenticate_token(token_type, token, dpop_jkt, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::{Keyset, SigningKey};
    use crate::provider::account::AccountStoreMemory;
    use crate::provider::client_manager::{default_loopback_metadata, ClientStoreMemory};
    use crate::provider::device::DeviceStoreMemory;
    use crate::provider::replay::ReplayStoreMemory;
    use crate::provider::request::RequestStoreMemory;
    use crate::provider::token::TokenStoreMemory;
    use crate::types::{AuthMethod, CodeChallengeMethod, RedirectUri, ResponseType, Scope};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{Algorithm, Header};
    use serde_json::json;
    use sha2::{Digest, Sha256};

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn alice() -> Account {
        Account {
            sub: Sub::new("did:plc:alice").unwrap(),
            aud: vec!["https://pds.example.com".to_string()],
            preferred_username: Some("alice.test".to_string()),
            email: None,
        }
    }

    fn web_client_metadata() -> ClientMetadata {
        ClientMetadata {
            client_id: None,
            client_name: Some("Stored web client".to_string()),
            client_uri: None,
            logo_uri: None,
            tos_uri: None,
            policy_uri: None,
            redirect_uris: vec![RedirectUri::new("https://web.example.com/cb").unwrap()],
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            response_types: vec![crate::types::ResponseType::Code],
            scope: Some(Scope::new("atproto offline_access").unwrap()),
            token_endpoint_auth_method: Some(AuthMethod::None),
            token_endpoint_auth_signing_alg: None,
            application_type: crate::types::ApplicationType::Web,
            jwks: None,
            jwks_uri: None,
            dpop_bound_access_tokens: Some(true),
            subject_type: None,
            default_max_age: None,
            userinfo_signed_response_alg: None,
            id_token_signed_response_alg: None,
            tls_client_certificate_bound_access_tokens: None,
        }
    }

    fn confidential_client_metadata(
        application_type: crate::types::ApplicationType,
        jwks: jsonwebtoken::jwk::JwkSet,
    ) -> ClientMetadata {
        ClientMetadata {
            token_endpoint_auth_method: Some(AuthMethod::PrivateKeyJwt),
            token_endpoint_auth_signing_alg: Some("ES256".to_string()),
            application_type,
            jwks: Some(jwks),
            redirect_uris: vec![RedirectUri::new("https://web.example.com/cb").unwrap()],
            ..web_client_metadata()
        }
    }

    struct TestSetup {
        provider: Provider,
        client_keyset: Keyset,
    }

    fn setup() -> TestSetup {
        let client_keyset =
            Keyset::new(vec![SigningKey::generate("client-key-1").unwrap()]).unwrap();

        let client_store = ClientStoreMemory::new()
            .with_client(
                ClientId::new("https://web.example.com").unwrap(),
                web_client_metadata(),
            )
            .with_client(
                ClientId::new("https://confidential.example.com").unwrap(),
                confidential_client_metadata(
                    crate::types::ApplicationType::Web,
                    client_keyset.public_jwks(),
                ),
            )
            .with_client(
                ClientId::new("https://native.example.com").unwrap(),
                confidential_client_metadata(
                    crate::types::ApplicationType::Native,
                    client_keyset.public_jwks(),
                ),
            );

        let options = ProviderOptions {
            issuer: Issuer::new("https://auth.example.com").unwrap(),
            keyset: Arc::new(Keyset::new(vec![SigningKey::generate("issuer-key").unwrap()]).unwrap()),
            account_store: Arc::new(RwLock::new(
                AccountStoreMemory::new().with_account("alice.test", "hunter2", alice()),
            )),
            device_store: Arc::new(RwLock::new(DeviceStoreMemory::new())),
            request_store: Arc::new(RwLock::new(RequestStoreMemory::new())),
            token_store: Arc::new(RwLock::new(TokenStoreMemory::new())),
            replay_store: Arc::new(RwLock::new(ReplayStoreMemory::new())),
            client_store: Some(Arc::new(RwLock::new(client_store))),
            loopback_metadata: Some(Box::new(default_loopback_metadata)),
            hooks: Hooks::default(),
            metadata: None,
            authentication_max_age: None,
            token_max_age: None,
            access_token_mode: None,
            dpop_secret: None,
            dpop_step: None,
            device_manager_options: None,
        };
        TestSetup {
            provider: Provider::new(options).unwrap(),
            client_keyset,
        }
    }

    fn loopback_credentials() -> ClientCredentials {
        ClientCredentials::None {
            client_id: ClientId::new("http://localhost").unwrap(),
        }
    }

    fn par_parameters(client_id: &str, redirect_uri: &str) -> AuthorizationParameters {
        let mut parameters = AuthorizationParameters::new(
            ClientId::new(client_id).unwrap(),
            crate::types::ResponseType::Code,
        );
        parameters.redirect_uri = Some(RedirectUri::new(redirect_uri).unwrap());
        parameters.scope = Some(Scope::new("atproto").unwrap());
        parameters.state = Some("s1".to_string());
        parameters.code_challenge =
            Some(URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes())));
        parameters.code_challenge_method = Some(CodeChallengeMethod::S256);
        parameters
    }

    fn sign_in_credentials() -> SignInCredentials {
        SignInCredentials {
            username: "alice.test".to_string(),
            password: "hunter2".to_string(),
            remember: Some(true),
            email_otp: None,
        }
    }

    fn assertion_credentials(keyset: &Keyset, client_id: &str, jti: &str) -> ClientCredentials {
        let claims = json!({
            "iss": client_id,
            "sub": client_id,
            "aud": "https://auth.example.com",
            "jti": jti,
            "iat": chrono::Utc::now().timestamp(),
            "exp": chrono::Utc::now().timestamp() + 60,
        });
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some("client-key-1".to_string());
        ClientCredentials::JwtBearer {
            client_id: ClientId::new(client_id).unwrap(),
            client_assertion_type: crate::types::CLIENT_ASSERTION_TYPE_JWT_BEARER.to_string(),
            client_assertion: keyset.sign_with_header(&header, &claims).unwrap(),
        }
    }

    fn redirect_query(url: &str) -> std::collections::HashMap<String, String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// Drive PAR -> authorize -> sign-in -> accept and return the code.
    async fn authorize_code(
        provider: &Provider,
        device_id: &DeviceId,
        credentials: &ClientCredentials,
        parameters: AuthorizationParameters,
        dpop_jkt: Option<&str>,
        remember: bool,
    ) -> String {
        let par = provider
            .pushed_authorization_request(
                credentials.clone(),
                ParRequest::Parameters(parameters),
                dpop_jkt.map(str::to_string),
            )
            .await
            .unwrap();
        assert!(par.expires_in <= 300);

        let query = AuthorizationQuery::Uri {
            client_id: credentials.client_id().clone(),
            request_uri: par.request_uri.clone(),
        };
        match provider.authorize(device_id, &query).await.unwrap() {
            AuthorizeOutcome::Page(page) => assert!(page.sessions.iter().all(|s| !s.selected)),
            AuthorizeOutcome::Redirect(url) => panic!("expected interaction page, got {url}"),
        }

        let mut credentials_in = sign_in_credentials();
        credentials_in.remember = Some(remember);
        let signed_in = provider
            .sign_in(
                device_id.clone(),
                par.request_uri.clone(),
                credentials.client_id().clone(),
                credentials_in,
            )
            .await
            .unwrap();

        let url = provider
            .accept_request(
                device_id.clone(),
                par.request_uri.clone(),
                credentials.client_id().clone(),
                signed_in.account.sub.clone(),
            )
            .await
            .unwrap();
        let query = redirect_query(&url);
        assert_eq!(query.get("state").map(String::as_str), Some("s1"));
        assert_eq!(
            query.get("iss").map(String::as_str),
            Some("https://auth.example.com")
        );
        query.get("code").expect("redirect carries a code").clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_code_dpop_pkce() {
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = loopback_credentials();
        let code = authorize_code(
            &provider,
            &device_id,
            &credentials,
            par_parameters("http://localhost", "http://127.0.0.1/"),
            Some("jkt-proof"),
            true,
        )
        .await;

        let response = provider
            .token(
                credentials,
                TokenRequest::AuthorizationCode {
                    code,
                    redirect_uri: None,
                    code_verifier: Some(VERIFIER.to_string()),
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(response.token_type, TokenType::DPoP);
        assert_eq!(response.expires_in, 3600);
        assert!(response.refresh_token.is_some());
        assert_eq!(response.scope, Some(Scope::new("atproto").unwrap()));
        assert_eq!(response.sub.as_deref(), Some("did:plc:alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pkce_failure() {
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = loopback_credentials();
        let code = authorize_code(
            &provider,
            &device_id,
            &credentials,
            par_parameters("http://localhost", "http://127.0.0.1/"),
            Some("jkt-proof"),
            true,
        )
        .await;

        let error = provider
            .token(
                credentials,
                TokenRequest::AuthorizationCode {
                    code,
                    redirect_uri: None,
                    code_verifier: Some("wrong-verifier-wrong-verifier-wrong-verifier".to_string()),
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_replay_revokes_tokens() {
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = loopback_credentials();
        let code = authorize_code(
            &provider,
            &device_id,
            &credentials,
            par_parameters("http://localhost", "http://127.0.0.1/"),
            Some("jkt-proof"),
            true,
        )
        .await;

        let request = TokenRequest::AuthorizationCode {
            code,
            redirect_uri: None,
            code_verifier: Some(VERIFIER.to_string()),
        };
        let response = provider
            .token(credentials.clone(), request.clone(), Some("jkt-proof".to_string()))
            .await
            .unwrap();

        // Second spend fails and revokes the first grant's tokens.
        let error = provider
            .token(credentials.clone(), request, Some("jkt-proof".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");

        let error = provider
            .token(
                credentials,
                TokenRequest::RefreshToken {
                    refresh_token: response.refresh_token.unwrap(),
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rotation_and_replay() {
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = loopback_credentials();
        let code = authorize_code(
            &provider,
            &device_id,
            &credentials,
            par_parameters("http://localhost", "http://127.0.0.1/"),
            Some("jkt-proof"),
            true,
        )
        .await;

        let response = provider
            .token(
                credentials.clone(),
                TokenRequest::AuthorizationCode {
                    code,
                    redirect_uri: None,
                    code_verifier: Some(VERIFIER.to_string()),
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap();
        let first_refresh = response.refresh_token.unwrap();

        let rotated = provider
            .token(
                credentials.clone(),
                TokenRequest::RefreshToken {
                    refresh_token: first_refresh.clone(),
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap();
        assert_ne!(rotated.refresh_token.as_deref(), Some(first_refresh.as_str()));

        // Replay of the rotated-out refresh token kills the lineage.
        let error = provider
            .token(
                credentials.clone(),
                TokenRequest::RefreshToken {
                    refresh_token: first_refresh,
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");

        let error = provider
            .token(
                credentials,
                TokenRequest::RefreshToken {
                    refresh_token: rotated.refresh_token.unwrap(),
                },
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_none_without_session_redirects_login_required() {
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = loopback_credentials();

        let mut parameters = par_parameters("http://localhost", "http://127.0.0.1/");
        parameters.prompt = Some(Prompt::None);
        let par = provider
            .pushed_authorization_request(
                credentials.clone(),
                ParRequest::Parameters(parameters),
                None,
            )
            .await
            .unwrap();

        let query = AuthorizationQuery::Uri {
            client_id: credentials.client_id().clone(),
            request_uri: par.request_uri,
        };
        match provider.authorize(&device_id, &query).await.unwrap() {
            AuthorizeOutcome::Redirect(url) => {
                let query = redirect_query(&url);
                assert_eq!(
                    query.get("error").map(String::as_str),
                    Some("login_required")
                );
                assert_eq!(query.get("state").map(String::as_str), Some("s1"));
            }
            AuthorizeOutcome::Page(_) => panic!("expected a redirect"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_client_must_use_none_method() {
        let TestSetup {
            provider,
            client_keyset,
        } = setup();
        let credentials = assertion_credentials(
            &client_keyset,
            "https://native.example.com",
            "native-jti-1",
        );
        let error = provider
            .token(
                credentials,
                TokenRequest::AuthorizationCode {
                    code: "cod-irrelevant".to_string(),
                    redirect_uri: None,
                    code_verifier: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");
        assert!(error.to_string().contains("\"none\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_assertion_jti_replay() {
        let TestSetup {
            provider,
            client_keyset,
        } = setup();
        let credentials = assertion_credentials(
            &client_keyset,
            "https://confidential.example.com",
            "assert-jti-1",
        );

        // First use is consumed by an (otherwise failing) token request.
        let _ = provider
            .token(
                credentials.clone(),
                TokenRequest::AuthorizationCode {
                    code: "cod-irrelevant".to_string(),
                    redirect_uri: None,
                    code_verifier: None,
                },
                None,
            )
            .await;

        let error = provider
            .token(
                credentials,
                TokenRequest::AuthorizationCode {
                    code: "cod-irrelevant".to_string(),
                    redirect_uri: None,
                    code_verifier: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "invalid_grant");
        assert!(error.to_string().contains("jti"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jar_replay_at_par() {
        let TestSetup {
            provider,
            client_keyset,
        } = setup();
        let client_id = "https://confidential.example.com";

        let jar_claims = json!({
            "iss": client_id,
            "aud": "https://auth.example.com",
            "jti": "jar-jti-1",
            "iat": chrono::Utc::now().timestamp(),
            "exp": chrono::Utc::now().timestamp() + 30,
            "client_id": client_id,
            "response_type": "code",
            "redirect_uri": "https://web.example.com/cb",
            "scope": "atproto",
            "state": "s1",
            "code_challenge": URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes())),
            "code_challenge_method": "S256",
        });
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some("client-key-1".to_string());
        let jar = client_keyset.sign_with_header(&header, &jar_claims).unwrap();

        provider
            .pushed_authorization_request(
                assertion_credentials(&client_keyset, client_id, "assert-jti-a"),
                ParRequest::Jar {
                    request: jar.clone(),
                },
                None,
            )
            .await
            .unwrap();

        let error = provider
            .pushed_authorization_request(
                assertion_credentials(&client_keyset, client_id, "assert-jti-b"),
                ParRequest::Jar { request: jar },
                None,
            )
            .await
            .unwrap_err();
        // Downgraded per rfc9126 either way, but the jti guard reports
        // invalid_request directly.
        assert_eq!(error.code(), "invalid_request");
    }

    #[tokio::test(start_paused = true)]
    async fn test_introspection_requires_confidential_client() {
        let TestSetup { provider, .. } = setup();
        let error = provider
            .introspect(
                loopback_credentials(),
                TokenIdentification {
                    token: "tok-whatever".to_string(),
                    token_type_hint: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(error.code(), "unauthorized_client");
    }

    #[tokio::test(start_paused = true)]
    async fn test_introspection_of_unknown_token_is_inactive() {
        let TestSetup {
            provider,
            client_keyset,
        } = setup();
        let credentials = assertion_credentials(
            &client_keyset,
            "https://confidential.example.com",
            "introspect-jti-1",
        );
        let response = provider
            .introspect(
                credentials,
                TokenIdentification {
                    token: "tok-00000000000000000000000000000000".to_string(),
                    token_type_hint: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(response, IntrospectionResponse::inactive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unremembered_session_can_still_accept() {
        // A sign-in with remember=false is not listed on the chooser but
        // can be selected at accept time during the authentication window.
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = loopback_credentials();
        let code = authorize_code(
            &provider,
            &device_id,
            &credentials,
            par_parameters("http://localhost", "http://127.0.0.1/"),
            Some("jkt-proof"),
            false,
        )
        .await;
        assert!(code.starts_with("cod-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_remembered_per_client_not_per_scope() {
        let TestSetup { provider, .. } = setup();
        let device_id = DeviceId::generate();
        let credentials = ClientCredentials::None {
            client_id: ClientId::new("https://web.example.com").unwrap(),
        };

        let _ = authorize_code(
            &provider,
            &device_id,
            &credentials,
            par_parameters("https://web.example.com", "https://web.example.com/cb"),
            Some("jkt-proof"),
            true,
        )
        .await;

        // Second authorization for the same client: consent is no longer
        // required, even with a broader scope than was first granted.
        let mut parameters =
            par_parameters("https://web.example.com", "https://web.example.com/cb");
        parameters.scope = Some(Scope::new("atproto offline_access").unwrap());
        parameters.code_challenge = Some(
            URL_SAFE_NO_PAD.encode(Sha256::digest("another-verifier-another-verifier".as_bytes())),
        );
        let par = provider
            .pushed_authorization_request(
                credentials.clone(),
                ParRequest::Parameters(parameters),
                Some("jkt-proof".to_string()),
            )
            .await
            .unwrap();

        let signed_in = provider
            .sign_in(
                device_id.clone(),
                par.request_uri.clone(),
                credentials.client_id().clone(),
                sign_in_credentials(),
            )
            .await
            .unwrap();
        assert!(!signed_in.consent_required);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_requires_login() {
        let TestSetup { provider, .. } = setup();
        // Older than the default 7-day authentication max age.
        let info = DeviceAccountInfo {
            remembered: true,
            authenticated_at: Utc::now() - chrono::Duration::days(8),
            authorized_clients: vec![],
        };
        assert!(provider.login_required(&info));

        let fresh = DeviceAccountInfo {
            remembered: true,
            authenticated_at: Utc::now(),
            authorized_clients: vec![],
        };
        assert!(!provider.login_required(&fresh));
    }
}
