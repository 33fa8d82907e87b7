use crate::constants::{
    AUTHENTICATED_REFRESH_INACTIVITY_TIMEOUT, AUTHENTICATED_REFRESH_LIFETIME, TOKEN_MAX_AGE,
    UNAUTHENTICATED_REFRESH_INACTIVITY_TIMEOUT, UNAUTHENTICATED_REFRESH_LIFETIME,
};
use crate::errors::OAuthError;
use crate::provider::account::{Account, DeviceAccountInfo};
use crate::provider::client::{Client, ClientAuth};
use crate::provider::device::DeviceId;
use crate::provider::hooks::Hooks;
use crate::provider::request::Code;
use crate::provider::signer::{
    verify_token_claims, AccessTokenClaims, AccessTokenMode, Confirmation, Signer,
    VerifyTokenClaimsOptions,
};
use crate::provider::token::{
    NewTokenData, RefreshToken, TokenData, TokenId, TokenInfo, TokenStore,
};
use crate::types::{
    AuthorizationParameters, CodeChallengeMethod, GrantType, TokenIdentification, TokenResponse,
    TokenType,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Inputs of the code grant that the token manager checks itself.
#[derive(Debug, Clone, Default)]
pub struct CodeGrantInput {
    pub code_verifier: Option<String>,
}

pub struct TokenManager {
    store: Arc<RwLock<dyn TokenStore>>,
    signer: Arc<Signer>,
    access_token_mode: AccessTokenMode,
    token_max_age: u64,
    hooks: Arc<Hooks>,
}

impl TokenManager {
    pub fn new(
        store: Arc<RwLock<dyn TokenStore>>,
        signer: Arc<Signer>,
        access_token_mode: AccessTokenMode,
        token_max_age: Option<u64>,
        hooks: Arc<Hooks>,
    ) -> Self {
        TokenManager {
            store,
            signer,
            access_token_mode,
            token_max_age: token_max_age.unwrap_or(TOKEN_MAX_AGE),
            hooks,
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.token_max_age as i64)
    }

    fn use_jwt_access_token(&self, account: &Account) -> bool {
        match self.access_token_mode {
            AccessTokenMode::Jwt => true,
            AccessTokenMode::Opaque => false,
            AccessTokenMode::Auto => {
                // The issuer's own resource server can look tokens up in the
                // store; remote audiences need a self-contained JWT.
                !(account.aud.len() == 1 && account.aud[0] == self.signer.issuer.as_str())
            }
        }
    }

    fn check_pkce(
        parameters: &AuthorizationParameters,
        input: &CodeGrantInput,
    ) -> Result<(), OAuthError> {
        match (&parameters.code_challenge, &input.code_verifier) {
            (Some(challenge), Some(verifier)) => {
                match parameters.code_challenge_method.unwrap_or(CodeChallengeMethod::S256) {
                    CodeChallengeMethod::S256 => {
                        let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
                        if &computed != challenge {
                            return Err(OAuthError::InvalidGrant(
                                "Invalid code_verifier".to_string(),
                            ));
                        }
                        Ok(())
                    }
                    CodeChallengeMethod::Plain => Err(OAuthError::InvalidGrant(
                        "The \"plain\" code_challenge_method is not allowed".to_string(),
                    )),
                }
            }
            (Some(_), None) => Err(OAuthError::InvalidGrant(
                "code_verifier is required".to_string(),
            )),
            (None, Some(_)) => Err(OAuthError::InvalidRequest(
                "code_verifier was provided but no code_challenge was set".to_string(),
            )),
            (None, None) => Err(OAuthError::InvalidGrant(
                "Missing code_challenge".to_string(),
            )),
        }
    }

    fn check_dpop_binding(
        client: &Client,
        client_auth: &ClientAuth,
        parameters: &mut AuthorizationParameters,
        dpop_jkt: Option<String>,
    ) -> Result<(), OAuthError> {
        if client.metadata.dpop_bound_access_tokens == Some(true) && dpop_jkt.is_none() {
            return Err(OAuthError::InvalidDpopProof(
                "DPoP proof required".to_string(),
            ));
        }

        match (&parameters.dpop_jkt, dpop_jkt) {
            // Clients may bind at the token endpoint if they did not
            // during the authorization request.
            (None, Some(jkt)) => parameters.dpop_jkt = Some(jkt),
            (Some(declared), Some(proved)) => {
                if declared != &proved {
                    return Err(OAuthError::InvalidDpopKeyBinding);
                }
            }
            (Some(_), None) => return Err(OAuthError::InvalidDpopKeyBinding),
            (None, None) => {}
        }

        // Clients must not sign DPoP proofs with their client
        // authentication key.
        if let (Some(client_jkt), Some(proof_jkt)) = (client_auth.jkt(), &parameters.dpop_jkt) {
            if client_jkt == proof_jkt {
                return Err(OAuthError::InvalidRequest(
                    "The DPoP proof must be signed with a different key than the client assertion"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Issue the access (and possibly refresh) token for a consumed
    /// authorization code.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        account: &Account,
        device: Option<(DeviceId, DeviceAccountInfo)>,
        mut parameters: AuthorizationParameters,
        code: Code,
        input: CodeGrantInput,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        Self::check_dpop_binding(client, client_auth, &mut parameters, dpop_jkt)?;
        Self::check_pkce(&parameters, &input)?;

        let token_id = TokenId::generate();
        let refresh_token = if client.metadata.grant_types.contains(&GrantType::RefreshToken) {
            Some(RefreshToken::generate())
        } else {
            None
        };

        let now = Utc::now();
        let expires_at = self.expiry();
        let details = self
            .hooks
            .on_authorization_details
            .as_ref()
            .and_then(|hook| hook(client, &parameters, account));

        let (device_id, device_info) = match device {
            Some((device_id, info)) => (Some(device_id), Some(info)),
            None => (None, None),
        };

        let data = TokenData {
            created_at: now,
            updated_at: now,
            expires_at,
            client_id: client.id.clone(),
            client_auth: client_auth.clone(),
            device_id,
            sub: account.sub.clone(),
            parameters: parameters.clone(),
            details: details.clone(),
            code: Some(code),
        };

        let access_token = self.build_access_token(&token_id, &data, account)?;

        self.store.write().await.create_token(
            token_id,
            data,
            account.clone(),
            device_info,
            refresh_token.clone(),
        )?;

        Ok(TokenResponse {
            access_token,
            token_type: match parameters.dpop_jkt {
                Some(_) => TokenType::DPoP,
                None => TokenType::Bearer,
            },
            expires_in: self.token_max_age / 1000,
            refresh_token: refresh_token.map(RefreshToken::into_inner),
            scope: parameters.scope,
            sub: Some(account.sub.as_str().to_string()),
            authorization_details: details,
        })
    }

    fn build_access_token(
        &self,
        token_id: &TokenId,
        data: &TokenData,
        account: &Account,
    ) -> Result<String, OAuthError> {
        if !self.use_jwt_access_token(account) {
            return Ok(token_id.as_str().to_string());
        }
        let claims = AccessTokenClaims {
            iss: self.signer.issuer.as_str().to_string(),
            aud: account.aud.clone(),
            sub: account.sub.as_str().to_string(),
            client_id: data.client_id.as_str().to_string(),
            scope: data.parameters.scope.as_ref().map(|s| s.as_str().to_string()),
            jti: token_id.as_str().to_string(),
            iat: data.updated_at.timestamp(),
            exp: data.expires_at.timestamp(),
            cnf: data
                .parameters
                .dpop_jkt
                .clone()
                .map(|jkt| Confirmation { jkt }),
        };
        self.signer.sign_access_token(&claims)
    }

    /// Rotate a refresh token.
    ///
    /// Presentation of a rotated-out refresh token revokes the whole
    /// lineage: whoever holds the other copy must not be able to use it
    /// either.
    pub async fn refresh(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        refresh_token: &str,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let refresh_token = RefreshToken::new(refresh_token)
            .map_err(|_| OAuthError::InvalidGrant("Invalid refresh token".to_string()))?;

        let mut store = self.store.write().await;
        let token_info = store
            .find_token_by_refresh_token(&refresh_token)?
            .ok_or_else(|| OAuthError::InvalidGrant("Invalid refresh token".to_string()))?;

        if token_info.current_refresh_token.as_ref() != Some(&refresh_token) {
            store.delete_token(&token_info.id)?;
            tracing::warn!(token_id = %token_info.id, "refresh token replay, lineage revoked");
            return Err(OAuthError::InvalidGrant(
                "Refresh token was already used".to_string(),
            ));
        }

        let data = &token_info.data;
        if data.client_id != client.id {
            store.delete_token(&token_info.id)?;
            return Err(OAuthError::InvalidGrant(
                "This refresh token was issued to another client".to_string(),
            ));
        }
        if !data.client_auth.matches_method(client_auth) {
            return Err(OAuthError::InvalidGrant(
                "This refresh token was obtained under a different client authentication method"
                    .to_string(),
            ));
        }

        let mut parameters = data.parameters.clone();
        Self::check_dpop_binding(client, client_auth, &mut parameters, dpop_jkt)?;
        if parameters.dpop_jkt != data.parameters.dpop_jkt {
            // Binding cannot be introduced or changed after issuance.
            return Err(OAuthError::InvalidDpopKeyBinding);
        }

        let (lifetime, inactivity_timeout) = match data.client_auth {
            ClientAuth::None => (
                UNAUTHENTICATED_REFRESH_LIFETIME,
                UNAUTHENTICATED_REFRESH_INACTIVITY_TIMEOUT,
            ),
            ClientAuth::JwtBearer { .. } => (
                AUTHENTICATED_REFRESH_LIFETIME,
                AUTHENTICATED_REFRESH_INACTIVITY_TIMEOUT,
            ),
        };
        let now = Utc::now();
        if data.created_at + Duration::milliseconds(lifetime as i64) < now {
            store.delete_token(&token_info.id)?;
            return Err(OAuthError::InvalidGrant("Session expired".to_string()));
        }
        if data.updated_at + Duration::milliseconds(inactivity_timeout as i64) < now {
            store.delete_token(&token_info.id)?;
            return Err(OAuthError::InvalidGrant(
                "Session expired due to inactivity".to_string(),
            ));
        }

        let next_token_id = TokenId::generate();
        let next_refresh_token = RefreshToken::generate();
        let expires_at = self.expiry();

        store.rotate_token(
            &token_info.id,
            next_token_id.clone(),
            next_refresh_token.clone(),
            NewTokenData {
                client_auth: client_auth.clone(),
                expires_at,
                updated_at: now,
            },
        )?;

        let data = TokenData {
            updated_at: now,
            expires_at,
            ..token_info.data
        };
        let access_token = self.build_access_token(&next_token_id, &data, &token_info.account)?;

        Ok(TokenResponse {
            access_token,
            token_type: match data.parameters.dpop_jkt {
                Some(_) => TokenType::DPoP,
                None => TokenType::Bearer,
            },
            expires_in: self.token_max_age / 1000,
            refresh_token: Some(next_refresh_token.into_inner()),
            scope: data.parameters.scope,
            sub: Some(data.sub.as_str().to_string()),
            authorization_details: data.details,
        })
    }

    /// Best-effort, idempotent revocation of whatever `token` designates:
    /// token id, signed JWT, refresh token or authorization code.
    ///
    /// <https://datatracker.ietf.org/doc/html/rfc7009#section-2.2>
    pub async fn revoke(&self, token: &str) -> Result<(), OAuthError> {
        let mut store = self.store.write().await;

        if let Ok(token_id) = TokenId::new(token) {
            store.delete_token(&token_id)?;
        } else if let Ok(refresh_token) = RefreshToken::new(token) {
            if let Some(token_info) = store.find_token_by_refresh_token(&refresh_token)? {
                store.delete_token(&token_info.id)?;
            }
        } else if let Ok(code) = Code::new(token) {
            if let Some(token_info) = store.find_token_by_code(&code)? {
                store.delete_token(&token_info.id)?;
            }
        } else if let Ok(claims) = self
            .signer
            .verify_access_token(token, TokenType::Bearer)
        {
            if let Ok(token_id) = TokenId::new(claims.jti) {
                store.delete_token(&token_id)?;
            }
        }
        // Unknown token shapes are silently ignored.
        Ok(())
    }

    /// Revoke whatever tokens were derived from `code`. Used when a code is
    /// presented twice: the first exchange must be undone.
    pub async fn revoke_by_code(&self, code: &Code) -> Result<bool, OAuthError> {
        let mut store = self.store.write().await;
        match store.find_token_by_code(code)? {
            Some(token_info) => {
                store.delete_token(&token_info.id)?;
                tracing::warn!(token_id = %token_info.id, "code replayed, derived tokens revoked");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Token lookup for introspection: only the token's original client,
    /// authenticating the same way, may see it.
    pub async fn client_token_info(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        token: &TokenIdentification,
    ) -> Result<TokenInfo, OAuthError> {
        let token_info = self
            .find_token_info(&token.token)
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("Invalid token".to_string()))?;

        if token_info.data.client_id != client.id {
            return Err(OAuthError::InvalidGrant(
                "Token was issued to another client".to_string(),
            ));
        }
        if !token_info.data.client_auth.matches_method(client_auth) {
            return Err(OAuthError::InvalidGrant(
                "Client authentication method mismatch".to_string(),
            ));
        }
        if token_info.data.expires_at < Utc::now() {
            return Err(OAuthError::InvalidGrant("Token expired".to_string()));
        }
        Ok(token_info)
    }

    async fn find_token_info(&self, token: &str) -> Result<Option<TokenInfo>, OAuthError> {
        let store = self.store.read().await;
        if let Ok(token_id) = TokenId::new(token) {
            return store.read_token(&token_id);
        }
        if let Ok(refresh_token) = RefreshToken::new(token) {
            return store.find_token_by_refresh_token(&refresh_token);
        }
        if let Ok(claims) = self.signer.verify_access_token(token, TokenType::Bearer) {
            if let Ok(token_id) = TokenId::new(claims.jti) {
                return store.read_token(&token_id);
            }
        }
        Ok(None)
    }

    /// Resource-server-side validation of an opaque token id. Returns the
    /// stored record along with the claims it would carry as a JWT.
    pub async fn authenticate_token_id(
        &self,
        token_type: TokenType,
        token_id: &TokenId,
        dpop_jkt: Option<&str>,
        verify_options: &VerifyTokenClaimsOptions,
    ) -> Result<(TokenInfo, AccessTokenClaims), OAuthError> {
        let token_info = self
            .store
            .read()
            .await
            .read_token(token_id)?
            .ok_or_else(|| {
                OAuthError::InvalidToken(token_type, "Invalid token".to_string())
            })?;

        if token_info.data.expires_at < Utc::now() {
            return Err(OAuthError::InvalidToken(
                token_type,
                "Token expired".to_string(),
            ));
        }

        // Rebuild the claims as if the token were a JWT and run the common
        // checks, including the cnf.jkt binding.
        let data = &token_info.data;
        let claims = AccessTokenClaims {
            iss: self.signer.issuer.as_str().to_string(),
            aud: token_info.account.aud.clone(),
            sub: data.sub.as_str().to_string(),
            client_id: data.client_id.as_str().to_string(),
            scope: data.parameters.scope.as_ref().map(|s| s.as_str().to_string()),
            jti: token_info.id.as_str().to_string(),
            iat: data.updated_at.timestamp(),
            exp: data.expires_at.timestamp(),
            cnf: data
                .parameters
                .dpop_jkt
                .clone()
                .map(|jkt| Confirmation { jkt }),
        };
        verify_token_claims(&claims, token_type, dpop_jkt, verify_options)?;

        Ok((token_info, claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::{Keyset, SigningKey};
    use crate::provider::account::Sub;
    use crate::provider::client::ClientInfo;
    use crate::provider::client_manager::default_loopback_metadata;
    use crate::provider::token::TokenStoreMemory;
    use crate::types::{ClientId, Issuer, LoopbackClientId, ResponseType, Scope};

    fn manager(mode: AccessTokenMode) -> TokenManager {
        let keyset = Keyset::new(vec![SigningKey::generate("issuer-key").unwrap()]).unwrap();
        let signer = Signer::new(
            Issuer::new("https://auth.example.com").unwrap(),
            Arc::new(keyset),
        );
        TokenManager::new(
            Arc::new(RwLock::new(TokenStoreMemory::new())),
            Arc::new(signer),
            mode,
            None,
            Arc::new(Hooks::default()),
        )
    }

    fn client() -> Client {
        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        Client::new(
            loopback.client_id().clone(),
            default_loopback_metadata(&loopback),
            None,
            ClientInfo::default(),
        )
    }

    fn account() -> Account {
        Account {
            sub: Sub::new("did:plc:alice").unwrap(),
            aud: vec!["https://pds.example.com".to_string()],
            preferred_username: Some("alice.test".to_string()),
            email: None,
        }
    }

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn parameters(client: &Client, dpop_jkt: Option<&str>) -> AuthorizationParameters {
        let mut parameters = AuthorizationParameters::new(client.id.clone(), ResponseType::Code);
        parameters.scope = Some(Scope::new("atproto").unwrap());
        parameters.code_challenge =
            Some(URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes())));
        parameters.code_challenge_method = Some(CodeChallengeMethod::S256);
        parameters.dpop_jkt = dpop_jkt.map(str::to_string);
        parameters
    }

    fn grant_input() -> CodeGrantInput {
        CodeGrantInput {
            code_verifier: Some(VERIFIER.to_string()),
        }
    }

    async fn issue(
        manager: &TokenManager,
        client: &Client,
        dpop_jkt: Option<&str>,
    ) -> Result<TokenResponse, OAuthError> {
        manager
            .create(
                client,
                &ClientAuth::None,
                &account(),
                None,
                parameters(client, dpop_jkt),
                Code::generate(),
                grant_input(),
                dpop_jkt.map(str::to_string),
            )
            .await
    }

    #[tokio::test]
    async fn test_create_with_dpop_and_pkce() {
        let manager = manager(AccessTokenMode::Auto);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();
        assert_eq!(response.token_type, TokenType::DPoP);
        assert_eq!(response.expires_in, 3600);
        assert!(response.refresh_token.is_some());
        assert_eq!(response.sub.as_deref(), Some("did:plc:alice"));
        // Audience differs from the issuer: JWT access token.
        assert!(response.access_token.contains('.'));
    }

    #[tokio::test]
    async fn test_create_requires_dpop_for_bound_clients() {
        let manager = manager(AccessTokenMode::Auto);
        let client = client();
        let error = issue(&manager, &client, None).await.unwrap_err();
        assert_eq!(
            error,
            OAuthError::InvalidDpopProof("DPoP proof required".to_string())
        );
    }

    #[tokio::test]
    async fn test_create_rejects_bad_verifier() {
        let manager = manager(AccessTokenMode::Auto);
        let client = client();
        let mut parameters = parameters(&client, Some("jkt-123"));
        parameters.code_challenge = Some("definitely-not-the-hash".to_string());
        let error = manager
            .create(
                &client,
                &ClientAuth::None,
                &account(),
                None,
                parameters,
                Code::generate(),
                grant_input(),
                Some("jkt-123".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(
            error,
            OAuthError::InvalidGrant("Invalid code_verifier".to_string())
        );
    }

    #[tokio::test]
    async fn test_create_rejects_jkt_mismatch() {
        let manager = manager(AccessTokenMode::Auto);
        let client = client();
        let parameters = parameters(&client, Some("jkt-declared"));
        let error = manager
            .create(
                &client,
                &ClientAuth::None,
                &account(),
                None,
                parameters,
                Code::generate(),
                grant_input(),
                Some("jkt-other".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(error, OAuthError::InvalidDpopKeyBinding);
    }

    #[tokio::test]
    async fn test_opaque_mode_returns_token_id() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();
        assert!(TokenId::is_token_id(&response.access_token));
    }

    #[tokio::test]
    async fn test_refresh_rotation_and_replay() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();
        let first_refresh = response.refresh_token.unwrap();

        let rotated = manager
            .refresh(
                &client,
                &ClientAuth::None,
                &first_refresh,
                Some("jkt-123".to_string()),
            )
            .await
            .unwrap();
        let second_refresh = rotated.refresh_token.clone().unwrap();
        assert_ne!(first_refresh, second_refresh);

        // Replaying the rotated-out token revokes the lineage.
        let error = manager
            .refresh(
                &client,
                &ClientAuth::None,
                &first_refresh,
                Some("jkt-123".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidGrant(_)));

        // The successor refresh token is dead too.
        let error = manager
            .refresh(
                &client,
                &ClientAuth::None,
                &second_refresh,
                Some("jkt-123".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidGrant(_)));

        // And so is the rotated access token.
        let access_token_id = TokenId::new(rotated.access_token).unwrap();
        let error = manager
            .authenticate_token_id(
                TokenType::DPoP,
                &access_token_id,
                Some("jkt-123"),
                &VerifyTokenClaimsOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidToken(_, _)));
    }

    #[tokio::test]
    async fn test_refresh_requires_same_dpop_key() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();
        let refresh_token = response.refresh_token.unwrap();

        let error = manager
            .refresh(
                &client,
                &ClientAuth::None,
                &refresh_token,
                Some("jkt-other".to_string()),
            )
            .await
            .unwrap_err();
        assert_eq!(error, OAuthError::InvalidDpopKeyBinding);
    }

    #[tokio::test]
    async fn test_authenticate_token_id_checks_binding() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();
        let token_id = TokenId::new(response.access_token).unwrap();

        manager
            .authenticate_token_id(
                TokenType::DPoP,
                &token_id,
                Some("jkt-123"),
                &VerifyTokenClaimsOptions::default(),
            )
            .await
            .unwrap();

        let error = manager
            .authenticate_token_id(
                TokenType::DPoP,
                &token_id,
                Some("jkt-impostor"),
                &VerifyTokenClaimsOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(error, OAuthError::InvalidDpopKeyBinding);
    }

    #[tokio::test]
    async fn test_revoke_by_code() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let code = Code::generate();
        manager
            .create(
                &client,
                &ClientAuth::None,
                &account(),
                None,
                parameters(&client, Some("jkt-123")),
                code.clone(),
                grant_input(),
                Some("jkt-123".to_string()),
            )
            .await
            .unwrap();

        assert!(manager.revoke_by_code(&code).await.unwrap());
        assert!(!manager.revoke_by_code(&code).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_accepts_all_shapes() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();
        let refresh_token = response.refresh_token.unwrap();

        // Revoking by refresh token removes the record.
        manager.revoke(&refresh_token).await.unwrap();
        let token_id = TokenId::new(response.access_token).unwrap();
        let error = manager
            .authenticate_token_id(
                TokenType::DPoP,
                &token_id,
                Some("jkt-123"),
                &VerifyTokenClaimsOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidToken(_, _)));

        // Unknown shapes are ignored.
        manager.revoke("garbage-token").await.unwrap();
    }

    #[tokio::test]
    async fn test_client_token_info_gated_on_client() {
        let manager = manager(AccessTokenMode::Opaque);
        let client = client();
        let response = issue(&manager, &client, Some("jkt-123")).await.unwrap();

        let identification = TokenIdentification {
            token: response.access_token.clone(),
            token_type_hint: None,
        };
        manager
            .client_token_info(&client, &ClientAuth::None, &identification)
            .await
            .unwrap();

        let other_client = Client::new(
            ClientId::new("https://other.example.com/meta.json").unwrap(),
            client.metadata.clone(),
            None,
            ClientInfo::default(),
        );
        let error = manager
            .client_token_info(&other_client, &ClientAuth::None, &identification)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidGrant(_)));
    }
}
