use crate::constants::{AUTHORIZATION_INACTIVITY_TIMEOUT, CODE_EXPIRES_IN, PAR_EXPIRES_IN};
use crate::errors::OAuthError;
use crate::provider::account::Account;
use crate::provider::client::{Client, ClientAuth};
use crate::provider::device::DeviceId;
use crate::provider::request::{
    AuthorizedRequestData, Code, RequestData, RequestId, RequestInfo, RequestStore,
    UpdateRequestData,
};
use crate::types::{
    AuthorizationParameters, ClientId, CodeChallengeMethod, RequestUri, ResponseType,
    ServerMetadata,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owns the authorization-request record through its lifecycle: created at
/// PAR, bound to a device on the authorize page, authorized on consent,
/// consumed at the token endpoint.
pub struct RequestManager {
    store: Arc<RwLock<dyn RequestStore>>,
    metadata: ServerMetadata,
}

impl RequestManager {
    pub fn new(store: Arc<RwLock<dyn RequestStore>>, metadata: ServerMetadata) -> Self {
        RequestManager { store, metadata }
    }

    pub async fn create_authorization_request(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        input: &AuthorizationParameters,
        device_id: Option<DeviceId>,
        dpop_jkt: Option<String>,
    ) -> Result<RequestInfo, OAuthError> {
        let parameters = self.validate(client, input, dpop_jkt)?;
        self.create(client, client_auth, parameters, device_id).await
    }

    async fn create(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        parameters: AuthorizationParameters,
        device_id: Option<DeviceId>,
    ) -> Result<RequestInfo, OAuthError> {
        let id = RequestId::generate();
        let expires_at = Utc::now() + Duration::milliseconds(PAR_EXPIRES_IN as i64);

        let data = RequestData {
            client_id: client.id.clone(),
            client_auth: client_auth.clone(),
            parameters: parameters.clone(),
            expires_at,
            device_id,
            sub: None,
            code: None,
        };
        self.store
            .write()
            .await
            .create_request(id.clone(), data)?;

        Ok(RequestInfo {
            uri: id.as_request_uri(),
            id,
            client_id: client.id.clone(),
            client_auth: client_auth.clone(),
            parameters,
            expires_at,
        })
    }

    /// Validate request parameters against the client registration and the
    /// server profile. Returns the normalized parameter set that gets
    /// persisted.
    fn validate(
        &self,
        client: &Client,
        input: &AuthorizationParameters,
        dpop_jkt: Option<String>,
    ) -> Result<AuthorizationParameters, OAuthError> {
        let mut parameters = input.clone();

        if parameters.client_id != client.id {
            return Err(OAuthError::InvalidParameters(
                "client_id parameter does not match the authenticated client".to_string(),
            ));
        }

        if parameters.response_type != ResponseType::Code {
            return Err(OAuthError::InvalidParameters(
                "Only the \"code\" response type is supported".to_string(),
            ));
        }
        if !client.metadata.response_types.contains(&ResponseType::Code) {
            return Err(OAuthError::UnauthorizedClient(
                "Client is not registered for the \"code\" response type".to_string(),
            ));
        }

        match &parameters.scope {
            Some(scope) => {
                let registered = client.metadata.scope.as_ref();
                let allowed = registered
                    .map(|client_scope| scope.is_subset_of(client_scope))
                    .unwrap_or(false);
                if !allowed {
                    return Err(OAuthError::InvalidScope(
                        "Requested scope exceeds the client registration".to_string(),
                    ));
                }
            }
            None => {
                parameters.scope = client.metadata.scope.clone();
            }
        }

        match &parameters.redirect_uri {
            Some(redirect_uri) => {
                if client.metadata.matching_redirect_uri(redirect_uri).is_none() {
                    return Err(OAuthError::InvalidRedirectUri(format!(
                        "Invalid redirect_uri {redirect_uri} (allowed: {})",
                        client
                            .metadata
                            .redirect_uris
                            .iter()
                            .map(|uri| uri.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    )));
                }
            }
            None => match client.metadata.redirect_uris.as_slice() {
                [only] => {
                    parameters.redirect_uri = Some(only.clone());
                }
                _ => {
                    return Err(OAuthError::InvalidParameters(
                        "redirect_uri is required".to_string(),
                    ));
                }
            },
        }

        // PKCE is mandatory for the code flow.
        match (&parameters.code_challenge, parameters.code_challenge_method) {
            (Some(_), method) => {
                let method = method.unwrap_or(CodeChallengeMethod::S256);
                let supported = self
                    .metadata
                    .code_challenge_methods_supported
                    .as_ref()
                    .map(|methods| methods.iter().any(|m| m == &method.to_string()))
                    .unwrap_or(false);
                if !supported {
                    return Err(OAuthError::InvalidParameters(format!(
                        "Unsupported code_challenge_method {method}"
                    )));
                }
                parameters.code_challenge_method = Some(method);
            }
            (None, Some(_)) => {
                return Err(OAuthError::InvalidParameters(
                    "code_challenge_method requires a code_challenge".to_string(),
                ));
            }
            (None, None) => {
                return Err(OAuthError::InvalidParameters(
                    "code_challenge is required".to_string(),
                ));
            }
        }

        // A DPoP proof on the PAR request binds the authorization up front.
        match (&parameters.dpop_jkt, dpop_jkt) {
            (None, Some(jkt)) => parameters.dpop_jkt = Some(jkt),
            (Some(declared), Some(proved)) if declared != &proved => {
                return Err(OAuthError::InvalidParameters(
                    "dpop_jkt parameter does not match the DPoP proof key".to_string(),
                ));
            }
            _ => {}
        }

        Ok(parameters)
    }

    /// Load a live request for an interactive step.
    ///
    /// Binds the request to the device on first sight and refuses devices
    /// other than the bound one afterwards. Successful retrieval slides the
    /// expiry forward so a user slowly filling a login form is not cut off.
    pub async fn get(
        &self,
        uri: &RequestUri,
        client_id: &ClientId,
        device_id: &DeviceId,
    ) -> Result<RequestInfo, OAuthError> {
        let id = RequestId::from_request_uri(uri)
            .map_err(|_| OAuthError::InvalidRequest("Invalid request_uri".to_string()))?;

        let mut store = self.store.write().await;
        let data = store
            .read_request(&id)?
            .ok_or_else(|| OAuthError::InvalidRequest("Unknown request_uri".to_string()))?;

        if data.expires_at < Utc::now() {
            store.delete_request(&id)?;
            return Err(OAuthError::InvalidGrant("This request has expired".to_string()));
        }
        if &data.client_id != client_id {
            return Err(OAuthError::InvalidGrant(
                "This request was initiated for another client".to_string(),
            ));
        }
        if data.code.is_some() || data.sub.is_some() {
            // Single-shot: once authorized the request only exists for the
            // token endpoint to consume.
            store.delete_request(&id)?;
            return Err(OAuthError::InvalidGrant(
                "This request was already authorized".to_string(),
            ));
        }
        if let Some(bound_device) = &data.device_id {
            if bound_device != device_id {
                store.delete_request(&id)?;
                return Err(OAuthError::InvalidGrant(
                    "This request was initiated on another device".to_string(),
                ));
            }
        }

        let inactivity = Duration::milliseconds(AUTHORIZATION_INACTIVITY_TIMEOUT as i64);
        let slid = Utc::now() + inactivity;
        let expires_at = if data.expires_at < slid { slid } else { data.expires_at };

        store.update_request(
            &id,
            UpdateRequestData {
                expires_at: Some(expires_at),
                device_id: Some(device_id.clone()),
                ..Default::default()
            },
        )?;

        Ok(RequestInfo {
            uri: id.as_request_uri(),
            id,
            client_id: data.client_id,
            client_auth: data.client_auth,
            parameters: data.parameters,
            expires_at,
        })
    }

    /// Transition to `Authorized`, issuing the single-use code. Succeeds at
    /// most once per request; the store write lock serializes racing
    /// accept requests on the same uri.
    pub async fn set_authorized(
        &self,
        uri: &RequestUri,
        device_id: &DeviceId,
        account: &Account,
    ) -> Result<Code, OAuthError> {
        let id = RequestId::from_request_uri(uri)
            .map_err(|_| OAuthError::InvalidRequest("Invalid request_uri".to_string()))?;

        let mut store = self.store.write().await;
        let data = store
            .read_request(&id)?
            .ok_or_else(|| OAuthError::InvalidRequest("Unknown request_uri".to_string()))?;

        if data.expires_at < Utc::now() {
            store.delete_request(&id)?;
            return Err(OAuthError::InvalidGrant("This request has expired".to_string()));
        }
        if data.is_authorized() {
            return Err(OAuthError::InvalidGrant(
                "This request was already authorized".to_string(),
            ));
        }
        match &data.device_id {
            Some(bound_device) if bound_device == device_id => {}
            Some(_) => {
                return Err(OAuthError::InvalidGrant(
                    "This request was initiated on another device".to_string(),
                ));
            }
            None => {
                return Err(OAuthError::InvalidGrant(
                    "This request is not bound to a device".to_string(),
                ));
            }
        }

        let code = Code::generate();
        store.update_request(
            &id,
            UpdateRequestData {
                sub: Some(account.sub.clone()),
                code: Some(code.clone()),
                // The code must be redeemed promptly.
                expires_at: Some(Utc::now() + Duration::milliseconds(CODE_EXPIRES_IN as i64)),
                ..Default::default()
            },
        )?;
        Ok(code)
    }

    /// Consume the request holding `code` for the token endpoint.
    ///
    /// The record is removed atomically before any check runs, so whatever
    /// happens next the code can never be presented again. Callers must
    /// revoke any token previously issued from this code when this method
    /// fails.
    pub async fn find_code(
        &self,
        client: &Client,
        client_auth: &ClientAuth,
        code: &Code,
    ) -> Result<AuthorizedRequestData, OAuthError> {
        let found = self
            .store
            .write()
            .await
            .consume_request_by_code(code)?
            .ok_or_else(|| OAuthError::InvalidGrant("Invalid code".to_string()))?;
        let data = found.data;

        if data.expires_at < Utc::now() {
            return Err(OAuthError::InvalidGrant("This code has expired".to_string()));
        }
        if data.client_id != client.id {
            return Err(OAuthError::InvalidGrant(
                "This code was issued to another client".to_string(),
            ));
        }
        if !data.client_auth.matches_method(client_auth) {
            return Err(OAuthError::InvalidGrant(
                "This code was obtained under a different client authentication method"
                    .to_string(),
            ));
        }

        let (Some(device_id), Some(sub)) = (data.device_id, data.sub) else {
            return Err(OAuthError::InvalidGrant("Invalid code".to_string()));
        };

        Ok(AuthorizedRequestData {
            client_id: data.client_id,
            client_auth: data.client_auth,
            parameters: data.parameters,
            device_id,
            sub,
        })
    }

    /// Idempotent removal.
    pub async fn delete(&self, uri: &RequestUri) -> Result<(), OAuthError> {
        if let Ok(id) = RequestId::from_request_uri(uri) {
            self.store.write().await.delete_request(&id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::account::Sub;
    use crate::provider::client::ClientInfo;
    use crate::provider::client_manager::default_loopback_metadata;
    use crate::provider::metadata::build_metadata;
    use crate::provider::request::RequestStoreMemory;
    use crate::types::{Issuer, LoopbackClientId, RedirectUri, Scope};

    fn manager() -> RequestManager {
        let issuer = Issuer::new("https://auth.example.com").unwrap();
        RequestManager::new(
            Arc::new(RwLock::new(RequestStoreMemory::new())),
            build_metadata(&issuer, None),
        )
    }

    fn loopback_client() -> Client {
        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        Client::new(
            loopback.client_id().clone(),
            default_loopback_metadata(&loopback),
            None,
            ClientInfo::default(),
        )
    }

    fn parameters(client: &Client) -> AuthorizationParameters {
        let mut parameters =
            AuthorizationParameters::new(client.id.clone(), ResponseType::Code);
        parameters.redirect_uri = Some(RedirectUri::new("http://127.0.0.1/").unwrap());
        parameters.scope = Some(Scope::new("atproto").unwrap());
        parameters.code_challenge = Some("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string());
        parameters.code_challenge_method = Some(CodeChallengeMethod::S256);
        parameters.state = Some("s1".to_string());
        parameters
    }

    fn account() -> Account {
        Account {
            sub: Sub::new("did:plc:alice").unwrap(),
            aud: vec!["https://pds.example.com".to_string()],
            preferred_username: Some("alice.test".to_string()),
            email: None,
        }
    }

    async fn created(manager: &RequestManager, client: &Client) -> RequestInfo {
        manager
            .create_authorization_request(client, &ClientAuth::None, &parameters(client), None, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let manager = manager();
        let client = loopback_client();
        let info = created(&manager, &client).await;
        assert!(info.uri.as_str().starts_with("urn:ietf:params:oauth:request_uri:"));

        let device_id = DeviceId::generate();
        let loaded = manager.get(&info.uri, &client.id, &device_id).await.unwrap();
        assert_eq!(loaded.parameters.state.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_get_refuses_other_device() {
        let manager = manager();
        let client = loopback_client();
        let info = created(&manager, &client).await;

        let device_a = DeviceId::generate();
        manager.get(&info.uri, &client.id, &device_a).await.unwrap();

        let device_b = DeviceId::generate();
        let error = manager
            .get(&info.uri, &client.id, &device_b)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_validate_requires_pkce() {
        let manager = manager();
        let client = loopback_client();
        let mut input = parameters(&client);
        input.code_challenge = None;
        input.code_challenge_method = None;
        let error = manager
            .create_authorization_request(&client, &ClientAuth::None, &input, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_validate_rejects_plain_challenge() {
        let manager = manager();
        let client = loopback_client();
        let mut input = parameters(&client);
        input.code_challenge_method = Some(CodeChallengeMethod::Plain);
        let error = manager
            .create_authorization_request(&client, &ClientAuth::None, &input, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_validate_rejects_foreign_redirect() {
        let manager = manager();
        let client = loopback_client();
        let mut input = parameters(&client);
        input.redirect_uri = Some(RedirectUri::new("https://evil.example.net/cb").unwrap());
        let error = manager
            .create_authorization_request(&client, &ClientAuth::None, &input, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidRedirectUri(_)));
    }

    #[tokio::test]
    async fn test_validate_rejects_excess_scope() {
        let manager = manager();
        let client = loopback_client();
        let mut input = parameters(&client);
        input.scope = Some(Scope::new("atproto transition:generic").unwrap());
        let error = manager
            .create_authorization_request(&client, &ClientAuth::None, &input, None, None)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidScope(_)));
    }

    #[tokio::test]
    async fn test_set_authorized_single_shot() {
        let manager = manager();
        let client = loopback_client();
        let info = created(&manager, &client).await;
        let device_id = DeviceId::generate();
        manager.get(&info.uri, &client.id, &device_id).await.unwrap();

        manager
            .set_authorized(&info.uri, &device_id, &account())
            .await
            .unwrap();
        let error = manager
            .set_authorized(&info.uri, &device_id, &account())
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_find_code_consumes() {
        let manager = manager();
        let client = loopback_client();
        let info = created(&manager, &client).await;
        let device_id = DeviceId::generate();
        manager.get(&info.uri, &client.id, &device_id).await.unwrap();
        let code = manager
            .set_authorized(&info.uri, &device_id, &account())
            .await
            .unwrap();

        let authorized = manager
            .find_code(&client, &ClientAuth::None, &code)
            .await
            .unwrap();
        assert_eq!(authorized.sub.as_str(), "did:plc:alice");

        let error = manager
            .find_code(&client, &ClientAuth::None, &code)
            .await
            .unwrap_err();
        assert_eq!(error, OAuthError::InvalidGrant("Invalid code".to_string()));
    }

    #[tokio::test]
    async fn test_find_code_requires_same_auth_method() {
        let manager = manager();
        let client = loopback_client();
        let info = created(&manager, &client).await;
        let device_id = DeviceId::generate();
        manager.get(&info.uri, &client.id, &device_id).await.unwrap();
        let code = manager
            .set_authorized(&info.uri, &device_id, &account())
            .await
            .unwrap();

        let other_auth = ClientAuth::JwtBearer {
            alg: "ES256".to_string(),
            kid: "k".to_string(),
            jkt: "t".to_string(),
        };
        let error = manager
            .find_code(&client, &other_auth, &code)
            .await
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidGrant(_)));
        // The consuming read deleted the request: the code is dead even for
        // the original method.
        let error = manager
            .find_code(&client, &ClientAuth::None, &code)
            .await
            .unwrap_err();
        assert_eq!(error, OAuthError::InvalidGrant("Invalid code".to_string()));
    }
}
