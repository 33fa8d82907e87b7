use crate::errors::OAuthError;
use crate::provider::client::{Client, ClientInfo};
use crate::provider::hooks::Hooks;
use crate::types::{
    ApplicationType, AuthMethod, ClientId, ClientMetadata, DiscoverableClientId, GrantType,
    LoopbackClientId, RedirectUri, ResponseType, Scope, ServerMetadata, SubjectType,
};
use jsonwebtoken::jwk::JwkSet;
use lru::LruCache;
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use url::Url;

/// How long fetched client documents stay fresh.
const CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// Bounded number of cached documents per cache.
const CACHE_CAPACITY: usize = 1000;
/// Upper bound on fetched document size.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;
/// Outbound fetch timeout.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub type LoopbackMetadataGetter =
    Box<dyn Fn(&LoopbackClientId) -> ClientMetadata + Send + Sync>;

/// Statically registered clients, looked up when a client id is neither
/// loopback nor discoverable.
#[rocket::async_trait]
pub trait ClientStore: Send + Sync {
    async fn find_client(&self, client_id: &ClientId)
        -> Result<Option<ClientMetadata>, OAuthError>;
}

/// Reference client store used by tests and deployments with a fixed set
/// of registered clients.
#[derive(Default)]
pub struct ClientStoreMemory {
    clients: std::collections::HashMap<ClientId, ClientMetadata>,
}

impl ClientStoreMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client_id: ClientId, metadata: ClientMetadata) -> Self {
        self.clients.insert(client_id, metadata);
        self
    }
}

#[rocket::async_trait]
impl ClientStore for ClientStoreMemory {
    async fn find_client(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<ClientMetadata>, OAuthError> {
        Ok(self.clients.get(client_id).cloned())
    }
}

/// LRU cache of immutable snapshots with TTL expiry.
struct TtlCache<V: Clone> {
    entries: Mutex<LruCache<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((cached_at, value)) if cached_at.elapsed() < CACHE_TTL => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: String, value: V) {
        self.entries.lock().await.put(key, (Instant::now(), value));
    }
}

/// Resolves, validates and caches client metadata and keys.
pub struct ClientManager {
    server_metadata: ServerMetadata,
    http: reqwest::Client,
    store: Option<Arc<RwLock<dyn ClientStore>>>,
    loopback_metadata: Option<LoopbackMetadataGetter>,
    hooks: Arc<Hooks>,
    metadata_cache: TtlCache<ClientMetadata>,
    jwks_cache: TtlCache<JwkSet>,
}

impl ClientManager {
    pub fn new(
        server_metadata: ServerMetadata,
        hooks: Arc<Hooks>,
        store: Option<Arc<RwLock<dyn ClientStore>>>,
        loopback_metadata: Option<LoopbackMetadataGetter>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client always builds");
        Self {
            server_metadata,
            http,
            store,
            loopback_metadata,
            hooks,
            metadata_cache: TtlCache::new(),
            jwks_cache: TtlCache::new(),
        }
    }

    /// Resolve a client: metadata, keys, deployment info.
    ///
    /// <https://openid.net/specs/openid-connect-registration-1_0.html#rfc.section.2>
    pub async fn get_client(&self, client_id: &ClientId) -> Result<Client, OAuthError> {
        let metadata = self.get_client_metadata(client_id).await?;

        let jwks = match &metadata.jwks_uri {
            None => None,
            Some(jwks_uri) => Some(self.get_client_jwks(jwks_uri).await?),
        };

        let info = match &self.hooks.on_client_info {
            None => ClientInfo::default(),
            Some(on_client_info) => on_client_info(client_id, &metadata),
        };

        Ok(Client::new(client_id.clone(), metadata, jwks, info))
    }

    async fn get_client_metadata(
        &self,
        client_id: &ClientId,
    ) -> Result<ClientMetadata, OAuthError> {
        if let Ok(loopback) = LoopbackClientId::new(client_id.as_str()) {
            self.get_loopback_client_metadata(&loopback)
        } else if let Ok(discoverable) = DiscoverableClientId::new(client_id.as_str()) {
            self.get_discoverable_client_metadata(&discoverable).await
        } else {
            self.get_stored_client_metadata(client_id).await
        }
    }

    fn get_loopback_client_metadata(
        &self,
        client_id: &LoopbackClientId,
    ) -> Result<ClientMetadata, OAuthError> {
        let metadata = match &self.loopback_metadata {
            Some(loopback_metadata) => loopback_metadata(client_id),
            None => {
                return Err(OAuthError::InvalidClientMetadata(
                    "Loopback clients are not allowed".to_string(),
                ))
            }
        };
        self.validate_client_metadata(client_id.client_id(), metadata)
    }

    async fn get_discoverable_client_metadata(
        &self,
        client_id: &DiscoverableClientId,
    ) -> Result<ClientMetadata, OAuthError> {
        let url = client_id.as_url();
        if let Some(metadata) = self.metadata_cache.get(url.as_str()).await {
            return Ok(metadata);
        }

        let metadata: ClientMetadata = self.safe_fetch_json(url).await?;
        let metadata = self.validate_client_metadata(client_id.client_id(), metadata)?;
        self.metadata_cache
            .put(url.as_str().to_string(), metadata.clone())
            .await;
        Ok(metadata)
    }

    async fn get_stored_client_metadata(
        &self,
        client_id: &ClientId,
    ) -> Result<ClientMetadata, OAuthError> {
        let store = self.store.as_ref().ok_or_else(|| {
            OAuthError::InvalidClientMetadata("Invalid client id".to_string())
        })?;
        let metadata = store
            .read()
            .await
            .find_client(client_id)
            .await?
            .ok_or_else(|| OAuthError::InvalidClientMetadata("Client not found".to_string()))?;
        self.validate_client_metadata(client_id, metadata)
    }

    async fn get_client_jwks(&self, jwks_uri: &str) -> Result<JwkSet, OAuthError> {
        if let Some(jwks) = self.jwks_cache.get(jwks_uri).await {
            return Ok(jwks);
        }
        let url = Url::parse(jwks_uri).map_err(|_| {
            OAuthError::InvalidClientMetadata("jwks_uri is not a valid URL".to_string())
        })?;
        let jwks: JwkSet = self.safe_fetch_json(&url).await?;
        self.jwks_cache.put(jwks_uri.to_string(), jwks.clone()).await;
        Ok(jwks)
    }

    /// Fetch a JSON document with SSRF protections: https only, no
    /// credentials, no redirects, no private or loopback addresses, JSON
    /// content type, bounded response size.
    async fn safe_fetch_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, OAuthError> {
        if url.scheme() != "https" {
            return Err(OAuthError::InvalidClientMetadata(
                "Client documents must be served over https".to_string(),
            ));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(OAuthError::InvalidClientMetadata(
                "Client document URLs must not contain credentials".to_string(),
            ));
        }
        if let Some(host) = url.host_str() {
            if let Ok(address) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
                if is_forbidden_address(&address) {
                    return Err(OAuthError::InvalidClientMetadata(
                        "Client document host resolves to a private address".to_string(),
                    ));
                }
            }
        }

        let response = self
            .http
            .get(url.clone())
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(url = %url, error = %e, "client document fetch failed");
                OAuthError::InvalidClientMetadata("Failed to fetch client document".to_string())
            })?;

        if !response.status().is_success() {
            return Err(OAuthError::InvalidClientMetadata(format!(
                "Client document fetch returned {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("application/json") {
            return Err(OAuthError::InvalidClientMetadata(
                "Client document must be served as application/json".to_string(),
            ));
        }

        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response.chunk().await.map_err(|_| {
            OAuthError::InvalidClientMetadata("Failed to read client document".to_string())
        })? {
            body.extend_from_slice(&chunk);
            if body.len() > MAX_RESPONSE_BYTES {
                return Err(OAuthError::InvalidClientMetadata(
                    "Client document is too large".to_string(),
                ));
            }
        }

        serde_json::from_slice(&body).map_err(|e| {
            OAuthError::InvalidClientMetadata(format!("Invalid client document: {e}"))
        })
    }

    /// Ensure the client metadata is valid w.r.t. OAuth, this
    /// implementation's constraints, and the identity-network profile
    /// (DPoP-bound tokens, `atproto` scope, S256-only PKCE).
    fn validate_client_metadata(
        &self,
        client_id: &ClientId,
        metadata: ClientMetadata,
    ) -> Result<ClientMetadata, OAuthError> {
        if metadata.jwks.is_some() && metadata.jwks_uri.is_some() {
            return Err(OAuthError::InvalidClientMetadata(
                "jwks_uri and jwks are mutually exclusive".to_string(),
            ));
        }

        if metadata.default_max_age.is_some()
            || metadata.userinfo_signed_response_alg.is_some()
            || metadata.id_token_signed_response_alg.is_some()
        {
            return Err(OAuthError::InvalidClientMetadata(
                "Unsupported client metadata parameter".to_string(),
            ));
        }
        if metadata.tls_client_certificate_bound_access_tokens.is_some() {
            return Err(OAuthError::InvalidClientMetadata(
                "Mutual-TLS bound access tokens are not supported".to_string(),
            ));
        }
        if let Some(SubjectType::Pairwise) = metadata.subject_type {
            return Err(OAuthError::InvalidClientMetadata(
                "Only public subject_type is supported".to_string(),
            ));
        }

        if let Some(metadata_client_id) = &metadata.client_id {
            if metadata_client_id != client_id.as_str() {
                return Err(OAuthError::InvalidClientMetadata(
                    "client_id does not match".to_string(),
                ));
            }
        }

        self.validate_scope(&metadata)?;
        self.validate_grant_types(&metadata)?;
        self.validate_auth_method(&metadata)?;
        self.validate_redirect_uris(&metadata)?;

        // The identity-network profile requires DPoP (plain OAuth defaults
        // to false).
        if metadata.dpop_bound_access_tokens != Some(true) {
            return Err(OAuthError::InvalidClientMetadata(
                "\"dpop_bound_access_tokens\" must be true".to_string(),
            ));
        }

        if !metadata.response_types.contains(&ResponseType::Code) {
            return Err(OAuthError::InvalidClientMetadata(
                "response_types must include \"code\"".to_string(),
            ));
        }
        if !metadata.grant_types.contains(&GrantType::AuthorizationCode) {
            return Err(OAuthError::InvalidClientMetadata(
                "The \"code\" response type requires that \"grant_types\" contains \"authorization_code\"".to_string(),
            ));
        }

        if LoopbackClientId::new(client_id.as_str()).is_ok() {
            self.validate_loopback_client_metadata(metadata)
        } else if let Ok(discoverable) = DiscoverableClientId::new(client_id.as_str()) {
            self.validate_discoverable_client_metadata(&discoverable, metadata)
        } else {
            Ok(metadata)
        }
    }

    fn validate_scope(&self, metadata: &ClientMetadata) -> Result<(), OAuthError> {
        let scope = metadata.scope.as_ref().ok_or_else(|| {
            OAuthError::InvalidClientMetadata("Missing scope property".to_string())
        })?;

        if !scope.contains("atproto") {
            return Err(OAuthError::InvalidClientMetadata(
                "Missing \"atproto\" scope".to_string(),
            ));
        }

        let mut tokens: Vec<&str> = scope.iter().collect();
        tokens.sort_unstable();
        let before = tokens.len();
        tokens.dedup();
        if before != tokens.len() {
            return Err(OAuthError::InvalidClientMetadata(
                "Duplicate scope".to_string(),
            ));
        }

        if let Some(scopes_supported) = &self.server_metadata.scopes_supported {
            for token in tokens {
                if !scopes_supported.iter().any(|s| s == token) {
                    return Err(OAuthError::InvalidClientMetadata(format!(
                        "Unsupported scope {token:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_grant_types(&self, metadata: &ClientMetadata) -> Result<(), OAuthError> {
        let mut grant_types = metadata.grant_types.clone();
        grant_types.sort();
        let before = grant_types.len();
        grant_types.dedup();
        if before != grant_types.len() {
            return Err(OAuthError::InvalidClientMetadata(
                "Duplicate grant type".to_string(),
            ));
        }

        for grant_type in grant_types {
            match grant_type {
                GrantType::AuthorizationCode | GrantType::RefreshToken => {
                    if !self.server_metadata.supports_grant_type(grant_type) {
                        return Err(OAuthError::InvalidClientMetadata(format!(
                            "Unsupported grant type {grant_type}"
                        )));
                    }
                }
                // Never allowed (unsafe).
                GrantType::Implicit => {
                    return Err(OAuthError::InvalidClientMetadata(
                        "Grant type \"implicit\" is not allowed".to_string(),
                    ));
                }
                other => {
                    return Err(OAuthError::InvalidClientMetadata(format!(
                        "Grant type {other} is not supported"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_auth_method(&self, metadata: &ClientMetadata) -> Result<(), OAuthError> {
        let method = metadata.token_endpoint_auth_method.ok_or_else(|| {
            OAuthError::InvalidClientMetadata(
                "Missing token_endpoint_auth_method client metadata".to_string(),
            )
        })?;
        match method {
            AuthMethod::None => {
                if metadata.token_endpoint_auth_signing_alg.is_some() {
                    return Err(OAuthError::InvalidClientMetadata(
                        "token_endpoint_auth_method \"none\" must not have token_endpoint_auth_signing_alg".to_string(),
                    ));
                }
            }
            AuthMethod::PrivateKeyJwt => {
                let has_keys = match (&metadata.jwks, &metadata.jwks_uri) {
                    (Some(jwks), None) => !jwks.keys.is_empty(),
                    (None, Some(_)) => true,
                    _ => false,
                };
                if !has_keys {
                    return Err(OAuthError::InvalidClientMetadata(
                        "private_key_jwt auth method requires at least one key in jwks".to_string(),
                    ));
                }
                if metadata.token_endpoint_auth_signing_alg.is_none() {
                    return Err(OAuthError::InvalidClientMetadata(
                        "Missing token_endpoint_auth_signing_alg client metadata".to_string(),
                    ));
                }
            }
            other => {
                return Err(OAuthError::InvalidClientMetadata(format!(
                    "{other} is not a supported \"token_endpoint_auth_method\". Use \"private_key_jwt\" or \"none\"."
                )));
            }
        }
        Ok(())
    }

    fn validate_redirect_uris(&self, metadata: &ClientMetadata) -> Result<(), OAuthError> {
        if metadata.redirect_uris.is_empty() {
            return Err(OAuthError::InvalidClientMetadata(
                "At least one redirect_uri is required".to_string(),
            ));
        }

        for redirect_uri in &metadata.redirect_uris {
            match redirect_uri {
                RedirectUri::Loopback(uri) => {
                    // rfc8252 section 7.3: loopback redirects are a native
                    // app mechanism.
                    if metadata.application_type != ApplicationType::Native {
                        return Err(OAuthError::InvalidRedirectUri(format!(
                            "Loopback redirect URI {uri} is only allowed for native apps"
                        )));
                    }
                }
                RedirectUri::Https(_) => {}
                RedirectUri::PrivateUse(uri) => {
                    if metadata.application_type != ApplicationType::Native {
                        return Err(OAuthError::InvalidRedirectUri(format!(
                            "Private-use redirect URI {uri} is only allowed for native apps"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_loopback_client_metadata(
        &self,
        metadata: ClientMetadata,
    ) -> Result<ClientMetadata, OAuthError> {
        if metadata.client_uri.is_some() {
            return Err(OAuthError::InvalidClientMetadata(
                "client_uri is not allowed for loopback clients".to_string(),
            ));
        }
        if metadata.application_type != ApplicationType::Native {
            return Err(OAuthError::InvalidClientMetadata(
                "Loopback clients must have application_type \"native\"".to_string(),
            ));
        }
        if metadata.token_endpoint_auth_method != Some(AuthMethod::None) {
            return Err(OAuthError::InvalidClientMetadata(
                "Loopback clients must authenticate using the \"none\" method".to_string(),
            ));
        }
        for redirect_uri in &metadata.redirect_uris {
            if !redirect_uri.is_loopback() {
                return Err(OAuthError::InvalidClientMetadata(
                    "Loopback clients must use loopback redirect URIs".to_string(),
                ));
            }
        }
        Ok(metadata)
    }

    fn validate_discoverable_client_metadata(
        &self,
        client_id: &DiscoverableClientId,
        metadata: ClientMetadata,
    ) -> Result<ClientMetadata, OAuthError> {
        if metadata.client_id.is_none() {
            return Err(OAuthError::InvalidClientMetadata(
                "client_id is required for discoverable clients".to_string(),
            ));
        }
        let client_id_url = client_id.as_url();

        if let Some(client_uri) = &metadata.client_uri {
            let client_uri_url = Url::parse(client_uri).map_err(|_| {
                OAuthError::InvalidClientMetadata("client_uri is not a valid URL".to_string())
            })?;
            if client_uri_url.origin() != client_id_url.origin() {
                return Err(OAuthError::InvalidClientMetadata(
                    "client_uri must have the same origin as the client_id".to_string(),
                ));
            }
        }

        for redirect_uri in &metadata.redirect_uris {
            match redirect_uri {
                RedirectUri::Https(uri) => {
                    // rfc8252 section 8.4: tie redirect ownership to the
                    // client id's domain. Applied to web clients as well.
                    let url = Url::parse(uri).map_err(|_| {
                        OAuthError::InvalidRedirectUri(format!("Invalid redirect URI {uri}"))
                    })?;
                    if url.host_str() != client_id_url.host_str() {
                        return Err(OAuthError::InvalidRedirectUri(format!(
                            "Redirect URI {uri} must be under the same domain as the client_id"
                        )));
                    }
                }
                RedirectUri::PrivateUse(uri) => {
                    // Scheme must be the reversed FQDN of the client id.
                    let url = Url::parse(uri).map_err(|_| {
                        OAuthError::InvalidRedirectUri(format!("Invalid redirect URI {uri}"))
                    })?;
                    let host = client_id_url.host_str().unwrap_or_default();
                    let reversed: Vec<&str> = host.split('.').rev().collect();
                    if url.scheme() != reversed.join(".") {
                        return Err(OAuthError::InvalidRedirectUri(format!(
                            "Private-use scheme of {uri} must be the reversed client_id domain"
                        )));
                    }
                }
                RedirectUri::Loopback(_) => {}
            }
        }

        Ok(metadata)
    }
}

fn is_forbidden_address(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Default metadata synthesized for loopback development clients.
pub fn default_loopback_metadata(client_id: &LoopbackClientId) -> ClientMetadata {
    let redirect_uris = client_id
        .redirect_uris()
        .into_iter()
        .filter_map(|uri| RedirectUri::new(uri).ok())
        .collect();
    let scope = client_id
        .scope()
        .and_then(|scope| Scope::new(scope).ok())
        .or_else(|| Scope::new("atproto").ok());

    ClientMetadata {
        client_id: None,
        client_name: Some("Loopback client".to_string()),
        client_uri: None,
        logo_uri: None,
        tos_uri: None,
        policy_uri: None,
        redirect_uris,
        grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
        response_types: vec![ResponseType::Code],
        scope,
        token_endpoint_auth_method: Some(AuthMethod::None),
        token_endpoint_auth_signing_alg: None,
        application_type: ApplicationType::Native,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::metadata::build_metadata;
    use crate::types::Issuer;

    fn manager() -> ClientManager {
        let issuer = Issuer::new("https://auth.example.com").unwrap();
        ClientManager::new(
            build_metadata(&issuer, None),
            Arc::new(Hooks::default()),
            None,
            Some(Box::new(default_loopback_metadata)),
        )
    }

    #[tokio::test]
    async fn test_loopback_client_synthesis() {
        let manager = manager();
        let client_id = ClientId::new("http://localhost").unwrap();
        let client = manager.get_client(&client_id).await.unwrap();
        assert_eq!(client.metadata.application_type, ApplicationType::Native);
        assert_eq!(
            client.metadata.token_endpoint_auth_method,
            Some(AuthMethod::None)
        );
        assert!(client
            .metadata
            .redirect_uris
            .iter()
            .all(RedirectUri::is_loopback));
    }

    #[tokio::test]
    async fn test_loopback_disabled() {
        let issuer = Issuer::new("https://auth.example.com").unwrap();
        let manager = ClientManager::new(
            build_metadata(&issuer, None),
            Arc::new(Hooks::default()),
            None,
            None,
        );
        let client_id = ClientId::new("http://localhost").unwrap();
        assert!(manager.get_client(&client_id).await.is_err());
    }

    #[test]
    fn test_metadata_requires_dpop_binding() {
        let manager = manager();
        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        let mut metadata = default_loopback_metadata(&loopback);
        metadata.dpop_bound_access_tokens = None;
        let error = manager
            .validate_client_metadata(loopback.client_id(), metadata)
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidClientMetadata(_)));
    }

    #[test]
    fn test_metadata_requires_atproto_scope() {
        let manager = manager();
        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        let mut metadata = default_loopback_metadata(&loopback);
        metadata.scope = Some(Scope::new("offline_access").unwrap());
        assert!(manager
            .validate_client_metadata(loopback.client_id(), metadata)
            .is_err());
    }

    #[test]
    fn test_metadata_rejects_implicit_grant() {
        let manager = manager();
        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        let mut metadata = default_loopback_metadata(&loopback);
        metadata.grant_types.push(GrantType::Implicit);
        assert!(manager
            .validate_client_metadata(loopback.client_id(), metadata)
            .is_err());
    }

    #[test]
    fn test_discoverable_redirect_domain_rule() {
        let manager = manager();
        let client_id =
            ClientId::new("https://app.example.com/client-metadata.json").unwrap();
        let loopback = LoopbackClientId::new("http://localhost").unwrap();
        let mut metadata = default_loopback_metadata(&loopback);
        metadata.client_id = Some(client_id.as_str().to_string());
        metadata.application_type = ApplicationType::Web;
        metadata.redirect_uris = vec![RedirectUri::new("https://evil.example.net/cb").unwrap()];
        let error = manager
            .validate_client_metadata(&client_id, metadata)
            .unwrap_err();
        assert!(matches!(error, OAuthError::InvalidRedirectUri(_)));
    }

    #[test]
    fn test_forbidden_addresses() {
        assert!(is_forbidden_address(&"127.0.0.1".parse().unwrap()));
        assert!(is_forbidden_address(&"10.1.2.3".parse().unwrap()));
        assert!(is_forbidden_address(&"192.168.0.1".parse().unwrap()));
        assert!(is_forbidden_address(&"::1".parse().unwrap()));
        assert!(!is_forbidden_address(&"93.184.216.34".parse().unwrap()));
    }
}
