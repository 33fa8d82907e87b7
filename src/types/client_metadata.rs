use crate::types::{RedirectUri, Scope};
use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const GRANT_TYPE_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_TYPE_REFRESH_TOKEN: &str = "refresh_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    Implicit,
    Password,
    ClientCredentials,
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GrantType::AuthorizationCode => GRANT_TYPE_AUTHORIZATION_CODE,
            GrantType::RefreshToken => GRANT_TYPE_REFRESH_TOKEN,
            GrantType::Implicit => "implicit",
            GrantType::Password => "password",
            GrantType::ClientCredentials => "client_credentials",
        };
        s.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    #[serde(rename = "code")]
    Code,
    #[serde(rename = "token")]
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationType {
    Web,
    Native,
}

impl Default for ApplicationType {
    fn default() -> Self {
        ApplicationType::Web
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    PrivateKeyJwt,
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::PrivateKeyJwt => "private_key_jwt",
            AuthMethod::ClientSecretBasic => "client_secret_basic",
            AuthMethod::ClientSecretPost => "client_secret_post",
            AuthMethod::ClientSecretJwt => "client_secret_jwt",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Client metadata, either fetched from the client id document, synthesized
/// by the loopback policy, or returned by the client store.
///
/// <https://datatracker.ietf.org/doc/html/rfc7591#section-2>
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tos_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_uri: Option<String>,

    pub redirect_uris: Vec<RedirectUri>,

    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,

    #[serde(default = "default_response_types")]
    pub response_types: Vec<ResponseType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<AuthMethod>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg: Option<String>,

    #[serde(default)]
    pub application_type: ApplicationType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_bound_access_tokens: Option<bool>,

    // OIDC-specific parameters. Recognized so that their presence can be
    // rejected explicitly rather than silently ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_type: Option<SubjectType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_max_age: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub userinfo_signed_response_alg: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token_signed_response_alg: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_client_certificate_bound_access_tokens: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectType {
    Public,
    Pairwise,
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::AuthorizationCode]
}

fn default_response_types() -> Vec<ResponseType> {
    vec![ResponseType::Code]
}

impl ClientMetadata {
    /// Locate a registered redirect URI matching the presented one,
    /// applying the loopback port-agnostic rule.
    pub fn matching_redirect_uri(&self, presented: &RedirectUri) -> Option<&RedirectUri> {
        self.redirect_uris
            .iter()
            .find(|registered| registered.matches(presented))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_json() -> serde_json::Value {
        serde_json::json!({
            "client_id": "https://app.example.com/client-metadata.json",
            "client_name": "Example App",
            "redirect_uris": ["https://app.example.com/cb"],
            "grant_types": ["authorization_code", "refresh_token"],
            "response_types": ["code"],
            "scope": "atproto offline_access",
            "token_endpoint_auth_method": "none",
            "application_type": "web",
            "dpop_bound_access_tokens": true
        })
    }

    #[test]
    fn test_deserialize_document() {
        let metadata: ClientMetadata = serde_json::from_value(metadata_json()).unwrap();
        assert_eq!(
            metadata.grant_types,
            vec![GrantType::AuthorizationCode, GrantType::RefreshToken]
        );
        assert_eq!(metadata.token_endpoint_auth_method, Some(AuthMethod::None));
        assert_eq!(metadata.application_type, ApplicationType::Web);
        assert_eq!(metadata.dpop_bound_access_tokens, Some(true));
    }

    #[test]
    fn test_defaults() {
        let metadata: ClientMetadata = serde_json::from_value(serde_json::json!({
            "redirect_uris": ["https://app.example.com/cb"]
        }))
        .unwrap();
        assert_eq!(metadata.grant_types, vec![GrantType::AuthorizationCode]);
        assert_eq!(metadata.response_types, vec![ResponseType::Code]);
        assert_eq!(metadata.application_type, ApplicationType::Web);
    }

    #[test]
    fn test_matching_redirect_uri() {
        let metadata: ClientMetadata = serde_json::from_value(serde_json::json!({
            "redirect_uris": ["http://127.0.0.1/cb"],
            "application_type": "native"
        }))
        .unwrap();
        let presented = RedirectUri::new("http://127.0.0.1:33001/cb").unwrap();
        assert!(metadata.matching_redirect_uri(&presented).is_some());
        let wrong = RedirectUri::new("http://127.0.0.1:33001/other").unwrap();
        assert!(metadata.matching_redirect_uri(&wrong).is_none());
    }
}
