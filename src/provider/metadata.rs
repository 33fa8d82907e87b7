use crate::types::{GrantType, Issuer, ResponseType, ServerMetadata};

/// Deployment additions to the discovery document.
#[derive(Debug, Clone, Default)]
pub struct CustomMetadata {
    pub scopes_supported: Option<Vec<String>>,
}

/// Build the RFC 8414 discovery document for this issuer.
pub fn build_metadata(issuer: &Issuer, custom: Option<CustomMetadata>) -> ServerMetadata {
    let mut scopes = vec![
        "atproto".to_string(),
        "offline_access".to_string(),
        "transition:generic".to_string(),
    ];
    if let Some(custom) = custom {
        if let Some(custom_scopes) = custom.scopes_supported {
            for scope in custom_scopes {
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
        }
    }

    ServerMetadata {
        issuer: issuer.clone(),
        authorization_endpoint: issuer.endpoint("/oauth/authorize"),
        token_endpoint: issuer.endpoint("/oauth/token"),
        revocation_endpoint: Some(issuer.endpoint("/oauth/revoke")),
        introspection_endpoint: Some(issuer.endpoint("/oauth/introspect")),
        pushed_authorization_request_endpoint: Some(issuer.endpoint("/oauth/par")),
        jwks_uri: Some(issuer.endpoint("/oauth/jwks")),
        scopes_supported: Some(scopes),
        response_types_supported: Some(vec![ResponseType::Code]),
        grant_types_supported: Some(vec![GrantType::AuthorizationCode, GrantType::RefreshToken]),
        code_challenge_methods_supported: Some(vec!["S256".to_string()]),
        token_endpoint_auth_methods_supported: Some(vec![
            "none".to_string(),
            "private_key_jwt".to_string(),
        ]),
        token_endpoint_auth_signing_alg_values_supported: Some(vec!["ES256".to_string()]),
        request_object_signing_alg_values_supported: Some(vec!["ES256".to_string()]),
        dpop_signing_alg_values_supported: Some(vec!["ES256".to_string()]),
        authorization_response_iss_parameter_supported: Some(true),
        require_pushed_authorization_requests: Some(true),
        require_request_uri_registration: Some(true),
        client_id_metadata_document_supported: Some(true),
    }
}
