use crate::constants::{CLIENT_ASSERTION_MAX_AGE, JAR_MAX_AGE, JWT_CLOCK_TOLERANCE};
use crate::errors::OAuthError;
use crate::jose::jwk_thumbprint;
use crate::provider::epoch_secs;
use crate::types::{
    AuthMethod, AuthorizationParameters, ClientId, ClientMetadata, Issuer,
    CLIENT_ASSERTION_TYPE_JWT_BEARER,
};
use crate::types::ClientCredentials;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// How the client proved its identity on the current request. Persisted
/// with authorization requests and tokens; grants can only be redeemed
/// under the same method they were created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum ClientAuth {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "private_key_jwt")]
    JwtBearer { alg: String, kid: String, jkt: String },
}

impl ClientAuth {
    pub fn method(&self) -> &'static str {
        match self {
            ClientAuth::None => "none",
            ClientAuth::JwtBearer { .. } => "private_key_jwt",
        }
    }

    /// Exact method match: a grant obtained under one authentication method
    /// cannot be redeemed under another.
    pub fn matches_method(&self, other: &ClientAuth) -> bool {
        self.method() == other.method()
    }

    pub fn jkt(&self) -> Option<&str> {
        match self {
            ClientAuth::None => None,
            ClientAuth::JwtBearer { jkt, .. } => Some(jkt),
        }
    }
}

/// Deployment-level knowledge about a client, resolved through the hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientInfo {
    /// First-party clients skip the consent screen.
    pub is_first_party: bool,
    pub is_trusted: bool,
}

/// Claims of a client-assertion JWT (RFC 7523 section 3).
#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: Option<String>,
    sub: Option<String>,
    jti: Option<String>,
    iat: Option<i64>,
}

/// Payload of a JAR request object: the authorization parameters plus the
/// token-level claims of RFC 9101.
#[derive(Debug, Serialize, Deserialize)]
struct JarClaims {
    #[serde(flatten)]
    parameters: AuthorizationParameters,
    jti: Option<String>,
    iss: Option<String>,
    iat: Option<i64>,
}

/// Outcome of decoding a request object.
#[derive(Debug)]
pub struct DecodedJar {
    pub parameters: AuthorizationParameters,
    pub jti: String,
    pub alg: String,
    pub kid: String,
    pub jkt: String,
}

/// A resolved client: identity, validated metadata, fetched JWKS and
/// deployment info.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub metadata: ClientMetadata,
    pub jwks: Option<JwkSet>,
    pub info: ClientInfo,
}

impl Client {
    pub fn new(
        id: ClientId,
        metadata: ClientMetadata,
        jwks: Option<JwkSet>,
        info: ClientInfo,
    ) -> Self {
        Client {
            id,
            metadata,
            jwks,
            info,
        }
    }

    fn keys(&self) -> Option<&JwkSet> {
        self.jwks.as_ref().or(self.metadata.jwks.as_ref())
    }

    fn key_for_kid(&self, kid: &str) -> Result<&Jwk, OAuthError> {
        self.keys()
            .and_then(|jwks| {
                jwks.keys
                    .iter()
                    .find(|key| key.common.key_id.as_deref() == Some(kid))
            })
            .ok_or_else(|| {
                OAuthError::InvalidClient(format!("No key matching kid {kid:?} in client JWKS"))
            })
    }

    /// Verify the presented credentials against the registered
    /// authentication method.
    ///
    /// Returns the `ClientAuth` describing the authentication and, for
    /// assertion-based methods, the assertion `jti` to feed the replay
    /// guard.
    pub fn verify_credentials(
        &self,
        credentials: &ClientCredentials,
        issuer: &Issuer,
    ) -> Result<(ClientAuth, Option<String>), OAuthError> {
        let method = self.metadata.token_endpoint_auth_method.ok_or_else(|| {
            OAuthError::InvalidClientMetadata(
                "Missing token_endpoint_auth_method client metadata".to_string(),
            )
        })?;

        match method {
            AuthMethod::None => match credentials {
                ClientCredentials::None { .. } => Ok((ClientAuth::None, None)),
                ClientCredentials::JwtBearer { .. } => Err(OAuthError::InvalidClient(
                    "Client authentication method mismatch (expected \"none\")".to_string(),
                )),
            },
            AuthMethod::PrivateKeyJwt => match credentials {
                ClientCredentials::JwtBearer {
                    client_assertion_type,
                    client_assertion,
                    ..
                } => {
                    if client_assertion_type != CLIENT_ASSERTION_TYPE_JWT_BEARER {
                        return Err(OAuthError::InvalidClient(format!(
                            "Unsupported client_assertion_type {client_assertion_type:?}"
                        )));
                    }
                    self.verify_assertion(client_assertion, issuer)
                }
                ClientCredentials::None { .. } => Err(OAuthError::InvalidClient(
                    "Client authentication method mismatch (expected \"private_key_jwt\")"
                        .to_string(),
                )),
            },
            other => Err(OAuthError::InvalidClientMetadata(format!(
                "Unsupported client authentication method {other}"
            ))),
        }
    }

    fn verify_assertion(
        &self,
        assertion: &str,
        issuer: &Issuer,
    ) -> Result<(ClientAuth, Option<String>), OAuthError> {
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|e| OAuthError::InvalidClient(e.to_string()))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidClient("Missing \"kid\" in header".to_string()))?;
        let jwk = self.key_for_kid(kid)?;
        let decoding_key =
            DecodingKey::from_jwk(jwk).map_err(|e| OAuthError::InvalidClient(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = JWT_CLOCK_TOLERANCE / 1000;
        validation.set_audience(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        let data = jsonwebtoken::decode::<AssertionClaims>(assertion, &decoding_key, &validation)
            .map_err(|e| OAuthError::InvalidClient(e.to_string()))?;
        let claims = data.claims;

        if claims.iss.as_deref() != Some(self.id.as_str())
            || claims.sub.as_deref() != Some(self.id.as_str())
        {
            return Err(OAuthError::InvalidClient(
                "Client assertion \"iss\" and \"sub\" must both be the client_id".to_string(),
            ));
        }
        let jti = match claims.jti {
            Some(jti) if !jti.is_empty() => jti,
            _ => {
                return Err(OAuthError::InvalidClient(
                    "Client assertion must contain a \"jti\" claim".to_string(),
                ))
            }
        };
        if let Some(iat) = claims.iat {
            let min = epoch_secs() as i64
                - ((CLIENT_ASSERTION_MAX_AGE + JWT_CLOCK_TOLERANCE) / 1000) as i64;
            if iat < min {
                return Err(OAuthError::InvalidClient(
                    "Client assertion is too old".to_string(),
                ));
            }
        }

        let jkt = jwk_thumbprint(jwk).map_err(|e| OAuthError::InvalidClient(e.to_string()))?;
        Ok((
            ClientAuth::JwtBearer {
                alg: format!("{:?}", header.alg),
                kid: kid.to_string(),
                jkt,
            },
            Some(jti),
        ))
    }

    /// Decode and verify a JAR request object (RFC 9101).
    pub fn decode_request_object(
        &self,
        jar: &str,
        issuer: &Issuer,
    ) -> Result<DecodedJar, OAuthError> {
        let header = jsonwebtoken::decode_header(jar)
            .map_err(|e| OAuthError::InvalidRequest(e.to_string()))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidParameters("Missing \"kid\" in header".to_string()))?;
        let jwk = self.key_for_kid(kid)?;
        let decoding_key =
            DecodingKey::from_jwk(jwk).map_err(|e| OAuthError::InvalidRequest(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = JWT_CLOCK_TOLERANCE / 1000;
        validation.set_audience(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud"]);
        let data = jsonwebtoken::decode::<JarClaims>(jar, &decoding_key, &validation)
            .map_err(|e| OAuthError::InvalidRequest(e.to_string()))?;
        let claims = data.claims;

        if claims.iss.as_deref() != Some(self.id.as_str())
            || claims.parameters.client_id != self.id
        {
            return Err(OAuthError::InvalidParameters(
                "Request object \"iss\" and \"client_id\" must be the client_id".to_string(),
            ));
        }
        let jti = claims.jti.filter(|jti| !jti.is_empty()).ok_or_else(|| {
            OAuthError::InvalidParameters("Request object must contain a jti claim".to_string())
        })?;
        if let Some(iat) = claims.iat {
            let min = epoch_secs() as i64 - ((JAR_MAX_AGE + JWT_CLOCK_TOLERANCE) / 1000) as i64;
            if iat < min {
                return Err(OAuthError::InvalidParameters(
                    "Request object is too old".to_string(),
                ));
            }
        }

        let jkt = jwk_thumbprint(jwk).map_err(|e| OAuthError::InvalidRequest(e.to_string()))?;
        Ok(DecodedJar {
            parameters: claims.parameters,
            jti,
            alg: format!("{:?}", header.alg),
            kid: kid.to_string(),
            jkt,
        })
    }
}
