use crate::constants::JWT_CLOCK_TOLERANCE;
use crate::errors::OAuthError;
use crate::jose::Keyset;
use crate::types::{Issuer, TokenType};
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shape of access tokens issued by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTokenMode {
    /// JWT when the token's audience is a different host than the issuer
    /// (the resource server cannot reach our token store), opaque token id
    /// otherwise.
    Auto,
    /// Always JWT: stateless, verifiable without a store lookup.
    Jwt,
    /// Always the opaque token id: shorter, revocation is immediate, but
    /// resource servers must introspect.
    Opaque,
}

/// `cnf` confirmation claim (RFC 7800) carrying the DPoP key thumbprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub jkt: String,
}

/// Claims of an issued access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub aud: Vec<String>,
    pub sub: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

/// Signs and verifies issuer JWTs.
pub struct Signer {
    pub issuer: Issuer,
    keyset: Arc<Keyset>,
}

impl Signer {
    pub fn new(issuer: Issuer, keyset: Arc<Keyset>) -> Self {
        Signer { issuer, keyset }
    }

    pub fn keyset(&self) -> &Keyset {
        &self.keyset
    }

    pub fn sign_access_token(&self, claims: &AccessTokenClaims) -> Result<String, OAuthError> {
        if claims.iss != self.issuer.as_str() {
            return Err(OAuthError::ServerError(
                "Access token \"iss\" must be this issuer".to_string(),
            ));
        }
        self.keyset
            .sign("at+jwt", claims)
            .map_err(|e| OAuthError::ServerError(e.to_string()))
    }

    /// Verify a token issued by us: signature, `iss` and `exp`.
    pub fn verify_access_token(
        &self,
        token: &str,
        token_type: TokenType,
    ) -> Result<AccessTokenClaims, OAuthError> {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.leeway = JWT_CLOCK_TOLERANCE / 1000;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = self
            .keyset
            .verify::<AccessTokenClaims>(token, &validation)
            .map_err(|e| OAuthError::InvalidToken(token_type, e.to_string()))?;
        Ok(data.claims)
    }
}

/// Required checks common to JWT and token-id presentation at a resource
/// server or at introspection time.
#[derive(Debug, Default)]
pub struct VerifyTokenClaimsOptions {
    pub audience: Option<String>,
    pub scope: Option<String>,
}

pub fn verify_token_claims(
    claims: &AccessTokenClaims,
    token_type: TokenType,
    dpop_jkt: Option<&str>,
    options: &VerifyTokenClaimsOptions,
) -> Result<(), OAuthError> {
    match &claims.cnf {
        Some(cnf) => {
            // DPoP-bound token (Invariant: cnf.jkt must match the proof on
            // every presentation).
            if token_type != TokenType::DPoP {
                return Err(OAuthError::InvalidToken(
                    token_type,
                    "Token is DPoP-bound and must be presented with the DPoP scheme".to_string(),
                ));
            }
            match dpop_jkt {
                Some(jkt) if jkt == cnf.jkt => {}
                Some(_) => return Err(OAuthError::InvalidDpopKeyBinding),
                None => {
                    return Err(OAuthError::InvalidToken(
                        token_type,
                        "DPoP proof required".to_string(),
                    ));
                }
            }
        }
        None => {
            if token_type != TokenType::Bearer {
                return Err(OAuthError::InvalidToken(
                    token_type,
                    "Token is not DPoP-bound".to_string(),
                ));
            }
        }
    }

    if let Some(audience) = &options.audience {
        if !claims.aud.iter().any(|aud| aud == audience) {
            return Err(OAuthError::InvalidToken(
                token_type,
                "Invalid audience".to_string(),
            ));
        }
    }
    if let Some(required_scope) = &options.scope {
        let granted = claims.scope.as_deref().unwrap_or("");
        if !granted.split(' ').any(|token| token == required_scope) {
            return Err(OAuthError::InvalidToken(
                token_type,
                "Missing required scope".to_string(),
            ));
        }
    }
    Ok(())
}
