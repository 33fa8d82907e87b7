use crate::constants::{DPOP_NONCE_MAX_AGE, JWT_CLOCK_TOLERANCE};
use crate::errors::OAuthError;
use crate::jose::jwk_thumbprint;
use crate::provider::{epoch_millis, epoch_secs};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hex::ToHex;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Rotating DPoP nonce chain.
///
/// Nonces are derived from a secret and a time-step counter, so any server
/// instance sharing the secret accepts the same window of nonces without
/// coordination. The previous, current and next values are all accepted,
/// giving clients a full step of slack around rotation.
#[derive(Clone, Debug)]
pub struct DpopNonce {
    secret: Vec<u8>,
    counter: u64,
    prev: String,
    now: String,
    next: String,
    step: u64,
}

#[derive(Clone)]
pub enum DpopSecretInput {
    Hex(String),
    Bytes(Vec<u8>),
}

impl DpopNonce {
    pub fn new(secret: Vec<u8>, step: u64) -> Result<Self, DpopNonceError> {
        if secret.len() != 32 {
            return Err(DpopNonceError::InvalidSecret);
        }
        if step == 0 || step > DPOP_NONCE_MAX_AGE / 3 {
            return Err(DpopNonceError::InvalidStep);
        }

        let counter = epoch_millis() / step;
        let prev = compute(&secret, counter.wrapping_sub(1));
        let now = compute(&secret, counter);
        let next = compute(&secret, counter + 1);
        Ok(DpopNonce {
            secret,
            counter,
            prev,
            now,
            next,
            step,
        })
    }

    pub fn from_input(
        input: Option<DpopSecretInput>,
        step: Option<u64>,
    ) -> Result<Self, DpopNonceError> {
        let step = step.unwrap_or(DPOP_NONCE_MAX_AGE / 3);
        let secret = match input {
            None => rand::random::<[u8; 32]>().to_vec(),
            Some(DpopSecretInput::Hex(hex_secret)) => {
                hex::decode(hex_secret).map_err(|_| DpopNonceError::InvalidSecret)?
            }
            Some(DpopSecretInput::Bytes(bytes)) => bytes,
        };
        DpopNonce::new(secret, step)
    }

    /// The nonce to advertise in the `DPoP-Nonce` header.
    pub fn next(&mut self) -> String {
        self.rotate();
        self.next.clone()
    }

    fn rotate(&mut self) {
        let counter = epoch_millis() / self.step;
        match counter.saturating_sub(self.counter) {
            0 => return,
            1 => {
                self.prev = std::mem::replace(&mut self.now, self.next.clone());
                self.next = compute(&self.secret, counter + 1);
            }
            2 => {
                self.prev = self.next.clone();
                self.now = compute(&self.secret, counter);
                self.next = compute(&self.secret, counter + 1);
            }
            _ => {
                self.prev = compute(&self.secret, counter.wrapping_sub(1));
                self.now = compute(&self.secret, counter);
                self.next = compute(&self.secret, counter + 1);
            }
        }
        self.counter = counter;
    }

    pub fn check(&self, nonce: &str) -> bool {
        self.next == nonce || self.now == nonce || self.prev == nonce
    }
}

fn compute(secret: &[u8], counter: u64) -> String {
    let mut input = Vec::with_capacity(secret.len() + 8);
    input.extend_from_slice(secret);
    input.extend_from_slice(&counter.to_be_bytes());
    digest(&SHA256, &input).encode_hex()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DpopNonceError {
    #[error("DPoP nonce secret must be 32 bytes")]
    InvalidSecret,
    #[error("DPoP nonce step must be positive and at most a third of the nonce max age")]
    InvalidStep,
}

pub struct DpopManagerOptions {
    /// Provide a secret to make nonces predictable across instances;
    /// leave unset to generate one at startup.
    pub secret: Option<DpopSecretInput>,
    /// Rotation interval in milliseconds.
    pub step: Option<u64>,
}

/// Outcome of a successful proof check: the proof's `jti` (for the replay
/// guard) and the proof key's thumbprint (for sender-constraining).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedProof {
    pub jti: String,
    pub jkt: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProofClaims {
    jti: Option<String>,
    htm: Option<String>,
    htu: Option<String>,
    iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}

#[derive(Clone)]
pub struct DpopManager {
    nonce: Option<Arc<RwLock<DpopNonce>>>,
}

impl DpopManager {
    pub fn new(options: Option<DpopManagerOptions>) -> Result<Self, DpopNonceError> {
        match options {
            None => Ok(DpopManager { nonce: None }),
            Some(options) => {
                let nonce = DpopNonce::from_input(options.secret, options.step)?;
                Ok(DpopManager {
                    nonce: Some(Arc::new(RwLock::new(nonce))),
                })
            }
        }
    }

    pub async fn next_nonce(&self) -> Option<String> {
        match &self.nonce {
            None => None,
            Some(nonce) => Some(nonce.write().await.next()),
        }
    }

    /// Validate a DPoP proof against the request it arrived on.
    ///
    /// <https://datatracker.ietf.org/doc/html/rfc9449#section-4.3>
    pub async fn check_proof(
        &self,
        proof: &str,
        htm: &str,
        htu: &str,
        access_token: Option<&str>,
    ) -> Result<CheckedProof, OAuthError> {
        let header = jsonwebtoken::decode_header(proof)
            .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;

        match header.typ.as_deref() {
            Some("dpop+jwt") => {}
            Some(_) => return Err(OAuthError::InvalidDpopProof("Invalid \"typ\"".to_string())),
            None => return Err(OAuthError::InvalidDpopProof("Missing \"typ\"".to_string())),
        }
        if matches!(
            header.alg,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(OAuthError::InvalidDpopProof(
                "Symmetric algorithms are not allowed".to_string(),
            ));
        }
        let jwk = header
            .jwk
            .as_ref()
            .ok_or_else(|| OAuthError::InvalidDpopProof("Missing \"jwk\" header".to_string()))?;

        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;
        let mut validation = Validation::new(header.alg);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        validation.validate_aud = false;
        let proof_data = jsonwebtoken::decode::<ProofClaims>(proof, &decoding_key, &validation)
            .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;
        let claims = proof_data.claims;

        let jti = claims
            .jti
            .ok_or_else(|| OAuthError::InvalidDpopProof("Missing \"jti\"".to_string()))?;

        let iat = claims
            .iat
            .ok_or_else(|| OAuthError::InvalidDpopProof("Missing \"iat\"".to_string()))?;
        let now = epoch_secs() as i64;
        let max_age = (DPOP_NONCE_MAX_AGE / 1000) as i64;
        let skew = (JWT_CLOCK_TOLERANCE / 1000) as i64;
        if iat < now - max_age - skew || iat > now + skew {
            return Err(OAuthError::InvalidDpopProof(
                "\"iat\" out of range".to_string(),
            ));
        }

        // rfc9110 section 9.1: method names are case-sensitive.
        match claims.htm.as_deref() {
            Some(proof_htm) if proof_htm == htm => {}
            Some(_) => {
                return Err(OAuthError::InvalidDpopProof("DPoP htm mismatch".to_string()));
            }
            None => return Err(OAuthError::InvalidDpopProof("Missing \"htm\"".to_string())),
        }

        let proof_htu = claims
            .htu
            .as_deref()
            .and_then(normalize_htu)
            .ok_or_else(|| OAuthError::InvalidDpopProof("Invalid \"htu\"".to_string()))?;
        let expected_htu = normalize_htu(htu)
            .ok_or_else(|| OAuthError::InvalidRequest("Invalid \"htu\" argument".to_string()))?;
        if proof_htu != expected_htu {
            return Err(OAuthError::InvalidDpopProof("DPoP htu mismatch".to_string()));
        }

        if let Some(nonce) = &self.nonce {
            match &claims.nonce {
                None => return Err(OAuthError::UseDpopNonce(None)),
                Some(proof_nonce) => {
                    if !nonce.read().await.check(proof_nonce) {
                        return Err(OAuthError::UseDpopNonce(Some(
                            "DPoP nonce mismatch".to_string(),
                        )));
                    }
                }
            }
        }

        match (access_token, &claims.ath) {
            (Some(token), Some(proof_ath)) => {
                let ath = URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()));
                if &ath != proof_ath {
                    return Err(OAuthError::InvalidDpopProof("DPoP ath mismatch".to_string()));
                }
            }
            (Some(_), None) => {
                return Err(OAuthError::InvalidDpopProof("Missing \"ath\"".to_string()));
            }
            (None, Some(_)) => {
                return Err(OAuthError::InvalidDpopProof(
                    "DPoP ath not allowed".to_string(),
                ));
            }
            (None, None) => {}
        }

        let jkt =
            jwk_thumbprint(jwk).map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;
        Ok(CheckedProof { jti, jkt })
    }
}

/// The `htu` claim matches the request URI ignoring query and fragment,
/// after syntax-based normalization (RFC 9449 section 4.3).
fn normalize_htu(htu: &str) -> Option<String> {
    let mut url = url::Url::parse(htu).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::{Keyset, SigningKey};

    fn manager_with_nonce() -> DpopManager {
        DpopManager::new(Some(DpopManagerOptions {
            secret: None,
            step: None,
        }))
        .unwrap()
    }

    // Build a proof signed by a throwaway key whose public JWK is embedded
    // in the header, as clients do.
    fn proof_token(claims: &ProofClaims, keyset: &Keyset) -> String {
        let mut jwks = keyset.public_jwks();
        let mut header = jsonwebtoken::Header::new(Algorithm::ES256);
        header.typ = Some("dpop+jwt".to_string());
        header.jwk = Some(jwks.keys.remove(0));
        keyset.sign_with_header(&header, claims).unwrap()
    }

    fn base_claims(manager_nonce: Option<String>) -> ProofClaims {
        ProofClaims {
            jti: Some("jti-1".to_string()),
            htm: Some("POST".to_string()),
            htu: Some("https://auth.example.com/oauth/par".to_string()),
            iat: Some(chrono::Utc::now().timestamp()),
            nonce: manager_nonce,
            ath: None,
        }
    }

    #[tokio::test]
    async fn test_valid_proof() {
        let manager = manager_with_nonce();
        let nonce = manager.next_nonce().await;
        let keyset = Keyset::new(vec![SigningKey::generate("dpop-key").unwrap()]).unwrap();
        let proof = proof_token(&base_claims(nonce), &keyset);

        let checked = manager
            .check_proof(&proof, "POST", "https://auth.example.com/oauth/par", None)
            .await
            .unwrap();
        assert_eq!(checked.jti, "jti-1");
        assert!(!checked.jkt.is_empty());
    }

    #[tokio::test]
    async fn test_missing_nonce_asks_for_one() {
        let manager = manager_with_nonce();
        let keyset = Keyset::new(vec![SigningKey::generate("dpop-key").unwrap()]).unwrap();
        let proof = proof_token(&base_claims(None), &keyset);

        let error = manager
            .check_proof(&proof, "POST", "https://auth.example.com/oauth/par", None)
            .await
            .unwrap_err();
        assert_eq!(error, OAuthError::UseDpopNonce(None));
    }

    #[tokio::test]
    async fn test_htm_mismatch() {
        let manager = manager_with_nonce();
        let nonce = manager.next_nonce().await;
        let keyset = Keyset::new(vec![SigningKey::generate("dpop-key").unwrap()]).unwrap();
        let proof = proof_token(&base_claims(nonce), &keyset);

        let error = manager
            .check_proof(&proof, "GET", "https://auth.example.com/oauth/par", None)
            .await
            .unwrap_err();
        assert_eq!(
            error,
            OAuthError::InvalidDpopProof("DPoP htm mismatch".to_string())
        );
    }

    #[tokio::test]
    async fn test_htu_ignores_query() {
        let manager = manager_with_nonce();
        let nonce = manager.next_nonce().await;
        let keyset = Keyset::new(vec![SigningKey::generate("dpop-key").unwrap()]).unwrap();
        let proof = proof_token(&base_claims(nonce), &keyset);

        manager
            .check_proof(
                &proof,
                "POST",
                "https://auth.example.com/oauth/par?client_id=x",
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ath_required_with_access_token() {
        let manager = manager_with_nonce();
        let nonce = manager.next_nonce().await;
        let keyset = Keyset::new(vec![SigningKey::generate("dpop-key").unwrap()]).unwrap();

        let mut claims = base_claims(nonce.clone());
        let proof = proof_token(&claims, &keyset);
        let error = manager
            .check_proof(
                &proof,
                "POST",
                "https://auth.example.com/oauth/par",
                Some("token-value"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            error,
            OAuthError::InvalidDpopProof("Missing \"ath\"".to_string())
        );

        claims.ath = Some(URL_SAFE_NO_PAD.encode(Sha256::digest("token-value".as_bytes())));
        let proof = proof_token(&claims, &keyset);
        manager
            .check_proof(
                &proof,
                "POST",
                "https://auth.example.com/oauth/par",
                Some("token-value"),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_nonce_chain_window() {
        let mut nonce = DpopNonce::from_input(None, None).unwrap();
        let advertised = nonce.next();
        assert!(nonce.check(&advertised));
        assert!(!nonce.check("not-a-nonce"));
    }

    #[test]
    fn test_nonce_secret_validation() {
        assert_eq!(
            DpopNonce::new(vec![0u8; 16], 1000).unwrap_err(),
            DpopNonceError::InvalidSecret
        );
        assert_eq!(
            DpopNonce::new(vec![0u8; 32], 0).unwrap_err(),
            DpopNonceError::InvalidStep
        );
    }
}
