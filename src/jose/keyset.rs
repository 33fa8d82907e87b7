use crate::jose::jwk_thumbprint;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors that can occur when building or using a Keyset.
#[derive(Debug, thiserror::Error)]
pub enum KeysetError {
    #[error("Keyset requires at least one signing key")]
    Empty,
    #[error("Key material was rejected: {0}")]
    KeyRejected(String),
    #[error("No key in the keyset can verify this token")]
    NoMatchingKey,
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// A single ES256 signing key with its public JWK.
pub struct SigningKey {
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_jwk: Jwk,
}

impl SigningKey {
    /// Generate a fresh P-256 key. Useful for development setups and tests;
    /// production deployments construct keys from persisted PKCS#8 material.
    pub fn generate(kid: impl Into<String>) -> Result<Self, KeysetError> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|e| KeysetError::KeyRejected(e.to_string()))?;
        Self::from_pkcs8_der(kid, document.as_ref())
    }

    /// Build a signing key from PKCS#8 DER bytes of a P-256 private key.
    pub fn from_pkcs8_der(kid: impl Into<String>, der: &[u8]) -> Result<Self, KeysetError> {
        let kid = kid.into();
        let rng = SystemRandom::new();
        let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng)
            .map_err(|e| KeysetError::KeyRejected(e.to_string()))?;

        // Uncompressed SEC1 point: 0x04 || X (32 bytes) || Y (32 bytes).
        let public = pair.public_key().as_ref();
        if public.len() != 65 || public[0] != 0x04 {
            return Err(KeysetError::KeyRejected(
                "unexpected public key encoding".to_string(),
            ));
        }
        let x = URL_SAFE_NO_PAD.encode(&public[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&public[33..65]);

        let public_jwk = Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_algorithm: Some(KeyAlgorithm::ES256),
                key_id: Some(kid.clone()),
                ..Default::default()
            },
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: x.clone(),
                y: y.clone(),
            }),
        };
        let decoding_key = DecodingKey::from_ec_components(&x, &y)?;

        Ok(SigningKey {
            kid,
            encoding_key: EncodingKey::from_ec_der(der),
            decoding_key,
            public_jwk,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn public_jwk(&self) -> &Jwk {
        &self.public_jwk
    }

    /// RFC 7638 thumbprint of the public key.
    pub fn thumbprint(&self) -> String {
        jwk_thumbprint(&self.public_jwk).expect("EC JWK always has a thumbprint")
    }
}

/// The issuer's signing keys. The first key signs; every key verifies.
pub struct Keyset {
    keys: Vec<SigningKey>,
}

impl Keyset {
    pub fn new(keys: Vec<SigningKey>) -> Result<Self, KeysetError> {
        if keys.is_empty() {
            return Err(KeysetError::Empty);
        }
        Ok(Keyset { keys })
    }

    /// The JWKS document published at `/oauth/jwks`. Private members never
    /// leave the `SigningKey`.
    pub fn public_jwks(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.iter().map(|k| k.public_jwk.clone()).collect(),
        }
    }

    /// Sign `claims` into a compact JWS with the primary key.
    pub fn sign<C: Serialize>(&self, typ: &str, claims: &C) -> Result<String, KeysetError> {
        let key = &self.keys[0];
        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some(typ.to_string());
        header.kid = Some(key.kid.clone());
        Ok(jsonwebtoken::encode(&header, claims, &key.encoding_key)?)
    }

    /// Sign with a caller-supplied header. Client-side proofs (DPoP, client
    /// assertions) need headers the default signing path does not produce,
    /// such as an embedded `jwk`.
    pub fn sign_with_header<C: Serialize>(
        &self,
        header: &Header,
        claims: &C,
    ) -> Result<String, KeysetError> {
        Ok(jsonwebtoken::encode(header, claims, &self.keys[0].encoding_key)?)
    }

    /// Verify a compact JWS against the keyset. When the header names a
    /// `kid` only that key is tried; otherwise every key is.
    pub fn verify<C: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<TokenData<C>, KeysetError> {
        let header = jsonwebtoken::decode_header(token)?;

        let candidates: Vec<&SigningKey> = match &header.kid {
            Some(kid) => self.keys.iter().filter(|k| &k.kid == kid).collect(),
            None => self.keys.iter().collect(),
        };
        if candidates.is_empty() {
            return Err(KeysetError::NoMatchingKey);
        }

        let mut last_error = None;
        for key in candidates {
            match jsonwebtoken::decode::<C>(token, &key.decoding_key, validation) {
                Ok(data) => return Ok(data),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.map(KeysetError::Jwt).unwrap_or(KeysetError::NoMatchingKey))
    }
}
