use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::Jwk;
use sha2::{Digest, Sha256};

/// Errors that can occur when computing a JWK thumbprint.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ThumbprintError {
    #[error("JWK is missing required member {0:?}")]
    MissingMember(&'static str),
    #[error("Unsupported JWK key type: {0}")]
    UnsupportedKeyType(String),
}

/// Compute the RFC 7638 thumbprint of a JWK: SHA-256 over the canonical
/// JSON containing only the required members, in lexicographic order,
/// base64url-encoded without padding.
pub fn jwk_thumbprint(jwk: &Jwk) -> Result<String, ThumbprintError> {
    let value = serde_json::to_value(jwk).expect("JWK serializes to JSON");

    let member = |name: &'static str| -> Result<&str, ThumbprintError> {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .ok_or(ThumbprintError::MissingMember(name))
    };

    let kty = member("kty")?;
    let canonical = match kty {
        "EC" => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            member("crv")?,
            member("x")?,
            member("y")?
        ),
        "RSA" => format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            member("e")?,
            member("n")?
        ),
        "OKP" => format!(
            r#"{{"crv":"{}","kty":"OKP","x":"{}"}}"#,
            member("crv")?,
            member("x")?
        ),
        "oct" => format!(r#"{{"k":"{}","kty":"oct"}}"#, member("k")?),
        other => return Err(ThumbprintError::UnsupportedKeyType(other.to_string())),
    };

    let hash = Sha256::digest(canonical.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7638_appendix_a_vector() {
        // The RSA example key from RFC 7638 section 3.1.
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAt\
                  VT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn6\
                  4tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FD\
                  W2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n9\
                  1CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINH\
                  aQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
            "alg": "RS256",
            "kid": "2011-04-29"
        }))
        .unwrap();
        assert_eq!(
            jwk_thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_ec_thumbprint_is_stable() {
        let jwk: Jwk = serde_json::from_value(serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": "Pex6FMpr2h3KxOxiC9_vyZiZ1HGoe1R2t2j_hRZO2H8",
            "y": "YcgpKzYNc4oIG8Zro8OYv-csCiwYZTgf4kqMakD2LFQ"
        }))
        .unwrap();
        let a = jwk_thumbprint(&jwk).unwrap();
        let b = jwk_thumbprint(&jwk).unwrap();
        assert_eq!(a, b);
        // base64url, no padding
        assert!(!a.contains('='));
        assert_eq!(a.len(), 43);
    }
}
