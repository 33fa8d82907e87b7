use crate::types::ClientId;
use serde::{Deserialize, Serialize};

pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// How the client identified itself on this request.
///
/// Public clients send a bare `client_id`; confidential clients send a
/// signed client assertion (RFC 7523).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientCredentials {
    JwtBearer {
        client_id: ClientId,
        client_assertion_type: String,
        client_assertion: String,
    },
    None {
        client_id: ClientId,
    },
}

impl ClientCredentials {
    pub fn client_id(&self) -> &ClientId {
        match self {
            ClientCredentials::JwtBearer { client_id, .. } => client_id,
            ClientCredentials::None { client_id } => client_id,
        }
    }
}
