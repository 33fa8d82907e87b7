pub mod account;
pub mod client;
pub mod client_manager;
pub mod device;
pub mod dpop;
pub mod hooks;
pub mod metadata;
pub mod provider;
pub mod replay;
pub mod request;
pub mod request_manager;
pub mod routes;
pub mod signer;
pub mod token;
pub mod token_manager;
pub mod verifier;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Milliseconds since the UNIX epoch.
pub fn epoch_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Seconds since the UNIX epoch.
pub fn epoch_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Random alphanumeric string used as the body of prefixed identifiers.
pub fn random_alphanumeric(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
