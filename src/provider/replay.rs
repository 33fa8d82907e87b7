use crate::constants::{
    CLIENT_ASSERTION_MAX_AGE, CODE_CHALLENGE_REPLAY_TIMEFRAME, DPOP_NONCE_MAX_AGE, JAR_MAX_AGE,
};
use crate::provider::epoch_millis;
use crate::types::ClientId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// At-most-once acceptance of nonces.
///
/// `unique` must behave as a conditional insert: when two concurrent calls
/// race on the same `(namespace, nonce)`, exactly one observes `true`.
pub trait ReplayStore: Send + Sync {
    /// Returns true if the nonce was never seen within the time frame.
    /// The namespace prevents cross-category collisions and mitigates
    /// denial of service between clients.
    ///
    /// `timeframe` is expressed in milliseconds.
    fn unique(&mut self, namespace: &str, nonce: &str, timeframe: u64) -> bool;
}

/// In-memory replay store. Entries expire lazily; insertion happens under
/// the caller's exclusive borrow, so check-then-insert cannot race.
#[derive(Default)]
pub struct ReplayStoreMemory {
    seen: HashMap<String, u64>,
}

impl ReplayStoreMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(&mut self, now: u64) {
        self.seen.retain(|_, expires_at| *expires_at > now);
    }
}

impl ReplayStore for ReplayStoreMemory {
    fn unique(&mut self, namespace: &str, nonce: &str, timeframe: u64) -> bool {
        let now = epoch_millis();
        self.purge_expired(now);

        let key = format!("{namespace}:{nonce}");
        match self.seen.get(&key) {
            Some(_) => false,
            None => {
                self.seen.insert(key, now + timeframe);
                true
            }
        }
    }
}

// Safety margin over the witness lifetime.
const SECURITY_RATIO_PERCENT: u64 = 110;

fn as_time_frame(time_frame: u64) -> u64 {
    time_frame * SECURITY_RATIO_PERCENT / 100
}

pub struct ReplayManager {
    store: Arc<RwLock<dyn ReplayStore>>,
}

impl ReplayManager {
    pub fn new(store: Arc<RwLock<dyn ReplayStore>>) -> Self {
        ReplayManager { store }
    }

    /// JAR request-object reuse.
    pub async fn unique_jar(&self, jti: &str, client_id: &ClientId) -> bool {
        self.store
            .write()
            .await
            .unique(&format!("JAR@{client_id}"), jti, as_time_frame(JAR_MAX_AGE))
    }

    /// Client-assertion JWT reuse.
    pub async fn unique_auth(&self, jti: &str, client_id: &ClientId) -> bool {
        self.store.write().await.unique(
            &format!("Auth@{client_id}"),
            jti,
            as_time_frame(CLIENT_ASSERTION_MAX_AGE),
        )
    }

    /// DPoP proof reuse, keyed under the proof key's thumbprint.
    pub async fn unique_dpop(&self, jkt: &str, jti: &str) -> bool {
        self.store.write().await.unique(
            &format!("DPoP@{jkt}"),
            jti,
            as_time_frame(DPOP_NONCE_MAX_AGE),
        )
    }

    /// Fresh PKCE challenge per authorization.
    ///
    /// Enforced through the replay store rather than by linking issued
    /// tokens, which is a coarse guard: after a restart of a memory-backed
    /// store the window starts over. Accepted trade-off; clients are
    /// expected to generate a new challenge per authorization anyway.
    pub async fn unique_code_challenge(&self, challenge: &str) -> bool {
        self.store.write().await.unique(
            "CodeChallenge",
            challenge,
            as_time_frame(CODE_CHALLENGE_REPLAY_TIMEFRAME),
        )
    }
}
