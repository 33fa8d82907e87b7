use crate::errors::OAuthError;
use crate::jose::Keyset;
use crate::provider::dpop::{CheckedProof, DpopManager, DpopManagerOptions, DpopSecretInput};
use crate::provider::replay::{ReplayManager, ReplayStore};
use crate::provider::signer::{
    verify_token_claims, AccessTokenClaims, AccessTokenMode, Signer, VerifyTokenClaimsOptions,
};
use crate::types::{Issuer, TokenType};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct VerifierOptions {
    pub issuer: Issuer,
    pub keyset: Arc<Keyset>,
    pub access_token_mode: AccessTokenMode,
    pub replay_store: Arc<RwLock<dyn ReplayStore>>,
    pub dpop_secret: Option<DpopSecretInput>,
    pub dpop_step: Option<u64>,
}

/// The subset of the provider a resource server needs: proof checking and
/// access-token validation, with no access to the stores behind issuance.
pub struct Verifier {
    pub issuer: Issuer,
    pub signer: Arc<Signer>,
    pub access_token_mode: AccessTokenMode,
    pub dpop_manager: DpopManager,
    pub replay_manager: ReplayManager,
}

impl Verifier {
    pub fn new(options: VerifierOptions) -> Result<Self, OAuthError> {
        let signer = Arc::new(Signer::new(options.issuer.clone(), options.keyset));
        let dpop_manager = DpopManager::new(Some(DpopManagerOptions {
            secret: options.dpop_secret,
            step: options.dpop_step,
        }))
        .map_err(|e| OAuthError::ServerError(e.to_string()))?;
        Ok(Verifier {
            issuer: options.issuer,
            signer,
            access_token_mode: options.access_token_mode,
            dpop_manager,
            replay_manager: ReplayManager::new(options.replay_store),
        })
    }

    pub async fn next_dpop_nonce(&self) -> Option<String> {
        self.dpop_manager.next_nonce().await
    }

    /// Full DPoP check: proof validity plus at-most-once `jti` acceptance.
    pub async fn check_dpop_proof(
        &self,
        proof: &str,
        htm: &str,
        htu: &str,
        access_token: Option<&str>,
    ) -> Result<CheckedProof, OAuthError> {
        let checked = self
            .dpop_manager
            .check_proof(proof, htm, htu, access_token)
            .await?;
        if !self
            .replay_manager
            .unique_dpop(&checked.jkt, &checked.jti)
            .await
        {
            return Err(OAuthError::InvalidDpopProof(
                "DPoP proof replayed".to_string(),
            ));
        }
        Ok(checked)
    }

    /// Validate a JWT access token presented to a resource server.
    pub async fn authenticate_token(
        &self,
        token_type: TokenType,
        token: &str,
        dpop_jkt: Option<&str>,
        options: &VerifyTokenClaimsOptions,
    ) -> Result<AccessTokenClaims, OAuthError> {
        if self.access_token_mode == AccessTokenMode::Opaque {
            return Err(OAuthError::InvalidToken(
                token_type,
                "This server does not issue JWT access tokens".to_string(),
            ));
        }
        let claims = self.signer.verify_access_token(token, token_type)?;
        verify_token_claims(&claims, token_type, dpop_jkt, options)?;
        Ok(claims)
    }
}
