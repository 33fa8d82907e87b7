use crate::provider::account::Account;
use crate::provider::client::{Client, ClientInfo};
use crate::types::{AuthorizationParameters, ClientId, ClientMetadata};

pub type OnClientInfo = Box<dyn Fn(&ClientId, &ClientMetadata) -> ClientInfo + Send + Sync>;

pub type OnAuthorizationDetails =
    Box<dyn Fn(&Client, &AuthorizationParameters, &Account) -> Option<serde_json::Value> + Send + Sync>;

/// Deployment-supplied callbacks. No global registration: the embedder
/// passes a `Hooks` value when constructing the provider.
#[derive(Default)]
pub struct Hooks {
    /// Enrich the resolved client with deployment knowledge (first-party
    /// flag, trust level).
    pub on_client_info: Option<OnClientInfo>,

    /// Enrich issued tokens with RFC 9396 authorization details.
    pub on_authorization_details: Option<OnAuthorizationDetails>,
}
