use crate::constants::SIGN_IN_TIMING_FLOOR;
use crate::errors::OAuthError;
use crate::provider::device::DeviceId;
use crate::types::ClientId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Stable subject identifier of an account (a DID in decentralized-identity
/// deployments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sub(String);

impl Sub {
    pub fn new(sub: impl Into<String>) -> Result<Self, SubError> {
        let sub = sub.into();
        if sub.is_empty() {
            return Err(SubError::Empty);
        }
        if sub.chars().any(char::is_whitespace) {
            return Err(SubError::InvalidCharacters);
        }
        Ok(Self(sub))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Sub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Sub {
    type Err = SubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Sub {
    type Error = SubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Sub> for String {
    fn from(sub: Sub) -> Self {
        sub.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubError {
    #[error("Subject cannot be empty")]
    Empty,
    #[error("Subject cannot contain whitespace")]
    InvalidCharacters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub sub: Sub,
    /// Resource audiences tokens for this account are scoped to.
    pub aud: Vec<String>,
    pub preferred_username: Option<String>,
    pub email: Option<String>,
}

/// Association between an account and a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAccountInfo {
    /// When false the account must not be listed on the device chooser.
    pub remembered: bool,
    pub authenticated_at: DateTime<Utc>,
    /// Clients the user granted consent to from this device.
    pub authorized_clients: Vec<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account: Account,
    pub info: DeviceAccountInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInCredentials {
    pub username: String,
    pub password: String,
    /// When false the account is bound to the device but not listed by
    /// `list_device_accounts`.
    pub remember: Option<bool>,
    pub email_otp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpInput {
    pub handle: String,
    pub password: String,
    pub invite_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPasswordRequestInput {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetPasswordConfirmInput {
    pub token: String,
    pub password: String,
}

/// Account persistence and credential-checking capability. Implemented by
/// the embedding service; the in-memory variant below backs the tests.
#[rocket::async_trait]
pub trait AccountStore: Send + Sync {
    async fn authenticate_account(
        &mut self,
        credentials: SignInCredentials,
        device_id: DeviceId,
    ) -> Result<Option<AccountInfo>, OAuthError>;

    async fn create_account(
        &mut self,
        input: SignUpInput,
        device_id: DeviceId,
    ) -> Result<AccountInfo, OAuthError>;

    async fn get_device_account(
        &self,
        device_id: &DeviceId,
        sub: &Sub,
    ) -> Result<Option<AccountInfo>, OAuthError>;

    async fn list_device_accounts(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<AccountInfo>, OAuthError>;

    async fn add_authorized_client(
        &mut self,
        device_id: DeviceId,
        sub: Sub,
        client_id: ClientId,
    ) -> Result<(), OAuthError>;

    async fn remove_device_account(
        &mut self,
        device_id: DeviceId,
        sub: Sub,
    ) -> Result<(), OAuthError>;

    async fn verify_handle_availability(&self, handle: &str) -> Result<bool, OAuthError>;

    async fn reset_password_request(
        &mut self,
        input: ResetPasswordRequestInput,
    ) -> Result<(), OAuthError>;

    async fn reset_password_confirm(
        &mut self,
        input: ResetPasswordConfirmInput,
    ) -> Result<(), OAuthError>;
}

pub struct AccountManager {
    store: Arc<RwLock<dyn AccountStore>>,
}

impl AccountManager {
    pub fn new(store: Arc<RwLock<dyn AccountStore>>) -> Self {
        Self { store }
    }

    /// Check credentials and bind the account to the device.
    ///
    /// Failed and successful attempts are padded to a common floor so that
    /// response timing does not reveal whether the username exists.
    pub async fn sign_in(
        &self,
        credentials: SignInCredentials,
        device_id: DeviceId,
    ) -> Result<AccountInfo, OAuthError> {
        let started_at = tokio::time::Instant::now();
        let result = self
            .store
            .write()
            .await
            .authenticate_account(credentials, device_id)
            .await;

        let floor = Duration::from_millis(SIGN_IN_TIMING_FLOOR);
        let elapsed = started_at.elapsed();
        if elapsed < floor {
            tokio::time::sleep(floor - elapsed).await;
        }

        match result? {
            Some(account_info) => Ok(account_info),
            None => Err(OAuthError::InvalidRequest("Invalid credentials".to_string())),
        }
    }

    pub async fn sign_up(
        &self,
        input: SignUpInput,
        device_id: DeviceId,
    ) -> Result<AccountInfo, OAuthError> {
        self.store.write().await.create_account(input, device_id).await
    }

    pub async fn get(&self, device_id: &DeviceId, sub: &Sub) -> Result<AccountInfo, OAuthError> {
        match self.store.read().await.get_device_account(device_id, sub).await? {
            Some(account_info) => Ok(account_info),
            None => Err(OAuthError::InvalidRequest("Account not found".to_string())),
        }
    }

    /// Accounts eligible for the device chooser; unremembered sessions are
    /// bound to the device but not listed.
    pub async fn list(&self, device_id: &DeviceId) -> Result<Vec<AccountInfo>, OAuthError> {
        let accounts = self.store.read().await.list_device_accounts(device_id).await?;
        Ok(accounts
            .into_iter()
            .filter(|account_info| account_info.info.remembered)
            .collect())
    }

    pub async fn add_authorized_client(
        &self,
        device_id: DeviceId,
        account: &Account,
        client_id: &ClientId,
    ) -> Result<(), OAuthError> {
        // Loopback clients are not distinguishable from one another, so a
        // consent record for one would cover them all.
        if client_id.is_loopback() {
            return Ok(());
        }
        self.store
            .write()
            .await
            .add_authorized_client(device_id, account.sub.clone(), client_id.clone())
            .await
    }

    pub async fn verify_handle_availability(&self, handle: &str) -> Result<bool, OAuthError> {
        self.store.read().await.verify_handle_availability(handle).await
    }

    pub async fn reset_password_request(
        &self,
        input: ResetPasswordRequestInput,
    ) -> Result<(), OAuthError> {
        self.store.write().await.reset_password_request(input).await
    }

    pub async fn reset_password_confirm(
        &self,
        input: ResetPasswordConfirmInput,
    ) -> Result<(), OAuthError> {
        self.store.write().await.reset_password_confirm(input).await
    }
}

/// Reference store used by tests and development setups. Passwords are
/// compared in plain text; production stores hash.
#[derive(Default)]
pub struct AccountStoreMemory {
    accounts: HashMap<String, (String, Account)>,
    device_accounts: HashMap<(DeviceId, Sub), DeviceAccountInfo>,
}

impl AccountStoreMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, username: &str, password: &str, account: Account) -> Self {
        self.accounts
            .insert(username.to_string(), (password.to_string(), account));
        self
    }
}

#[rocket::async_trait]
impl AccountStore for AccountStoreMemory {
    async fn authenticate_account(
        &mut self,
        credentials: SignInCredentials,
        device_id: DeviceId,
    ) -> Result<Option<AccountInfo>, OAuthError> {
        let Some((password, account)) = self.accounts.get(&credentials.username) else {
            return Ok(None);
        };
        if *password != credentials.password {
            return Ok(None);
        }
        let account = account.clone();
        let info = DeviceAccountInfo {
            remembered: credentials.remember.unwrap_or(false),
            authenticated_at: Utc::now(),
            authorized_clients: self
                .device_accounts
                .get(&(device_id.clone(), account.sub.clone()))
                .map(|info| info.authorized_clients.clone())
                .unwrap_or_default(),
        };
        self.device_accounts
            .insert((device_id, account.sub.clone()), info.clone());
        Ok(Some(AccountInfo { account, info }))
    }

    async fn create_account(
        &mut self,
        input: SignUpInput,
        device_id: DeviceId,
    ) -> Result<AccountInfo, OAuthError> {
        if self.accounts.contains_key(&input.handle) {
            return Err(OAuthError::InvalidRequest("Handle is taken".to_string()));
        }
        let account = Account {
            sub: Sub::new(format!("did:web:{}", input.handle))
                .map_err(|e| OAuthError::InvalidRequest(e.to_string()))?,
            aud: vec![],
            preferred_username: Some(input.handle.clone()),
            email: None,
        };
        self.accounts
            .insert(input.handle, (input.password, account.clone()));
        let info = DeviceAccountInfo {
            remembered: true,
            authenticated_at: Utc::now(),
            authorized_clients: vec![],
        };
        self.device_accounts
            .insert((device_id, account.sub.clone()), info.clone());
        Ok(AccountInfo { account, info })
    }

    async fn get_device_account(
        &self,
        device_id: &DeviceId,
        sub: &Sub,
    ) -> Result<Option<AccountInfo>, OAuthError> {
        let Some(info) = self
            .device_accounts
            .get(&(device_id.clone(), sub.clone()))
        else {
            return Ok(None);
        };
        let account = self
            .accounts
            .values()
            .find(|(_, account)| &account.sub == sub)
            .map(|(_, account)| account.clone())
            .ok_or_else(|| OAuthError::ServerError("Dangling device account".to_string()))?;
        Ok(Some(AccountInfo {
            account,
            info: info.clone(),
        }))
    }

    async fn list_device_accounts(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<AccountInfo>, OAuthError> {
        let mut result = Vec::new();
        for ((bound_device, sub), _) in self.device_accounts.iter() {
            if bound_device == device_id {
                if let Some(account_info) = self.get_device_account(device_id, sub).await? {
                    result.push(account_info);
                }
            }
        }
        Ok(result)
    }

    async fn add_authorized_client(
        &mut self,
        device_id: DeviceId,
        sub: Sub,
        client_id: ClientId,
    ) -> Result<(), OAuthError> {
        if let Some(info) = self.device_accounts.get_mut(&(device_id, sub)) {
            if !info.authorized_clients.contains(&client_id) {
                info.authorized_clients.push(client_id);
            }
        }
        Ok(())
    }

    async fn remove_device_account(
        &mut self,
        device_id: DeviceId,
        sub: Sub,
    ) -> Result<(), OAuthError> {
        self.device_accounts.remove(&(device_id, sub));
        Ok(())
    }

    async fn verify_handle_availability(&self, handle: &str) -> Result<bool, OAuthError> {
        Ok(!self.accounts.contains_key(handle))
    }

    async fn reset_password_request(
        &mut self,
        _input: ResetPasswordRequestInput,
    ) -> Result<(), OAuthError> {
        Ok(())
    }

    async fn reset_password_confirm(
        &mut self,
        input: ResetPasswordConfirmInput,
    ) -> Result<(), OAuthError> {
        if input.token.is_empty() {
            return Err(OAuthError::InvalidRequest("Invalid reset token".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_account(sub: &str, username: &str) -> Account {
        Account {
            sub: Sub::new(sub).unwrap(),
            aud: vec!["https://pds.example.com".to_string()],
            preferred_username: Some(username.to_string()),
            email: None,
        }
    }

    fn manager_with_alice() -> AccountManager {
        let store = AccountStoreMemory::new().with_account(
            "alice.test",
            "hunter2",
            test_account("did:plc:alice", "alice.test"),
        );
        AccountManager::new(Arc::new(RwLock::new(store)))
    }

    fn credentials(remember: bool) -> SignInCredentials {
        SignInCredentials {
            username: "alice.test".to_string(),
            password: "hunter2".to_string(),
            remember: Some(remember),
            email_otp: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_success() {
        let manager = manager_with_alice();
        let device_id = DeviceId::generate();
        let account_info = manager.sign_in(credentials(true), device_id).await.unwrap();
        assert_eq!(account_info.account.sub.as_str(), "did:plc:alice");
        assert!(account_info.info.remembered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_bad_password() {
        let manager = manager_with_alice();
        let device_id = DeviceId::generate();
        let mut bad = credentials(true);
        bad.password = "wrong".to_string();
        let error = manager.sign_in(bad, device_id).await.unwrap_err();
        assert_eq!(
            error,
            OAuthError::InvalidRequest("Invalid credentials".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unremembered_sessions_not_listed() {
        let manager = manager_with_alice();
        let device_id = DeviceId::generate();
        manager
            .sign_in(credentials(false), device_id.clone())
            .await
            .unwrap();

        assert!(manager.list(&device_id).await.unwrap().is_empty());
        // ... but the binding still resolves directly by sub.
        let sub = Sub::new("did:plc:alice").unwrap();
        assert!(manager.get(&device_id, &sub).await.is_ok());
    }

    #[tokio::test]
    async fn test_loopback_consent_not_recorded() {
        let manager = manager_with_alice();
        let device_id = DeviceId::generate();
        let account_info = manager
            .sign_in(credentials(true), device_id.clone())
            .await
            .unwrap();

        let loopback = ClientId::new("http://localhost").unwrap();
        manager
            .add_authorized_client(device_id.clone(), &account_info.account, &loopback)
            .await
            .unwrap();

        let sub = Sub::new("did:plc:alice").unwrap();
        let refreshed = manager.get(&device_id, &sub).await.unwrap();
        assert!(refreshed.info.authorized_clients.is_empty());
    }

    #[tokio::test]
    async fn test_handle_availability() {
        let manager = manager_with_alice();
        assert!(!manager.verify_handle_availability("alice.test").await.unwrap());
        assert!(manager.verify_handle_availability("bob.test").await.unwrap());
    }

    #[tokio::test]
    async fn test_sign_up_binds_device() {
        let manager = manager_with_alice();
        let device_id = DeviceId::generate();
        let account_info = manager
            .sign_up(
                SignUpInput {
                    handle: "carol.test".to_string(),
                    password: "s3cret".to_string(),
                    invite_code: None,
                },
                device_id.clone(),
            )
            .await
            .unwrap();
        let fetched = manager
            .get(&device_id, &account_info.account.sub)
            .await
            .unwrap();
        assert_eq!(fetched.account.preferred_username.as_deref(), Some("carol.test"));
    }
}
