use crate::constants::{
    DEVICE_ID_LENGTH, DEVICE_ID_PREFIX, SESSION_ID_LENGTH, SESSION_ID_PREFIX,
};
use crate::errors::OAuthError;
use crate::provider::random_alphanumeric;
use chrono::{DateTime, Duration, Utc};
use rocket::http::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identifies a user agent across visits. Stored server-side and mirrored
/// in a cookie together with the rotating session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(device_id: impl Into<String>) -> Result<Self, DeviceIdError> {
        let device_id = device_id.into();
        if device_id.len() != DEVICE_ID_PREFIX.len() + DEVICE_ID_LENGTH {
            return Err(DeviceIdError::InvalidLength);
        }
        if !device_id.starts_with(DEVICE_ID_PREFIX) {
            return Err(DeviceIdError::InvalidFormat);
        }
        Ok(Self(device_id))
    }

    pub fn generate() -> Self {
        let val = DEVICE_ID_PREFIX.to_string() + &random_alphanumeric(DEVICE_ID_LENGTH);
        Self::new(val).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(device_id: DeviceId) -> Self {
        device_id.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Invalid device id length")]
    InvalidLength,
    #[error("Invalid device id format")]
    InvalidFormat,
}

/// The rotating secret paired with a device id. Only valid together with a
/// matching device id; rotation invalidates stolen cookies over time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(session_id: impl Into<String>) -> Result<Self, SessionIdError> {
        let session_id = session_id.into();
        if session_id.len() != SESSION_ID_PREFIX.len() + SESSION_ID_LENGTH {
            return Err(SessionIdError::InvalidLength);
        }
        if !session_id.starts_with(SESSION_ID_PREFIX) {
            return Err(SessionIdError::InvalidFormat);
        }
        Ok(Self(session_id))
    }

    pub fn generate() -> Self {
        let val = SESSION_ID_PREFIX.to_string() + &random_alphanumeric(SESSION_ID_LENGTH);
        Self::new(val).unwrap()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("Invalid session id length")]
    InvalidLength,
    #[error("Invalid session id format")]
    InvalidFormat,
}

/// Transport-level facts about the request a device was seen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub user_agent: Option<String>,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceData {
    pub session_id: SessionId,
    pub user_agent: Option<String>,
    pub ip_address: String,
    pub last_seen_at: DateTime<Utc>,
}

#[rocket::async_trait]
pub trait DeviceStore: Send + Sync {
    async fn create_device(&mut self, device_id: DeviceId, data: DeviceData)
        -> Result<(), OAuthError>;
    async fn read_device(&self, device_id: &DeviceId) -> Result<Option<DeviceData>, OAuthError>;
    async fn update_device(&mut self, device_id: DeviceId, data: DeviceData)
        -> Result<(), OAuthError>;
    async fn delete_device(&mut self, device_id: DeviceId) -> Result<(), OAuthError>;
}

/// Reference store used by tests and development setups.
#[derive(Default)]
pub struct DeviceStoreMemory {
    devices: HashMap<DeviceId, DeviceData>,
}

impl DeviceStoreMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl DeviceStore for DeviceStoreMemory {
    async fn create_device(
        &mut self,
        device_id: DeviceId,
        data: DeviceData,
    ) -> Result<(), OAuthError> {
        self.devices.insert(device_id, data);
        Ok(())
    }

    async fn read_device(&self, device_id: &DeviceId) -> Result<Option<DeviceData>, OAuthError> {
        Ok(self.devices.get(device_id).cloned())
    }

    async fn update_device(
        &mut self,
        device_id: DeviceId,
        data: DeviceData,
    ) -> Result<(), OAuthError> {
        self.devices.insert(device_id, data);
        Ok(())
    }

    async fn delete_device(&mut self, device_id: DeviceId) -> Result<(), OAuthError> {
        self.devices.remove(&device_id);
        Ok(())
    }
}

pub struct DeviceManagerOptions {
    /// Time after which session ids are rotated, in milliseconds.
    pub rotation_rate: u64,
    /// Name of the cookie carrying the device id.
    pub device_cookie: String,
    /// Name of the cookie carrying the session id.
    pub session_cookie: String,
    /// Path the cookies are scoped to.
    pub cookie_path: String,
    /// Must stay `true` in production; only development setups on plain
    /// http may disable it.
    pub secure: bool,
}

impl Default for DeviceManagerOptions {
    fn default() -> Self {
        Self {
            rotation_rate: 5 * 60 * 1000,
            device_cookie: "device-id".to_string(),
            session_cookie: "session-id".to_string(),
            cookie_path: "/oauth/authorize".to_string(),
            secure: true,
        }
    }
}

/// Keeps track of devices (user agents) across interactive requests.
///
/// A device is identified by a cookie pair: the stable device id and a
/// session id that rotates on a schedule. A session id that does not match
/// the stored one is treated as a stolen or fixated cookie and yields a
/// brand new device.
pub struct DeviceManager {
    store: Arc<RwLock<dyn DeviceStore>>,
    options: DeviceManagerOptions,
}

impl DeviceManager {
    pub fn new(store: Arc<RwLock<dyn DeviceStore>>, options: Option<DeviceManagerOptions>) -> Self {
        Self {
            store,
            options: options.unwrap_or_default(),
        }
    }

    /// Resolve the device for this request, creating or rotating as needed,
    /// and (re)writing the cookie pair.
    pub async fn load(
        &self,
        cookies: &CookieJar<'_>,
        metadata: RequestMetadata,
    ) -> Result<DeviceId, OAuthError> {
        let presented = self.read_cookies(cookies);

        if let Some((device_id, session_id)) = presented {
            let stored = self.store.read().await.read_device(&device_id).await?;
            if let Some(data) = stored {
                if data.session_id == session_id {
                    return self.refresh(cookies, device_id, data, metadata).await;
                }
                tracing::debug!(%device_id, "session id mismatch, issuing a new device");
            }
        }

        self.create(cookies, metadata).await
    }

    async fn refresh(
        &self,
        cookies: &CookieJar<'_>,
        device_id: DeviceId,
        data: DeviceData,
        metadata: RequestMetadata,
    ) -> Result<DeviceId, OAuthError> {
        let age = Utc::now() - data.last_seen_at;
        let rotate = age > Duration::milliseconds(self.options.rotation_rate as i64);

        let session_id = if rotate {
            SessionId::generate()
        } else {
            data.session_id.clone()
        };

        let updated = DeviceData {
            session_id: session_id.clone(),
            user_agent: metadata.user_agent.or(data.user_agent),
            ip_address: metadata.ip_address,
            last_seen_at: Utc::now(),
        };
        self.store
            .write()
            .await
            .update_device(device_id.clone(), updated)
            .await?;

        if rotate {
            self.write_cookies(cookies, &device_id, &session_id);
        }
        Ok(device_id)
    }

    async fn create(
        &self,
        cookies: &CookieJar<'_>,
        metadata: RequestMetadata,
    ) -> Result<DeviceId, OAuthError> {
        let device_id = DeviceId::generate();
        let session_id = SessionId::generate();
        let data = DeviceData {
            session_id: session_id.clone(),
            user_agent: metadata.user_agent,
            ip_address: metadata.ip_address,
            last_seen_at: Utc::now(),
        };
        self.store
            .write()
            .await
            .create_device(device_id.clone(), data)
            .await?;

        self.write_cookies(cookies, &device_id, &session_id);
        Ok(device_id)
    }

    fn read_cookies(&self, cookies: &CookieJar<'_>) -> Option<(DeviceId, SessionId)> {
        let device = cookies.get(&self.options.device_cookie)?;
        let session = cookies.get(&self.options.session_cookie)?;
        let device_id = DeviceId::new(device.value()).ok()?;
        let session_id = SessionId::new(session.value()).ok()?;
        Some((device_id, session_id))
    }

    fn write_cookies(&self, cookies: &CookieJar<'_>, device_id: &DeviceId, session_id: &SessionId) {
        for (name, value) in [
            (&self.options.device_cookie, device_id.as_str()),
            (&self.options.session_cookie, session_id.as_str()),
        ] {
            cookies.add(
                Cookie::build((name.clone(), value.to_string()))
                    .path(self.options.cookie_path.clone())
                    .secure(self.options.secure)
                    .http_only(true)
                    .same_site(SameSite::Lax),
            );
        }
    }
}
