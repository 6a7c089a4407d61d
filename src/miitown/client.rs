//! Miitown web API client
//!
//! Holds the authorization returned by login and attaches its token to
//! every data call. There is no token refresh: once the server answers
//! -401/-404 the caller has to log in again with fresh credentials.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TrackerError;
use crate::miitown::fuse::{fuse_devices, parse_roster, parse_status, FusedDevice, RosterEntry};
use crate::miitown::http::HttpTransport;
use crate::miitown::response::take_data;

pub const BASE_URL: &str = "https://miitown.com";
pub const LOGIN_PATH: &str = "/api-user/user/login";
pub const DEVICES_PATH: &str = "/api-device/device-gps/all";
pub const STATUS_PATH: &str = "/api-gps/last/all/status";

/// Token-bearing object returned by login
///
/// Stored and restored as a whole so that fields other than `token`
/// survive a restart untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub token: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(rename = "rememberMe")]
    remember_me: bool,
}

pub struct MiitownClient {
    base_url: String,
    transport: HttpTransport,
    authorization: RwLock<Option<Authorization>>,
}

impl MiitownClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: HttpTransport,
        authorization: Option<Authorization>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            authorization: RwLock::new(authorization),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Log in and keep the returned authorization for later calls
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Authorization, TrackerError> {
        let body = LoginBody {
            username,
            password,
            remember_me: false,
        };

        let resp = self.transport.post(&self.url(LOGIN_PATH), &body).await?;
        let data = take_data(resp)?;
        let authorization: Authorization = serde_json::from_value(data)
            .map_err(|e| TrackerError::DataShape(format!("login: {}", e)))?;

        *self.authorization.write().await = Some(authorization.clone());

        tracing::info!("[MiitownClient] Logged in as {}", username);
        Ok(authorization)
    }

    pub async fn authorization(&self) -> Option<Authorization> {
        self.authorization.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.authorization.read().await.is_some()
    }

    async fn token(&self) -> Result<String, TrackerError> {
        self.authorization
            .read()
            .await
            .as_ref()
            .map(|a| a.token.clone())
            .ok_or_else(TrackerError::token_invalid)
    }

    /// Fetch the account's device roster
    pub async fn fetch_devices(&self) -> Result<Vec<RosterEntry>, TrackerError> {
        let token = self.token().await?;
        let resp = self
            .transport
            .get(&self.url(DEVICES_PATH), &[("token", token.as_str())])
            .await?;

        parse_roster(take_data(resp)?)
    }

    /// Fetch the status feed and fuse it with `devices`
    pub async fn fetch_devices_data(
        &self,
        devices: &[RosterEntry],
    ) -> Result<Vec<FusedDevice>, TrackerError> {
        let token = self.token().await?;
        let resp = self
            .transport
            .get(&self.url(STATUS_PATH), &[("token", token.as_str())])
            .await?;

        let metas = parse_status(take_data(resp)?)?;
        Ok(fuse_devices(devices, &metas, Utc::now().timestamp()))
    }
}
