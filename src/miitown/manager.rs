//! TrackerManager: multi-account session lifecycle
//!
//! Owns one [`Session`] per set of credentials plus the shared
//! [`DeviceRegistry`]. Adding a session runs a first refresh before the
//! background [`TrackerSyncer`] is spawned; removing one stops its loop and
//! releases every device it owned.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::{AccountConfig, ApiConfig, TrackerConfig};
use crate::error::{RefreshError, TrackerError};
use crate::miitown::client::{Authorization, MiitownClient};
use crate::miitown::coordinator::{Coordinator, DeviceSource, Fetcher};
use crate::miitown::http::HttpTransport;
use crate::miitown::registry::{Claim, DeviceRegistry};
use crate::miitown::snapshot::TrackerData;
use crate::miitown::sync::TrackerSyncer;
use crate::miitown::tracker::DeviceTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionStatus {
    Running,
    /// Credentials were rejected; the host must ask for new ones
    AuthRequired,
    Stopped,
}

/// Counts from publishing one cycle result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub added: usize,
    pub changed: usize,
}

/// One authenticated account with its own coordinator and trackers
pub struct Session {
    id: String,
    name: String,
    coordinator: Coordinator,
    driving_speed: Option<f64>,
    authorization: Option<Authorization>,
    /// device_id → tracker, only for devices this session owns
    trackers: RwLock<BTreeMap<String, DeviceTracker>>,
    status: watch::Sender<SessionStatus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        coordinator: Coordinator,
        driving_speed: Option<f64>,
        authorization: Option<Authorization>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Running);
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            name: name.into(),
            coordinator,
            driving_speed,
            authorization,
            trackers: RwLock::new(BTreeMap::new()),
            status,
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Authorization to persist for the next start
    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn tracker(&self, device_id: &str) -> Option<DeviceTracker> {
        self.trackers.read().await.get(device_id).cloned()
    }

    pub async fn trackers(&self) -> Vec<DeviceTracker> {
        self.trackers.read().await.values().cloned().collect()
    }

    /// Claim newly seen devices and push `data` to every tracker
    pub async fn publish(&self, data: &TrackerData, registry: &DeviceRegistry) -> PublishReport {
        let mut report = PublishReport::default();
        if self.is_stopped() {
            return report;
        }

        let mut trackers = self.trackers.write().await;

        for (device_id, snapshot) in &data.devices {
            if trackers.contains_key(device_id) {
                continue;
            }
            match registry.claim(device_id, &self.id).await {
                Claim::New | Claim::Owned => {
                    tracing::debug!("[TrackerManager] Member: {} ({})", snapshot.name, self.name);
                    trackers.insert(
                        device_id.clone(),
                        DeviceTracker::new(device_id.clone(), snapshot.clone(), self.driving_speed),
                    );
                    report.added += 1;
                }
                Claim::Foreign => {
                    let owner = registry.owner(device_id).await.unwrap_or_default();
                    tracing::debug!(
                        "[TrackerManager] {} already tracked by session {}, skipping for {}",
                        device_id,
                        owner,
                        self.name
                    );
                }
            }
        }

        for tracker in trackers.values_mut() {
            if tracker.handle_update(data) {
                report.changed += 1;
            }
        }

        report
    }

    pub async fn mark_auth_required(&self) {
        let mut trackers = self.trackers.write().await;
        for tracker in trackers.values_mut() {
            tracker.mark_unavailable();
        }
        self.status.send_replace(SessionStatus::AuthRequired);
    }

    /// Stop the poll loop and wait until it has fully exited
    async fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if self.status() == SessionStatus::Running {
            self.status.send_replace(SessionStatus::Stopped);
        }
    }
}

/// Login failures other than an unreachable server mean the credentials
/// themselves were rejected
fn login_error(err: TrackerError) -> RefreshError {
    match err {
        TrackerError::Api(_) | TrackerError::AuthInvalid(_) => RefreshError::AuthRequired(err),
        other => RefreshError::UpdateFailed(other),
    }
}

/// Manages all sessions and the device registry they share
pub struct TrackerManager {
    /// session_id → Session
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    registry: Arc<DeviceRegistry>,
    api: ApiConfig,
    options: TrackerConfig,
    /// Set once by `shutdown`; pending startup retries give up
    closing: watch::Sender<bool>,
}

impl TrackerManager {
    pub fn new(api: ApiConfig, options: TrackerConfig) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry: Arc::new(DeviceRegistry::new()),
            api,
            options,
            closing,
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Log in (or reuse a stored authorization) and start a session
    pub async fn add_account(&self, account: &AccountConfig) -> Result<Arc<Session>, RefreshError> {
        let transport = HttpTransport::new(self.api.timeout()).map_err(RefreshError::classify)?;
        let client = MiitownClient::new(
            self.api.base_url.clone(),
            transport,
            account.authorization.clone(),
        );

        if client.is_authenticated().await {
            tracing::debug!("[TrackerManager] Reusing stored token for {}", account.username);
        } else {
            client
                .authenticate(&account.username, &account.password)
                .await
                .map_err(login_error)?;
        }

        let authorization = client.authorization().await;
        self.add_session(&account.username, Arc::new(client), authorization)
            .await
    }

    /// Retry [`add_account`](Self::add_account) every scan interval until it
    /// succeeds or the credentials are rejected
    ///
    /// Returns `Ok(None)` if the manager shuts down first.
    pub async fn add_account_until_ready(
        &self,
        account: &AccountConfig,
    ) -> Result<Option<Arc<Session>>, RefreshError> {
        let mut closing = self.closing.subscribe();
        let mut timer = interval(self.options.scan_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = closing.changed() => return Ok(None),
                _ = timer.tick() => {}
            }
            if self.is_closing() {
                return Ok(None);
            }

            match self.add_account(account).await {
                Ok(session) => {
                    if self.is_closing() {
                        self.remove_session(session.id()).await;
                        return Ok(None);
                    }
                    return Ok(Some(session));
                }
                Err(e @ RefreshError::AuthRequired(_)) => return Err(e),
                Err(e) => tracing::warn!(
                    "[TrackerManager] {} not ready, retrying in {}s: {}",
                    account.username,
                    self.options.scan_interval_secs,
                    e
                ),
            }
        }
    }

    /// Start a session over `source`; fails if the first refresh fails
    pub async fn add_session(
        &self,
        name: &str,
        source: Arc<dyn DeviceSource>,
        authorization: Option<Authorization>,
    ) -> Result<Arc<Session>, RefreshError> {
        let id = uuid::Uuid::new_v4().to_string();
        let coordinator = Coordinator::new(format!("miitown ({})", name), source);

        let initial = coordinator.refresh().await?;

        let session = Arc::new(Session::new(
            id.clone(),
            name,
            coordinator,
            self.options.driving_speed,
            authorization,
        ));
        let report = session.publish(&initial, &self.registry).await;

        let syncer = Arc::new(TrackerSyncer::new(
            session.clone(),
            self.registry.clone(),
            self.options.scan_interval(),
        ));
        let handle = tokio::spawn(syncer.start(session.shutdown.subscribe()));
        *session.task.lock().await = Some(handle);

        self.sessions.write().await.insert(id.clone(), session.clone());

        tracing::info!(
            "[TrackerManager] Session {} started for {} with {} devices",
            id,
            name,
            report.added
        );
        Ok(session)
    }

    /// Stop a session and release its devices
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let session = self.sessions.write().await.remove(session_id);
        let Some(session) = session else {
            return false;
        };

        session.stop().await;
        let released = self.registry.release_session(session_id).await;

        tracing::info!(
            "[TrackerManager] Session {} ({}) removed, released {} devices",
            session_id,
            session.name(),
            released.len()
        );
        true
    }

    pub async fn list_session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Stop every session and any pending startup retries
    pub async fn shutdown(&self) {
        self.closing.send_replace(true);
        let ids = self.list_session_ids().await;
        futures::future::join_all(ids.iter().map(|id| self.remove_session(id))).await;
    }
}
