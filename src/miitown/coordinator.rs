//! Per-session refresh cycle
//!
//! Fetches the roster once, then on every cycle fetches the status feed,
//! fuses it and runs each device through [`reconcile`] against the last
//! snapshot accepted for it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{RefreshError, TrackerError};
use crate::miitown::client::MiitownClient;
use crate::miitown::fuse::{FusedDevice, RosterEntry};
use crate::miitown::snapshot::{reconcile, DeviceSnapshot, TrackerData};

/// Where a coordinator gets its raw device data from
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<RosterEntry>, TrackerError>;
    async fn fetch_devices_data(
        &self,
        devices: &[RosterEntry],
    ) -> Result<Vec<FusedDevice>, TrackerError>;
}

#[async_trait]
impl DeviceSource for MiitownClient {
    async fn fetch_devices(&self) -> Result<Vec<RosterEntry>, TrackerError> {
        MiitownClient::fetch_devices(self).await
    }

    async fn fetch_devices_data(
        &self,
        devices: &[RosterEntry],
    ) -> Result<Vec<FusedDevice>, TrackerError> {
        MiitownClient::fetch_devices_data(self, devices).await
    }
}

/// Something the scheduler can refresh on a fixed interval
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn refresh(&self) -> Result<TrackerData, RefreshError>;
}

#[derive(Default)]
struct CycleState {
    roster: Vec<RosterEntry>,
    /// serial number → last accepted snapshot
    previous: HashMap<String, DeviceSnapshot>,
}

pub struct Coordinator {
    name: String,
    source: Arc<dyn DeviceSource>,
    /// Held for the whole cycle so cycles never overlap
    state: Mutex<CycleState>,
}

impl Coordinator {
    pub fn new(name: impl Into<String>, source: Arc<dyn DeviceSource>) -> Self {
        Self {
            name: name.into(),
            source,
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, err: TrackerError) -> RefreshError {
        if err.is_auth() {
            tracing::debug!("[Coordinator] {} login error: {}", self.name, err);
        } else {
            tracing::debug!("[Coordinator] {} update error: {}", self.name, err);
        }
        RefreshError::classify(err)
    }
}

fn stale_update_message(device_id: &str, seen: DateTime<Utc>, kept: DateTime<Utc>) -> String {
    format!(
        "{}: Ignoring location update because last_seen ({}) < previous last_seen ({})",
        device_id, seen, kept
    )
}

#[async_trait]
impl Fetcher for Coordinator {
    async fn refresh(&self) -> Result<TrackerData, RefreshError> {
        let mut state = self.state.lock().await;

        if state.roster.is_empty() {
            let roster = self
                .source
                .fetch_devices()
                .await
                .map_err(|e| self.classify(e))?;
            tracing::info!(
                "[Coordinator] {} roster fetched: {} devices",
                self.name,
                roster.len()
            );
            state.roster = roster;
        }

        let fused = self
            .source
            .fetch_devices_data(&state.roster)
            .await
            .map_err(|e| self.classify(e))?;

        let mut data = TrackerData::default();
        for device in fused {
            let device_id = device.entry.serial_number.clone();
            let incoming = DeviceSnapshot::from(device);
            let incoming_seen = incoming.last_seen;

            let result = reconcile(state.previous.get(&device_id), incoming);
            if result.is_frozen() {
                if let (Some(seen), Some(kept)) = (incoming_seen, result.snapshot().last_seen) {
                    tracing::warn!("[Coordinator] {}", stale_update_message(&device_id, seen, kept));
                }
            }

            let snapshot = result.into_snapshot();
            state.previous.insert(device_id.clone(), snapshot.clone());
            data.devices.insert(device_id, snapshot);
        }

        tracing::debug!(
            "[Coordinator] {} cycle done: {} devices",
            self.name,
            data.len()
        );
        Ok(data)
    }
}
