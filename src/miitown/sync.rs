//! TrackerSyncer: periodic refresh loop for one session
//!
//! Runs in a background tokio task. Every scan interval, refreshes the
//! session's coordinator and publishes the result to its trackers.
//! Transient failures keep the last published state and wait for the next
//! tick; an authentication failure stops the loop for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::RefreshError;
use crate::miitown::coordinator::Fetcher;
use crate::miitown::manager::Session;
use crate::miitown::registry::DeviceRegistry;
use crate::miitown::snapshot::TrackerData;

/// What the loop should do after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Stop,
}

pub struct TrackerSyncer {
    session: Arc<Session>,
    registry: Arc<DeviceRegistry>,
    scan_interval: Duration,
}

impl TrackerSyncer {
    pub fn new(session: Arc<Session>, registry: Arc<DeviceRegistry>, scan_interval: Duration) -> Self {
        Self {
            session,
            registry,
            scan_interval,
        }
    }

    /// Run until shutdown is signalled or authentication fails
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "[Syncer] {} polling every {}s",
            self.session.name(),
            self.scan_interval.as_secs_f64()
        );

        let mut timer = interval(self.scan_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The session was refreshed once before the loop started
        timer.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = timer.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.session.coordinator().refresh() => result,
            };

            if *shutdown.borrow() {
                break;
            }

            if self.handle_result(result).await == CycleOutcome::Stop {
                break;
            }
        }

        tracing::info!("[Syncer] {} stopped", self.session.name());
    }

    /// Apply one refresh result to the session
    pub async fn handle_result(&self, result: Result<TrackerData, RefreshError>) -> CycleOutcome {
        match result {
            Ok(data) => {
                let report = self.session.publish(&data, &self.registry).await;
                tracing::debug!(
                    "[Syncer] {} published {} devices ({} new, {} changed)",
                    self.session.name(),
                    data.len(),
                    report.added,
                    report.changed
                );
                CycleOutcome::Continue
            }
            Err(e @ RefreshError::UpdateFailed(_)) => {
                tracing::warn!("[Syncer] {} sync failed: {}", self.session.name(), e);
                CycleOutcome::Continue
            }
            Err(e @ RefreshError::AuthRequired(_)) => {
                tracing::error!(
                    "[Syncer] {} needs new credentials, polling stopped: {}",
                    self.session.name(),
                    e
                );
                self.session.mark_auth_required().await;
                CycleOutcome::Stop
            }
        }
    }
}
