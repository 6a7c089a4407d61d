//! miitown-tracker - Miitown GPS tracker bridge
//!
//! Starts one polling session per configured account and keeps the
//! device trackers up to date until interrupted.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use miitown_tracker::config::Config;
use miitown_tracker::miitown::{DeviceView, Session, SessionStatus, TrackerManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "miitown_tracker=info".into()),
        )
        .init();

    tracing::info!("Starting miitown-tracker...");

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        "Configuration loaded: {} accounts, scan interval {}s",
        config.accounts.len(),
        config.tracker.scan_interval_secs
    );

    let manager = Arc::new(TrackerManager::new(config.api.clone(), config.tracker.clone()));

    if config.accounts.is_empty() {
        tracing::warn!("No accounts configured");
    }

    // Each account keeps retrying on the scan interval until it starts or its
    // credentials are rejected
    let mut starting = Vec::new();
    for account in config.accounts.clone() {
        let manager = manager.clone();
        starting.push(tokio::spawn(async move {
            match manager.add_account_until_ready(&account).await {
                Ok(Some(session)) => watch_session(session),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Account {} needs new credentials: {}", account.username, e)
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    manager.shutdown().await;
    futures::future::join_all(starting).await;

    Ok(())
}

/// Log session status changes until the session stops
fn watch_session(session: Arc<Session>) {
    let mut status = session.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow();
            match current {
                SessionStatus::AuthRequired => {
                    tracing::error!("Session {} requires re-authentication", session.name());
                    break;
                }
                SessionStatus::Stopped => break,
                SessionStatus::Running => {}
            }
        }

        for tracker in session.trackers().await {
            tracing::info!(
                "Tracker {} last known: lat={:?} lng={:?} battery={:?}",
                tracker.name(),
                tracker.latitude(),
                tracker.longitude(),
                tracker.battery_level()
            );
        }
    });
}
