//! Miitown GPS tracker integration module
//!
//! - `http`: JSON transport with a bounded timeout
//! - `response`: vendor response code validation
//! - `client`: API client (login, token handling, roster and status calls)
//! - `battery`: raw battery reading → percentage
//! - `fuse`: roster + status feed fusion
//! - `snapshot`: normalized device model and stale update reconciliation
//! - `coordinator`: per-session refresh cycle
//! - `registry`: device → owning session map
//! - `tracker`: location entities exposed to the host
//! - `manager`: multi-account session lifecycle
//! - `sync`: background polling loop

pub mod battery;
pub mod client;
pub mod coordinator;
pub mod fuse;
pub mod http;
pub mod manager;
pub mod registry;
pub mod response;
pub mod snapshot;
pub mod sync;
pub mod tracker;

pub use client::{Authorization, MiitownClient};
pub use coordinator::{Coordinator, DeviceSource, Fetcher};
pub use manager::{Session, SessionStatus, TrackerManager};
pub use registry::DeviceRegistry;
pub use snapshot::{reconcile, DeviceSnapshot, TrackerData};
pub use sync::TrackerSyncer;
pub use tracker::{DeviceTracker, DeviceView};
