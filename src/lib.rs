//! Miitown tracker bridge
//!
//! Polls the miitown.com GPS tracker API, fuses each device's roster entry
//! with its connection, position and power fragments, and publishes the
//! result as location trackers.

pub mod config;
pub mod error;
pub mod miitown;

pub use error::{RefreshError, TrackerError};
