//! Error handling module

use thiserror::Error;

/// Message carried by every authentication failure
pub const TOKEN_INVALID: &str = "Token is invalid";

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Authentication invalid: {0}")]
    AuthInvalid(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Unexpected data: {0}")]
    DataShape(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TrackerError {
    /// Authentication failure with the vendor's fixed message
    pub fn token_invalid() -> Self {
        TrackerError::AuthInvalid(TOKEN_INVALID.to_string())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, TrackerError::AuthInvalid(_))
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::DataShape(e.to_string())
    }
}

/// Outcome of a failed refresh cycle, as seen by the scheduler
#[derive(Error, Debug)]
pub enum RefreshError {
    /// Credentials are no longer accepted; polling must stop
    #[error("Re-authentication required: {0}")]
    AuthRequired(#[source] TrackerError),

    /// Transient failure; the next scheduled cycle retries
    #[error("Update failed: {0}")]
    UpdateFailed(#[source] TrackerError),
}

impl RefreshError {
    pub fn classify(err: TrackerError) -> Self {
        if err.is_auth() {
            RefreshError::AuthRequired(err)
        } else {
            RefreshError::UpdateFailed(err)
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RefreshError::AuthRequired(_))
    }
}
