//! Device → owning session registry
//!
//! A device is tracked by the first session that sees it. Claims go through
//! a single write lock so two sessions can never both own the same device.

use std::collections::HashMap;

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First sighting; the device now belongs to the caller
    New,
    /// Already owned by the caller
    Owned,
    /// Owned by a different session
    Foreign,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// device_id → session_id
    devices: RwLock<HashMap<String, String>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claim(&self, device_id: &str, session_id: &str) -> Claim {
        let mut map = self.devices.write().await;
        match map.get(device_id) {
            Some(owner) if owner == session_id => Claim::Owned,
            Some(_) => Claim::Foreign,
            None => {
                map.insert(device_id.to_string(), session_id.to_string());
                Claim::New
            }
        }
    }

    pub async fn owner(&self, device_id: &str) -> Option<String> {
        let map = self.devices.read().await;
        map.get(device_id).cloned()
    }

    /// Forget every device owned by `session_id`, returning their ids
    pub async fn release_session(&self, session_id: &str) -> Vec<String> {
        let mut map = self.devices.write().await;
        let mut released = Vec::new();
        map.retain(|device_id, owner| {
            if owner == session_id {
                released.push(device_id.clone());
                false
            } else {
                true
            }
        });
        released.sort();
        released
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }
}
