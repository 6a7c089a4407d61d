//! Location entities published to the host

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::miitown::snapshot::{DeviceSnapshot, TrackerData};

pub const ATTRIBUTION: &str = "Data provided by miitown.com";
pub const DRIVING_LOCATION: &str = "Driving";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Gps,
}

/// Driving flag after applying the configured speed threshold
///
/// With a threshold set, any known speed at or above it counts as driving;
/// otherwise the fused flag decides.
pub fn effective_driving(speed: Option<f64>, is_driving: bool, threshold: Option<f64>) -> bool {
    if let (Some(threshold), Some(speed)) = (threshold, speed) {
        if speed >= threshold {
            return true;
        }
    }
    is_driving
}

/// Extra per-entity attributes; every field is `None` while unavailable
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerAttributes {
    pub imei: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_connected: Option<bool>,
    pub is_low_power: Option<bool>,
    pub driving: Option<bool>,
    pub height: Option<f64>,
    pub satellites: Option<i64>,
    pub speed: Option<f64>,
}

/// Read accessors the entity layer renders
pub trait DeviceView {
    fn unique_id(&self) -> &str;
    fn name(&self) -> &str;
    fn available(&self) -> bool;
    fn battery_level(&self) -> Option<u8>;
    fn latitude(&self) -> Option<f64>;
    fn longitude(&self) -> Option<f64>;
    fn driving(&self) -> bool;
    fn extra_state_attributes(&self) -> TrackerAttributes;

    fn location_name(&self) -> Option<&'static str> {
        self.driving().then_some(DRIVING_LOCATION)
    }

    fn source_type(&self) -> SourceType {
        SourceType::Gps
    }

    fn attribution(&self) -> &'static str {
        ATTRIBUTION
    }
}

#[derive(Debug, Clone)]
pub struct DeviceTracker {
    device_id: String,
    name: String,
    driving_speed: Option<f64>,
    data: Option<DeviceSnapshot>,
}

impl DeviceTracker {
    pub fn new(device_id: impl Into<String>, snapshot: DeviceSnapshot, driving_speed: Option<f64>) -> Self {
        Self {
            device_id: device_id.into(),
            name: snapshot.name.clone(),
            driving_speed,
            data: Some(snapshot),
        }
    }

    /// Take this device's entry from a new cycle result
    ///
    /// Returns `true` when the rendered state changed.
    pub fn handle_update(&mut self, data: &TrackerData) -> bool {
        let next = data.get(&self.device_id).cloned();
        let changed = next != self.data;
        self.data = next;
        changed
    }

    pub fn mark_unavailable(&mut self) {
        self.data = None;
    }

    pub fn snapshot(&self) -> Option<&DeviceSnapshot> {
        self.data.as_ref()
    }
}

impl DeviceView for DeviceTracker {
    fn unique_id(&self) -> &str {
        &self.device_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn available(&self) -> bool {
        self.data.is_some()
    }

    fn battery_level(&self) -> Option<u8> {
        self.data.as_ref().map(|d| d.battery_level)
    }

    fn latitude(&self) -> Option<f64> {
        self.data.as_ref().and_then(|d| d.latitude)
    }

    fn longitude(&self) -> Option<f64> {
        self.data.as_ref().and_then(|d| d.longitude)
    }

    fn driving(&self) -> bool {
        self.data
            .as_ref()
            .map(|d| effective_driving(d.speed, d.is_driving, self.driving_speed))
            .unwrap_or(false)
    }

    fn extra_state_attributes(&self) -> TrackerAttributes {
        let Some(data) = self.data.as_ref() else {
            return TrackerAttributes::default();
        };

        TrackerAttributes {
            imei: Some(data.imei.clone()),
            last_seen: data.last_seen,
            is_connected: Some(data.is_connected),
            is_low_power: Some(data.is_low_power),
            driving: Some(self.driving()),
            height: data.height,
            satellites: data.satellites,
            speed: data.speed,
        }
    }
}
