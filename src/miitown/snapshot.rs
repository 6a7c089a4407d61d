//! Normalized device snapshots and out-of-order update handling

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::miitown::fuse::FusedDevice;

/// Decimal digits kept on reported speed
pub const SPEED_DIGITS: i32 = 1;

fn round_speed(speed: f64) -> f64 {
    let factor = 10f64.powi(SPEED_DIGITS);
    (speed * factor).round() / factor
}

/// Stable per-device model published to the entity layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub imei: String,
    pub name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_connected: bool,
    pub battery_level: u8,
    pub is_low_power: bool,
    pub is_driving: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub height: Option<f64>,
    pub satellites: Option<i64>,
    pub speed: Option<f64>,
}

impl From<FusedDevice> for DeviceSnapshot {
    fn from(device: FusedDevice) -> Self {
        let pos = device.position;
        Self {
            imei: device.entry.imei,
            name: device.entry.display_name,
            last_seen: device
                .last_seen
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            is_connected: device.is_connected,
            battery_level: device.battery,
            is_low_power: device.is_low_power,
            is_driving: device.is_driving,
            latitude: pos.as_ref().map(|p| p.latitude),
            longitude: pos.as_ref().map(|p| p.longitude),
            height: pos.as_ref().map(|p| p.height),
            satellites: pos.as_ref().map(|p| p.satellites),
            speed: pos.as_ref().map(|p| round_speed(p.speed)),
        }
    }
}

impl DeviceSnapshot {
    /// Copy of `self` whose location fields come from `previous`
    fn frozen_to(self, previous: &DeviceSnapshot) -> Self {
        Self {
            last_seen: previous.last_seen,
            is_connected: previous.is_connected,
            is_driving: previous.is_driving,
            latitude: previous.latitude,
            longitude: previous.longitude,
            height: previous.height,
            satellites: previous.satellites,
            speed: previous.speed,
            ..self
        }
    }
}

/// Result of checking an incoming snapshot against the last accepted one
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Accepted(DeviceSnapshot),
    /// `last_seen` went backwards; location fields were taken from the previous snapshot
    Frozen(DeviceSnapshot),
}

impl Reconciled {
    pub fn snapshot(&self) -> &DeviceSnapshot {
        match self {
            Reconciled::Accepted(s) | Reconciled::Frozen(s) => s,
        }
    }

    pub fn into_snapshot(self) -> DeviceSnapshot {
        match self {
            Reconciled::Accepted(s) | Reconciled::Frozen(s) => s,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Reconciled::Frozen(_))
    }
}

/// Accept `incoming` unless its `last_seen` is strictly before `previous`'s
///
/// A rejected snapshot keeps its own battery and low-power state but takes
/// every location field (last seen, connectivity, driving, coordinates,
/// height, satellites, speed) from `previous`. With no previous snapshot, or
/// with either timestamp unknown, the incoming value is accepted as-is.
pub fn reconcile(previous: Option<&DeviceSnapshot>, incoming: DeviceSnapshot) -> Reconciled {
    let Some(previous) = previous else {
        return Reconciled::Accepted(incoming);
    };

    match (incoming.last_seen, previous.last_seen) {
        (Some(new), Some(prev)) if new < prev => Reconciled::Frozen(incoming.frozen_to(previous)),
        _ => Reconciled::Accepted(incoming),
    }
}

/// One cycle's published result, keyed by device serial number
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerData {
    pub devices: BTreeMap<String, DeviceSnapshot>,
}

impl TrackerData {
    pub fn get(&self, device_id: &str) -> Option<&DeviceSnapshot> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
