//! Roster + status feed fusion
//!
//! The roster lists the account's devices. The status feed is a list of
//! metas, each carrying up to three fragments (`conn`, `position`, `power`)
//! tagged with the IMEI they belong to. A fragment belongs to a device when
//! its IMEI equals the device's `imei` or its `serialNumber`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::TrackerError;
use crate::miitown::battery::{battery_percentage, LOW_POWER_PERCENT};

/// A device counts as connected if it reported within this window
pub const CONNECTED_WINDOW_SECS: i64 = 900;
/// A position fix older than this never counts as driving
pub const DRIVING_FIX_WINDOW_SECS: i64 = 60;
/// Speed that must be exceeded for a fresh fix to count as driving
pub const DRIVING_MIN_SPEED: f64 = 3.0;
/// `po` value reported while running on external power
pub const EXTERNAL_POWER: i64 = 1;

// ============================================================================
// Lenient field decoding
// ============================================================================

/// Read a JSON string or number as a string
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_f64(value: Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| "number out of range".to_string()),
        Value::String(s) => s.trim().parse::<f64>().map_err(|e| format!("'{}': {}", s, e)),
        other => Err(format!("expected number, got {}", other)),
    }
}

fn value_to_i64(value: Value) -> Result<i64, String> {
    let v = value_to_f64(value)?;
    if !v.is_finite() || v < i64::MIN as f64 || v >= i64::MAX as f64 {
        return Err(format!("{} does not fit an integer", v));
    }
    Ok(v as i64)
}

/// Accept a JSON string or number as a string
fn de_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_string(&value).ok_or_else(|| {
        serde::de::Error::custom(format!("expected string or number, got {}", value))
    })
}

/// Accept a JSON number or numeric string as f64
fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    value_to_f64(Value::deserialize(deserializer)?).map_err(serde::de::Error::custom)
}

fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    value_to_i64(Value::deserialize(deserializer)?).map_err(serde::de::Error::custom)
}

fn de_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => value_to_i64(value).map(Some).map_err(serde::de::Error::custom),
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// One device from the account's roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "serialNumber", deserialize_with = "de_string")]
    pub serial_number: String,
    #[serde(deserialize_with = "de_string")]
    pub imei: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Static fields the fuser does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RosterEntry {
    /// Whether a fragment tagged with `imei` belongs to this device
    pub fn owns(&self, imei: &str) -> bool {
        self.imei == imei || self.serial_number == imei
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnFragment {
    #[serde(deserialize_with = "de_string")]
    pub imei: String,
    #[serde(rename = "connTime", deserialize_with = "de_i64")]
    pub conn_time: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PositionFragment {
    #[serde(deserialize_with = "de_string")]
    pub imei: String,
    #[serde(rename = "gpsTime", deserialize_with = "de_i64")]
    pub gps_time: i64,
    #[serde(deserialize_with = "de_f64")]
    pub high: f64,
    #[serde(deserialize_with = "de_f64")]
    pub lat: f64,
    #[serde(deserialize_with = "de_f64")]
    pub lng: f64,
    #[serde(deserialize_with = "de_i64")]
    pub sates: i64,
    #[serde(deserialize_with = "de_f64")]
    pub speed: f64,
    #[serde(rename = "upMode", default)]
    pub up_mode: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PowerFragment {
    #[serde(deserialize_with = "de_string")]
    pub imei: String,
    #[serde(deserialize_with = "de_i64")]
    pub po: i64,
    /// Internal battery reading; only sent while on internal power
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub inside: Option<i64>,
}

/// A fragment as found in the feed
///
/// Decoding happens per fragment so that one malformed fragment only
/// affects the device it is tagged with.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment<T> {
    /// Tag read straight from the raw fragment; `None` matches no device
    pub imei: Option<String>,
    pub body: Result<T, String>,
}

impl<T: DeserializeOwned> Fragment<T> {
    fn from_value(value: Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        let imei = value.get("imei").and_then(value_to_string);
        let body = serde_json::from_value(value).map_err(|e| e.to_string());
        Some(Self { imei, body })
    }
}

impl<T> Fragment<T> {
    fn belongs_to(&self, entry: &RosterEntry) -> bool {
        self.imei.as_deref().is_some_and(|imei| entry.owns(imei))
    }

    fn decoded(&self, kind: &str) -> Result<&T, TrackerError> {
        self.body
            .as_ref()
            .map_err(|e| TrackerError::DataShape(format!("{} fragment: {}", kind, e)))
    }
}

/// One entry of the batched status feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusMeta {
    pub conn: Option<Fragment<ConnFragment>>,
    pub position: Option<Fragment<PositionFragment>>,
    pub power: Option<Fragment<PowerFragment>>,
}

impl StatusMeta {
    /// Anything other than an object is kept as an empty meta
    fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::default();
        };
        Self {
            conn: map.remove("conn").and_then(Fragment::from_value),
            position: map.remove("position").and_then(Fragment::from_value),
            power: map.remove("power").and_then(Fragment::from_value),
        }
    }
}

pub fn parse_roster(data: Value) -> Result<Vec<RosterEntry>, TrackerError> {
    serde_json::from_value(data).map_err(|e| TrackerError::DataShape(format!("roster: {}", e)))
}

pub fn parse_status(data: Value) -> Result<Vec<StatusMeta>, TrackerError> {
    match data {
        Value::Array(items) => Ok(items.into_iter().map(StatusMeta::from_value).collect()),
        other => Err(TrackerError::DataShape(format!(
            "status: expected a list, got {}",
            other
        ))),
    }
}

// ============================================================================
// Fused record
// ============================================================================

/// Position fields copied verbatim from a position fragment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionFix {
    pub gps_time: i64,
    pub height: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub satellites: i64,
    pub speed: f64,
    pub up_mode: Option<Value>,
}

/// Roster entry annotated with whatever fragments matched it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedDevice {
    pub entry: RosterEntry,
    pub is_connected: bool,
    pub is_low_power: bool,
    pub battery: u8,
    pub last_seen: Option<i64>,
    pub is_driving: bool,
    pub position: Option<PositionFix>,
}

impl FusedDevice {
    fn unmatched(entry: RosterEntry) -> Self {
        Self {
            entry,
            is_connected: false,
            is_low_power: false,
            battery: 0,
            last_seen: None,
            is_driving: false,
            position: None,
        }
    }

    fn apply_conn(&mut self, conn: &ConnFragment, now: i64) {
        self.is_connected = now.saturating_sub(conn.conn_time) <= CONNECTED_WINDOW_SECS;
        self.last_seen = Some(conn.conn_time);
    }

    fn apply_position(&mut self, pos: &PositionFragment, now: i64) {
        self.is_driving = now.saturating_sub(pos.gps_time) <= DRIVING_FIX_WINDOW_SECS
            && pos.speed > DRIVING_MIN_SPEED;
        self.position = Some(PositionFix {
            gps_time: pos.gps_time,
            height: pos.high,
            latitude: pos.lat,
            longitude: pos.lng,
            satellites: pos.sates,
            speed: pos.speed,
            up_mode: pos.up_mode.clone(),
        });
    }

    fn apply_power(&mut self, power: &PowerFragment) -> Result<(), TrackerError> {
        if power.po == EXTERNAL_POWER {
            self.battery = 100;
            self.is_low_power = false;
        } else {
            let inside = power.inside.ok_or_else(|| {
                TrackerError::DataShape("power fragment: missing field `inside`".to_string())
            })?;
            self.battery = battery_percentage(inside);
            self.is_low_power = self.battery <= LOW_POWER_PERCENT;
        }
        Ok(())
    }
}

/// Fuse one meta into a fresh copy of `entry`; `None` if no fragment matched
fn fuse_meta(
    entry: &RosterEntry,
    meta: &StatusMeta,
    now: i64,
) -> Option<Result<FusedDevice, TrackerError>> {
    let conn = meta.conn.as_ref().filter(|f| f.belongs_to(entry));
    let position = meta.position.as_ref().filter(|f| f.belongs_to(entry));
    let power = meta.power.as_ref().filter(|f| f.belongs_to(entry));

    if conn.is_none() && position.is_none() && power.is_none() {
        return None;
    }

    let fuse = || -> Result<FusedDevice, TrackerError> {
        let mut device = FusedDevice::unmatched(entry.clone());
        if let Some(conn) = conn {
            device.apply_conn(conn.decoded("conn")?, now);
        }
        if let Some(position) = position {
            device.apply_position(position.decoded("position")?, now);
        }
        if let Some(power) = power {
            device.apply_power(power.decoded("power")?)?;
        }
        Ok(device)
    };
    Some(fuse())
}

/// Fuse the roster with the status feed at time `now` (epoch seconds)
///
/// Output keeps roster order and only contains devices that matched at
/// least one fragment. For each device the first meta with any matching
/// fragment is used and later metas are ignored, even if they carry the
/// same IMEI. A device whose matching fragments cannot be read is left out
/// of this cycle.
pub fn fuse_devices(roster: &[RosterEntry], metas: &[StatusMeta], now: i64) -> Vec<FusedDevice> {
    roster
        .iter()
        .filter_map(|entry| {
            match metas.iter().find_map(|meta| fuse_meta(entry, meta, now))? {
                Ok(device) => Some(device),
                Err(e) => {
                    tracing::warn!("[Fuse] Skipping {} this cycle: {}", entry.serial_number, e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn roster() -> Vec<RosterEntry> {
        parse_roster(json!([
            { "serialNumber": "SN-1", "imei": "861000000000001", "displayName": "Car", "model": "M1" },
            { "serialNumber": "SN-2", "imei": "861000000000002", "displayName": "Bike" },
            { "serialNumber": "SN-3", "imei": "861000000000003", "displayName": "Dog" }
        ]))
        .unwrap()
    }

    fn full_meta(imei: &str) -> Value {
        json!({
            "conn": { "imei": imei, "connTime": NOW - 30 },
            "position": {
                "imei": imei, "gpsTime": NOW - 10, "high": 12.0, "lat": 22.5, "lng": 114.1,
                "sates": 9, "speed": 42.25, "upMode": 1
            },
            "power": { "imei": imei, "po": 0, "inside": 375 }
        })
    }

    #[test]
    fn test_full_match() {
        let metas = parse_status(json!([full_meta("861000000000001")])).unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 1);
        let car = &fused[0];
        assert_eq!(car.entry.serial_number, "SN-1");
        assert_eq!(car.entry.extra.get("model"), Some(&json!("M1")));
        assert!(car.is_connected);
        assert_eq!(car.last_seen, Some(NOW - 30));
        assert!(car.is_driving);
        assert_eq!(car.battery, 53);
        assert!(!car.is_low_power);
        let pos = car.position.as_ref().unwrap();
        assert_eq!(pos.latitude, 22.5);
        assert_eq!(pos.longitude, 114.1);
        assert_eq!(pos.height, 12.0);
        assert_eq!(pos.satellites, 9);
        assert_eq!(pos.up_mode, Some(json!(1)));
    }

    #[test]
    fn test_unmatched_device_excluded() {
        let metas = parse_status(json!([full_meta("861000000000002")])).unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].entry.serial_number, "SN-2");
    }

    #[test]
    fn test_power_only_match_uses_defaults() {
        let metas = parse_status(json!([
            { "power": { "imei": "861000000000003", "po": 0, "inside": 350 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 1);
        let dog = &fused[0];
        assert_eq!(dog.battery, 15);
        assert!(dog.is_low_power);
        assert!(!dog.is_connected);
        assert!(!dog.is_driving);
        assert_eq!(dog.last_seen, None);
        assert!(dog.position.is_none());
    }

    #[test]
    fn test_match_by_serial_number() {
        let metas = parse_status(json!([
            { "conn": { "imei": "SN-2", "connTime": NOW - 1000 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].entry.serial_number, "SN-2");
        assert!(!fused[0].is_connected);
        assert_eq!(fused[0].last_seen, Some(NOW - 1000));
    }

    #[test]
    fn test_connected_window_boundary() {
        let metas = parse_status(json!([
            { "conn": { "imei": "861000000000001", "connTime": NOW - 900 } },
            { "conn": { "imei": "861000000000002", "connTime": NOW - 901 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert!(fused[0].is_connected);
        assert!(!fused[1].is_connected);
    }

    #[test]
    fn test_driving_needs_fresh_fix_and_speed() {
        let position = |gps_time: i64, speed: f64| {
            json!({ "position": {
                "imei": "861000000000001", "gpsTime": gps_time, "high": 0, "lat": 1, "lng": 2,
                "sates": 4, "speed": speed
            }})
        };
        let driving = |meta: Value| {
            let metas = parse_status(json!([meta])).unwrap();
            fuse_devices(&roster(), &metas, NOW)[0].is_driving
        };

        assert!(driving(position(NOW - 60, 3.5)));
        assert!(!driving(position(NOW - 61, 50.0)));
        assert!(!driving(position(NOW, 3.0)));
    }

    #[test]
    fn test_external_power_forces_full() {
        let metas = parse_status(json!([
            { "power": { "imei": "861000000000001", "po": 1, "inside": 0 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused[0].battery, 100);
        assert!(!fused[0].is_low_power);
    }

    #[test]
    fn test_first_matching_meta_wins() {
        let metas = parse_status(json!([
            { "conn": { "imei": "861000000000001", "connTime": NOW - 5 } },
            { "power": { "imei": "861000000000001", "po": 1, "inside": 0 } },
            { "conn": { "imei": "861000000000001", "connTime": NOW - 2000 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].last_seen, Some(NOW - 5));
        // power sat in a later meta, so it was never consulted
        assert_eq!(fused[0].battery, 0);
    }

    #[test]
    fn test_meta_only_matching_other_device_is_skipped() {
        let metas = parse_status(json!([
            { "conn": { "imei": "861000000000002", "connTime": NOW } },
            { "power": { "imei": "861000000000001", "po": 0, "inside": 410 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].entry.serial_number, "SN-1");
        assert_eq!(fused[0].battery, 100);
        assert_eq!(fused[1].entry.serial_number, "SN-2");
    }

    #[test]
    fn test_fuse_is_idempotent_and_leaves_roster_untouched() {
        let roster = roster();
        let before = roster.clone();
        let metas = parse_status(json!([full_meta("861000000000001"), full_meta("SN-3")])).unwrap();

        let first = fuse_devices(&roster, &metas, NOW);
        let second = fuse_devices(&roster, &metas, NOW);

        assert_eq!(first, second);
        assert_eq!(roster, before);
    }

    #[test]
    fn test_lenient_numbers() {
        let metas = parse_status(json!([
            { "position": {
                "imei": 861000000000001u64, "gpsTime": "1700000000", "high": "3.5",
                "lat": "22.5", "lng": "114.0", "sates": "7", "speed": 0
            }}
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        let pos = fused[0].position.as_ref().unwrap();
        assert_eq!(pos.gps_time, NOW);
        assert_eq!(pos.satellites, 7);
        assert_eq!(pos.height, 3.5);
    }

    #[test]
    fn test_shape_errors() {
        let err = parse_roster(json!([{ "imei": "x" }])).unwrap_err();
        assert!(matches!(err, TrackerError::DataShape(_)));

        let err = parse_status(json!({"not": "a list"})).unwrap_err();
        assert!(matches!(err, TrackerError::DataShape(_)));
    }

    #[test]
    fn test_external_power_without_inside_reading() {
        let metas = parse_status(json!([
            { "conn": { "imei": "861000000000001", "connTime": NOW - 5 } },
            { "power": { "imei": "861000000000002", "po": 1 } }
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 2);
        assert!(fused[0].is_connected);
        assert_eq!(fused[1].battery, 100);
        assert!(!fused[1].is_low_power);
    }

    #[test]
    fn test_malformed_fragment_only_drops_its_device() {
        let metas = parse_status(json!([
            { "conn": { "imei": "861000000000001" } },
            { "power": { "imei": "861000000000002", "po": 0 } },
            { "position": { "lat": 1.0 } },
            "garbage",
            full_meta("861000000000003")
        ]))
        .unwrap();
        assert_eq!(metas.len(), 5);

        let fused = fuse_devices(&roster(), &metas, NOW);

        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].entry.serial_number, "SN-3");
        assert_eq!(fused[0].battery, 53);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let metas = parse_status(json!([
            { "conn": { "imei": "861000000000001", "connTime": -1e30 } },
            { "conn": { "imei": "861000000000002", "connTime": i64::MIN } },
            { "position": {
                "imei": "861000000000003", "gpsTime": i64::MIN, "high": 0, "lat": 1, "lng": 2,
                "sates": 4, "speed": 80
            }}
        ]))
        .unwrap();
        let fused = fuse_devices(&roster(), &metas, NOW);

        // -1e30 cannot be represented, so that device is skipped
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].entry.serial_number, "SN-2");
        assert!(!fused[0].is_connected);
        assert_eq!(fused[0].last_seen, Some(i64::MIN));
        assert_eq!(fused[1].entry.serial_number, "SN-3");
        assert!(!fused[1].is_driving);
    }
}
