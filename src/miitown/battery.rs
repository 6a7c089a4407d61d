//! Raw battery reading → percentage
//!
//! Readings at or above `FULL` are 100%, below `EMPTY` are 0%, and the range
//! in between is linear over `FULL - HEADROOM - EMPTY` (65) raw units, so the
//! curve tops out at 405 and everything from there to 409 clamps to 100.

const FULL: i64 = 410;
const EMPTY: i64 = 340;
const HEADROOM: i64 = 5;

/// Percentage at or below which a device is flagged low-power
pub const LOW_POWER_PERCENT: u8 = 20;

pub fn battery_percentage(raw: i64) -> u8 {
    if raw >= FULL {
        return 100;
    }
    if raw < EMPTY {
        return 0;
    }

    let percent = 100 * (raw - EMPTY) / (FULL - HEADROOM - EMPTY);
    percent.min(100) as u8
}
