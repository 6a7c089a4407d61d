//! Vendor response code convention
//!
//! Every decoded body goes through [`check_response`] before it is used.
//! `code` may arrive either as a string or as a number.

use serde_json::Value;

use crate::error::TrackerError;

const CODE_OK: &str = "200";
const AUTH_CODES: [&str; 2] = ["-401", "-404"];

fn code_of(body: &serde_json::Map<String, Value>) -> String {
    match body.get("code") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn error_text(body: &serde_json::Map<String, Value>, code: &str) -> String {
    let text = |key: &str| {
        body.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    text("message")
        .or_else(|| text("msg"))
        .unwrap_or_else(|| format!("unexpected response code '{}'", code))
}

/// Validate a decoded response body
///
/// - bare array: always accepted
/// - `code` "200": accepted
/// - `code` "-401" / "-404": [`TrackerError::AuthInvalid`]
/// - anything else: [`TrackerError::Api`] with `message`, falling back to `msg`
pub fn check_response(body: &Value) -> Result<(), TrackerError> {
    let map = match body {
        Value::Array(_) => return Ok(()),
        Value::Object(map) => map,
        other => {
            return Err(TrackerError::DataShape(format!(
                "expected a JSON object or array, got {}",
                other
            )))
        }
    };

    let code = code_of(map);
    if code == CODE_OK {
        return Ok(());
    }
    if AUTH_CODES.contains(&code.as_str()) {
        return Err(TrackerError::token_invalid());
    }

    Err(TrackerError::Api(error_text(map, &code)))
}

/// Validate `body` and take its `data` member
pub fn take_data(mut body: Value) -> Result<Value, TrackerError> {
    check_response(&body)?;
    match body {
        Value::Array(_) => Ok(body),
        _ => body
            .get_mut("data")
            .map(Value::take)
            .ok_or_else(|| TrackerError::DataShape("response has no 'data' member".to_string())),
    }
}
