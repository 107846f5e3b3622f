use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Typed status information sent by the device as JSON text messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    FreeText(String),
    /// Battery charge in percent
    BatteryLevel(f32),
    BrightnessLevel(i32),
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::FreeText(text) => write!(f, "{}", text),
            StatusEvent::BatteryLevel(level) => write!(f, "battery: {:.0}%", level),
            StatusEvent::BrightnessLevel(level) => write!(f, "brightness: {}", level),
        }
    }
}

/// Stateless parser for device status messages.
///
/// Recognized fields are `status` (string), `battery` (number) and
/// `brightness` (integer). Unknown fields are ignored and absent fields emit
/// nothing. Numeric fields also accept numeric strings, which some firmware
/// revisions send.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusMessageParser;

impl StatusMessageParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one text message. Malformed input yields no events.
    pub fn parse(&self, text: &str) -> Vec<StatusEvent> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping malformed status message: {}", e);
                return Vec::new();
            }
        };

        let Some(object) = value.as_object() else {
            warn!("Dropping status message that is not a JSON object: {}", text);
            return Vec::new();
        };

        let mut events = Vec::new();

        if let Some(status) = object.get("status").and_then(Value::as_str) {
            events.push(StatusEvent::FreeText(status.to_string()));
        }

        if let Some(battery) = object.get("battery").and_then(as_f64) {
            events.push(StatusEvent::BatteryLevel(battery as f32));
        }

        if let Some(brightness) = object.get("brightness").and_then(as_f64) {
            events.push(StatusEvent::BrightnessLevel(brightness.round() as i32));
        }

        debug!("Parsed {} status events", events.len());
        events
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Render the combined device status line, e.g. `battery: 87% | brightness: 3`
pub fn status_summary(battery: Option<f32>, brightness: Option<i32>) -> Option<String> {
    let parts: Vec<String> = [
        battery.map(|level| StatusEvent::BatteryLevel(level).to_string()),
        brightness.map(|level| StatusEvent::BrightnessLevel(level).to_string()),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}
