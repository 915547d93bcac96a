//! JSON Output for link events
//!
//! One JSON object per line on stdout, for tools that drive the debug link
//! from a script.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::events::Event;

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    // Round to 6 decimal places for consistent formatting
    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

/// A link event flattened for output
#[derive(Debug, Clone, Serialize)]
pub struct EventLine {
    /// Timestamp when the event was printed
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl EventLine {
    fn new(event_type: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: event_type.to_string(),
            robot: None,
            address: None,
            detail: Value::Null,
        }
    }

    fn robot(mut self, name: &str) -> Self {
        self.robot = Some(name.to_string());
        self
    }

    fn address(mut self, address: impl fmt::Display) -> Self {
        self.address = Some(address.to_string());
        self
    }

    fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn from_event(event: &Event) -> Self {
        match event {
            Event::Settings { settings, from } => Self::new("settings")
                .robot(&settings.name)
                .address(from)
                .detail(serde_json::to_value(settings).unwrap_or_default()),
            Event::Message(message) => Self::new("message")
                .address(message.from)
                .detail(json!({"msg_type": message.msg_type})),
            Event::Found(record) => Self::new("found").robot(&record.name).address(record.address),
            Event::Updated(record) => Self::new("updated")
                .robot(&record.name)
                .address(record.address)
                .detail(json!({
                    "free": record.free,
                    "frontend_running": record.settings.frontend_running,
                })),
            Event::Lost(record) => Self::new("lost").robot(&record.name),
            Event::Connect(name) => Self::new("connect").robot(name),
            Event::Connected(record) => Self::new("connected").robot(&record.name).address(record.address),
            Event::Disconnect(name) => Self::new("disconnect").robot(name),
            Event::Disconnected(record) => Self::new("disconnected").robot(&record.name),
            Event::SymbolNames { robot, symbols } => Self::new("symbol_names")
                .robot(robot)
                .detail(Value::Object(symbols.clone())),
            Event::SymbolValues { robot, values } => Self::new("symbol_values")
                .robot(robot)
                .detail(Value::Object(values.clone())),
            Event::BlackboardsSaved { ok } => Self::new("blackboards_saved").detail(json!({"ok": ok})),
            Event::Image(frame) => Self::new("image").detail(json!({
                "camera": frame.camera,
                "codec": frame.codec,
                "tick": frame.tick,
                "payload_bytes": frame.payload.len(),
                "side_channel_bytes": frame.side_channel.len(),
            })),
            Event::ImageStreamClosed { peer, .. } => Self::new("image_stream_closed").address(peer),
            Event::SplMessage { message, from } => Self::new("spl_message")
                .address(from)
                .detail(serde_json::to_value(message.as_ref()).unwrap_or_default()),
        }
    }
}

impl fmt::Display for EventLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "{{\"type\":\"{}\"}}", self.event_type),
        }
    }
}

/// Output an event as a single JSON line
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}
