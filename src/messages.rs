//! Wire messages exchanged with the robots
//!
//! Debug traffic is JSON wrapped in a `debugv2` object carrying a
//! `msg_type`. The monitor daemon speaks a small binary format instead.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;

use crate::error::{DecodeError, LinkError, Result};

/// Kinds of `debugv2` messages a robot sends us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    HelloDebug,
    SymbolNames,
    SymbolValues,
    SaveBlackboardsOk,
    SaveBlackboardsError,
    Other,
}

impl MessageKind {
    pub fn from_msg_type(msg_type: &str) -> Self {
        match msg_type {
            "hellodebug" => MessageKind::HelloDebug,
            "symbol_names" => MessageKind::SymbolNames,
            "symbol_values" => MessageKind::SymbolValues,
            "save_blackboards_ok" => MessageKind::SaveBlackboardsOk,
            "save_blackboards_error" => MessageKind::SaveBlackboardsError,
            _ => MessageKind::Other,
        }
    }
}

/// A decoded `debugv2` message; `payload` is the object without `msg_type`
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: MessageKind,
    pub msg_type: String,
    pub payload: Map<String, Value>,
    pub from: SocketAddr,
}

impl InboundMessage {
    /// Unwrap the `debugv2` envelope. Documents without one, or without a
    /// string `msg_type`, are not debug messages and yield `None`.
    pub fn from_json(document: Value, from: SocketAddr) -> Option<Self> {
        let Value::Object(mut root) = document else {
            return None;
        };
        let Some(Value::Object(mut payload)) = root.remove("debugv2") else {
            return None;
        };
        let Some(Value::String(msg_type)) = payload.remove("msg_type") else {
            return None;
        };
        Some(Self {
            kind: MessageKind::from_msg_type(&msg_type),
            msg_type,
            payload,
            from,
        })
    }
}

/// Reply to a discovery probe
#[derive(Debug, Clone, PartialEq)]
pub struct HelloDebug {
    /// Lower-cased robot name
    pub robot_name: String,
    /// Whether another debug client currently owns the robot
    pub connected: bool,
    pub debug_client: Option<SocketAddr>,
}

impl HelloDebug {
    pub fn from_payload(payload: &Map<String, Value>) -> std::result::Result<Self, DecodeError> {
        let robot_name = payload
            .get("robotname")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DecodeError::Invalid("hellodebug without robotname".to_string()))?
            .to_lowercase();

        let connected = match payload.get("connected") {
            Some(Value::String(s)) => s != "false",
            Some(Value::Bool(b)) => *b,
            _ => return Err(DecodeError::Invalid("hellodebug without connected flag".to_string())),
        };

        let debug_client = match payload.get("debug_client").and_then(Value::as_str) {
            None | Some("") => None,
            Some(addr) => Some(addr.parse().map_err(|_| {
                DecodeError::Invalid(format!("hellodebug: bad debug_client '{}'", addr))
            })?),
        };

        Ok(Self { robot_name, connected, debug_client })
    }

    pub fn is_free(&self) -> bool {
        !self.connected
    }
}

/// Outbound debug messages
#[derive(Debug, Clone, PartialEq)]
pub enum DebugCommand {
    FindNao,
    KeepAlive,
    ChangeSymbol { blackboard: String, key: String, value: i32 },
    ChangeValues { blackboard: String, values: Map<String, Value> },
    SaveBlackboards,
}

impl DebugCommand {
    pub fn to_json(&self) -> Value {
        match self {
            DebugCommand::FindNao => json!({"debugv2": {"msg_type": "findnao"}}),
            DebugCommand::KeepAlive => json!({"debugv2": {"msg_type": "keepalive"}}),
            DebugCommand::ChangeSymbol { blackboard, key, value } => {
                let mut inner = Map::new();
                inner.insert(blackboard.clone(), json!({ key.as_str(): value }));
                inner.insert("msg_type".to_string(), json!("change_symbol"));
                json!({"debugv2": inner})
            }
            DebugCommand::ChangeValues { blackboard, values } => {
                let mut inner = Map::new();
                inner.insert(blackboard.clone(), Value::Object(values.clone()));
                inner.insert("msg_type".to_string(), json!("change_value"));
                json!({"debugv2": inner})
            }
            DebugCommand::SaveBlackboards => json!({"debugv2": {"msg_type": "save_blackboards"}}),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

/// Actions understood by the robot monitor daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MonitorAction {
    Backend = 0,
    Frontend = 1,
    AutoRestart = 2,
    SendConfig = 3,
    SetJson = 4,
}

/// Length of the zero-padded robot name leading every monitor message
pub const MONITOR_NAME_LEN: usize = 20;

/// Binary message for the monitor daemon
#[derive(Debug, Clone)]
pub struct MonitorMessage {
    data: Vec<u8>,
}

impl MonitorMessage {
    pub fn new(robot_name: &str) -> Result<Self> {
        let name = robot_name.as_bytes();
        if name.len() > MONITOR_NAME_LEN {
            return Err(LinkError::Protocol(format!(
                "robot name '{}' exceeds {} bytes",
                robot_name, MONITOR_NAME_LEN
            )));
        }
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(name);
        data.resize(MONITOR_NAME_LEN, 0);
        Ok(Self { data })
    }

    /// Enable or disable a monitor action
    pub fn action(robot_name: &str, action: MonitorAction, enabled: bool) -> Result<Self> {
        let mut message = Self::new(robot_name)?;
        message.push_i32(action as i32);
        message.push_i32(enabled as i32);
        Ok(message)
    }

    /// Push configuration (and optionally calibration) JSON to the robot
    pub fn set_json(robot_name: &str, configuration: &Value, calibration: Option<&Value>) -> Result<Self> {
        let mut message = Self::new(robot_name)?;
        message.push_i32(MonitorAction::SetJson as i32);
        message.push_json(robot_name, configuration)?;
        if let Some(calibration) = calibration {
            message.push_json(robot_name, calibration)?;
        }
        Ok(message)
    }

    fn push_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn push_json(&mut self, robot_name: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(&json!({ robot_name: value }))?;
        let len = i32::try_from(text.len())
            .map_err(|_| LinkError::Protocol("monitor JSON too large".to_string()))?;
        self.push_i32(len);
        self.data.extend_from_slice(text.as_bytes());
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
