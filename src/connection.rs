//! The active debug connection to one robot

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::heartbeat::Heartbeat;
use crate::messages::DebugCommand;
use crate::net::DatagramSocket;
use crate::registry::RobotRecord;

/// Debug session with a single robot.
///
/// Holds a snapshot of the robot's registry record, refreshed on every
/// update, and sends commands over the shared control socket.
pub struct Connection {
    record: RobotRecord,
    socket: Arc<dyn DatagramSocket>,
    heartbeat: Heartbeat,
    /// blackboard -> symbol -> "1" (receiving) or "0"
    subscriptions: BTreeMap<String, BTreeMap<String, String>>,
    /// Latest symbol table announced by the robot
    symbol_names: Map<String, Value>,
}

impl Connection {
    pub fn new(record: RobotRecord, socket: Arc<dyn DatagramSocket>) -> Self {
        Self {
            record,
            socket,
            heartbeat: Heartbeat::default(),
            subscriptions: BTreeMap::new(),
            symbol_names: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &RobotRecord {
        &self.record
    }

    /// Replace the record snapshot with a newer one for the same robot
    pub fn refresh(&mut self, record: RobotRecord) {
        debug_assert_eq!(record.name, self.record.name);
        self.record = record;
    }

    /// Alive, owned by us, and reachable
    pub fn is_connected(&self) -> bool {
        self.heartbeat.is_connected() && !self.record.free && self.record.debug_address.is_some()
    }

    pub fn is_frontend_running(&self) -> bool {
        self.record.settings.frontend_running
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn update_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.heartbeat = heartbeat;
    }

    pub fn send(&self, command: &DebugCommand) -> Result<()> {
        let addr = self.record.debug_address.ok_or(LinkError::NotConnected)?;
        self.socket.send_to(&command.encode(), addr)?;
        Ok(())
    }

    /// Ask the robot to start streaming a symbol's value
    pub fn start_receiving_symbol(&mut self, blackboard: &str, symbol: &str) -> Result<()> {
        self.set_symbol_status(blackboard, symbol, true)
    }

    pub fn stop_receiving_symbol(&mut self, blackboard: &str, symbol: &str) -> Result<()> {
        self.set_symbol_status(blackboard, symbol, false)
    }

    pub fn set_symbol_status(&mut self, blackboard: &str, symbol: &str, receive: bool) -> Result<()> {
        let value = receive as i32;
        self.subscriptions
            .entry(blackboard.to_string())
            .or_default()
            .insert(symbol.to_string(), value.to_string());
        debug!("{} {}.{} on {}", if receive { "Subscribing" } else { "Unsubscribing" }, blackboard, symbol, self.name());
        self.send(&DebugCommand::ChangeSymbol {
            blackboard: blackboard.to_string(),
            key: symbol.to_string(),
            value,
        })
    }

    pub fn subscriptions(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.subscriptions
    }

    pub fn is_receiving(&self, blackboard: &str, symbol: &str) -> bool {
        self.subscriptions
            .get(blackboard)
            .and_then(|symbols| symbols.get(symbol))
            .map_or(false, |value| value == "1")
    }

    pub fn change_value(&self, blackboard: &str, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut values = Map::new();
        values.insert(key.to_string(), value.into());
        self.change_values(blackboard, values)
    }

    pub fn change_values(&self, blackboard: &str, values: Map<String, Value>) -> Result<()> {
        self.send(&DebugCommand::ChangeValues {
            blackboard: blackboard.to_string(),
            values,
        })
    }

    pub fn save_blackboards(&self) -> Result<()> {
        self.send(&DebugCommand::SaveBlackboards)
    }

    pub fn symbol_names(&self) -> &Map<String, Value> {
        &self.symbol_names
    }

    pub fn set_symbol_names(&mut self, symbol_names: Map<String, Value>) {
        self.symbol_names = symbol_names;
    }
}
