//! Keepalive handling for the active connection

use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::arbiter::ConnectionArbiter;
use crate::events::{Event, Outbox};
use crate::messages::DebugCommand;

/// Outcome of the last successful keepalive.
///
/// Replaced on every ping, never mutated. The default value has no timestamp
/// and is therefore never valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat {
    timestamp: Option<Instant>,
    connected: bool,
}

impl Heartbeat {
    pub fn new(timestamp: Instant, connected: bool) -> Self {
        Self {
            timestamp: Some(timestamp),
            connected,
        }
    }

    /// Valid while less than `interval` has passed since the ping
    pub fn is_valid(&self, now: Instant, interval: Duration) -> bool {
        self.timestamp
            .map_or(false, |t| now.saturating_duration_since(t) < interval)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }
}

/// Pings the active connection at most once per keepalive interval
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn tick(&self, now: Instant, arbiter: &mut ConnectionArbiter, outbox: &mut Outbox) {
        let Some(connection) = arbiter.connection_mut() else {
            return;
        };

        if connection.is_connected() && !connection.is_frontend_running() {
            info!("Frontend on {} stopped, disconnecting", connection.name());
            outbox.emit(Event::Disconnect(connection.name().to_string()));
            return;
        }

        if connection.heartbeat().is_valid(now, self.interval) {
            return;
        }

        let was_connected = connection.is_connected();
        if let Err(e) = connection.send(&DebugCommand::KeepAlive) {
            // Heartbeat stays invalid, so the next tick retries
            debug!("Keepalive to {} failed: {}", connection.name(), e);
            return;
        }
        trace!("Keepalive sent to {}", connection.name());

        let robot_connected = !connection.record().free;
        connection.update_heartbeat(Heartbeat::new(now, robot_connected));

        if !was_connected && connection.is_connected() {
            info!("Connected to {}", connection.name());
            outbox.emit(Event::Connected(connection.record().clone()));
        }
    }
}
