//! State shared by every handler on the dispatch thread

use crossbeam::channel::Sender;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::arbiter::ConnectionArbiter;
use crate::config::{LinkConfig, MONITOR_PORT};
use crate::discovery::Discovery;
use crate::dispatch::{Command, Inbound};
use crate::error::{LinkError, Result};
use crate::events::{Event, EventBus, Outbox, Topic};
use crate::heartbeat::HeartbeatMonitor;
use crate::listener::ImageClient;
use crate::messages::{MessageKind, MonitorMessage};
use crate::net::DatagramSocket;
use crate::registry::{RobotRecord, SharedRegistry};

/// Everything the core handlers act on.
///
/// Owned by the dispatch thread. `now` is the time of the current dispatch
/// step, so handlers and ticks agree on a single clock reading.
pub struct LinkContext {
    pub config: LinkConfig,
    pub socket: Arc<dyn DatagramSocket>,
    pub registry: SharedRegistry,
    pub discovery: Discovery,
    pub arbiter: ConnectionArbiter,
    pub heartbeat: HeartbeatMonitor,
    pub outbox: Outbox,
    pub now: Instant,
}

impl LinkContext {
    pub fn new(
        config: LinkConfig,
        socket: Arc<dyn DatagramSocket>,
        registry: SharedRegistry,
        queue: Sender<Inbound>,
    ) -> Result<Self> {
        let discovery = Discovery::from_config(&config.discovery)?;
        let images = ImageClient::new(queue, config.images.clone());
        let arbiter = ConnectionArbiter::new(Arc::clone(&socket), images, config.images.port);
        let heartbeat = HeartbeatMonitor::new(config.connection.keepalive_interval());

        Ok(Self {
            config,
            socket,
            registry,
            discovery,
            arbiter,
            heartbeat,
            outbox: Outbox::default(),
            now: Instant::now(),
        })
    }

    pub fn tick_discovery(&mut self) {
        self.discovery.tick(self.now, self.socket.as_ref());
    }

    pub fn tick_heartbeat(&mut self) {
        self.heartbeat.tick(self.now, &mut self.arbiter, &mut self.outbox);
    }

    /// Drop robots that stopped answering and report them as lost
    pub fn expire_robots(&mut self) {
        let now = self.now;
        for record in self.registry.write(|registry| registry.expire(now)) {
            info!("Lost robot {}", record.name);
            self.outbox.emit(Event::Lost(record));
        }
    }

    /// Run a command issued through a link handle
    pub fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Connect(name) => self.outbox.emit(Event::Connect(name)),
            Command::Disconnect(name) => self.outbox.emit(Event::Disconnect(name)),
            Command::SetSymbolStatus { blackboard, symbol, receive } => {
                self.arbiter.active()?.set_symbol_status(&blackboard, &symbol, receive)?
            }
            Command::ChangeValues { blackboard, values } => {
                self.arbiter.active()?.change_values(&blackboard, values)?
            }
            Command::SaveBlackboards => self.arbiter.active()?.save_blackboards()?,
            Command::RecvImages => self.arbiter.recv_images()?,
            Command::StopImages => self.arbiter.stop_images(),
            Command::AddSearchIp(ip) => self.discovery.add_search_ip(ip),
            Command::RemoveSearchIp(ip) => {
                if !self.discovery.remove_search_ip(ip) {
                    debug!("{} was not a search address", ip);
                }
            }
            Command::ClearSearchIps => self.discovery.clear_search_ips(),
            Command::Monitor { robot, action, enabled } => {
                let record = self.known_robot(&robot)?;
                let message = MonitorMessage::action(&record.settings.name, action, enabled)?;
                self.send_monitor(&record, &message)?;
            }
            Command::PushConfig { robot, include_calibration } => {
                let record = self.known_robot(&robot)?;
                let configuration = record
                    .settings
                    .configuration
                    .as_ref()
                    .ok_or_else(|| LinkError::Protocol(format!("no configuration known for {}", robot)))?;
                let calibration = match (&record.settings.calibration, include_calibration) {
                    (Some(calibration), true) => Some(calibration),
                    (None, true) => {
                        return Err(LinkError::Protocol(format!("no calibration known for {}", robot)))
                    }
                    (_, false) => None,
                };
                let message = MonitorMessage::set_json(&record.settings.name, &configuration.raw, calibration)?;
                self.send_monitor(&record, &message)?;
            }
        }
        Ok(())
    }

    fn known_robot(&self, name: &str) -> Result<RobotRecord> {
        self.registry
            .write(|registry| registry.lookup(name).cloned())
            .ok_or_else(|| LinkError::Protocol(format!("unknown robot '{}'", name)))
    }

    fn send_monitor(&self, record: &RobotRecord, message: &MonitorMessage) -> Result<()> {
        let target = record
            .monitor_address
            .unwrap_or_else(|| SocketAddr::new(record.address.ip(), MONITOR_PORT));
        debug!("Monitor message for {} to {}", record.name, target);
        self.socket.send_to(message.as_bytes(), target)?;
        Ok(())
    }
}

/// Wire discovery, connection handling and debug replies into the bus
pub fn register_core_handlers(bus: &mut EventBus<LinkContext>) -> Result<()> {
    let discovery = bus.register("discovery", |event, ctx: &mut LinkContext| {
        let now = ctx.now;
        match event {
            Event::Message(message) => ctx.discovery.handle_hello(message, &ctx.registry, now, &mut ctx.outbox),
            Event::Settings { settings, from } => ctx.discovery.handle_settings(
                settings,
                *from,
                &ctx.registry,
                ctx.socket.as_ref(),
                now,
                &mut ctx.outbox,
            ),
            _ => Ok(()),
        }
    });
    bus.subscribe_all(&[Topic::Inbound(MessageKind::HelloDebug), Topic::Settings], discovery)?;

    let arbiter = bus.register("arbiter", |event, ctx: &mut LinkContext| {
        ctx.arbiter.handle(event, &ctx.registry, &mut ctx.outbox);
        Ok(())
    });
    bus.subscribe_all(
        &[
            Topic::Found,
            Topic::Updated,
            Topic::Lost,
            Topic::Connect,
            Topic::Disconnect,
            Topic::ImageStreamClosed,
        ],
        arbiter,
    )?;

    let symbols = bus.register("symbols", |event, ctx: &mut LinkContext| {
        let Event::Message(message) = event else {
            return Ok(());
        };
        let Some(connection) = ctx.arbiter.connection_mut() else {
            return Ok(());
        };
        let from_connected = connection
            .record()
            .debug_address
            .map_or(false, |addr| addr.ip() == message.from.ip());
        if !from_connected {
            debug!("Ignoring {} from {}, not the connected robot", message.msg_type, message.from);
            return Ok(());
        }

        let robot = connection.name().to_string();
        match message.kind {
            MessageKind::SymbolNames => {
                connection.set_symbol_names(message.payload.clone());
                ctx.outbox.emit(Event::SymbolNames { robot, symbols: message.payload.clone() });
            }
            MessageKind::SymbolValues => {
                ctx.outbox.emit(Event::SymbolValues { robot, values: message.payload.clone() });
            }
            _ => {}
        }
        Ok(())
    });
    bus.subscribe_all(
        &[Topic::Inbound(MessageKind::SymbolNames), Topic::Inbound(MessageKind::SymbolValues)],
        symbols,
    )?;

    let blackboards = bus.register("blackboards", |event, ctx: &mut LinkContext| {
        if let Event::Message(message) = event {
            let ok = message.kind == MessageKind::SaveBlackboardsOk;
            if ok {
                info!("Blackboards saved");
            } else {
                warn!("Saving blackboards failed on the robot");
            }
            ctx.outbox.emit(Event::BlackboardsSaved { ok });
        }
        Ok(())
    });
    bus.subscribe_all(
        &[
            Topic::Inbound(MessageKind::SaveBlackboardsOk),
            Topic::Inbound(MessageKind::SaveBlackboardsError),
        ],
        blackboards,
    )?;

    Ok(())
}
