//! Debug link service - high-level wrapper for embedding the link
//!
//! Builds the control socket, event bus and dispatch context, then runs the
//! listener and dispatch threads until shut down.

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::context::{register_core_handlers, LinkContext};
use crate::dispatch::{Command, Dispatcher, Inbound};
use crate::error::{LinkError, Result};
use crate::events::{Event, EventBus, HandlerId, Topic};
use crate::listener::{ControlListener, SplListener};
use crate::messages::MonitorAction;
use crate::net::{bind_udp, DatagramSocket};
use crate::registry::{RobotRecord, SharedRegistry};

/// A configured link that has not started its threads yet.
///
/// Handlers subscribed here run on the dispatch thread once started.
pub struct DebugLink {
    config: LinkConfig,
    socket: Arc<UdpSocket>,
    bus: EventBus<LinkContext>,
    ctx: LinkContext,
    queue: Sender<Inbound>,
    inbound: Receiver<Inbound>,
    registry: SharedRegistry,
}

impl DebugLink {
    /// Create a link from a configuration file
    pub fn new_with_config(config_path: &str) -> Result<Self> {
        let config = LinkConfig::load_from_path(config_path)?;
        Self::new(config)
    }

    pub fn new(config: LinkConfig) -> Result<Self> {
        info!("Initializing debug link");
        config.validate()?;
        let socket = Arc::new(bind_udp(config.network.bind_address, config.network.read_timeout())?);
        let (queue, inbound) = unbounded();
        let registry = SharedRegistry::new(config.connection.expiry());

        let sender: Arc<dyn DatagramSocket> = socket.clone();
        let ctx = LinkContext::new(config.clone(), sender, registry.clone(), queue.clone())?;
        let mut bus = EventBus::new();
        register_core_handlers(&mut bus)?;

        Ok(Self { config, socket, bus, ctx, queue, inbound, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            queue: self.queue.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Register `handler` under `name` and subscribe it to `topics`
    pub fn subscribe<F>(&mut self, name: &str, topics: &[Topic], handler: F) -> Result<HandlerId>
    where
        F: FnMut(&Event, &mut LinkContext) -> Result<()> + Send + 'static,
    {
        let id = self.bus.register(name, handler);
        self.bus.subscribe_all(topics, id)?;
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        self.bus.unregister(id)
    }

    /// Spawn the listener and dispatch threads.
    ///
    /// If any thread fails to start, the ones already running are stopped.
    pub fn start(self) -> Result<RunningLink> {
        let running = Arc::new(AtomicBool::new(true));
        let mut link = RunningLink {
            handle: self.handle(),
            running: Arc::clone(&running),
            threads: Vec::new(),
        };

        link.threads.push(ControlListener::spawn(
            Arc::clone(&self.socket),
            self.config.network.max_datagram,
            Arc::clone(&running),
            self.queue.clone(),
        )?);

        if self.config.spl.enabled {
            let addr = SocketAddr::from(([0, 0, 0, 0], self.config.spl.port()));
            let spl_socket = Arc::new(bind_udp(addr, self.config.network.read_timeout())?);
            link.threads.push(SplListener::spawn(
                spl_socket,
                self.config.spl.max_datagram,
                Arc::clone(&running),
                self.queue.clone(),
            )?);
        }

        let dispatcher = Dispatcher::new(self.bus, self.ctx, self.inbound);
        link.threads.push(
            thread::Builder::new()
                .name("dispatch".to_string())
                .spawn(move || dispatcher.run(running))?,
        );

        info!("Debug link started on {:?}", self.socket.local_addr());
        Ok(link)
    }
}

/// A started link; dropping it stops every thread
pub struct RunningLink {
    handle: LinkHandle,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl RunningLink {
    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Stop and join the listener and dispatch threads
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("Shutting down debug link");
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("A link thread panicked during shutdown");
            }
        }
    }
}

impl Drop for RunningLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cloneable handle for issuing commands from any thread.
///
/// Commands are queued and executed on the dispatch thread; their failures
/// are logged there. Only enqueueing can fail here.
#[derive(Clone)]
pub struct LinkHandle {
    queue: Sender<Inbound>,
    registry: SharedRegistry,
}

impl LinkHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.queue
            .send(Inbound::Command(command))
            .map_err(|_| LinkError::Channel("dispatch queue closed".to_string()))
    }

    /// Connect to a robot now, or as soon as it becomes debuggable
    pub fn connect(&self, robot: &str) -> Result<()> {
        self.send(Command::Connect(robot.to_lowercase()))
    }

    pub fn disconnect(&self, robot: &str) -> Result<()> {
        self.send(Command::Disconnect(robot.to_lowercase()))
    }

    pub fn start_receiving_symbol(&self, blackboard: &str, symbol: &str) -> Result<()> {
        self.set_symbol_status(blackboard, symbol, true)
    }

    pub fn stop_receiving_symbol(&self, blackboard: &str, symbol: &str) -> Result<()> {
        self.set_symbol_status(blackboard, symbol, false)
    }

    fn set_symbol_status(&self, blackboard: &str, symbol: &str, receive: bool) -> Result<()> {
        self.send(Command::SetSymbolStatus {
            blackboard: blackboard.to_string(),
            symbol: symbol.to_string(),
            receive,
        })
    }

    pub fn change_value(&self, blackboard: &str, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut values = Map::new();
        values.insert(key.to_string(), value.into());
        self.change_values(blackboard, values)
    }

    pub fn change_values(&self, blackboard: &str, values: Map<String, Value>) -> Result<()> {
        self.send(Command::ChangeValues { blackboard: blackboard.to_string(), values })
    }

    pub fn save_blackboards(&self) -> Result<()> {
        self.send(Command::SaveBlackboards)
    }

    pub fn recv_images(&self) -> Result<()> {
        self.send(Command::RecvImages)
    }

    pub fn stop_images(&self) -> Result<()> {
        self.send(Command::StopImages)
    }

    pub fn add_search_ip(&self, ip: IpAddr) -> Result<()> {
        self.send(Command::AddSearchIp(ip))
    }

    pub fn remove_search_ip(&self, ip: IpAddr) -> Result<()> {
        self.send(Command::RemoveSearchIp(ip))
    }

    pub fn clear_search_ips(&self) -> Result<()> {
        self.send(Command::ClearSearchIps)
    }

    /// Switch a monitor-controlled feature on the robot
    pub fn monitor(&self, robot: &str, action: MonitorAction, enabled: bool) -> Result<()> {
        self.send(Command::Monitor { robot: robot.to_lowercase(), action, enabled })
    }

    /// Send the robot's known configuration back to its monitor
    pub fn push_config(&self, robot: &str, include_calibration: bool) -> Result<()> {
        self.send(Command::PushConfig { robot: robot.to_lowercase(), include_calibration })
    }

    /// Snapshot of known robots; fails while the dispatch thread writes
    pub fn robots(&self) -> Result<Vec<RobotRecord>> {
        self.registry.try_snapshot()
    }

    pub fn robot(&self, name: &str) -> Result<Option<RobotRecord>> {
        self.registry.try_lookup(&name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn loopback_config() -> LinkConfig {
        let mut config = LinkConfig::default();
        config.network.bind_address = SocketAddr::from(([127, 0, 0, 1], 0));
        config.network.read_timeout_ms = 20;
        config.discovery.include_interfaces = false;
        config
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_handle_fails_after_link_is_gone() {
        let link = DebugLink::new(loopback_config()).unwrap();
        let handle = link.handle();
        drop(link);
        assert!(matches!(handle.connect("nao21"), Err(LinkError::Channel(_))));
    }

    #[test]
    fn test_robot_reply_is_discovered_end_to_end() {
        let mut link = DebugLink::new(loopback_config()).unwrap();
        let link_addr = link.local_addr().unwrap();
        let found = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&found);
        link.subscribe("test", &[Topic::Found], move |event, _ctx| {
            if let Event::Found(record) = event {
                log.lock().unwrap().push(record.name.clone());
            }
            Ok(())
        })
        .unwrap();

        let mut running = link.start().unwrap();
        let handle = running.handle();

        let robot = UdpSocket::bind("127.0.0.1:0").unwrap();
        robot
            .send_to(
                br#"{"debugv2": {"msg_type": "hellodebug", "robotname": "Nao21", "connected": "false"}}"#,
                link_addr,
            )
            .unwrap();

        assert!(wait_for(|| !found.lock().unwrap().is_empty()));
        assert_eq!(found.lock().unwrap()[0], "nao21");
        assert!(wait_for(|| matches!(handle.robot("NAO21"), Ok(Some(_)))));

        running.shutdown();
        assert!(matches!(handle.save_blackboards(), Err(LinkError::Channel(_))));
    }
}
