//! Robot discovery
//!
//! Broadcasts a probe to every configured search address, to the broadcast
//! address of each local IPv4 interface and to localhost. Robots answer with
//! a `hellodebug` message; their monitor daemons additionally send settings
//! records. Both are folded into the registry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::{LinkError, Result};
use crate::events::{Event, Outbox};
use crate::messages::{DebugCommand, HelloDebug, InboundMessage, MonitorAction, MonitorMessage};
use crate::net::DatagramSocket;
use crate::registry::{RobotRecord, SharedRegistry};
use crate::settings::RobotSettings;

pub struct Discovery {
    port: u16,
    interval: Duration,
    search_ips: Vec<IpAddr>,
    extra_broadcasts: Vec<IpAddr>,
    include_interfaces: bool,
    last_sent: Option<Instant>,
    probe: Vec<u8>,
}

impl Discovery {
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        Ok(Self {
            port: config.port,
            interval: config.interval(),
            search_ips: parse_ips(&config.search_ips)?,
            extra_broadcasts: parse_ips(&config.extra_broadcasts)?,
            include_interfaces: config.include_interfaces,
            last_sent: None,
            probe: DebugCommand::FindNao.encode(),
        })
    }

    pub fn add_search_ip(&mut self, ip: IpAddr) {
        if !self.search_ips.contains(&ip) {
            self.search_ips.push(ip);
        }
    }

    pub fn remove_search_ip(&mut self, ip: IpAddr) -> bool {
        let before = self.search_ips.len();
        self.search_ips.retain(|known| *known != ip);
        self.search_ips.len() != before
    }

    pub fn clear_search_ips(&mut self) {
        self.search_ips.clear();
    }

    pub fn search_ips(&self) -> &[IpAddr] {
        &self.search_ips
    }

    /// Every address a probe goes to, without duplicates
    pub fn targets(&self) -> Vec<SocketAddr> {
        let mut ips: Vec<IpAddr> = self.search_ips.clone();
        if self.include_interfaces {
            ips.extend(interface_broadcasts());
        }
        ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        ips.extend(self.extra_broadcasts.iter().copied());

        let mut targets = Vec::with_capacity(ips.len());
        for ip in ips {
            let target = SocketAddr::new(ip, self.port);
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    /// Send the probe if the interval has elapsed; returns the number of
    /// addresses it reached.
    pub fn tick(&mut self, now: Instant, socket: &dyn DatagramSocket) -> usize {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.interval {
                return 0;
            }
        }
        self.last_sent = Some(now);

        let mut reached = 0;
        for target in self.targets() {
            match socket.send_to(&self.probe, target) {
                Ok(_) => reached += 1,
                Err(e) => trace!("Probe to {} failed: {}", target, e),
            }
        }
        reached
    }

    /// Fold a `hellodebug` reply into the registry
    pub fn handle_hello(
        &self,
        message: &InboundMessage,
        registry: &SharedRegistry,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let hello = HelloDebug::from_payload(&message.payload)?;
        let from = message.from;

        let event = registry.write(|registry| {
            let mut record = registry
                .lookup(&hello.robot_name)
                .cloned()
                .unwrap_or_else(|| RobotRecord::new(hello.robot_name.clone(), from));
            record.address = from;
            record.debug_address = Some(from);
            record.debug_client = hello.debug_client;
            record.free = hello.is_free();
            // Only a running frontend answers debug probes
            record.settings.frontend_running = true;
            registry.upsert(record, now)
        });
        announce(&event);
        outbox.emit(event);
        Ok(())
    }

    /// Fold a settings record into the registry, asking the monitor for the
    /// configuration when the record lacks it.
    pub fn handle_settings(
        &self,
        settings: &RobotSettings,
        from: SocketAddr,
        registry: &SharedRegistry,
        socket: &dyn DatagramSocket,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let name = settings.name.to_lowercase();

        let event = registry.write(|registry| {
            let mut record = registry
                .lookup(&name)
                .cloned()
                .unwrap_or_else(|| RobotRecord::new(name.clone(), from));
            let mut settings = settings.clone();
            settings.carry_over(&record.settings);
            record.settings = settings;
            record.address = from;
            record.monitor_address = Some(from);
            registry.upsert(record, now)
        });

        let complete = match &event {
            Event::Found(record) | Event::Updated(record) => record.settings.is_complete(),
            _ => true,
        };
        if !complete {
            debug!("Requesting configuration from {}", name);
            let request = MonitorMessage::action(&settings.name, MonitorAction::SendConfig, true)?;
            if let Err(e) = socket.send_to(request.as_bytes(), from) {
                debug!("Configuration request to {} failed: {}", from, e);
            }
        }

        announce(&event);
        outbox.emit(event);
        Ok(())
    }
}

fn announce(event: &Event) {
    if let Event::Found(record) = event {
        info!("Found robot {} at {}", record.name, record.address);
    }
}

fn parse_ips(values: &[String]) -> Result<Vec<IpAddr>> {
    values
        .iter()
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| LinkError::Config(format!("invalid IP address '{}'", value)))
        })
        .collect()
}

/// Directed broadcast of an IPv4 network
pub fn broadcast_address(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Broadcast addresses of the local IPv4 interfaces.
///
/// Computed from address and netmask because some tunnel interfaces report
/// a wrong broadcast address.
fn interface_broadcasts() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                if_addrs::IfAddr::V4(v4) => Some(IpAddr::V4(broadcast_address(v4.ip, v4.netmask))),
                _ => None,
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}
