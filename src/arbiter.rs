//! Single-connection policy
//!
//! At most one robot is connected at a time. Connecting to another robot
//! drops the current connection first and reports it as disconnected.
//! Requests for robots that cannot be debugged right now are refused
//! silently and remembered; the next discovery update that makes the robot
//! eligible completes them.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::{LinkError, Result};
use crate::events::{Event, Outbox};
use crate::listener::ImageClient;
use crate::net::DatagramSocket;
use crate::registry::{RobotRecord, SharedRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
}

pub struct ConnectionArbiter {
    connection: Option<Connection>,
    pending: HashSet<String>,
    socket: Arc<dyn DatagramSocket>,
    images: ImageClient,
    image_port: u16,
}

impl ConnectionArbiter {
    pub fn new(socket: Arc<dyn DatagramSocket>, images: ImageClient, image_port: u16) -> Self {
        Self {
            connection: None,
            pending: HashSet::new(),
            socket,
            images,
            image_port,
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Connection or `NotConnected`, for command paths
    pub fn active(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(LinkError::NotConnected)
    }

    pub fn state(&self, name: &str) -> ConnectionState {
        match &self.connection {
            Some(connection) if connection.name() == name => {
                if connection.is_connected() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Connecting
                }
            }
            _ => ConnectionState::Idle,
        }
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    pub fn handle(&mut self, event: &Event, registry: &SharedRegistry, outbox: &mut Outbox) {
        match event {
            Event::Connect(name) => self.connect(name, registry, outbox),
            Event::Disconnect(name) => self.disconnect(name, outbox),
            Event::Found(record) | Event::Updated(record) => self.on_record(record, outbox),
            Event::Lost(record) => {
                if self.state(&record.name) != ConnectionState::Idle {
                    info!("Lost connected robot {}", record.name);
                    self.drop_connection(outbox);
                }
            }
            Event::ImageStreamClosed { peer, generation } => self.images.closed(*peer, *generation),
            _ => {}
        }
    }

    /// Connect to `name`, replacing any other connection
    pub fn connect(&mut self, name: &str, registry: &SharedRegistry, outbox: &mut Outbox) {
        if self.connection.as_ref().map_or(false, |c| c.name() == name) {
            return;
        }

        let record = registry.write(|r| r.lookup(name).cloned());
        let Some(record) = record.filter(RobotRecord::is_debuggable) else {
            debug!("{} is not debuggable right now, connection pending", name);
            self.pending.insert(name.to_string());
            return;
        };
        self.open(record, outbox);
    }

    pub fn disconnect(&mut self, name: &str, outbox: &mut Outbox) {
        self.pending.remove(name);
        if self.state(name) != ConnectionState::Idle {
            info!("Disconnecting from {}", name);
            self.drop_connection(outbox);
        }
    }

    fn on_record(&mut self, record: &RobotRecord, outbox: &mut Outbox) {
        if let Some(connection) = self.connection.as_mut() {
            if connection.name() == record.name {
                connection.refresh(record.clone());
                return;
            }
        }
        if self.pending.contains(&record.name) && record.is_debuggable() {
            debug!("{} became debuggable, completing pending connection", record.name);
            self.open(record.clone(), outbox);
        }
    }

    fn open(&mut self, record: RobotRecord, outbox: &mut Outbox) {
        if self.connection.is_some() {
            self.drop_connection(outbox);
        }
        info!("Connecting to {} at {:?}", record.name, record.debug_address);
        self.pending.remove(&record.name);
        self.connection = Some(Connection::new(record, Arc::clone(&self.socket)));
    }

    fn drop_connection(&mut self, outbox: &mut Outbox) {
        self.images.disconnect();
        if let Some(connection) = self.connection.take() {
            outbox.emit(Event::Disconnected(connection.record().clone()));
        }
    }

    /// Start streaming camera images from the connected robot
    pub fn recv_images(&mut self) -> Result<()> {
        let connection = self.connection.as_ref().ok_or(LinkError::NotConnected)?;
        let debug_address = connection.record().debug_address.ok_or(LinkError::NotConnected)?;
        self.images.connect(SocketAddr::new(debug_address.ip(), self.image_port));
        Ok(())
    }

    pub fn stop_images(&mut self) {
        self.images.disconnect();
    }

    pub fn images(&self) -> &ImageClient {
        &self.images
    }
}
