//! Event bus
//!
//! Topics are a closed enum and handlers are registered by name into an
//! explicit table before they can be subscribed. Handlers run synchronously
//! on the dispatch thread and receive the dispatch context, so they can act
//! on the link (send commands, queue follow-up events) without globals.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{LinkError, Result};
use crate::image::ImageFrame;
use crate::messages::{InboundMessage, MessageKind};
use crate::registry::RobotRecord;
use crate::settings::RobotSettings;
use crate::spl::SplStandardMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Binary settings record received from a robot
    Settings,
    /// JSON `debugv2` message received from a robot
    Inbound(MessageKind),
    Found,
    Updated,
    Lost,
    /// Connection requested
    Connect,
    Connected,
    /// Disconnection requested
    Disconnect,
    Disconnected,
    SymbolNames,
    SymbolValues,
    BlackboardsSaved,
    Image,
    ImageStreamClosed,
    SplMessage,
}

#[derive(Debug, Clone)]
pub enum Event {
    Settings { settings: RobotSettings, from: SocketAddr },
    Message(InboundMessage),
    Found(RobotRecord),
    Updated(RobotRecord),
    Lost(RobotRecord),
    Connect(String),
    Connected(RobotRecord),
    Disconnect(String),
    Disconnected(RobotRecord),
    SymbolNames { robot: String, symbols: Map<String, Value> },
    SymbolValues { robot: String, values: Map<String, Value> },
    BlackboardsSaved { ok: bool },
    Image(Arc<ImageFrame>),
    /// `generation` identifies the reader that saw the stream close
    ImageStreamClosed { peer: SocketAddr, generation: u64 },
    SplMessage { message: Box<SplStandardMessage>, from: SocketAddr },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Settings { .. } => Topic::Settings,
            Event::Message(message) => Topic::Inbound(message.kind),
            Event::Found(_) => Topic::Found,
            Event::Updated(_) => Topic::Updated,
            Event::Lost(_) => Topic::Lost,
            Event::Connect(_) => Topic::Connect,
            Event::Connected(_) => Topic::Connected,
            Event::Disconnect(_) => Topic::Disconnect,
            Event::Disconnected(_) => Topic::Disconnected,
            Event::SymbolNames { .. } => Topic::SymbolNames,
            Event::SymbolValues { .. } => Topic::SymbolValues,
            Event::BlackboardsSaved { .. } => Topic::BlackboardsSaved,
            Event::Image(_) => Topic::Image,
            Event::ImageStreamClosed { .. } => Topic::ImageStreamClosed,
            Event::SplMessage { .. } => Topic::SplMessage,
        }
    }
}

/// Events raised while handling another event or during a tick.
///
/// The dispatcher publishes them in order once the current publication has
/// finished, so handlers never re-enter the bus.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<Event>,
}

impl Outbox {
    pub fn emit(&mut self, event: Event) {
        self.pending.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

pub type Handler<C> = Box<dyn FnMut(&Event, &mut C) -> Result<()> + Send>;

struct Registration<C> {
    name: String,
    handler: Handler<C>,
}

pub struct EventBus<C> {
    handlers: HashMap<HandlerId, Registration<C>>,
    subscriptions: HashMap<Topic, HashSet<HandlerId>>,
    next_id: u64,
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventBus<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            subscriptions: HashMap::new(),
            next_id: 0,
        }
    }

    /// Add a handler to the registration table
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnMut(&Event, &mut C) -> Result<()> + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.insert(
            id,
            Registration {
                name: name.into(),
                handler: Box::new(handler),
            },
        );
        id
    }

    /// Remove a handler and every subscription that points at it
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(&id);
        }
        self.handlers.remove(&id).is_some()
    }

    /// Subscribe a registered handler to a topic.
    ///
    /// Subscribing twice is a no-op. An id that is not in the registration
    /// table is a wiring bug and is reported as [`LinkError::MissingHandler`].
    pub fn subscribe(&mut self, topic: Topic, id: HandlerId) -> Result<()> {
        if !self.handlers.contains_key(&id) {
            return Err(LinkError::MissingHandler {
                topic,
                handler: format!("#{}", id.0),
            });
        }
        self.subscriptions.entry(topic).or_default().insert(id);
        Ok(())
    }

    pub fn subscribe_all(&mut self, topics: &[Topic], id: HandlerId) -> Result<()> {
        topics.iter().try_for_each(|topic| self.subscribe(*topic, id))
    }

    pub fn unsubscribe(&mut self, topic: Topic, id: HandlerId) -> bool {
        self.subscriptions
            .get_mut(&topic)
            .map_or(false, |subscribers| subscribers.remove(&id))
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscriptions.get(&topic).map_or(0, HashSet::len)
    }

    pub fn handler_name(&self, id: HandlerId) -> Option<&str> {
        self.handlers.get(&id).map(|r| r.name.as_str())
    }

    /// Deliver an event to every subscriber of its topic.
    ///
    /// A failing or panicking handler is logged and does not stop delivery
    /// to the others. Returns the number of handlers invoked.
    pub fn publish(&mut self, event: &Event, ctx: &mut C) -> usize {
        let topic = event.topic();
        let Some(subscribers) = self.subscriptions.get(&topic) else {
            return 0;
        };
        let ids: Vec<HandlerId> = subscribers.iter().copied().collect();

        let mut invoked = 0;
        for id in ids {
            let Some(registration) = self.handlers.get_mut(&id) else {
                continue;
            };
            invoked += 1;
            let handler = &mut registration.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event, &mut *ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Handler '{}' failed on {:?}: {}", registration.name, topic, e),
                Err(payload) => error!(
                    "Handler '{}' panicked on {:?}: {}",
                    registration.name,
                    topic,
                    panic_message(&*payload)
                ),
            }
        }
        invoked
    }
}

/// Text of a panic payload, for logging
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
