//! Dispatch loop
//!
//! The only thread that publishes events. Each step runs the periodic
//! ticks, publishes what they raised, then drains the inbound queue filled
//! by the listener threads and link handles. A failure or panic in any tick
//! or handler is logged and the loop carries on.

use crossbeam::channel::Receiver;
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::context::LinkContext;
use crate::events::{panic_message, Event, EventBus};
use crate::image::ImageFrame;
use crate::messages::{InboundMessage, MonitorAction};
use crate::settings::RobotSettings;
use crate::spl::SplStandardMessage;

/// Follow-up rounds allowed per publication before the outbox is dropped
const MAX_FLUSH_ROUNDS: usize = 64;

/// Item on the inbound queue
#[derive(Debug)]
pub enum Inbound {
    Message(InboundMessage),
    Settings { settings: RobotSettings, from: SocketAddr },
    Spl { message: Box<SplStandardMessage>, from: SocketAddr },
    Image(ImageFrame),
    ImageStreamClosed { peer: SocketAddr, generation: u64 },
    Command(Command),
}

impl Inbound {
    /// Publish the item on the bus, or execute it if it is a command.
    ///
    /// Follow-up events stay in `ctx.outbox` for the caller to flush.
    pub fn publish(self, bus: &mut EventBus<LinkContext>, ctx: &mut LinkContext) {
        let event = match self {
            Inbound::Message(message) => Event::Message(message),
            Inbound::Settings { settings, from } => Event::Settings { settings, from },
            Inbound::Spl { message, from } => Event::SplMessage { message, from },
            Inbound::Image(frame) => Event::Image(Arc::new(frame)),
            Inbound::ImageStreamClosed { peer, generation } => {
                Event::ImageStreamClosed { peer, generation }
            }
            Inbound::Command(command) => {
                debug!("Executing {:?}", command);
                if let Err(e) = ctx.execute(command) {
                    warn!("Command failed: {}", e);
                }
                return;
            }
        };
        bus.publish(&event, ctx);
    }
}

/// Requests from link handles, executed on the dispatch thread
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(String),
    Disconnect(String),
    SetSymbolStatus { blackboard: String, symbol: String, receive: bool },
    ChangeValues { blackboard: String, values: Map<String, Value> },
    SaveBlackboards,
    RecvImages,
    StopImages,
    AddSearchIp(IpAddr),
    RemoveSearchIp(IpAddr),
    ClearSearchIps,
    Monitor { robot: String, action: MonitorAction, enabled: bool },
    PushConfig { robot: String, include_calibration: bool },
}

pub struct Dispatcher {
    bus: EventBus<LinkContext>,
    ctx: LinkContext,
    queue: Receiver<Inbound>,
    interval: Duration,
}

impl Dispatcher {
    pub fn new(bus: EventBus<LinkContext>, ctx: LinkContext, queue: Receiver<Inbound>) -> Self {
        let interval = ctx.config.dispatch.interval();
        Self { bus, ctx, queue, interval }
    }

    pub fn context(&self) -> &LinkContext {
        &self.ctx
    }

    pub fn bus_mut(&mut self) -> &mut EventBus<LinkContext> {
        &mut self.bus
    }

    /// One dispatch round at time `now`; returns the number of queue items
    /// handled.
    ///
    /// Only items queued before the drain starts are handled, so a flooding
    /// listener cannot keep the ticks from running.
    pub fn step(&mut self, now: Instant) -> usize {
        self.ctx.now = now;

        self.guarded("discovery tick", |d| d.ctx.tick_discovery());
        self.guarded("heartbeat tick", |d| d.ctx.tick_heartbeat());
        self.guarded("expiry tick", |d| d.ctx.expire_robots());
        self.guarded("tick events", Self::flush);

        let queued = self.queue.len();
        let mut handled = 0;
        for _ in 0..queued {
            let Ok(item) = self.queue.try_recv() else {
                break;
            };
            handled += 1;
            self.guarded("inbound item", |d| d.handle(item));
        }
        handled
    }

    /// Step every interval until `running` is cleared
    pub fn run(mut self, running: Arc<AtomicBool>) {
        info!("Dispatch loop started ({:?} interval)", self.interval);
        while running.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.step(started);
            thread::sleep(self.interval.saturating_sub(started.elapsed()));
        }
        self.ctx.arbiter.stop_images();
        info!("Dispatch loop stopped");
    }

    fn handle(&mut self, item: Inbound) {
        item.publish(&mut self.bus, &mut self.ctx);
        self.flush();
    }

    /// Publish follow-up events in the order they were raised
    fn flush(&mut self) {
        for _ in 0..MAX_FLUSH_ROUNDS {
            let pending = self.ctx.outbox.take();
            if pending.is_empty() {
                return;
            }
            for event in pending {
                self.bus.publish(&event, &mut self.ctx);
            }
        }
        let dropped = self.ctx.outbox.take();
        if !dropped.is_empty() {
            error!("Dropping {} events after {} follow-up rounds", dropped.len(), MAX_FLUSH_ROUNDS);
        }
    }

    fn guarded(&mut self, what: &str, f: impl FnOnce(&mut Self)) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            error!("Panic during {}: {}", what, panic_message(&*payload));
            // Events raised before the panic may reference half-applied state
            self.ctx.outbox.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::register_core_handlers;
    use crate::events::Topic;
    use crate::test_utils::{debuggable_record, test_context, RecordingSocket};
    use crossbeam::channel::{unbounded, Sender};
    use serde_json::json;
    use std::sync::Mutex;

    fn dispatcher(socket: Arc<RecordingSocket>) -> (Dispatcher, Sender<Inbound>, Arc<Mutex<Vec<String>>>) {
        let ctx = test_context(socket);
        let mut bus = EventBus::new();
        register_core_handlers(&mut bus).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let recorder = bus.register("recorder", move |event, _ctx: &mut LinkContext| {
            let entry = match event {
                Event::Found(r) => format!("found {}", r.name),
                Event::Lost(r) => format!("lost {}", r.name),
                Event::Connected(r) => format!("connected {}", r.name),
                Event::Disconnected(r) => format!("disconnected {}", r.name),
                other => format!("{:?}", other.topic()),
            };
            log.lock().unwrap().push(entry);
            Ok(())
        });
        bus.subscribe_all(
            &[Topic::Found, Topic::Lost, Topic::Connected, Topic::Disconnected],
            recorder,
        )
        .unwrap();

        let (tx, rx) = unbounded();
        (Dispatcher::new(bus, ctx, rx), tx, seen)
    }

    fn hello(name: &str, connected: bool, from: SocketAddr) -> Inbound {
        let document = json!({"debugv2": {
            "msg_type": "hellodebug",
            "robotname": name,
            "connected": connected.to_string(),
        }});
        Inbound::Message(InboundMessage::from_json(document, from).unwrap())
    }

    #[test]
    fn test_discovery_to_expiry() {
        let socket = Arc::new(RecordingSocket::default());
        let (mut dispatcher, tx, seen) = dispatcher(socket.clone());
        let start = Instant::now();

        dispatcher.step(start);
        let probes = socket.sent_json();
        assert!(!probes.is_empty());
        assert_eq!(probes[0]["debugv2"]["msg_type"], "findnao");

        let robot = SocketAddr::from(([10, 0, 0, 21], 10350));
        tx.send(hello("nao21", false, robot)).unwrap();
        assert_eq!(dispatcher.step(start + Duration::from_millis(10)), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["found nao21"]);
        assert_eq!(dispatcher.context().registry.try_snapshot().unwrap().len(), 1);

        dispatcher.step(start + Duration::from_secs(5));
        assert_eq!(seen.lock().unwrap().len(), 1);

        dispatcher.step(start + Duration::from_secs(11));
        assert_eq!(*seen.lock().unwrap(), vec!["found nao21", "lost nao21"]);
        assert!(dispatcher.context().registry.try_snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_switching_robots_disconnects_before_connecting() {
        let socket = Arc::new(RecordingSocket::default());
        let (mut dispatcher, tx, seen) = dispatcher(socket);
        let start = Instant::now();
        let nao22 = SocketAddr::from(([10, 0, 0, 22], 10350));

        tx.send(hello("nao21", false, SocketAddr::from(([10, 0, 0, 21], 10350)))).unwrap();
        tx.send(hello("nao22", false, nao22)).unwrap();
        tx.send(Inbound::Command(Command::Connect("nao21".to_string()))).unwrap();
        dispatcher.step(start);

        tx.send(Inbound::Command(Command::Connect("nao22".to_string()))).unwrap();
        dispatcher.step(start + Duration::from_millis(10));

        // The robot acknowledges us as its debug client
        tx.send(hello("nao22", true, nao22)).unwrap();
        dispatcher.step(start + Duration::from_millis(20));
        dispatcher.step(start + Duration::from_millis(1100));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["found nao21", "found nao22", "disconnected nao21", "connected nao22"]
        );
    }

    #[test]
    fn test_panicking_handler_keeps_loop_alive() {
        let socket = Arc::new(RecordingSocket::default());
        let (mut dispatcher, tx, seen) = dispatcher(socket);
        let panicking = dispatcher
            .bus_mut()
            .register("panicking", |_, _: &mut LinkContext| panic!("handler bug"));
        dispatcher.bus_mut().subscribe(Topic::Found, panicking).unwrap();
        let start = Instant::now();

        tx.send(hello("nao21", false, SocketAddr::from(([10, 0, 0, 21], 10350)))).unwrap();
        tx.send(hello("nao22", false, SocketAddr::from(([10, 0, 0, 22], 10350)))).unwrap();
        assert_eq!(dispatcher.step(start), 2);

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"found nao21".to_string()));
        assert!(seen.contains(&"found nao22".to_string()));
    }

    #[test]
    fn test_panicking_tick_keeps_loop_alive() {
        let socket = Arc::new(RecordingSocket::default());
        let (mut dispatcher, tx, seen) = dispatcher(socket.clone());
        let start = Instant::now();

        // The discovery tick panics on its first probe
        socket.panic_on_next_send();
        tx.send(hello("nao21", false, SocketAddr::from(([10, 0, 0, 21], 10350)))).unwrap();
        assert_eq!(dispatcher.step(start), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["found nao21"]);

        tx.send(hello("nao22", false, SocketAddr::from(([10, 0, 0, 22], 10350)))).unwrap();
        assert_eq!(dispatcher.step(start + Duration::from_secs(1)), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["found nao21", "found nao22"]);
        assert!(!socket.sent_json().is_empty());

        dispatcher.step(start + Duration::from_secs(12));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_failed_command_is_logged_not_fatal() {
        let socket = Arc::new(RecordingSocket::default());
        let (mut dispatcher, tx, _seen) = dispatcher(socket);
        tx.send(Inbound::Command(Command::SaveBlackboards)).unwrap();
        tx.send(Inbound::Command(Command::AddSearchIp("10.0.0.5".parse().unwrap()))).unwrap();
        assert_eq!(dispatcher.step(Instant::now()), 2);
        assert_eq!(dispatcher.context().discovery.search_ips().len(), 1);
    }

    #[test]
    fn test_pending_connect_completes_on_discovery() {
        let socket = Arc::new(RecordingSocket::default());
        let (mut dispatcher, tx, _seen) = dispatcher(socket);
        let start = Instant::now();

        tx.send(Inbound::Command(Command::Connect("nao21".to_string()))).unwrap();
        dispatcher.step(start);
        assert!(dispatcher.context().arbiter.connection().is_none());

        let record = debuggable_record("nao21", [10, 0, 0, 21]);
        tx.send(hello(&record.name, false, record.address)).unwrap();
        dispatcher.step(start + Duration::from_millis(10));
        let connection = dispatcher.context().arbiter.connection().unwrap();
        assert_eq!(connection.name(), "nao21");
    }
}
