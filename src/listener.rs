//! Socket listener threads
//!
//! Every listener owns one socket and one thread. Listeners decode wire
//! bytes into [`Inbound`] items and push them onto the shared queue; only
//! the dispatch thread publishes events. Reads use timeouts so each loop
//! re-checks its running flag at least once per timeout.

use crossbeam::channel::Sender;
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::ImageConfig;
use crate::dispatch::Inbound;
use crate::error::Result;
use crate::image::ImageReassembler;
use crate::messages::InboundMessage;
use crate::net::is_timeout;
use crate::settings::RobotSettings;
use crate::spl::SplStandardMessage;

const IMAGE_READ_CHUNK: usize = 64 * 1024;

/// Decode one datagram received on the control port.
///
/// Datagrams starting with `{` are JSON. A JSON document that ends early is
/// dropped rather than reinterpreted, since a datagram is never delivered in
/// parts. Anything else, including text that is not JSON at all, is tried as
/// a binary settings record.
pub fn decode_datagram(data: &[u8], from: SocketAddr) -> Option<Inbound> {
    let looks_like_json = data
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map_or(false, |b| *b == b'{');

    if looks_like_json {
        match serde_json::from_slice(data) {
            Ok(document) => {
                let message = InboundMessage::from_json(document, from);
                if message.is_none() {
                    debug!("Ignoring JSON datagram without debugv2 envelope from {}", from);
                }
                return message.map(Inbound::Message);
            }
            Err(e) if e.is_eof() => {
                warn!("Dropping truncated JSON datagram from {} ({} bytes)", from, data.len());
                return None;
            }
            Err(_) => {}
        }
    }

    match RobotSettings::decode(data) {
        Ok(settings) => Some(Inbound::Settings { settings, from }),
        Err(e) => {
            warn!("Dropping undecodable datagram from {}: {}", from, e);
            None
        }
    }
}

/// Receive loop shared by the UDP listeners
fn spawn_udp_listener<F>(
    name: &str,
    socket: Arc<UdpSocket>,
    max_datagram: usize,
    running: Arc<AtomicBool>,
    queue: Sender<Inbound>,
    decode: F,
) -> Result<JoinHandle<()>>
where
    F: Fn(&[u8], SocketAddr) -> Option<Inbound> + Send + 'static,
{
    let thread_name = name.to_string();
    let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
        info!("{} listening on {:?}", thread_name, socket.local_addr());
        let mut buf = vec![0u8; max_datagram];

        while running.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let Some(item) = decode(&buf[..len], from) else {
                        continue;
                    };
                    if queue.send(item).is_err() {
                        debug!("{}: queue closed", thread_name);
                        break;
                    }
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some platforms
                    trace!("{}: receive error: {}", thread_name, e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        info!("{} stopped", thread_name);
    })?;
    Ok(handle)
}

/// UDP control listener: discovery replies, debug messages and settings
pub struct ControlListener;

impl ControlListener {
    pub fn spawn(
        socket: Arc<UdpSocket>,
        max_datagram: usize,
        running: Arc<AtomicBool>,
        queue: Sender<Inbound>,
    ) -> Result<JoinHandle<()>> {
        spawn_udp_listener("control-listener", socket, max_datagram, running, queue, decode_datagram)
    }
}

/// UDP listener for SPL team messages
pub struct SplListener;

impl SplListener {
    pub fn spawn(
        socket: Arc<UdpSocket>,
        max_datagram: usize,
        running: Arc<AtomicBool>,
        queue: Sender<Inbound>,
    ) -> Result<JoinHandle<()>> {
        spawn_udp_listener("spl-listener", socket, max_datagram, running, queue, |data, from| {
            match SplStandardMessage::decode(data) {
                Ok(message) => Some(Inbound::Spl { message: Box::new(message), from }),
                Err(e) => {
                    warn!("Dropping SPL message from {}: {}", from, e);
                    None
                }
            }
        })
    }
}

struct ImageReader {
    peer: SocketAddr,
    generation: u64,
    running: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    _handle: JoinHandle<()>,
}

/// TCP client for a robot's image stream.
///
/// At most one reader runs at a time; connecting again replaces it.
pub struct ImageClient {
    queue: Sender<Inbound>,
    config: ImageConfig,
    reader: Option<ImageReader>,
    generation: u64,
}

impl ImageClient {
    pub fn new(queue: Sender<Inbound>, config: ImageConfig) -> Self {
        Self {
            queue,
            config,
            reader: None,
            generation: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.reader.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.reader.as_ref().map(|r| r.peer)
    }

    /// Generation of the current reader; each connect starts a new one
    pub fn generation(&self) -> Option<u64> {
        self.reader.as_ref().map(|r| r.generation)
    }

    pub fn connect(&mut self, peer: SocketAddr) {
        self.disconnect();
        self.generation += 1;
        let generation = self.generation;

        let running = Arc::new(AtomicBool::new(true));
        let stream = Arc::new(Mutex::new(None));
        let link = ReaderLink {
            peer,
            generation,
            running: Arc::clone(&running),
            stream: Arc::clone(&stream),
            queue: self.queue.clone(),
        };
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name("image-reader".to_string())
            .spawn(move || run_image_reader(link, config));

        match spawned {
            Ok(handle) => {
                self.reader = Some(ImageReader { peer, generation, running, stream, _handle: handle });
            }
            Err(e) => warn!("Failed to start image reader for {}: {}", peer, e),
        }
    }

    /// Stop the reader and close its socket.
    ///
    /// The thread is not joined; it exits once its blocked read returns.
    pub fn disconnect(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        reader.running.store(false, Ordering::Relaxed);
        if let Ok(mut stream) = reader.stream.lock() {
            if let Some(stream) = stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        info!("Image stream from {} stopped", reader.peer);
    }

    /// Handle a close notice; notices from replaced readers are ignored
    pub fn closed(&mut self, peer: SocketAddr, generation: u64) {
        if self.peer() == Some(peer) && self.generation() == Some(generation) {
            self.disconnect();
        } else {
            debug!("Ignoring close of stale image stream {} (generation {})", peer, generation);
        }
    }
}

impl Drop for ImageClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// What a reader thread shares with its client
struct ReaderLink {
    peer: SocketAddr,
    generation: u64,
    running: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    queue: Sender<Inbound>,
}

impl ReaderLink {
    fn report_closed(&self) {
        if self.running.load(Ordering::Relaxed) {
            let _ = self.queue.send(Inbound::ImageStreamClosed {
                peer: self.peer,
                generation: self.generation,
            });
        }
    }
}

fn run_image_reader(link: ReaderLink, config: ImageConfig) {
    let peer = link.peer;
    let mut stream = match TcpStream::connect_timeout(&peer, config.connect_timeout()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Image connection to {} failed: {}", peer, e);
            link.report_closed();
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(config.read_timeout())) {
        warn!("Failed to set image read timeout: {}", e);
    }
    match (stream.try_clone(), link.stream.lock()) {
        (Ok(clone), Ok(mut slot)) => *slot = Some(clone),
        _ => debug!("Image stream to {} cannot be shut down early", peer),
    }
    info!("Image stream connected to {}", peer);

    let mut reassembler = ImageReassembler::new(config.max_frame_bytes);
    let mut buf = vec![0u8; IMAGE_READ_CHUNK];
    let mut peer_gone = false;

    while link.running.load(Ordering::Relaxed) && !peer_gone {
        match stream.read(&mut buf) {
            Ok(0) => peer_gone = true,
            Ok(len) => {
                for frame in reassembler.push(&buf[..len]) {
                    if link.queue.send(Inbound::Image(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if is_timeout(&e) || e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Image stream from {} failed: {}", peer, e);
                peer_gone = true;
            }
        }
    }

    if peer_gone {
        info!("Image stream closed by {}", peer);
        link.report_closed();
    }
}
