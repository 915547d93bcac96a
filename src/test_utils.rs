//! Fixtures shared by the unit tests

use crossbeam::channel::unbounded;
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::arbiter::ConnectionArbiter;
use crate::config::{ImageConfig, LinkConfig, DEBUG_PORT, IMAGE_PORT};
use crate::context::LinkContext;
use crate::image::{ImageHeader, IMAGE_MAGIC};
use crate::listener::ImageClient;
use crate::net::DatagramSocket;
use crate::registry::{RobotRecord, SharedRegistry};
use crate::settings::JOINT_COUNT;
use crate::spl::{SPL_MAGIC, VENDOR_MAGIC};

/// Socket that records every datagram instead of sending it
#[derive(Default)]
pub struct RecordingSocket {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    fail: AtomicBool,
    panic_once: AtomicBool,
}

impl RecordingSocket {
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .map(|(data, _)| serde_json::from_slice(data).unwrap())
            .collect()
    }

    /// Make every following send fail with a network error
    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the next send panic, as a bug in a tick would
    pub fn panic_on_next_send(&self) {
        self.panic_once.store(true, Ordering::SeqCst);
    }
}

impl DatagramSocket for RecordingSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("send to {} blew up", addr);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NetworkUnreachable, "network unreachable"));
        }
        self.sent.lock().unwrap().push((buf.to_vec(), addr));
        Ok(buf.len())
    }
}

/// A free robot with its frontend running, reachable on the debug port
pub fn debuggable_record(name: &str, ip: [u8; 4]) -> RobotRecord {
    let address = SocketAddr::from((ip, DEBUG_PORT));
    let mut record = RobotRecord::new(name, address);
    record.debug_address = Some(address);
    record.settings.frontend_running = true;
    record
}

pub fn test_arbiter(socket: Arc<RecordingSocket>) -> ConnectionArbiter {
    let (tx, _rx) = unbounded();
    let images = ImageClient::new(tx, ImageConfig::default());
    ConnectionArbiter::new(socket, images, IMAGE_PORT)
}

/// Context with interface broadcasts disabled, so probes only go to localhost
pub fn test_context(socket: Arc<RecordingSocket>) -> LinkContext {
    let mut config = LinkConfig::default();
    config.discovery.include_interfaces = false;
    let registry = SharedRegistry::new(config.connection.expiry());
    let (tx, _rx) = unbounded();
    LinkContext::new(config, socket, registry, tx).unwrap()
}

/// Builder for binary settings records
#[derive(Debug, Clone)]
pub struct SettingsRecord {
    pub name: String,
    pub lan_address: String,
    pub lan_link: bool,
    pub wlan_address: String,
    pub wlan_essid: String,
    pub wlan_signal_strength: i32,
    pub frontend_running: bool,
    pub backend_running: bool,
    pub fail_state: i32,
    pub battery_charge: f32,
    pub battery_charging: bool,
    pub joint_temperatures: [f32; JOINT_COUNT],
    pub joint_status: [i32; JOINT_COUNT],
    pub build_info_frontend: String,
    pub build_info_backend: String,
    pub configuration: String,
    pub calibration: String,
}

impl SettingsRecord {
    /// Record for `name`, whose LAN address ends in the name's trailing digits
    pub fn named(name: &str) -> Self {
        let digits: String = name.chars().filter(char::is_ascii_digit).collect();
        Self {
            name: name.to_string(),
            lan_address: format!("10.0.0.{}", digits),
            lan_link: true,
            wlan_address: format!("192.168.1.{}", digits),
            wlan_essid: "SPL_A".to_string(),
            wlan_signal_strength: -60,
            frontend_running: true,
            backend_running: true,
            fail_state: 0,
            battery_charge: 1.0,
            battery_charging: false,
            joint_temperatures: [0.0; JOINT_COUNT],
            joint_status: [0; JOINT_COUNT],
            build_info_frontend: "frontend".to_string(),
            build_info_backend: "backend".to_string(),
            configuration: String::new(),
            calibration: String::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_str(&mut body, &self.name);
        put_str(&mut body, &self.lan_address);
        body.push(self.lan_link as u8);
        put_str(&mut body, &self.wlan_address);
        put_str(&mut body, &self.wlan_essid);
        body.extend_from_slice(&self.wlan_signal_strength.to_le_bytes());
        body.push(self.frontend_running as u8);
        body.push(self.backend_running as u8);
        body.extend_from_slice(&self.fail_state.to_le_bytes());
        body.extend_from_slice(&self.battery_charge.to_le_bytes());
        body.push(self.battery_charging as u8);
        for temperature in &self.joint_temperatures {
            body.extend_from_slice(&temperature.to_le_bytes());
        }
        for status in &self.joint_status {
            body.extend_from_slice(&status.to_le_bytes());
        }
        put_str(&mut body, &self.build_info_frontend);
        put_str(&mut body, &self.build_info_backend);
        put_str(&mut body, &self.configuration);
        put_str(&mut body, &self.calibration);

        let mut out = (body.len() as u32).to_le_bytes().to_vec();
        out.extend(body);
        out
    }
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Builder for SPL standard messages
#[derive(Debug, Clone)]
pub struct SplBuffer {
    pub version: u8,
    pub player_num: i8,
    pub team_num: i8,
    pub pose: [f32; 3],
    pub ball_age: f32,
    /// Append a vendor block for this robot id
    pub vendor_robot_id: Option<i32>,
    /// Raw bytes appended to the data section after any vendor block
    pub extra: Vec<u8>,
}

impl Default for SplBuffer {
    fn default() -> Self {
        Self {
            version: 7,
            player_num: 2,
            team_num: 3,
            pose: [0.0; 3],
            ball_age: -1.0,
            vendor_robot_id: None,
            extra: Vec::new(),
        }
    }
}

impl SplBuffer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = SPL_MAGIC.to_vec();
        out.push(self.version);
        out.push(self.player_num as u8);
        out.push(self.team_num as u8);
        out.push(0); // fallen
        put_f32s(&mut out, &self.pose);
        put_f32s(&mut out, &[0.0; 2]); // walking to
        put_f32s(&mut out, &[0.0; 2]); // shooting to
        put_f32s(&mut out, &[self.ball_age]);
        put_f32s(&mut out, &[0.0; 4]); // ball, ball velocity
        out.extend_from_slice(&[0u8; 5]); // suggestions
        out.push(0); // intention
        out.extend_from_slice(&0i16.to_le_bytes());
        out.extend_from_slice(&0i16.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]); // confidences

        let mut data = Vec::new();
        if let Some(robot_id) = self.vendor_robot_id {
            data.extend_from_slice(VENDOR_MAGIC);
            // Team robot
            put_message_header(&mut data);
            put_f32s(&mut data, &[0.9]);
            data.extend_from_slice(&robot_id.to_le_bytes());
            put_f32s(&mut data, &[100.0, 200.0, f32::NAN, 0.0, 0.0, 0.0, 0.0]);
            data.extend_from_slice(&[1, 0, 0, 0]);
            data.extend_from_slice(&0i32.to_le_bytes());
            data.extend_from_slice(&1i32.to_le_bytes());
            put_f32s(&mut data, &[0.0; 9]);
            data.extend_from_slice(&0i32.to_le_bytes());
            // Team ball
            put_message_header(&mut data);
            put_f32s(&mut data, &[0.8, 1000.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        }
        data.extend_from_slice(&self.extra);

        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        out.extend(data);
        out
    }
}

fn put_f32s(out: &mut Vec<u8>, values: &[f32]) {
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn put_message_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&1i32.to_le_bytes()); // message type
    out.extend_from_slice(&[7, 0, 0, 0]); // sender hash, padding
    out.extend_from_slice(&2i32.to_le_bytes()); // sender
    out.extend_from_slice(&3i32.to_le_bytes()); // team number
    out.extend_from_slice(&0i32.to_le_bytes()); // timestamp
}

/// One image stream frame with the given side channel and payload
pub fn image_frame_bytes(version: u8, camera: u8, side_channel: &[u8], payload: &[u8]) -> Vec<u8> {
    let header = ImageHeader {
        version,
        camera,
        codec: 0,
        tick: 0,
        payload_size: payload.len() as u64,
        side_channel_size: side_channel.len() as u64,
    };
    let mut out = header.encode().to_vec();
    debug_assert_eq!(&out[..8], IMAGE_MAGIC);
    out.extend_from_slice(side_channel);
    out.extend_from_slice(payload);
    out
}
