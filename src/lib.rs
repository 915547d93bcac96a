//! Robodbg - networking core of a robot debug tool
//!
//! Finds robots on the local network, keeps a single debug connection alive,
//! and decodes what the robots send back: debug messages, settings records,
//! camera image streams and SPL team messages. Everything observable is
//! published as an [`Event`] on a single dispatch thread.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use robodbg::{DebugLink, Event, Topic};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut link = DebugLink::new_with_config("config/default_config.yaml")?;
//!
//!     // Print every robot as it shows up
//!     link.subscribe("printer", &[Topic::Found], |event, _ctx| {
//!         if let Event::Found(robot) = event {
//!             println!("found {} at {}", robot.name, robot.address);
//!         }
//!         Ok(())
//!     })?;
//!
//!     let running = link.start()?;
//!     running.handle().connect("nao21")?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **DebugLink / RunningLink**: Service wrapper owning sockets and threads
//! - **LinkHandle**: Thread-safe command interface
//! - **Listeners**: One thread per socket, decoding into a shared queue
//! - **Dispatcher**: Ticks discovery, heartbeat and expiry, then drains the queue
//! - **EventBus**: Topic to handler routing with an explicit handler table
//! - **Registry**: Discovered robots, expiring after 10 s of silence
//! - **ConnectionArbiter**: At most one debug connection at a time
//! - **ImageReassembler / SplStandardMessage / RobotSettings**: Wire decoders

pub mod arbiter;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod image;
pub mod json_output;
pub mod listener;
pub mod messages;
pub mod net;
pub mod registry;
pub mod service;
pub mod settings;
pub mod spl;

#[cfg(test)]
mod test_utils;

// High-level exports for easy usage
pub use service::{DebugLink, LinkHandle, RunningLink};
pub use config::LinkConfig;
pub use error::{DecodeError, LinkError, Result};
pub use events::{Event, EventBus, HandlerId, Topic};
pub use context::LinkContext;
pub use registry::{RobotRecord, SharedRegistry};

// Decoders and protocol types
pub use image::{ImageFrame, ImageHeader, ImageReassembler, VisionResult};
pub use settings::{RobotConfiguration, RobotSettings};
pub use spl::{SplStandardMessage, TeamBall, TeamRobot, VendorBlock};
pub use messages::{DebugCommand, InboundMessage, MessageKind, MonitorAction, MonitorMessage};
pub use json_output::{EventLine, output_event};
