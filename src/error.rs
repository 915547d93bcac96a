//! Error types for the robot debug link

use std::net::SocketAddr;
use thiserror::Error;

use crate::events::Topic;

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No handler named '{handler}' is registered (subscribing to {topic:?})")]
    MissingHandler { topic: Topic, handler: String },

    #[error("Registry is busy, try again")]
    RegistryUnavailable,

    #[error("No active debug connection")]
    NotConnected,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to decode one wire unit (datagram, record or frame header).
///
/// Decoders never return partially filled values; any of these means the
/// whole unit is dropped.
#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("{what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{what}: bad magic")]
    BadMagic { what: &'static str },

    #[error("{what}: unsupported version {found} (expected {expected})")]
    UnsupportedVersion {
        what: &'static str,
        expected: u8,
        found: u8,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("{what}: invalid UTF-8")]
    Utf8 { what: &'static str },

    #[error("{what}: malformed JSON: {message}")]
    Json { what: &'static str, message: String },
}

impl DecodeError {
    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        DecodeError::Truncated { what, needed, available }
    }
}
