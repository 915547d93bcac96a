//! Socket plumbing shared by the listeners and the outbound senders

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::info;

use crate::error::{LinkError, Result};

/// Outbound datagram transport.
///
/// The control socket is shared between the heartbeat, discovery and the
/// command senders; sends from different call sites may interleave.
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }
}

/// Bind a UDP socket able to send broadcasts, with a read timeout so that
/// listener loops can observe their running flag.
pub fn bind_udp(addr: SocketAddr, read_timeout: Duration) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).map_err(|source| LinkError::Bind { addr, source })?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(read_timeout))?;
    info!("Bound UDP socket on {}", socket.local_addr()?);
    Ok(socket)
}

/// True for the errors a socket read returns when its timeout elapses
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
