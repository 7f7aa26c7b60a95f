/// Thin async UDP socket wrapper.
///
/// Sockets are created with socket2 so the OS buffers can be sized before
/// binding, then handed to tokio.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::warn;

/// How many times a send is retried while the OS send buffer is full.
const SEND_BUSY_RETRIES: u32 = 50;

pub struct Transport {
    socket: UdpSocket,
}

impl Transport {
    /// Bind a socket on `addr` with the requested buffer sizes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr, buffer_size: usize) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
            warn!("failed to set UDP recv buffer to {}: {}", buffer_size, e);
        }
        if let Err(e) = socket.set_send_buffer_size(buffer_size) {
            warn!("failed to set UDP send buffer to {}: {}", buffer_size, e);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Self {
            socket: UdpSocket::from_std(std_socket)?,
        })
    }

    /// Bind an ephemeral port of the same address family as `peer`.
    pub fn bind_ephemeral_for(peer: SocketAddr, buffer_size: usize) -> io::Result<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Self::bind(local, buffer_size)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram. Retries briefly while the OS reports a full buffer.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut retries = 0;
        loop {
            match self.socket.send_to(buf, target).await {
                Ok(n) => return Ok(n),
                Err(ref e) if retries < SEND_BUSY_RETRIES && is_send_busy(e) => {
                    retries += 1;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the next datagram.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Take a datagram that is already queued, without waiting.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.try_recv_from(buf) {
                Ok(received) => return Ok(Some(received)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if is_transient_recv(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the next datagram until `deadline`. `Ok(None)` means the
    /// deadline passed first.
    ///
    /// `ConnectionReset` (ICMP port unreachable on Windows) is not an error
    /// here: the peer may simply not be listening yet.
    pub async fn recv_until(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match tokio::time::timeout_at(deadline, self.socket.recv_from(buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(received)) => return Ok(Some(received)),
                Ok(Err(e)) if is_transient_recv(&e) => continue,
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

/// OS error code for "no buffer space available".
#[cfg(any(target_os = "linux", target_os = "android"))]
const ENOBUFS: Option<i32> = Some(105);
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
const ENOBUFS: Option<i32> = Some(55);
#[cfg(windows)]
const ENOBUFS: Option<i32> = Some(10055); // WSAENOBUFS
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
const ENOBUFS: Option<i32> = None;

/// ENOBUFS or a would-block: the send buffer is full.
fn is_send_busy(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || (ENOBUFS.is_some() && e.raw_os_error() == ENOBUFS)
}

/// Receive errors that say nothing about our own socket.
pub(crate) fn is_transient_recv(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}
