//! UDP transport the rpc sends its datagrams through.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use tracing::trace;

/// Default receive buffer size.
pub const DEFAULT_PACKET_SIZE: usize = 8192;
/// How long the reader thread blocks in `recv_from` before checking for shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Outbound half of a datagram transport.
///
/// Implemented for [KrpcSocket], and by in-memory recorders in tests and simulations.
pub trait Transport {
    /// Send (part of) a datagram, returns the number of bytes written.
    fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<usize>;

    /// Local address of this transport.
    fn local_addr(&self) -> SocketAddrV4;
}

/// Send a whole datagram, retrying partial writes until every byte is flushed.
pub fn send_datagram<T: Transport + ?Sized>(
    transport: &mut T,
    bytes: &[u8],
    address: SocketAddrV4,
) -> io::Result<()> {
    let mut written = 0;

    while written < bytes.len() {
        match transport.send_to(&bytes[written..], address) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }

    trace!(context = "socket_message_sending", ?address, size = written);

    Ok(())
}

/// A UdpSocket bound on all IPv4 interfaces.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl KrpcSocket {
    /// Bind `port`, or an ephemeral port if `None`.
    pub fn bind(port: Option<u16>) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0))))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        Ok(Self { socket, local_addr })
    }

    /// A second handle to the same socket, blocking on reads for at most [READ_TIMEOUT].
    pub fn reader(&self) -> io::Result<UdpSocket> {
        let reader = self.socket.try_clone()?;
        reader.set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(reader)
    }
}

impl Transport for KrpcSocket {
    fn send_to(&mut self, bytes: &[u8], address: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(bytes, address)
    }

    #[inline]
    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
}
