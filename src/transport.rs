//! Transport abstraction.
//!
//! The datapath consumes an unreliable, ordered-within-a-flow packet
//! transport that moves opaque frames of at most `mtu()` bytes. All
//! reliability lives above this trait. The bundled [`UdpTransport`] is a
//! kernel-UDP stand-in for the kernel-bypass NICs the runtime targets.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::error::{Error, Result};

/// Opaque routing descriptor for a remote datapath endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteInfo {
    /// Remote datapath address.
    pub addr: SocketAddr,
}

impl RouteInfo {
    /// Create routing info for the given address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// A packet transport.
///
/// `post_tx` is non-blocking; a transport that cannot accept the packet
/// returns [`Error::TransportBusy`] and the reliability layer treats the
/// packet as lost. `poll_rx` fills `buf` with at most one packet.
pub trait Transport {
    /// Maximum packet size, header included.
    fn mtu(&self) -> usize;

    /// Bytes the transport can send inline without a frame reference.
    fn max_inline(&self) -> usize {
        64
    }

    /// Transmissions between signaled completions.
    fn unsig_batch(&self) -> usize {
        64
    }

    /// Routing info remote peers use to reach this transport.
    fn local_route(&self) -> RouteInfo;

    /// Queue one packet for transmission.
    fn post_tx(&mut self, route: &RouteInfo, pkt: &[u8]) -> Result<()>;

    /// Poll for one received packet. Returns the packet length and the
    /// sender's routing info, or `None` when the receive queue is empty.
    fn poll_rx(&mut self, buf: &mut [u8]) -> Result<Option<(usize, RouteInfo)>>;

    /// Flush any queued transmissions.
    fn tx_flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// UDP datapath transport.
pub struct UdpTransport {
    sock: UdpSocket,
    mtu: usize,
    local: RouteInfo,
}

impl UdpTransport {
    /// Bind a transport to `bind_addr` (e.g. `"127.0.0.1:0"`) with the
    /// given MTU.
    pub fn bind<A: ToSocketAddrs>(bind_addr: A, mtu: usize) -> Result<Self> {
        if mtu <= crate::packet::PKT_HDR_SIZE {
            return Err(Error::InvalidConfig("mtu must exceed the packet header"));
        }
        let sock = UdpSocket::bind(bind_addr)?;
        sock.set_nonblocking(true)?;
        let local = RouteInfo::new(sock.local_addr()?);
        Ok(Self { sock, mtu, local })
    }
}

impl Transport for UdpTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn local_route(&self) -> RouteInfo {
        self.local
    }

    fn post_tx(&mut self, route: &RouteInfo, pkt: &[u8]) -> Result<()> {
        debug_assert!(pkt.len() <= self.mtu);
        match self.sock.send_to(pkt, route.addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::TransportBusy),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn poll_rx(&mut self, buf: &mut [u8]) -> Result<Option<(usize, RouteInfo)>> {
        match self.sock.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, RouteInfo::new(src)))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
