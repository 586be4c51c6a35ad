//! UDP transport helpers
//!
//! Receivers bind a socket, optionally joining a multicast group, and
//! feed every datagram to the packet parser. Senders buffer encoded
//! parts and flush a datagram whenever the next value list would no
//! longer fit.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{info, warn};

use crate::errors::{ProtocolError, Result};
use crate::protocol::PacketBuilder;
use crate::types::ValueList;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Well-known collector port
pub const DEFAULT_PORT: u16 = 25826;

/// The same port as the service string used in configuration files
pub const DEFAULT_SERVICE: &str = "25826";

/// Default payload budget per datagram, sized for a 1500-byte MTU
pub const DEFAULT_PACKET_SIZE: usize = 1452;

/// Default TTL applied when joining a multicast group
pub const DEFAULT_MULTICAST_TTL: u32 = 16;

// ----------------------------------------------------------------------------
// Listener
// ----------------------------------------------------------------------------

/// Configuration of a receiving socket
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind: SocketAddr,
    /// Multicast group to join, if any
    pub group: Option<IpAddr>,
    /// Local interface address for a v4 join; unspecified means any
    pub interface_v4: Ipv4Addr,
    /// Interface index for a v6 join; zero means any
    pub interface_v6: u32,
    pub multicast_ttl: u32,
    pub multicast_loop: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            group: None,
            interface_v4: Ipv4Addr::UNSPECIFIED,
            interface_v6: 0,
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            multicast_loop: true,
        }
    }
}

impl ListenConfig {
    /// Bind the socket and perform the multicast join
    pub fn open(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(self.bind)?;

        match self.group {
            Some(IpAddr::V4(group)) => {
                socket.join_multicast_v4(&group, &self.interface_v4)?;
                socket.set_multicast_loop_v4(self.multicast_loop)?;
                socket.set_multicast_ttl_v4(self.multicast_ttl)?;
                info!(%group, "joined multicast group");
            }
            Some(IpAddr::V6(group)) => {
                socket.join_multicast_v6(&group, self.interface_v6)?;
                socket.set_multicast_loop_v6(self.multicast_loop)?;
                info!(%group, "joined multicast group");
            }
            None => {}
        }
        Ok(socket)
    }
}

// ----------------------------------------------------------------------------
// Sender
// ----------------------------------------------------------------------------

/// Envelope applied to every outgoing packet
#[derive(Debug, Clone, Default)]
pub enum PacketSecurity {
    #[default]
    Plain,
    #[cfg(feature = "crypto")]
    Sign { username: String, password: String },
    #[cfg(feature = "crypto")]
    Encrypt { username: String, password: String },
}

impl PacketSecurity {
    /// Worst-case bytes the envelope adds around a payload
    fn overhead(&self) -> usize {
        match self {
            PacketSecurity::Plain => 0,
            // header + hmac + username
            #[cfg(feature = "crypto")]
            PacketSecurity::Sign { username, .. } => 4 + 32 + username.len(),
            // header + user length + username + iv + sha1
            #[cfg(feature = "crypto")]
            PacketSecurity::Encrypt { username, .. } => 4 + 2 + username.len() + 16 + 20,
        }
    }
}

/// Buffering packet sender over a connected UDP socket
pub struct Sender {
    socket: UdpSocket,
    builder: PacketBuilder,
    packet_size: usize,
    security: PacketSecurity,
}

impl Sender {
    /// Connect to a receiver
    pub fn connect<A: ToSocketAddrs>(addr: A, security: PacketSecurity) -> Result<Self> {
        let dest = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ProtocolError::malformed("destination did not resolve"))?;
        let local: SocketAddr = match dest {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(dest)?;
        Ok(Self {
            socket,
            builder: PacketBuilder::new(),
            packet_size: DEFAULT_PACKET_SIZE,
            security,
        })
    }

    /// Override the per-datagram payload budget
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Queue one value list, flushing first if it would not fit
    pub fn submit(&mut self, vl: &ValueList) -> Result<()> {
        // Measure the list encoded stand-alone; appended to the running
        // buffer it can only shrink through identity dedup.
        let mut probe = PacketBuilder::new();
        probe.write(vl)?;

        let budget = self.packet_size.saturating_sub(self.security.overhead());
        if !self.builder.is_empty() && self.builder.len() + probe.len() > budget {
            self.flush()?;
        }
        self.builder.write(vl)
    }

    /// Seal and transmit whatever is buffered
    pub fn flush(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let builder = std::mem::take(&mut self.builder);
        let packet = match &self.security {
            PacketSecurity::Plain => builder.finish(),
            #[cfg(feature = "crypto")]
            PacketSecurity::Sign { username, password } => {
                builder.finish_signed(username, password)?
            }
            #[cfg(feature = "crypto")]
            PacketSecurity::Encrypt { username, password } => {
                builder.finish_encrypted(username, password)?
            }
        };
        self.socket.send(&packet)?;
        Ok(())
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(%err, "failed to flush buffered samples on shutdown");
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
