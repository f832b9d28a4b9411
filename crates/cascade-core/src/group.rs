//! Multicast datagram group.
//!
//! Thin wrapper over a UDP socket configured for multicast: join/leave,
//! fixed-size datagram send and receive. IPv4 class-D and IPv6
//! `ff00::/8` groups are supported; TTL (hops on v6) defaults to 1 so a
//! transfer stays on its link unless configured otherwise. Loopback
//! delivery stays enabled so co-located sender and receivers — the
//! integration suite included — hear each other.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Interface selection for a group. V4 interfaces are addressed by one
/// of their IPs, v6 interfaces by OS index; `named` resolves a name via
/// `if_nametoindex` (v6 only — on v4, pass the interface address).
#[derive(Debug, Clone, Default)]
pub struct GroupInterface {
    pub name: Option<String>,
}

impl GroupInterface {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()) }
    }

    fn v4_addr(&self) -> Ipv4Addr {
        match &self.name {
            None => Ipv4Addr::UNSPECIFIED,
            Some(name) => match name.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    tracing::warn!(
                        interface = name,
                        "IPv4 multicast interfaces are addressed by IP; using the OS default"
                    );
                    Ipv4Addr::UNSPECIFIED
                }
            },
        }
    }

    fn v6_index(&self) -> u32 {
        match &self.name {
            None => 0,
            Some(name) => match if_index(name) {
                Some(index) => index,
                None => {
                    tracing::warn!(interface = name, "interface not found; using the OS default");
                    0
                }
            },
        }
    }
}

/// OS interface index for a named network interface.
fn if_index(name: &str) -> Option<u32> {
    let name_cstr = std::ffi::CString::new(name).ok()?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    (index != 0).then_some(index)
}

/// A joined multicast group, usable for both sending and receiving.
pub struct DatagramGroup {
    socket: UdpSocket,
    group: IpAddr,
    port: u16,
    v4_interface: Ipv4Addr,
    v6_index: u32,
    joined: bool,
}

impl DatagramGroup {
    /// Join `group:port`, optionally on a specific interface, with the
    /// given TTL/hop limit and receive buffer size.
    pub fn join(
        group: IpAddr,
        port: u16,
        interface: &GroupInterface,
        ttl: u32,
        recv_buffer: usize,
    ) -> std::io::Result<Self> {
        if !group.is_multicast() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{group} is not a multicast address"),
            ));
        }

        let (domain, bind_addr): (Domain, SocketAddr) = match group {
            IpAddr::V4(_) => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, port).into()),
            IpAddr::V6(_) => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, port).into()),
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if recv_buffer > 0 {
            if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
                tracing::warn!(error = %e, recv_buffer, "could not size the receive buffer");
            }
        }
        socket.bind(&bind_addr.into())?;

        let mut v6_index = 0;
        let mut v4_interface = Ipv4Addr::UNSPECIFIED;
        match group {
            IpAddr::V4(v4) => {
                let if_addr = interface.v4_addr();
                v4_interface = if_addr;
                socket.join_multicast_v4(&v4, &if_addr)?;
                socket.set_multicast_if_v4(&if_addr)?;
                socket.set_multicast_ttl_v4(ttl)?;
                socket.set_multicast_loop_v4(true)?;
            }
            IpAddr::V6(v6) => {
                v6_index = interface.v6_index();
                socket.join_multicast_v6(&v6, v6_index)?;
                socket.set_multicast_if_v6(v6_index)?;
                socket.set_multicast_hops_v6(ttl)?;
                socket.set_multicast_loop_v6(true)?;
            }
        }

        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;

        tracing::debug!(%group, port, ttl, "joined multicast group");
        Ok(Self { socket, group, port, v4_interface, v6_index, joined: true })
    }

    /// Publish one datagram to the group.
    pub async fn send(&self, payload: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(payload, (self.group, self.port)).await
    }

    /// Receive one datagram into `buf`, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (len, _from) = self.socket.recv_from(buf).await?;
        Ok(len)
    }

    /// Leave the group. Idempotent; also run on drop.
    pub fn leave(&mut self) -> std::io::Result<()> {
        if !self.joined {
            return Ok(());
        }
        self.joined = false;
        match self.group {
            IpAddr::V4(v4) => self.socket.leave_multicast_v4(v4, self.v4_interface),
            IpAddr::V6(v6) => self.socket.leave_multicast_v6(&v6, self.v6_index),
        }
    }
}

impl Drop for DatagramGroup {
    fn drop(&mut self) {
        let _ = self.leave();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
