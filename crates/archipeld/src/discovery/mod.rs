//! LAN discovery over UDP multicast.
//!
//! Every node sends a signed HELLO to the multicast group on a fixed
//! interval and listens on the same group. HELLOs feed the peer table and
//! the trust store; they never count as proof of liveness. REVOKE
//! certificates also travel on this channel so peers without a session hear
//! about them.

pub mod broadcast;
pub mod listener;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use archipel_core::config::NetworkConfig;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

pub use broadcast::{hello_loop, send_revocation};
pub use listener::{expiry_loop, listener_loop};

/// Largest datagram the listener accepts.
pub const MAX_DATAGRAM: usize = 2048;

/// Bind the discovery port and join the multicast group.
///
/// One socket both sends and receives. Address and port reuse let several
/// nodes share a host.
pub fn multicast_socket(network: &NetworkConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, network.discovery_port);
    socket.bind(&bind.into()).context("bind()")?;

    let interface = match network.bind_addr {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    socket
        .join_multicast_v4(&network.multicast_group, &interface)
        .context("IP_ADD_MEMBERSHIP")?;
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
    // TTL 1: the LAN segment only.
    socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to convert to tokio UdpSocket")
}

pub fn group_addr(network: &NetworkConfig) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(network.multicast_group, network.discovery_port))
}
