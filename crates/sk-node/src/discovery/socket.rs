//! UDP socket setup shared by the broadcaster and listener

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Bind a non-blocking UDP socket that other local nodes can share
pub(crate) fn bind_udp(addr: SocketAddr, broadcast: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // BSD-derived stacks need SO_REUSEPORT to share a multicast port
    #[cfg(all(unix, not(any(target_os = "linux", target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Join a multicast group on the default interface. Failure only costs
/// multicast reception, so it is logged rather than returned.
pub(crate) fn join_multicast(socket: &UdpSocket, group: Ipv4Addr) {
    match socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
        Ok(()) => {
            let _ = socket.set_multicast_loop_v4(true);
            tracing::debug!("Joined multicast group {}", group);
        }
        Err(e) => tracing::warn!("Failed to join multicast group {}: {}", group, e),
    }
}
