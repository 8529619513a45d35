//! Beacon broadcaster
//!
//! Sends one beacon per tick to every target. A failed target is logged
//! and skipped; the tick and the timer carry on.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use sk_core::config::DiscoveryConfig;
use sk_core::time::current_time_millis;
use sk_protocol::BeaconMessage;

use super::socket::bind_udp;
use crate::identity::AdvertSource;

/// Periodic presence announcer
pub struct BeaconBroadcaster {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    sequence: AtomicU64,
}

impl BeaconBroadcaster {
    /// Bind an ephemeral send socket
    pub fn bind(targets: Vec<SocketAddr>) -> io::Result<Self> {
        let socket = bind_udp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), true)?;
        Ok(Self {
            socket,
            targets,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    /// Send one beacon to every target. Returns how many sends succeeded.
    pub async fn send_once(&self, source: &dyn AdvertSource) -> usize {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let beacon = BeaconMessage::new(source.current_advert(), current_time_millis(), sequence);
        let datagram = match beacon.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode beacon: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for target in &self.targets {
            match self.socket.send_to(&datagram, target).await {
                Ok(_) => sent += 1,
                Err(e) => tracing::debug!("Beacon to {} failed: {}", target, e),
            }
        }

        if sent == 0 && !self.targets.is_empty() {
            tracing::warn!(sequence, "Beacon reached no targets");
        } else {
            tracing::trace!(sequence, sent, "Beacon sent");
        }
        sent
    }

    /// Announce every `interval` until cancelled. The first beacon goes
    /// out immediately.
    pub async fn run(&self, source: &dyn AdvertSource, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Beacon broadcaster stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.send_once(source).await;
                }
            }
        }
    }
}

/// Every address a beacon should go to: the multicast group, the limited
/// broadcast address, the /24 broadcast of `primary_ip`, then the extra
/// targets. Duplicates are dropped.
pub fn resolve_targets(config: &DiscoveryConfig, primary_ip: &str) -> Vec<SocketAddr> {
    let port = config.beacon_port;
    let mut targets = Vec::new();
    let mut push = |addr: SocketAddr| {
        if !targets.contains(&addr) {
            targets.push(addr);
        }
    };

    if let Some(group) = &config.multicast_group {
        match group.parse::<Ipv4Addr>() {
            Ok(group) => push(SocketAddrV4::new(group, port).into()),
            Err(_) => tracing::warn!("Ignoring invalid multicast group {:?}", group),
        }
    }

    if config.broadcast {
        push(SocketAddrV4::new(Ipv4Addr::BROADCAST, port).into());
    }

    if config.subnet_broadcast {
        if let Ok(ip) = primary_ip.parse::<Ipv4Addr>() {
            if !ip.is_loopback() && !ip.is_unspecified() {
                let [a, b, c, _] = ip.octets();
                push(SocketAddrV4::new(Ipv4Addr::new(a, b, c, 255), port).into());
            }
        }
    }

    for target in &config.targets {
        match resolve_target(target, port) {
            Some(addr) => push(addr),
            None => tracing::warn!("Ignoring unresolvable beacon target {:?}", target),
        }
    }

    targets
}

/// `host:port`, or a bare host on the beacon port
fn resolve_target(target: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = target.parse::<Ipv4Addr>() {
        return Some(SocketAddrV4::new(ip, default_port).into());
    }
    let with_port = if target.contains(':') {
        target.to_string()
    } else {
        format!("{}:{}", target, default_port)
    };
    with_port
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_targets() {
        let config = DiscoveryConfig::default();
        let targets = resolve_targets(&config, "192.168.1.20");
        assert_eq!(
            targets,
            vec![
                addr("239.255.43.21:8181"),
                addr("255.255.255.255:8181"),
                addr("192.168.1.255:8181"),
            ]
        );
    }

    #[test]
    fn test_loopback_has_no_subnet_broadcast() {
        let config = DiscoveryConfig {
            multicast_group: None,
            broadcast: false,
            ..Default::default()
        };
        assert!(resolve_targets(&config, "127.0.0.1").is_empty());
    }

    #[test]
    fn test_extra_targets_and_dedup() {
        let config = DiscoveryConfig {
            multicast_group: None,
            broadcast: false,
            subnet_broadcast: false,
            targets: vec![
                "10.0.0.7".into(),
                "10.0.0.8:9000".into(),
                "10.0.0.7:8181".into(),
            ],
            ..Default::default()
        };
        let targets = resolve_targets(&config, "10.0.0.1");
        assert_eq!(targets[0], addr("10.0.0.7:8181"));
        assert_eq!(targets[1], addr("10.0.0.8:9000"));
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let config = DiscoveryConfig {
            multicast_group: Some("not-an-ip".into()),
            broadcast: false,
            subnet_broadcast: false,
            targets: vec!["peer:notaport".into()],
            ..Default::default()
        };
        assert!(resolve_targets(&config, "10.0.0.1").is_empty());
    }
}
