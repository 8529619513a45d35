//! Beacon listener
//!
//! Turns datagrams on the beacon port into validated beacons from other
//! machines. Garbage and our own announcements never leave this module.

use futures::Stream;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use sk_core::time::current_time_millis;
use sk_core::types::MachineId;
use sk_protocol::{BeaconMessage, MAX_BEACON_SIZE};

use super::socket::{bind_udp, join_multicast};

/// A beacon accepted from another machine
#[derive(Debug, Clone)]
pub struct ReceivedBeacon {
    pub beacon: BeaconMessage,
    /// Datagram source
    pub from: SocketAddr,
    /// Local clock at receipt, Unix millis
    pub received_at: u64,
}

/// Receiver for presence beacons
pub struct BeaconListener {
    socket: UdpSocket,
    local_id: MachineId,
    /// Highest sequence seen per sender
    sequences: HashMap<String, u64>,
    buf: Vec<u8>,
}

impl BeaconListener {
    /// Bind the beacon port, joining `multicast` if given
    pub fn bind(addr: &str, multicast: Option<Ipv4Addr>, local_id: MachineId) -> io::Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", addr, e)))?;
        let socket = bind_udp(addr, true)?;
        if let Some(group) = multicast {
            join_multicast(&socket, group);
        }

        Ok(Self {
            socket,
            local_id,
            sequences: HashMap::new(),
            // One spare byte so oversized datagrams are detectable
            buf: vec![0u8; MAX_BEACON_SIZE + 1],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for the next beacon from another machine.
    ///
    /// Malformed datagrams and our own beacons are skipped. Socket errors
    /// are logged and retried, so this only returns with a beacon.
    pub async fn recv(&mut self) -> ReceivedBeacon {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.buf).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("Beacon socket error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let mut beacon = match BeaconMessage::decode(&self.buf[..len]) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("Dropping malformed beacon from {}: {}", from, e);
                    continue;
                }
            };

            if beacon.machine_id() == self.local_id.as_str() {
                continue;
            }

            let last = self
                .sequences
                .entry(beacon.machine_id().to_string())
                .or_insert(0);
            if beacon.sequence != 0 && beacon.sequence <= *last {
                tracing::debug!(
                    machine_id = beacon.machine_id(),
                    sequence = beacon.sequence,
                    last = *last,
                    "Out-of-order beacon"
                );
            }
            *last = (*last).max(beacon.sequence);

            let ip = &beacon.advert.primary_ip;
            if ip.is_empty() || ip == "0.0.0.0" {
                beacon.advert.primary_ip = from.ip().to_string();
            }

            return ReceivedBeacon {
                beacon,
                from,
                received_at: current_time_millis(),
            };
        }
    }

    /// Endless stream of accepted beacons. Dropping the stream closes the
    /// socket; binding again restarts it.
    pub fn into_stream(self) -> impl Stream<Item = ReceivedBeacon> {
        futures::stream::unfold(self, |mut listener| async move {
            let beacon = listener.recv().await;
            Some((beacon, listener))
        })
    }
}
