//! Per-link task
//!
//! Drives one TCP connection through the handshake and then multiplexes
//! inbound frames, outbound commands, heartbeats and the degrade check.
//! The task owns the socket; everything else talks to it through its
//! `LinkHandle`.

use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;

use sk_core::error::LinkError;
use sk_core::ipc::NodeEvent;
use sk_core::time::current_time_millis;
use sk_core::types::{LinkState, MachineId};
use sk_protocol::{
    ClusterCodec, ClusterMessage, ErrorCode, ErrorPayload, MessageType, PeerListPayload,
    PingPayload, ProtocolError, Registration, ServiceQueryPayload, ServiceResponsePayload,
    PROTOCOL_VERSION,
};

use super::pool::{CloseReason, LinkCommand, LinkHandle};
use crate::identity::AdvertSource;
use crate::state::NodeState;

type LinkStream = Framed<TcpStream, ClusterCodec>;

/// Run a link until it closes. Returns why it closed; the handle is left
/// in `Closed`.
pub async fn run_link(
    state: Arc<NodeState>,
    handle: Arc<LinkHandle>,
    stream: TcpStream,
    commands: mpsc::Receiver<LinkCommand>,
) -> CloseReason {
    configure_socket(&stream);

    let mut link = Link {
        state,
        handle: Arc::clone(&handle),
        framed: Framed::new(stream, ClusterCodec::new()),
        peer: None,
        pending_ping: None,
    };

    let reason = match link.handshake().await {
        Ok(()) => link.serve(commands).await,
        Err(reason) => reason,
    };

    // Best effort: flush whatever is buffered before dropping the socket
    let _ = timeout(Duration::from_millis(100), link.framed.close()).await;

    let reason = handle.close_reason().unwrap_or(reason);
    // Degraded describes link traffic; with the link gone it no longer applies
    if handle.state() == LinkState::Degraded {
        if let Some(peer) = &link.peer {
            link.state.registry.set_link_health(peer, false);
        }
    }
    link.transition(LinkState::Closed);
    reason
}

fn configure_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(30));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("Failed to enable TCP keepalive: {}", e);
    }
}

fn read_error(e: ProtocolError) -> CloseReason {
    match e {
        ProtocolError::Io(e) => CloseReason::Transport(e.to_string()),
        other => CloseReason::Protocol(other.to_string()),
    }
}

struct Link {
    state: Arc<NodeState>,
    handle: Arc<LinkHandle>,
    framed: LinkStream,
    /// Set once the handshake names the peer
    peer: Option<MachineId>,
    /// Outstanding ping nonce and when it was sent
    pending_ping: Option<(u64, Instant)>,
}

impl Link {
    fn local_id(&self) -> &str {
        self.state.local_id().as_str()
    }

    fn transition(&self, next: LinkState) {
        if self.handle.set_state(next) {
            tracing::debug!(link_id = self.handle.id, state = %next, "Link state changed");
            self.state.publish(NodeEvent::LinkStateChanged {
                link_id: self.handle.id,
                machine_id: self.handle.peer_id().map(|id| id.0.clone()),
                state: next,
            });
        }
    }

    async fn send(&mut self, message: ClusterMessage) -> Result<(), CloseReason> {
        self.framed
            .send(message)
            .await
            .map_err(|e| CloseReason::Transport(e.to_string()))
    }

    /// Tell the peer why we are hanging up. Failures are irrelevant.
    async fn send_error(&mut self, code: ErrorCode, message: &str) {
        let payload = ErrorPayload {
            code,
            message: message.to_string(),
        };
        if let Ok(msg) = ClusterMessage::with_payload(
            MessageType::Error,
            self.local_id(),
            &payload,
            current_time_millis(),
        ) {
            let _ = self.framed.send(msg).await;
        }
    }

    /// Exchange registrations and promote the link
    async fn handshake(&mut self) -> Result<(), CloseReason> {
        self.transition(LinkState::HandshakePending);

        let registration = Registration::new(self.state.current_advert());
        let hello =
            ClusterMessage::registration(self.local_id(), &registration, current_time_millis())
                .map_err(|e| CloseReason::Protocol(e.to_string()))?;
        self.send(hello).await?;

        let limit = self.state.config.cluster.handshake_timeout;
        let cancel = self.handle.cancel_token().clone();
        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(CloseReason::Shutdown),
            frame = timeout(limit, self.framed.next()) => frame,
        };

        let message = match first {
            Err(_) => return Err(LinkError::HandshakeTimeout(limit).into()),
            Ok(None) => {
                return Err(
                    LinkError::ConnectionLost("closed during handshake".into()).into(),
                )
            }
            Ok(Some(Err(e))) => return Err(read_error(e)),
            Ok(Some(Ok(message))) => message,
        };

        if message.kind == MessageType::Error {
            let detail = message
                .decode_payload::<ErrorPayload>()
                .map(|p| p.message)
                .unwrap_or_else(|_| "unspecified".into());
            return Err(LinkError::HandshakeFailed(format!("peer refused: {}", detail)).into());
        }
        if message.kind != MessageType::Registration {
            self.send_error(ErrorCode::InvalidMessage, "expected registration")
                .await;
            return Err(CloseReason::Protocol(format!(
                "expected registration, got {:?}",
                message.kind
            )));
        }

        let registration: Registration = match message.decode_payload() {
            Ok(r) => r,
            Err(e) => {
                self.send_error(ErrorCode::InvalidMessage, "malformed registration")
                    .await;
                return Err(CloseReason::Protocol(e.to_string()));
            }
        };

        if registration.protocol_version != PROTOCOL_VERSION {
            let detail = format!(
                "protocol version {} not supported (expected {})",
                registration.protocol_version, PROTOCOL_VERSION
            );
            self.send_error(ErrorCode::VersionMismatch, &detail).await;
            return Err(LinkError::HandshakeFailed(detail).into());
        }

        let mut advert = registration.advert;
        let peer = MachineId::new(advert.machine_id.clone());
        if message.source_machine_id != advert.machine_id {
            return Err(CloseReason::Protocol(format!(
                "envelope source {} does not match registration {}",
                message.source_machine_id, advert.machine_id
            )));
        }
        if &peer == self.state.local_id() {
            self.send_error(ErrorCode::SelfConnection, "connected to self")
                .await;
            return Err(LinkError::SelfConnection.into());
        }
        if let Some(expected) = self.handle.expected_peer() {
            if expected != &peer {
                let err = LinkError::UnexpectedPeer {
                    expected: expected.0.clone(),
                    actual: peer.0.clone(),
                };
                self.send_error(ErrorCode::UnexpectedPeer, &err.to_string())
                    .await;
                return Err(err.into());
            }
        }

        if advert.primary_ip.is_empty() {
            if let Ok(addr) = self.framed.get_ref().peer_addr() {
                advert.primary_ip = addr.ip().to_string();
            }
        }

        self.handle.confirm_peer(peer.clone());
        self.state.observe_peer(advert, current_time_millis());

        self.state.links.promote(&self.handle, &peer)?;
        tracing::info!(
            link_id = self.handle.id,
            machine_id = %peer,
            direction = %self.handle.direction,
            remote = %self.handle.remote_addr,
            "Cluster link established"
        );
        self.state.publish(NodeEvent::LinkStateChanged {
            link_id: self.handle.id,
            machine_id: Some(peer.0.clone()),
            state: LinkState::Established,
        });
        self.peer = Some(peer);
        Ok(())
    }

    /// Established loop
    async fn serve(&mut self, mut commands: mpsc::Receiver<LinkCommand>) -> CloseReason {
        let cluster = &self.state.config.cluster;
        let degrade_after = cluster.degrade_after();

        let mut heartbeat = interval(cluster.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let mut health = interval((cluster.heartbeat_interval / 2).max(Duration::from_millis(10)));
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_inbound = Instant::now();
        let cancel = self.handle.cancel_token().clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.handle.close_reason().unwrap_or(CloseReason::Shutdown);
                }

                frame = self.framed.next() => match frame {
                    None => return LinkError::ConnectionLost("peer closed connection".into()).into(),
                    Some(Err(e)) => return read_error(e),
                    Some(Ok(message)) => {
                        last_inbound = Instant::now();
                        if let Err(reason) = self.on_message(message).await {
                            return reason;
                        }
                    }
                },

                _ = heartbeat.tick() => {
                    let beat = ClusterMessage::heartbeat(self.local_id(), current_time_millis());
                    if let Err(reason) = self.send(beat).await {
                        return reason;
                    }
                }

                _ = health.tick() => {
                    if last_inbound.elapsed() > degrade_after
                        && self.handle.state() == LinkState::Established
                    {
                        tracing::warn!(
                            link_id = self.handle.id,
                            peer = ?self.peer,
                            "No traffic for {:?}, link degraded",
                            last_inbound.elapsed()
                        );
                        self.transition(LinkState::Degraded);
                        if let Some(peer) = &self.peer {
                            self.state.registry.set_link_health(peer, true);
                        }
                    }
                }

                Some(command) = commands.recv() => {
                    if let Err(reason) = self.on_command(command).await {
                        return reason;
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: LinkCommand) -> Result<(), CloseReason> {
        match command {
            LinkCommand::Send(message) => self.send(message).await,
            LinkCommand::Ping => {
                let nonce = rand::random::<u64>();
                let ping = ClusterMessage::with_payload(
                    MessageType::Ping,
                    self.local_id(),
                    &PingPayload { nonce },
                    current_time_millis(),
                )
                .map_err(|e| CloseReason::Protocol(e.to_string()))?;
                self.pending_ping = Some((nonce, Instant::now()));
                self.send(ping).await
            }
        }
    }

    async fn on_message(&mut self, message: ClusterMessage) -> Result<(), CloseReason> {
        let Some(peer) = self.peer.clone() else {
            return Ok(());
        };

        if message.source_machine_id != peer.0 {
            tracing::warn!(
                link_id = self.handle.id,
                "Dropping {:?} claiming to be from {} on link to {}",
                message.kind,
                message.source_machine_id,
                peer
            );
            return Ok(());
        }

        self.state.registry.touch(&peer, current_time_millis());
        if self.handle.state() == LinkState::Degraded {
            tracing::info!(link_id = self.handle.id, machine_id = %peer, "Link recovered");
            self.transition(LinkState::Established);
            self.state.registry.set_link_health(&peer, false);
        }

        if let Some(target) = &message.target_machine_id {
            if target != self.local_id() {
                tracing::debug!(target = %target, "Dropping message addressed elsewhere");
                return Ok(());
            }
        }

        match message.kind {
            MessageType::Heartbeat => {
                tracing::trace!(machine_id = %peer, "Heartbeat");
            }
            MessageType::Registration => {
                // Advert refresh on an open link
                match message.decode_payload::<Registration>() {
                    Ok(reg) if reg.advert.machine_id == peer.0 => {
                        self.state.observe_peer(reg.advert, current_time_millis());
                    }
                    Ok(_) => tracing::warn!(machine_id = %peer, "Re-registration under another id ignored"),
                    Err(e) => tracing::warn!(machine_id = %peer, "Malformed registration: {}", e),
                }
            }
            MessageType::Ping => {
                let mut pong = message.clone();
                pong.kind = MessageType::Pong;
                pong.source_machine_id = self.local_id().to_string();
                pong.target_machine_id = Some(peer.0.clone());
                pong.timestamp = current_time_millis();
                self.send(pong).await?;
            }
            MessageType::Pong => {
                let nonce = message.decode_payload::<PingPayload>().ok().map(|p| p.nonce);
                match self.pending_ping {
                    Some((expected, sent)) if Some(expected) == nonce => {
                        let rtt = sent.elapsed().as_millis() as u64;
                        self.handle.record_rtt(rtt);
                        self.pending_ping = None;
                        tracing::debug!(machine_id = %peer, rtt_ms = rtt, "Pong");
                    }
                    _ => tracing::debug!(machine_id = %peer, "Unsolicited pong"),
                }
            }
            MessageType::PeerQuery => {
                let payload = PeerListPayload {
                    peers: self
                        .state
                        .registry
                        .list_online()
                        .iter()
                        .map(|d| d.to_advert())
                        .collect(),
                };
                let reply = ClusterMessage::with_payload(
                    MessageType::PeerList,
                    self.local_id(),
                    &payload,
                    current_time_millis(),
                )
                .map_err(|e| CloseReason::Protocol(e.to_string()))?
                .to(peer.0.clone());
                self.send(reply).await?;
            }
            MessageType::PeerList => match message.decode_payload::<PeerListPayload>() {
                Ok(list) => tracing::debug!(
                    machine_id = %peer,
                    peers = list.peers.len(),
                    "Peer list received"
                ),
                Err(e) => tracing::warn!(machine_id = %peer, "Malformed peer list: {}", e),
            },
            MessageType::ServiceQuery => match message.decode_payload::<ServiceQueryPayload>() {
                Ok(query) => {
                    let payload = ServiceResponsePayload {
                        port: self.state.lookup_service(&query.service),
                        service: query.service,
                    };
                    let reply = ClusterMessage::with_payload(
                        MessageType::ServiceResponse,
                        self.local_id(),
                        &payload,
                        current_time_millis(),
                    )
                    .map_err(|e| CloseReason::Protocol(e.to_string()))?
                    .to(peer.0.clone());
                    self.send(reply).await?;
                }
                Err(e) => tracing::warn!(machine_id = %peer, "Malformed service query: {}", e),
            },
            MessageType::ServiceResponse => {
                match message.decode_payload::<ServiceResponsePayload>() {
                    Ok(resp) => tracing::debug!(
                        machine_id = %peer,
                        service = %resp.service,
                        port = ?resp.port,
                        "Service response"
                    ),
                    Err(e) => tracing::warn!(machine_id = %peer, "Malformed service response: {}", e),
                }
            }
            MessageType::StatusUpdate => {
                self.state.publish(NodeEvent::StatusUpdate {
                    machine_id: peer.0.clone(),
                    payload: message.payload,
                });
            }
            MessageType::TaskCoordination => {
                self.state.publish(NodeEvent::TaskCoordination {
                    machine_id: peer.0.clone(),
                    payload: message.payload,
                });
            }
            MessageType::Error => {
                let detail = message
                    .decode_payload::<ErrorPayload>()
                    .map(|p| format!("{:?}: {}", p.code, p.message))
                    .unwrap_or_else(|_| message.payload.to_string());
                tracing::warn!(machine_id = %peer, "Peer reported error: {}", detail);
            }
        }
        Ok(())
    }
}
