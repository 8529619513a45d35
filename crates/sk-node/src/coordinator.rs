//! Discovery coordinator
//!
//! Wires the beacon broadcaster and listener, the registry sweep, the
//! link listener and outbound dialing into one subsystem with a single
//! start/stop lifecycle. This is the only surface the rest of the
//! process (IPC server, CLI) talks to.
//!
//! # Peer lifecycle
//!
//! 1. A beacon from an unknown or offline machine inserts/revives it and
//!    triggers an immediate reply beacon
//! 2. Any beacon for a machine with no live link dials it
//! 3. A link that drops for a reason other than shutdown or tie-break
//!    schedules a reconnect with exponential back-off
//! 4. The reconnect loop gives up once the registry marks the peer offline

use dashmap::DashSet;
use futures::StreamExt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use sk_core::config::{NodeConfig, CLUSTER_SERVICE};
use sk_core::error::{LinkError, SkError};
use sk_core::ipc::{LinkInfo, NodeEvent, NodeStatus, PeerInfo};
use sk_core::time::current_time_millis;
use sk_core::types::{LinkState, MachineDescriptor, MachineId};
use sk_protocol::{ClusterMessage, MessageType};

use crate::discovery::{resolve_targets, BeaconBroadcaster, BeaconListener, ReceivedBeacon};
use crate::link::{
    CloseReason, ExponentialBackoff, LinkClosed, LinkCommand, LinkServer, LinkSpawner,
};
use crate::registry::PeerChange;
use crate::state::{is_reachable, NodeState};
use crate::tasks::TaskGroup;

/// Resources of one start/stop cycle
struct Running {
    cancel: CancellationToken,
    tasks: TaskGroup,
    spawner: LinkSpawner,
    broadcaster: Arc<BeaconBroadcaster>,
    beacon_addr: SocketAddr,
    cluster_addr: SocketAddr,
    /// Cluster port claimed under `CLUSTER_SERVICE`
    claimed_port: Option<u16>,
}

/// Orchestrates discovery, the registry and cluster links
pub struct DiscoveryCoordinator {
    state: Arc<NodeState>,
    running: Mutex<Option<Arc<Running>>>,
    /// Held across a whole start or stop so the two never interleave
    lifecycle: tokio::sync::Mutex<()>,
    /// Peers with a reconnect loop in progress
    reconnecting: DashSet<MachineId>,
    /// Ids of peers newly inserted or revived by a beacon
    discovered: broadcast::Sender<MachineId>,
}

impl DiscoveryCoordinator {
    /// Validate the configuration and build the node state
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, SkError> {
        config.validate()?;
        Ok(Self::with_state(Arc::new(NodeState::new(config))))
    }

    pub fn with_state(state: Arc<NodeState>) -> Arc<Self> {
        let (discovered, _) = broadcast::channel(64);
        Arc::new(Self {
            state,
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            reconnecting: DashSet::new(),
            discovered,
        })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    fn running(&self) -> Option<Arc<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Whether a back-off reconnect to `peer` is in progress
    pub fn is_reconnecting(&self, peer: &MachineId) -> bool {
        self.reconnecting.contains(peer)
    }

    /// Address the beacon listener is bound to
    pub fn beacon_addr(&self) -> Option<SocketAddr> {
        self.running().map(|r| r.beacon_addr)
    }

    /// Address the link listener is bound to
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.running().map(|r| r.cluster_addr)
    }

    /// Bind every socket and launch the broadcaster, listener, sweep and
    /// link tasks. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), SkError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            tracing::debug!("Discovery already running");
            return Ok(());
        }

        let config = &self.state.config;

        // Claim before binding: the claim's bind test would see our own
        // listener otherwise. An ephemeral port has nothing to protect.
        let claimed_port = match config.cluster.port {
            0 => None,
            port => {
                let allocation =
                    self.state
                        .ports
                        .claim(port, CLUSTER_SERVICE, Some(std::process::id()))?;
                self.state.publish(NodeEvent::PortClaimed(allocation));
                Some(port)
            }
        };

        match self.bind_and_spawn(claimed_port).await {
            Ok(running) => {
                self.state.refresh_local();
                tracing::info!(
                    machine_id = %self.state.local_id(),
                    beacon = %running.beacon_addr,
                    cluster = %running.cluster_addr,
                    "Discovery started"
                );
                *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(running);
                Ok(())
            }
            Err(e) => {
                if let Some(port) = claimed_port {
                    self.drop_self_claim(port);
                }
                Err(e)
            }
        }
    }

    async fn bind_and_spawn(
        self: &Arc<Self>,
        claimed_port: Option<u16>,
    ) -> Result<Arc<Running>, SkError> {
        let config = &self.state.config;

        let server = LinkServer::bind(&config.cluster.listen_address()).await?;
        let cluster_addr = server.local_addr()?;
        self.state.identity.set_cluster_port(cluster_addr.port());

        let multicast = config
            .discovery
            .multicast_group
            .as_deref()
            .and_then(|g| g.parse::<Ipv4Addr>().ok());
        let listener = BeaconListener::bind(
            &config.discovery.listen_address(),
            multicast,
            self.state.local_id().clone(),
        )?;
        let beacon_addr = listener.local_addr()?;

        let targets = resolve_targets(&config.discovery, &self.state.identity.primary_ip);
        if targets.is_empty() {
            tracing::warn!("No beacon targets configured; this node will not be discovered");
        }
        let broadcaster = Arc::new(BeaconBroadcaster::bind(targets)?);

        let cancel = CancellationToken::new();
        let tasks = TaskGroup::new();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let spawner = LinkSpawner::new(
            Arc::clone(&self.state),
            closed_tx,
            tasks.clone(),
            cancel.clone(),
        );

        let running = Arc::new(Running {
            cancel: cancel.clone(),
            tasks: tasks.clone(),
            spawner: spawner.clone(),
            broadcaster: Arc::clone(&broadcaster),
            beacon_addr,
            cluster_addr,
            claimed_port,
        });

        tasks.spawn(server.run(spawner, cancel.clone()));

        {
            let this = Arc::clone(self);
            let running = Arc::clone(&running);
            tasks.spawn(async move { this.listen_loop(listener, running).await });
        }

        {
            let state = Arc::clone(&self.state);
            let interval = config.discovery.interval;
            let cancel = cancel.clone();
            tasks.spawn(async move { broadcaster.run(state.as_ref(), interval, cancel).await });
        }

        {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.sweep_loop(cancel).await });
        }

        {
            let this = Arc::clone(self);
            let running = Arc::clone(&running);
            tasks.spawn(async move { this.closed_loop(closed_rx, running).await });
        }

        Ok(running)
    }

    async fn listen_loop(self: Arc<Self>, listener: BeaconListener, running: Arc<Running>) {
        let beacons = listener.into_stream();
        tokio::pin!(beacons);

        loop {
            tokio::select! {
                _ = running.cancel.cancelled() => {
                    tracing::debug!("Beacon listener stopping");
                    break;
                }
                Some(received) = beacons.next() => {
                    self.on_beacon(received, &running).await;
                }
            }
        }
    }

    async fn on_beacon(self: &Arc<Self>, received: ReceivedBeacon, running: &Arc<Running>) {
        tracing::trace!(
            machine_id = received.beacon.machine_id(),
            from = %received.from,
            "Beacon"
        );

        let upserted = self
            .state
            .observe_peer(received.beacon.advert, received.received_at);

        if matches!(upserted.change, PeerChange::Inserted | PeerChange::Revived) {
            let _ = self.discovered.send(upserted.descriptor.machine_id.clone());
            // Answer right away so the newcomer learns about us without
            // waiting a full interval
            running.broadcaster.send_once(self.state.as_ref()).await;
        }

        self.ensure_link(&upserted.descriptor, running);
    }

    /// Dial a peer unless a live link or a reconnect loop already covers it
    fn ensure_link(&self, descriptor: &MachineDescriptor, running: &Running) {
        let peer = &descriptor.machine_id;
        if peer == self.state.local_id() || !is_reachable(descriptor) {
            return;
        }
        if self.state.links.live_link_for(peer).is_some() || self.reconnecting.contains(peer) {
            return;
        }
        running
            .spawner
            .dial(peer.clone(), descriptor.cluster_address());
    }

    async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.state.config.discovery.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.state.expire_stale(current_time_millis());
                    if !expired.is_empty() {
                        tracing::debug!(count = expired.len(), "Registry sweep expired peers");
                    }
                }
            }
        }
    }

    async fn closed_loop(
        self: Arc<Self>,
        mut closed: mpsc::UnboundedReceiver<LinkClosed>,
        running: Arc<Running>,
    ) {
        loop {
            tokio::select! {
                _ = running.cancel.cancelled() => break,
                Some(notice) = closed.recv() => self.on_link_closed(notice, &running),
            }
        }
    }

    fn on_link_closed(self: &Arc<Self>, notice: LinkClosed, running: &Arc<Running>) {
        if running.cancel.is_cancelled() || notice.reason.is_intentional() {
            return;
        }
        let Some(peer) = notice.handle.peer_id().cloned() else {
            // Inbound link that never identified itself
            return;
        };
        if self.state.links.live_link_for(&peer).is_some() {
            return;
        }
        self.schedule_reconnect(peer, running);
    }

    fn schedule_reconnect(self: &Arc<Self>, peer: MachineId, running: &Arc<Running>) {
        if !self.reconnecting.insert(peer.clone()) {
            return;
        }
        let this = Arc::clone(self);
        let running_task = Arc::clone(running);
        running.tasks.spawn(async move {
            this.reconnect_loop(&peer, &running_task).await;
            this.reconnecting.remove(&peer);
        });
    }

    async fn reconnect_loop(&self, peer: &MachineId, running: &Running) {
        let mut backoff = ExponentialBackoff::from_config(&self.state.config.cluster.backoff);

        loop {
            let delay = backoff.next_delay();
            tracing::debug!(machine_id = %peer, "Reconnecting in {:?}", delay);
            tokio::select! {
                _ = running.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(descriptor) = self.state.registry.get(peer) else {
                return;
            };
            if !is_reachable(&descriptor) {
                tracing::info!(machine_id = %peer, "Peer offline, reconnect abandoned");
                return;
            }
            if self.state.links.live_link_for(peer).is_some() {
                return;
            }

            let handle = running
                .spawner
                .dial(peer.clone(), descriptor.cluster_address());
            let mut state = handle.subscribe_state();
            let outcome = tokio::select! {
                _ = running.cancel.cancelled() => return,
                result = state.wait_for(|s| s.is_open() || *s == LinkState::Closed) => {
                    result.map(|s| *s).unwrap_or(LinkState::Closed)
                }
            };

            if outcome.is_open() {
                tracing::info!(machine_id = %peer, "Reconnected");
                return;
            }
            if handle
                .close_reason()
                .map(|r| r.is_intentional())
                .unwrap_or(false)
            {
                return;
            }
        }
    }

    /// Announce now and report the machines first seen (or revived)
    /// during the discovery window
    pub async fn discover_now(&self) -> Result<Vec<PeerInfo>, SkError> {
        let running = self.running().ok_or(SkError::NotRunning)?;
        let mut discovered = self.discovered.subscribe();

        running.broadcaster.send_once(self.state.as_ref()).await;

        let deadline = Instant::now() + self.state.config.discovery.discover_window;
        let mut found: Vec<MachineId> = Vec::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = running.cancel.cancelled() => break,
                result = discovered.recv() => match result {
                    Ok(id) => {
                        if !found.contains(&id) {
                            found.push(id);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(found
            .iter()
            .filter_map(|id| self.state.get_peer(id))
            .collect())
    }

    /// Online and degraded machines, ourselves included
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.state.list_peers()
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.state.links.list()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.status()
    }

    /// Send a message to one peer over its established link
    pub async fn send_to(
        &self,
        peer: &MachineId,
        kind: MessageType,
        payload: serde_json::Value,
    ) -> Result<(), SkError> {
        let link = self
            .state
            .links
            .established_for(peer)
            .ok_or_else(|| LinkError::NoLink(peer.0.clone()))?;
        let message = ClusterMessage::new(
            kind,
            self.state.local_id().as_str(),
            payload,
            current_time_millis(),
        )
        .to(peer.0.clone());
        link.send(LinkCommand::Send(message)).await?;
        Ok(())
    }

    /// Send a message to every peer with an open link. Returns how many
    /// links accepted it.
    pub async fn broadcast(&self, kind: MessageType, payload: serde_json::Value) -> usize {
        let message = ClusterMessage::new(
            kind,
            self.state.local_id().as_str(),
            payload,
            current_time_millis(),
        );
        let mut sent = 0;
        for link in self.state.links.open_links() {
            if link.send(LinkCommand::Send(message.clone())).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Measure round-trip time to a peer; the result shows up in `links()`
    pub async fn ping(&self, peer: &MachineId) -> Result<(), SkError> {
        let link = self
            .state
            .links
            .established_for(peer)
            .ok_or_else(|| LinkError::NoLink(peer.0.clone()))?;
        link.send(LinkCommand::Ping).await?;
        Ok(())
    }

    /// Stop everything within the configured shutdown timeout. Tasks that
    /// have not finished by then are dropped. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.running.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };

        let started = Instant::now();
        tracing::info!("Discovery stopping");

        running.cancel.cancel();
        self.state.links.close_all(CloseReason::Shutdown);

        let grace = self.state.config.cluster.shutdown_timeout;
        let clean = running.tasks.shutdown(grace).await;
        self.state.links.clear();
        self.reconnecting.clear();

        if let Some(port) = running.claimed_port {
            self.drop_self_claim(port);
        }
        self.state.refresh_local();

        tracing::info!(
            clean,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Discovery stopped"
        );
    }

    /// Give back the cluster port claimed at start. The port is usually
    /// reserved for the cluster service, which `release` refuses.
    fn drop_self_claim(&self, port: u16) {
        if let Some(dropped) = self.state.ports.drop_claim(port, CLUSTER_SERVICE) {
            self.state.publish(NodeEvent::PortReleased {
                port,
                service: dropped.service,
            });
        }
    }
}
