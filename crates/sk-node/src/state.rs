//! Shared node state

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use sk_core::config::NodeConfig;
use sk_core::ipc::{NodeEvent, NodeStatus, PeerInfo};
use sk_core::ports::PortOutcome;
use sk_core::time::current_time_millis;
use sk_core::types::{MachineDescriptor, MachineId, MachineStatus};
use sk_protocol::{MachineAdvert, ServiceEndpoint};

use crate::identity::{AdvertSource, LocalIdentity};
use crate::link::LinkPool;
use crate::ports::PortRegistry;
use crate::registry::{MachineRegistry, PeerChange, Upserted};

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 256;

/// Global state for the node daemon
pub struct NodeState {
    /// Configuration
    pub config: NodeConfig,
    /// Who we are
    pub identity: LocalIdentity,
    /// Known machines
    pub registry: Arc<MachineRegistry>,
    /// Cluster links
    pub links: Arc<LinkPool>,
    /// Local port table
    pub ports: Arc<PortRegistry>,
    events: broadcast::Sender<NodeEvent>,
    started_at: Instant,
}

impl NodeState {
    /// Create node state with a live port registry
    pub fn new(config: NodeConfig) -> Self {
        let ports = PortRegistry::new(&config.ports);
        Self::with_ports(config, ports)
    }

    /// Create node state around an existing port registry
    pub fn with_ports(config: NodeConfig, ports: PortRegistry) -> Self {
        let identity = LocalIdentity::from_config(&config);
        let local = MachineDescriptor::from_advert(identity.current_advert(), current_time_millis());
        let registry = MachineRegistry::new(local, config.discovery.silence_window);
        let links = LinkPool::new(identity.machine_id.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            identity,
            registry: Arc::new(registry),
            links: Arc::new(links),
            ports: Arc::new(ports),
            events,
            started_at: Instant::now(),
        }
    }

    pub fn local_id(&self) -> &MachineId {
        &self.identity.machine_id
    }

    /// Publish an event to every subscriber. Having none is fine.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Rewrite our own registry entry after the advert changed
    pub fn refresh_local(&self) {
        let local = MachineDescriptor::from_advert(self.current_advert(), current_time_millis());
        self.registry.update_local(local);
    }

    /// Record what a peer says about itself, from a beacon or registration
    pub fn observe_peer(&self, advert: MachineAdvert, seen_at: u64) -> Upserted {
        let upserted = self
            .registry
            .upsert(MachineDescriptor::from_advert(advert, seen_at));
        let id = &upserted.descriptor.machine_id;

        if let Some(detail) = &upserted.anomaly {
            tracing::warn!(machine_id = %id, "Machine identity changed: {}", detail);
            self.publish(NodeEvent::PeerAnomaly {
                machine_id: id.0.clone(),
                detail: detail.clone(),
            });
        }

        match upserted.change {
            PeerChange::Inserted | PeerChange::Revived => {
                tracing::info!(
                    machine_id = %id,
                    hostname = %upserted.descriptor.hostname,
                    address = %upserted.descriptor.primary_ip,
                    "Peer discovered"
                );
                self.publish(NodeEvent::PeerDiscovered(
                    self.peer_info(upserted.descriptor.clone()),
                ));
            }
            PeerChange::Refreshed => {
                tracing::trace!(machine_id = %id, "Peer refreshed");
            }
        }

        upserted
    }

    /// Mark silent machines offline and announce each one
    pub fn expire_stale(&self, now: u64) -> Vec<MachineId> {
        let expired = self.registry.expire_stale(now);
        for id in &expired {
            tracing::info!(machine_id = %id, "Peer went offline");
            self.publish(NodeEvent::PeerOffline {
                machine_id: id.0.clone(),
            });
        }
        expired
    }

    pub fn peer_info(&self, descriptor: MachineDescriptor) -> PeerInfo {
        let is_local = &descriptor.machine_id == self.local_id();
        let link_state = self.links.best_state_for(&descriptor.machine_id);
        PeerInfo {
            descriptor,
            link_state,
            is_local,
        }
    }

    /// Online and degraded machines, ourselves included
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.registry
            .list_online()
            .into_iter()
            .map(|d| self.peer_info(d))
            .collect()
    }

    pub fn get_peer(&self, machine_id: &MachineId) -> Option<PeerInfo> {
        self.registry.get(machine_id).map(|d| self.peer_info(d))
    }

    /// Port a service named `service` listens on here
    pub fn lookup_service(&self, service: &str) -> Option<u16> {
        self.identity
            .services
            .iter()
            .find(|s| s.name == service)
            .map(|s| s.port)
            .or_else(|| self.ports.lookup_service(service))
    }

    /// Claim a port and advertise the result
    pub fn claim_port(&self, port: u16, service: &str, pid: Option<u32>) -> PortOutcome {
        let outcome = self.ports.claim_outcome(port, service, pid);
        if let Some(allocation) = &outcome.allocation {
            self.publish(NodeEvent::PortClaimed(allocation.clone()));
            self.refresh_local();
        }
        outcome
    }

    /// Release a port and stop advertising it
    pub fn release_port(&self, port: u16) -> PortOutcome {
        match self.ports.release(port) {
            Ok(released) => {
                self.publish(NodeEvent::PortReleased {
                    port,
                    service: released.service.clone(),
                });
                self.refresh_local();
                PortOutcome::ok(
                    port,
                    format!("Port {} released from {}", port, released.service),
                )
            }
            Err(e) => PortOutcome::rejected(port, e.to_string(), None),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Node and cluster summary
    pub fn status(&self) -> NodeStatus {
        let present: Vec<MachineDescriptor> = self.registry.list_online();
        let (cores, memory) = present
            .iter()
            .filter_map(|d| d.capabilities)
            .fold((0u64, 0u64), |(c, m), caps| {
                (c + caps.cpu_cores as u64, m + caps.memory_total_mb)
            });
        let ports = self.ports.status();

        NodeStatus {
            machine_id: self.local_id().0.clone(),
            hostname: self.identity.hostname.clone(),
            primary_ip: self.identity.primary_ip.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.uptime_secs(),
            beacon_port: self.config.discovery.beacon_port,
            cluster_port: self.identity.cluster_port(),
            peers_online: self.registry.remote_online_count(),
            peers_total: self.registry.remote_count(),
            links: self.links.counts(),
            cluster_cpu_cores: cores,
            cluster_memory_mb: memory,
            reserved_ports: ports.reserved.len(),
            active_claims: ports.active.len(),
        }
    }
}

impl AdvertSource for NodeState {
    /// Static services first, then active claims under names not already
    /// taken
    fn current_advert(&self) -> MachineAdvert {
        let mut advert = self.identity.current_advert();
        advert.services.extend(
            self.ports
                .active_claims()
                .into_iter()
                .map(|a| ServiceEndpoint::new(a.service, a.port)),
        );
        advert.dedup_services();
        advert
    }
}

/// Whether a machine can still be dialed
pub fn is_reachable(descriptor: &MachineDescriptor) -> bool {
    descriptor.status != MachineStatus::Offline && descriptor.cluster_port != 0
}
