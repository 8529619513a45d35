//! Link pool
//!
//! Every link, from the moment it starts connecting until its task exits,
//! has a handle here. The pool also owns the duplicate-connection
//! tie-break: at most one established link per peer machine.

use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use sk_core::error::LinkError;
use sk_core::ipc::{LinkCounts, LinkInfo};
use sk_core::time::current_time_millis;
use sk_core::types::{LinkDirection, LinkState, MachineId};
use sk_protocol::ClusterMessage;

/// Process-local link identifier
pub type LinkId = u64;

/// Outbound queue depth per link
const COMMAND_CAPACITY: usize = 64;

/// Work handed to a running link task
#[derive(Debug)]
pub enum LinkCommand {
    /// Write a message to the peer
    Send(ClusterMessage),
    /// Measure round-trip time
    Ping,
}

/// Why a link closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local shutdown
    Shutdown,
    /// Lost the duplicate-connection tie-break
    Duplicate,
    /// Dialed ourselves
    SelfConnection,
    /// Socket error or EOF
    Transport(String),
    /// Handshake failed or timed out
    Handshake(String),
    /// Peer sent something unusable
    Protocol(String),
}

impl CloseReason {
    /// Intentional closes never trigger a reconnect
    pub fn is_intentional(&self) -> bool {
        matches!(
            self,
            CloseReason::Shutdown | CloseReason::Duplicate | CloseReason::SelfConnection
        )
    }
}

impl From<LinkError> for CloseReason {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::SelfConnection => CloseReason::SelfConnection,
            LinkError::Closed => CloseReason::Shutdown,
            LinkError::HandshakeTimeout(_)
            | LinkError::HandshakeFailed(_)
            | LinkError::UnexpectedPeer { .. } => CloseReason::Handshake(e.to_string()),
            LinkError::ConnectionRefused(_)
            | LinkError::ConnectTimeout(_)
            | LinkError::ConnectionLost(_)
            | LinkError::NoLink(_) => CloseReason::Transport(e.to_string()),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Duplicate => write!(f, "duplicate connection"),
            CloseReason::SelfConnection => write!(f, "connected to self"),
            CloseReason::Transport(e) => write!(f, "transport: {}", e),
            CloseReason::Handshake(e) => write!(f, "handshake: {}", e),
            CloseReason::Protocol(e) => write!(f, "protocol: {}", e),
        }
    }
}

/// Shared handle to one link task
pub struct LinkHandle {
    pub id: LinkId,
    pub direction: LinkDirection,
    pub remote_addr: String,
    /// Who we meant to reach, for outbound links
    expected_peer: Option<MachineId>,
    /// Who the handshake says is on the other end
    peer: OnceLock<MachineId>,
    state: watch::Sender<LinkState>,
    commands: mpsc::Sender<LinkCommand>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    /// Unix millis, 0 until established
    established_at: AtomicU64,
    /// Last ping round trip, u64::MAX until measured
    rtt_ms: AtomicU64,
}

impl LinkHandle {
    fn new(
        id: LinkId,
        direction: LinkDirection,
        remote_addr: String,
        expected_peer: Option<MachineId>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<LinkCommand>) {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state, _) = watch::channel(LinkState::Disconnected);
        let handle = Self {
            id,
            direction,
            remote_addr,
            expected_peer,
            peer: OnceLock::new(),
            state,
            commands,
            cancel,
            close_reason: Mutex::new(None),
            established_at: AtomicU64::new(0),
            rtt_ms: AtomicU64::new(u64::MAX),
        };
        handle.set_state(LinkState::Connecting);
        (handle, rx)
    }

    /// Confirmed peer, else the one we dialed
    pub fn peer_id(&self) -> Option<&MachineId> {
        self.peer.get().or(self.expected_peer.as_ref())
    }

    pub fn expected_peer(&self) -> Option<&MachineId> {
        self.expected_peer.as_ref()
    }

    /// Record the peer named by the handshake. Only the first call counts.
    pub fn confirm_peer(&self, peer: MachineId) {
        let _ = self.peer.set(peer);
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Move to `next` if the state machine allows it
    pub fn set_state(&self, next: LinkState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed && next == LinkState::Established && self.established_at().is_none() {
            self.established_at
                .store(current_time_millis(), Ordering::Relaxed);
        }
        changed
    }

    pub fn established_at(&self) -> Option<u64> {
        match self.established_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        match self.rtt_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            rtt => Some(rtt),
        }
    }

    pub fn record_rtt(&self, rtt_ms: u64) {
        self.rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    /// Queue a message for the peer. Order is preserved per link.
    pub async fn send(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Ask the link task to stop. The first reason given wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// Reason passed to `close`, if any
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            link_id: self.id,
            machine_id: self.peer_id().map(|id| id.0.clone()),
            remote_addr: self.remote_addr.clone(),
            direction: self.direction,
            state: self.state(),
            established_at: self.established_at(),
            rtt_ms: self.rtt_ms(),
        }
    }
}

/// All links of this node
pub struct LinkPool {
    local_id: MachineId,
    next_id: AtomicU64,
    links: DashMap<LinkId, Arc<LinkHandle>>,
    /// The surviving established link per peer
    established: Mutex<HashMap<MachineId, LinkId>>,
}

impl LinkPool {
    pub fn new(local_id: MachineId) -> Self {
        Self {
            local_id,
            next_id: AtomicU64::new(1),
            links: DashMap::new(),
            established: Mutex::new(HashMap::new()),
        }
    }

    /// Create a handle in `Connecting`. Its token is a child of `parent`,
    /// so cancelling the parent closes every link.
    pub fn register(
        &self,
        direction: LinkDirection,
        remote_addr: String,
        expected_peer: Option<MachineId>,
        parent: &CancellationToken,
    ) -> (Arc<LinkHandle>, mpsc::Receiver<LinkCommand>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) =
            LinkHandle::new(id, direction, remote_addr, expected_peer, parent.child_token());
        let handle = Arc::new(handle);
        self.links.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Direction whose link survives a duplicate with `peer`.
    ///
    /// The lower machine id's outbound connection wins. Both ends compute
    /// the same answer: from the lower side it is our outbound link, from
    /// the higher side it is our inbound one.
    pub fn preferred_direction(&self, peer: &MachineId) -> LinkDirection {
        match self.local_id.cmp(peer) {
            CmpOrdering::Less => LinkDirection::Outbound,
            _ => LinkDirection::Inbound,
        }
    }

    /// Promote a link whose handshake completed to `Established`, applying
    /// the tie-break against any other open link to the same peer.
    ///
    /// On `Err` the caller must close its link with the returned reason.
    pub fn promote(&self, handle: &Arc<LinkHandle>, peer: &MachineId) -> Result<(), CloseReason> {
        if peer == &self.local_id {
            return Err(CloseReason::SelfConnection);
        }

        let mut established = self.established.lock().unwrap_or_else(|e| e.into_inner());

        let rival = established
            .get(peer)
            .filter(|id| **id != handle.id)
            .and_then(|id| self.get(*id))
            .filter(|rival| rival.state().is_open());

        if let Some(rival) = rival {
            let keep_new = rival.direction != handle.direction
                && handle.direction == self.preferred_direction(peer);
            if !keep_new {
                tracing::debug!(
                    link_id = handle.id,
                    kept = rival.id,
                    peer = %peer,
                    "Duplicate link loses tie-break"
                );
                return Err(CloseReason::Duplicate);
            }
            tracing::debug!(
                link_id = handle.id,
                replaced = rival.id,
                peer = %peer,
                "Duplicate link wins tie-break"
            );
            rival.close(CloseReason::Duplicate);
        }

        if !handle.set_state(LinkState::Established) {
            return Err(CloseReason::Handshake(format!(
                "cannot establish from {}",
                handle.state()
            )));
        }
        established.insert(peer.clone(), handle.id);
        Ok(())
    }

    pub fn get(&self, id: LinkId) -> Option<Arc<LinkHandle>> {
        self.links.get(&id).map(|r| Arc::clone(&r))
    }

    /// Forget a link whose task has exited
    pub fn remove(&self, id: LinkId) -> Option<Arc<LinkHandle>> {
        let removed = self.links.remove(&id).map(|(_, h)| h);
        if let Some(handle) = &removed {
            if let Some(peer) = handle.peer_id() {
                let mut established = self.established.lock().unwrap_or_else(|e| e.into_inner());
                if established.get(peer) == Some(&id) {
                    established.remove(peer);
                }
            }
        }
        removed
    }

    /// Any connecting, handshaking or open link to `peer`
    pub fn live_link_for(&self, peer: &MachineId) -> Option<Arc<LinkHandle>> {
        self.links
            .iter()
            .find(|r| r.peer_id() == Some(peer) && r.state().is_live())
            .map(|r| Arc::clone(&r))
    }

    /// The surviving established (or degraded) link to `peer`
    pub fn established_for(&self, peer: &MachineId) -> Option<Arc<LinkHandle>> {
        let id = *self
            .established
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)?;
        self.get(id).filter(|h| h.state().is_open())
    }

    /// Most advanced state among links to `peer`
    pub fn best_state_for(&self, peer: &MachineId) -> LinkState {
        fn rank(state: LinkState) -> u8 {
            match state {
                LinkState::Established => 5,
                LinkState::Degraded => 4,
                LinkState::HandshakePending => 3,
                LinkState::Connecting => 2,
                LinkState::Disconnected => 1,
                LinkState::Closed => 0,
            }
        }

        self.links
            .iter()
            .filter(|r| r.peer_id() == Some(peer))
            .map(|r| r.state())
            .max_by_key(|s| rank(*s))
            .filter(|s| *s != LinkState::Closed)
            .unwrap_or(LinkState::Disconnected)
    }

    /// Every open link, one per peer
    pub fn open_links(&self) -> Vec<Arc<LinkHandle>> {
        let ids: Vec<LinkId> = self
            .established
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .copied()
            .collect();
        ids.into_iter()
            .filter_map(|id| self.get(id))
            .filter(|h| h.state().is_open())
            .collect()
    }

    /// Snapshot of every link, by id
    pub fn list(&self) -> Vec<LinkInfo> {
        let mut links: Vec<LinkInfo> = self.links.iter().map(|r| r.info()).collect();
        links.sort_by_key(|l| l.link_id);
        links
    }

    pub fn counts(&self) -> LinkCounts {
        let mut counts = LinkCounts::default();
        for link in self.links.iter() {
            counts.record(link.state());
        }
        counts
    }

    /// Close every link
    pub fn close_all(&self, reason: CloseReason) {
        for link in self.links.iter() {
            link.close(reason.clone());
        }
    }

    /// Drop every handle, e.g. after link tasks were aborted
    pub fn clear(&self) {
        self.links.clear();
        self.established
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
