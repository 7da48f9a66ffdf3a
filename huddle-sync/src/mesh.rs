//! In-process peer mesh with fault injection.
//!
//! Every [`MeshNode`] is one peer. Publishing fans a frame out to every other
//! reachable node subscribed to the topic, sharing one `Arc` payload across
//! receivers. The mesh can drop a node off the network, cut individual links,
//! deliver every frame twice, and hand out per-link statistics profiles so the
//! link monitor can be exercised without a real WebRTC stack.
//!
//! ```text
//!   MeshNode(a) ──publish──► Mesh ──► [reachable? subscribed?] ──► FrameSink(b)
//!                                                             └──► FrameSink(c)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::peers::{
    CandidatePairState, CandidatePairStats, CandidateStats, CandidateType, PeerConnection,
    PeerId, PeerRegistry, PeerStatsError, StatsRecord,
};
use crate::transport::{
    BroadcastTransport, Delivery, FrameSink, TopicSubscription, TransportError,
    DEFAULT_SUBSCRIPTION_CAPACITY,
};

/// Statistics for monitoring mesh health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub frames_published: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub active_nodes: usize,
}

/// Path a link reports through its statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkProfile {
    /// Direct LAN path
    Host { address: String },
    /// Direct path through NAT, learned via STUN
    ServerReflexive { address: String, url: String },
    /// Path through a TURN relay
    Relayed { url: String },
    /// Stats queries fail
    Failing,
    /// Stats queries never answer within `delay`
    Slow { delay: Duration },
}

impl Default for LinkProfile {
    fn default() -> Self {
        LinkProfile::Host {
            address: "192.168.1.10".to_string(),
        }
    }
}

impl LinkProfile {
    /// Stats report a browser would produce for this path.
    pub fn report(&self) -> Vec<StatsRecord> {
        let (candidate_type, address, url) = match self {
            LinkProfile::Host { address } => (CandidateType::Host, Some(address.clone()), None),
            LinkProfile::ServerReflexive { address, url } => {
                (CandidateType::Srflx, Some(address.clone()), Some(url.clone()))
            }
            LinkProfile::Relayed { url } => (CandidateType::Relay, None, Some(url.clone())),
            LinkProfile::Failing | LinkProfile::Slow { .. } => return Vec::new(),
        };

        vec![
            StatsRecord::CandidatePair(CandidatePairStats {
                id: "CP-mesh".to_string(),
                state: Some(CandidatePairState::Succeeded),
                selected: Some(true),
                local_candidate_id: Some("L-mesh".to_string()),
                remote_candidate_id: Some("R-mesh".to_string()),
                url,
            }),
            StatsRecord::LocalCandidate(CandidateStats {
                id: "L-mesh".to_string(),
                candidate_type: Some(candidate_type),
                address,
                ..CandidateStats::default()
            }),
            StatsRecord::RemoteCandidate(CandidateStats {
                id: "R-mesh".to_string(),
                candidate_type: Some(CandidateType::Host),
                ..CandidateStats::default()
            }),
        ]
    }
}

struct AtomicMeshStats {
    frames_published: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Subscriber {
    id: u64,
    sink: FrameSink,
}

struct NodeState {
    online: AtomicBool,
    subscriptions: RwLock<HashMap<String, Vec<Subscriber>>>,
}

struct MeshInner {
    nodes: RwLock<HashMap<PeerId, Arc<NodeState>>>,
    /// Unordered pairs whose link is cut
    cut_links: RwLock<HashSet<(PeerId, PeerId)>>,
    profiles: RwLock<HashMap<(PeerId, PeerId), LinkProfile>>,
    duplicate_delivery: AtomicBool,
    next_subscription: AtomicU64,
    capacity: usize,
    stats: AtomicMeshStats,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn link_key(a: &str, b: &str) -> (PeerId, PeerId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl MeshInner {
    fn reachable(&self, from: &str, to: &str) -> bool {
        !read(&self.cut_links).contains(&link_key(from, to))
    }
}

/// Shared in-process network. Cloning yields another handle to the same mesh.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// `capacity` frames are buffered per subscription before lagging
    /// subscribers start dropping.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MeshInner {
                nodes: RwLock::new(HashMap::new()),
                cut_links: RwLock::new(HashSet::new()),
                profiles: RwLock::new(HashMap::new()),
                duplicate_delivery: AtomicBool::new(false),
                next_subscription: AtomicU64::new(0),
                capacity,
                stats: AtomicMeshStats {
                    frames_published: AtomicU64::new(0),
                    frames_delivered: AtomicU64::new(0),
                    frames_dropped: AtomicU64::new(0),
                },
            }),
        }
    }

    /// Join the mesh as `peer_id`. Joining again with the same id returns a
    /// handle to the existing node.
    pub fn join(&self, peer_id: impl Into<PeerId>) -> MeshNode {
        let peer_id = peer_id.into();
        let state = {
            let mut nodes = write(&self.inner.nodes);
            nodes
                .entry(peer_id.clone())
                .or_insert_with(|| {
                    Arc::new(NodeState {
                        online: AtomicBool::new(true),
                        subscriptions: RwLock::new(HashMap::new()),
                    })
                })
                .clone()
        };
        log::debug!("Peer {peer_id} joined mesh");
        MeshNode {
            peer_id,
            mesh: self.inner.clone(),
            state,
        }
    }

    /// Remove a peer entirely; its subscriptions stop receiving.
    pub fn leave(&self, peer_id: &str) -> bool {
        let removed = write(&self.inner.nodes).remove(peer_id);
        match removed {
            Some(state) => {
                state.online.store(false, Ordering::SeqCst);
                write(&state.subscriptions).clear();
                log::debug!("Peer {peer_id} left mesh");
                true
            }
            None => false,
        }
    }

    /// Cut the link between two peers in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        write(&self.inner.cut_links).insert(link_key(a, b));
    }

    /// Restore a link cut by [`Mesh::partition`].
    pub fn heal(&self, a: &str, b: &str) {
        write(&self.inner.cut_links).remove(&link_key(a, b));
    }

    /// Deliver every frame twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Statistics profile `from` sees on its connection to `to`.
    pub fn set_link_profile(&self, from: &str, to: &str, profile: LinkProfile) {
        write(&self.inner.profiles).insert((from.to_string(), to.to_string()), profile);
    }

    pub fn node_count(&self) -> usize {
        read(&self.inner.nodes).len()
    }

    pub fn stats(&self) -> MeshStats {
        let stats = &self.inner.stats;
        MeshStats {
            frames_published: stats.frames_published.load(Ordering::Relaxed),
            frames_delivered: stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
            active_nodes: self.node_count(),
        }
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's handle onto the mesh.
#[derive(Clone)]
pub struct MeshNode {
    peer_id: PeerId,
    mesh: Arc<MeshInner>,
    state: Arc<NodeState>,
}

impl MeshNode {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Take this node off the network. Publish and subscribe fail with
    /// [`TransportError::Unavailable`] and nothing is delivered to it.
    pub fn disconnect(&self) {
        self.state.online.store(false, Ordering::SeqCst);
        log::debug!("Peer {} disconnected", self.peer_id);
    }

    pub fn reconnect(&self) {
        self.state.online.store(true, Ordering::SeqCst);
        log::debug!("Peer {} reconnected", self.peer_id);
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!(
                "peer {} is not connected to the mesh",
                self.peer_id
            )))
        }
    }

    /// Number of subscribers this node holds on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        read(&self.state.subscriptions)
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }
}

#[async_trait]
impl BroadcastTransport for MeshNode {
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_online()?;

        let frame = Arc::new(bytes);
        let copies = if self.mesh.duplicate_delivery.load(Ordering::Relaxed) {
            2
        } else {
            1
        };
        let targets: Vec<(PeerId, Arc<NodeState>)> = read(&self.mesh.nodes)
            .iter()
            .filter(|(peer_id, _)| **peer_id != self.peer_id)
            .map(|(peer_id, state)| (peer_id.clone(), state.clone()))
            .collect();

        let stats = &self.mesh.stats;
        stats.frames_published.fetch_add(1, Ordering::Relaxed);
        for (peer_id, state) in targets {
            if !state.online.load(Ordering::SeqCst) || !self.mesh.reachable(&self.peer_id, &peer_id) {
                continue;
            }
            let subscriptions = read(&state.subscriptions);
            let Some(subscribers) = subscriptions.get(topic) else {
                continue;
            };
            for subscriber in subscribers {
                for _ in 0..copies {
                    match subscriber.sink.deliver(frame.clone()) {
                        Delivery::Delivered => {
                            stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Delivery::Dropped | Delivery::Closed => {
                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicSubscription, TransportError> {
        self.ensure_online()?;

        let id = self.mesh.next_subscription.fetch_add(1, Ordering::Relaxed);
        let state = Arc::downgrade(&self.state);
        let release_topic = topic.to_string();
        let (sink, subscription) =
            TopicSubscription::channel(topic, self.mesh.capacity, move || {
                if let Some(state) = state.upgrade() {
                    let mut subscriptions = write(&state.subscriptions);
                    if let Some(subscribers) = subscriptions.get_mut(&release_topic) {
                        subscribers.retain(|s| s.id != id);
                        if subscribers.is_empty() {
                            subscriptions.remove(&release_topic);
                        }
                    }
                }
            });

        write(&self.state.subscriptions)
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        log::debug!("Peer {} subscribed to {topic}", self.peer_id);
        Ok(subscription)
    }
}

impl PeerRegistry for MeshNode {
    /// Other online nodes this node can currently reach.
    fn peers(&self) -> Vec<(PeerId, Arc<dyn PeerConnection>)> {
        if !self.is_online() {
            return Vec::new();
        }
        let profiles = read(&self.mesh.profiles);
        read(&self.mesh.nodes)
            .iter()
            .filter(|(peer_id, state)| {
                **peer_id != self.peer_id
                    && state.online.load(Ordering::SeqCst)
                    && self.mesh.reachable(&self.peer_id, peer_id)
            })
            .map(|(peer_id, state)| {
                let profile = profiles
                    .get(&(self.peer_id.clone(), peer_id.clone()))
                    .cloned()
                    .unwrap_or_default();
                let link: Arc<dyn PeerConnection> = Arc::new(MeshLink {
                    profile,
                    remote: Arc::downgrade(state),
                });
                (peer_id.clone(), link)
            })
            .collect()
    }
}

/// Connection handle for one mesh link.
pub struct MeshLink {
    profile: LinkProfile,
    remote: std::sync::Weak<NodeState>,
}

#[async_trait]
impl PeerConnection for MeshLink {
    async fn stats(&self) -> Result<Vec<StatsRecord>, PeerStatsError> {
        match &self.profile {
            LinkProfile::Failing => {
                return Err(PeerStatsError::Unavailable("link reports no stats".into()))
            }
            LinkProfile::Slow { delay } => {
                tokio::time::sleep(*delay).await;
            }
            _ => {}
        }
        match self.remote.upgrade() {
            Some(state) if state.online.load(Ordering::SeqCst) => Ok(self.profile.report()),
            _ => Err(PeerStatsError::Disconnected),
        }
    }
}
