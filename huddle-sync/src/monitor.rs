//! Peer link quality monitor.
//!
//! Periodically samples the connection statistics of every registered peer
//! and classifies each link as direct or relayed.
//!
//! ```text
//!  stopped ──start()──► running ──stop()──► stopped
//!                          │
//!                every `interval`:
//!                          ▼
//!      registry.peers() ──► stats() per peer (concurrent, timed out)
//!                          │ join all
//!                          ▼
//!             classify ──► swap status map (unless stopped meanwhile)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::peers::{CandidateType, PeerConnection, PeerId, PeerRegistry, StatsRecord};

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between inspection cycles
    pub interval: Duration,
    /// Per-peer budget for one stats query
    pub sample_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            sample_timeout: Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(20),
            sample_timeout: Duration::from_millis(50),
        }
    }
}

/// Whether a link's path traverses a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Direct,
    Relayed,
    Unknown,
}

/// Classification of one peer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLinkStatus {
    pub connection_type: ConnectionType,
    /// Local candidate type that produced the classification
    pub candidate_type: Option<CandidateType>,
    /// Relay/STUN server, or the local candidate address
    pub server: Option<String>,
}

impl PeerLinkStatus {
    pub fn unknown() -> Self {
        Self {
            connection_type: ConnectionType::Unknown,
            candidate_type: None,
            server: None,
        }
    }

    /// Human-readable label for diagnostics panels.
    pub fn label(&self) -> &'static str {
        match self.candidate_type {
            Some(CandidateType::Relay) => "TURN (relay)",
            Some(CandidateType::Srflx) => "STUN (srflx)",
            Some(CandidateType::Prflx) => "peer reflexive",
            Some(CandidateType::Host) => "host",
            Some(CandidateType::Unknown) | None => "unknown",
        }
    }
}

impl fmt::Display for PeerLinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(f, "{} via {server}", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

/// Classify a link from its statistics report.
///
/// The active pair is the first one that `succeeded` or is `selected`. Its
/// local candidate decides the connection type; the server is the pair's
/// `url`, else the local candidate's `address`, else its `ip`.
pub fn classify(records: &[StatsRecord]) -> PeerLinkStatus {
    let Some(pair) = records.iter().find_map(|record| match record {
        StatsRecord::CandidatePair(pair) if pair.is_active() => Some(pair),
        _ => None,
    }) else {
        return PeerLinkStatus::unknown();
    };

    let local = pair.local_candidate_id.as_deref().and_then(|local_id| {
        records.iter().find_map(|record| match record {
            StatsRecord::LocalCandidate(candidate) if candidate.id == local_id => Some(candidate),
            _ => None,
        })
    });

    let candidate_type = local.and_then(|candidate| candidate.candidate_type);
    let connection_type = match candidate_type {
        Some(CandidateType::Relay) => ConnectionType::Relayed,
        Some(CandidateType::Srflx | CandidateType::Prflx | CandidateType::Host) => {
            ConnectionType::Direct
        }
        Some(CandidateType::Unknown) | None => ConnectionType::Unknown,
    };
    let server = pair.url.clone().or_else(|| {
        local.and_then(|candidate| candidate.address.clone().or_else(|| candidate.ip.clone()))
    });

    PeerLinkStatus {
        connection_type,
        candidate_type,
        server,
    }
}

/// Snapshot of every peer's classification.
pub type StatusMap = BTreeMap<PeerId, PeerLinkStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Everything one cycle needs, cloneable into the background task.
#[derive(Clone)]
struct Sampler {
    registry: Arc<dyn PeerRegistry>,
    sample_timeout: Duration,
    statuses: Arc<RwLock<Arc<StatusMap>>>,
    /// Bumped by start/stop; a cycle publishes only if it is unchanged
    generation: Arc<AtomicU64>,
    cycles: Arc<AtomicU64>,
}

impl Sampler {
    async fn sample(&self, peer_id: PeerId, connection: Arc<dyn PeerConnection>) -> (PeerId, PeerLinkStatus) {
        let status = match tokio::time::timeout(self.sample_timeout, connection.stats()).await {
            Ok(Ok(records)) => classify(&records),
            Ok(Err(e)) => {
                log::warn!("Stats for peer {peer_id} unavailable: {e}");
                PeerLinkStatus::unknown()
            }
            Err(_) => {
                log::warn!(
                    "Stats for peer {peer_id} timed out after {:?}",
                    self.sample_timeout
                );
                PeerLinkStatus::unknown()
            }
        };
        (peer_id, status)
    }

    /// Invalidate in-flight cycles. Taken under the statuses lock so a cycle
    /// that already passed its generation check finishes publishing first.
    fn advance_generation(&self) {
        let _statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Run one cycle. Returns the new map, or `None` if the monitor was
    /// started or stopped while the cycle was in flight.
    async fn run_cycle(&self) -> Option<Arc<StatusMap>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let jobs = self
            .registry
            .peers()
            .into_iter()
            .map(|(peer_id, connection)| self.sample(peer_id, connection));
        let statuses: StatusMap = join_all(jobs).await.into_iter().collect();
        let statuses = Arc::new(statuses);

        let mut current = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        if self.generation.load(Ordering::SeqCst) != generation {
            log::debug!("Discarding link statuses from a superseded cycle");
            return None;
        }
        *current = statuses.clone();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        Some(statuses)
    }
}

/// Periodic peer link inspector.
pub struct PeerLinkMonitor {
    sampler: Sampler,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLinkMonitor {
    pub fn new(registry: Arc<dyn PeerRegistry>, config: MonitorConfig) -> Self {
        Self {
            sampler: Sampler {
                registry,
                sample_timeout: config.sample_timeout,
                statuses: Arc::new(RwLock::new(Arc::new(StatusMap::new()))),
                generation: Arc::new(AtomicU64::new(0)),
                cycles: Arc::new(AtomicU64::new(0)),
            },
            interval: config.interval,
            task: Mutex::new(None),
        }
    }

    /// Start periodic inspection. The first cycle runs immediately. Calling
    /// `start` while running restarts the schedule.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = task.take() {
            previous.abort();
        }
        self.sampler.advance_generation();

        let sampler = self.sampler.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sampler.run_cycle().await;
            }
        }));
        log::debug!("Peer link monitor started ({:?} interval)", self.interval);
    }

    /// Stop inspection. Results of a cycle already in flight are discarded.
    pub fn stop(&self) {
        self.sampler.advance_generation();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            log::debug!("Peer link monitor stopped");
        }
    }

    pub fn state(&self) -> MonitorState {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        match task.as_ref() {
            Some(handle) if !handle.is_finished() => MonitorState::Running,
            _ => MonitorState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    /// Run a single cycle now and return its result. Returns the previous
    /// map unchanged if `start`/`stop` superseded the cycle.
    pub async fn inspect_once(&self) -> Arc<StatusMap> {
        match self.sampler.run_cycle().await {
            Some(statuses) => statuses,
            None => self.snapshot(),
        }
    }

    /// Copy of the most recent cycle's results.
    pub fn statuses(&self) -> StatusMap {
        self.snapshot().as_ref().clone()
    }

    pub fn status(&self, peer_id: &str) -> Option<PeerLinkStatus> {
        self.snapshot().get(peer_id).cloned()
    }

    /// Number of cycles whose results were published.
    pub fn completed_cycles(&self) -> u64 {
        self.sampler.cycles.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> Arc<StatusMap> {
        self.sampler
            .statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for PeerLinkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
