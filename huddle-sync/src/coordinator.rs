//! Wires a replicated document to a broadcast topic.
//!
//! ```text
//!            local mutation                         frame from topic
//!                  │                                       │
//!   listener (Local only) ──► outbound queue     inbound task ──► decode envelope
//!                                   │                      │  drop own origin
//!                            outbound task                 ├─ Update/StateResponse ─► apply_remote
//!                                   │                      └─ StateRequest ─► answer with diff,
//!                                   ▼                                         request if behind
//!                        publish(Update envelope)
//! ```
//!
//! Fragments received from peers are applied with the `Remote` origin, so the
//! listener never sends them back out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::codec::{CodecError, Envelope, EnvelopeKind, UpdateFragment};
use crate::document::{ChangeOrigin, ChangeSubscription, DocumentError, ReplicatedDocument};
use crate::transport::{topic_for_room, BroadcastTransport, Frame, TopicSubscription, TransportError};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Publish a state request this often; `None` disables periodic resync
    pub resync_interval: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            resync_interval: Some(Duration::from_secs(30)),
        }
    }
}

impl CoordinatorConfig {
    pub fn for_testing() -> Self {
        Self {
            resync_interval: None,
        }
    }
}

/// Counters describing what the coordinator has done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub fragments_published: u64,
    pub publish_failures: u64,
    pub frames_received: u64,
    pub fragments_applied: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub own_echoes: u64,
    pub state_requests_sent: u64,
    pub state_responses_sent: u64,
}

#[derive(Default)]
struct AtomicSyncStats {
    fragments_published: AtomicU64,
    publish_failures: AtomicU64,
    frames_received: AtomicU64,
    fragments_applied: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    own_echoes: AtomicU64,
    state_requests_sent: AtomicU64,
    state_responses_sent: AtomicU64,
}

impl AtomicSyncStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            fragments_published: self.fragments_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            fragments_applied: self.fragments_applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            own_echoes: self.own_echoes.load(Ordering::Relaxed),
            state_requests_sent: self.state_requests_sent.load(Ordering::Relaxed),
            state_responses_sent: self.state_responses_sent.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the coordinator handle and its tasks.
struct Shared {
    topic: String,
    replica_id: Uuid,
    document: Arc<ReplicatedDocument>,
    transport: Arc<dyn BroadcastTransport>,
    stats: AtomicSyncStats,
    needs_resync: AtomicBool,
}

impl Shared {
    async fn publish(&self, envelope: Envelope) -> Result<(), SyncError> {
        let bytes = envelope.encode()?;
        match self.transport.publish(&self.topic, bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                AtomicSyncStats::bump(&self.stats.publish_failures);
                self.needs_resync.store(true, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    async fn publish_update(&self, fragment: UpdateFragment) {
        match self.publish(Envelope::update(self.replica_id, &fragment)).await {
            Ok(()) => AtomicSyncStats::bump(&self.stats.fragments_published),
            Err(e) => log::warn!(
                "Publishing {}-byte fragment on {} failed, resync pending: {e}",
                fragment.len(),
                self.topic
            ),
        }
    }

    async fn request_state(&self) -> Result<(), SyncError> {
        let envelope = Envelope::state_request(self.replica_id, self.document.encoded_state_vector());
        self.publish(envelope).await?;
        AtomicSyncStats::bump(&self.stats.state_requests_sent);
        self.needs_resync.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_frame(&self, frame: Frame) {
        AtomicSyncStats::bump(&self.stats.frames_received);

        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                AtomicSyncStats::bump(&self.stats.malformed);
                log::warn!("Skipping undecodable frame on {}: {e}", self.topic);
                return;
            }
        };
        if envelope.origin == self.replica_id {
            AtomicSyncStats::bump(&self.stats.own_echoes);
            return;
        }

        match envelope.kind {
            EnvelopeKind::Update | EnvelopeKind::StateResponse => {
                match self.document.apply_remote(&envelope.payload) {
                    Ok(true) => AtomicSyncStats::bump(&self.stats.fragments_applied),
                    Ok(false) => AtomicSyncStats::bump(&self.stats.duplicates),
                    Err(e) => {
                        AtomicSyncStats::bump(&self.stats.malformed);
                        log::warn!(
                            "Skipping malformed fragment from {} on {}: {e}",
                            envelope.origin,
                            self.topic
                        );
                    }
                }
            }
            EnvelopeKind::StateRequest => self.answer_state_request(&envelope).await,
        }
    }

    async fn answer_state_request(&self, request: &Envelope) {
        match self.document.missing_updates(&request.payload) {
            Ok(Some(diff)) => {
                match self.publish(Envelope::state_response(self.replica_id, &diff)).await {
                    Ok(()) => AtomicSyncStats::bump(&self.stats.state_responses_sent),
                    Err(e) => log::warn!("Answering state request on {} failed: {e}", self.topic),
                }
            }
            Ok(None) => {}
            Err(e) => {
                AtomicSyncStats::bump(&self.stats.malformed);
                log::warn!("Ignoring state request from {} with bad state vector: {e}", request.origin);
                return;
            }
        }

        if let Ok(true) = self.document.is_behind(&request.payload) {
            log::debug!("Replica {} is ahead of us on {}; requesting state", request.origin, self.topic);
            if let Err(e) = self.request_state().await {
                log::warn!("State request on {} failed: {e}", self.topic);
            }
        }
    }
}

/// Keeps one room's document in sync with its topic.
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    listener: Option<ChangeSubscription>,
    inbound: Option<JoinHandle<()>>,
    outbound: Option<JoinHandle<()>>,
    resync: Option<JoinHandle<()>>,
}

impl SyncCoordinator {
    /// Subscribe to the room topic, start publishing local changes and ask
    /// peers for anything we are missing.
    ///
    /// Fails with [`SyncError::Transport`] when the topic cannot be
    /// subscribed; nothing is left running in that case.
    pub async fn start(
        room_id: &str,
        document: Arc<ReplicatedDocument>,
        transport: Arc<dyn BroadcastTransport>,
        config: CoordinatorConfig,
    ) -> Result<Self, SyncError> {
        let topic = topic_for_room(room_id)?;
        let subscription = transport.subscribe(&topic).await?;

        let shared = Arc::new(Shared {
            topic,
            replica_id: Uuid::new_v4(),
            document,
            transport,
            stats: AtomicSyncStats::default(),
            needs_resync: AtomicBool::new(false),
        });

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<UpdateFragment>();
        let listener = shared.document.subscribe(move |event| {
            if event.origin == ChangeOrigin::Local {
                let _ = outbound_tx.send(event.update.clone());
            }
        });

        let outbound = tokio::spawn(run_outbound(shared.clone(), outbound_rx));
        let inbound = tokio::spawn(run_inbound(shared.clone(), subscription));

        if let Err(e) = shared.request_state().await {
            log::warn!("Initial state request on {} failed: {e}", shared.topic);
        }

        let resync = config
            .resync_interval
            .map(|period| tokio::spawn(run_resync(shared.clone(), period)));

        log::info!("Sync started on {} as replica {}", shared.topic, shared.replica_id);
        Ok(Self {
            shared,
            listener: Some(listener),
            inbound: Some(inbound),
            outbound: Some(outbound),
            resync,
        })
    }

    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Envelope origin id of this coordinator.
    pub fn replica_id(&self) -> Uuid {
        self.shared.replica_id
    }

    pub fn stats(&self) -> SyncStats {
        self.shared.stats.snapshot()
    }

    /// Whether a publish failed since the last successful state request.
    pub fn needs_resync(&self) -> bool {
        self.shared.needs_resync.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inbound.is_some()
    }

    /// Publish a state request now.
    pub async fn resync(&self) -> Result<(), SyncError> {
        if !self.is_running() {
            return Err(SyncError::Stopped);
        }
        self.shared.request_state().await
    }

    /// Tear down: release the topic subscription, then the document listener,
    /// then flush fragments already queued for publishing. No callbacks run
    /// after this returns. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(inbound) = self.inbound.take() {
            inbound.abort();
            let _ = inbound.await;
        }
        // Dropping the listener drops the queue's only sender.
        drop(self.listener.take());
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.await;
        }
        if let Some(resync) = self.resync.take() {
            resync.abort();
            let _ = resync.await;
        }
        log::info!("Sync stopped on {}", self.shared.topic);
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(inbound) = self.inbound.take() {
            inbound.abort();
        }
        drop(self.listener.take());
        if let Some(resync) = self.resync.take() {
            resync.abort();
        }
    }
}

async fn run_inbound(shared: Arc<Shared>, mut subscription: TopicSubscription) {
    while let Some(frame) = subscription.recv().await {
        shared.handle_frame(frame).await;
    }
    log::warn!("Subscription to {} closed by transport", shared.topic);
}

async fn run_outbound(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<UpdateFragment>) {
    while let Some(fragment) = queue.recv().await {
        shared.publish_update(fragment).await;
    }
}

async fn run_resync(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = shared.request_state().await {
            log::debug!("Periodic resync on {} failed: {e}", shared.topic);
        }
    }
}

/// Coordinator errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("coordinator is stopped")]
    Stopped,
}

impl SyncError {
    /// Whether the mesh could not be reached.
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self, SyncError::Transport(e) if e.is_unavailable())
    }
}
