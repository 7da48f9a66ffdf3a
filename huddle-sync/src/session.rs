//! Room session: one client's view of one room.
//!
//! ```text
//!                       RoomSession
//!   ┌──────────────────────────────────────────────────┐
//!   │  ReplicatedDocument ◄── restore ── RoomPersistence│
//!   │     │        │                        ▲           │
//!   │     │        └─ listener ─► writer task (append,  │
//!   │     │                        compact at threshold)│
//!   │     └── SyncCoordinator ◄──► BroadcastTransport   │
//!   │                                                   │
//!   │  PeerLinkMonitor (optional) ◄── PeerRegistry      │
//!   └──────────────────────────────────────────────────┘
//! ```
//!
//! A session survives transport and storage failures: it opens offline when
//! the topic cannot be subscribed, starts empty when the stored state cannot
//! be read, and keeps working in memory when writes fail.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::blob::{BlobError, BlobStore};
use crate::codec::UpdateFragment;
use crate::coordinator::{CoordinatorConfig, SyncCoordinator, SyncError, SyncStats};
use crate::document::{
    ChangeEvent, ChangeOrigin, ChangeSubscription, DocumentError, DocumentView, FileMeta, Message,
    ReplicatedDocument,
};
use crate::monitor::{MonitorConfig, PeerLinkMonitor, PeerLinkStatus, StatusMap};
use crate::peers::PeerRegistry;
use crate::persistence::{
    KeyValueStore, PersistenceError, RoomPersistence, DEFAULT_COMPACTION_THRESHOLD,
};
use crate::transport::BroadcastTransport;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room to join
    pub room_id: String,
    /// Author id stamped on local messages
    pub author_id: String,
    /// Display name stamped on local messages
    pub author_name: String,
    pub coordinator: CoordinatorConfig,
    pub monitor: MonitorConfig,
    /// Logged fragments after which the room is compacted into a snapshot
    pub compaction_threshold: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            room_id: String::new(),
            author_id: String::new(),
            author_name: String::new(),
            coordinator: CoordinatorConfig::default(),
            monitor: MonitorConfig::default(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl SessionConfig {
    pub fn new(
        room_id: impl Into<String>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            author_id: author_id.into(),
            author_name: author_name.into(),
            ..Self::default()
        }
    }

    /// No periodic resync, fast monitor.
    pub fn for_testing(
        room_id: impl Into<String>,
        author_id: impl Into<String>,
        author_name: impl Into<String>,
    ) -> Self {
        Self {
            coordinator: CoordinatorConfig::for_testing(),
            monitor: MonitorConfig::for_testing(),
            ..Self::new(room_id, author_id, author_name)
        }
    }
}

/// How the document was obtained when the session opened.
#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// No storage was given
    NotPersisted,
    /// Storage had nothing for this room
    Empty,
    Restored {
        from_snapshot: bool,
        replayed: usize,
        skipped: usize,
    },
    /// Stored state could not be read; the session started empty
    Failed(PersistenceError),
}

impl RestoreOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RestoreOutcome::Failed(_))
    }
}

type ErrorSlot = Arc<Mutex<Option<PersistenceError>>>;

/// Persistence side of a session: the adapter, the listener feeding it and
/// the task that writes.
struct PersistenceWriter {
    persistence: Arc<RoomPersistence>,
    listener: Option<ChangeSubscription>,
    task: Option<JoinHandle<()>>,
}

impl PersistenceWriter {
    fn start(
        persistence: Arc<RoomPersistence>,
        document: Arc<ReplicatedDocument>,
        errors: ErrorSlot,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<UpdateFragment>();
        let listener = document.subscribe(move |event| {
            if event.origin != ChangeOrigin::Restore {
                let _ = tx.send(event.update.clone());
            }
        });
        let task = tokio::spawn(run_writer(persistence.clone(), document, rx, errors));
        Self {
            persistence,
            listener: Some(listener),
            task: Some(task),
        }
    }

    /// Stop accepting fragments and wait for queued ones to be written.
    async fn drain(&mut self) {
        drop(self.listener.take());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_writer(
    persistence: Arc<RoomPersistence>,
    document: Arc<ReplicatedDocument>,
    mut queue: mpsc::UnboundedReceiver<UpdateFragment>,
    errors: ErrorSlot,
) {
    while let Some(fragment) = queue.recv().await {
        let result = persistence.append_update(&fragment).and_then(|_| {
            if persistence.needs_compaction() {
                persistence.save_snapshot(&document).map(|_| ())
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            log::error!("Persisting room {} failed: {e}", persistence.room_id());
            *errors.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
        }
    }
}

/// One client's membership in one room.
pub struct RoomSession {
    config: SessionConfig,
    document: Arc<ReplicatedDocument>,
    transport: Arc<dyn BroadcastTransport>,
    coordinator: Option<SyncCoordinator>,
    writer: Option<PersistenceWriter>,
    monitor: Option<PeerLinkMonitor>,
    restore: RestoreOutcome,
    persistence_error: ErrorSlot,
    transport_error: Option<SyncError>,
    closed: bool,
}

impl RoomSession {
    /// Join a room: restore stored state, start persisting and start
    /// syncing.
    ///
    /// Only an empty room id fails the open. Storage and transport problems
    /// are reported through [`RoomSession::restore_outcome`] and
    /// [`RoomSession::is_online`].
    pub async fn open(
        config: SessionConfig,
        transport: Arc<dyn BroadcastTransport>,
        storage: Option<Arc<dyn KeyValueStore>>,
    ) -> Result<Self, SessionError> {
        if config.room_id.is_empty() {
            return Err(SessionError::EmptyRoomId);
        }

        let persistence_error: ErrorSlot = Arc::new(Mutex::new(None));
        let (document, restore, persistence) = match storage {
            None => (ReplicatedDocument::new(), RestoreOutcome::NotPersisted, None),
            Some(store) => restore_room(store, &config),
        };
        let document = Arc::new(document);

        let writer = persistence.map(|persistence| {
            PersistenceWriter::start(persistence, document.clone(), persistence_error.clone())
        });

        let mut session = Self {
            config,
            document,
            transport,
            coordinator: None,
            writer,
            monitor: None,
            restore,
            persistence_error,
            transport_error: None,
            closed: false,
        };

        match session.start_coordinator().await {
            Ok(()) => {}
            Err(e) if e.is_transport_unavailable() => {
                log::warn!("Room {} opened offline: {e}", session.config.room_id);
                session.transport_error = Some(e);
            }
            Err(e) => return Err(e.into()),
        }

        log::info!(
            "Joined room {} as {} ({})",
            session.config.room_id,
            session.config.author_name,
            session.config.author_id
        );
        Ok(session)
    }

    async fn start_coordinator(&mut self) -> Result<(), SyncError> {
        let coordinator = SyncCoordinator::start(
            &self.config.room_id,
            self.document.clone(),
            self.transport.clone(),
            self.config.coordinator.clone(),
        )
        .await?;
        self.coordinator = Some(coordinator);
        self.transport_error = None;
        Ok(())
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn document(&self) -> &Arc<ReplicatedDocument> {
        &self.document
    }

    pub fn restore_outcome(&self) -> &RestoreOutcome {
        &self.restore
    }

    /// Whether the session is subscribed to its room topic.
    pub fn is_online(&self) -> bool {
        self.coordinator.as_ref().is_some_and(SyncCoordinator::is_running)
    }

    /// Error that left the session offline, if any.
    pub fn transport_error(&self) -> Option<&SyncError> {
        self.transport_error.as_ref()
    }

    /// Most recent failure of the persistence writer.
    pub fn last_persistence_error(&self) -> Option<PersistenceError> {
        self.persistence_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn sync_stats(&self) -> Option<SyncStats> {
        self.coordinator.as_ref().map(SyncCoordinator::stats)
    }

    /// Post a text message as the session's author. Blank text is ignored.
    pub fn send_text(&self, text: &str) -> Result<Option<UpdateFragment>, SessionError> {
        self.ensure_open()?;
        Ok(self
            .document
            .send_text(&self.config.author_id, &self.config.author_name, text)?)
    }

    /// Record file metadata under `cid` and post a message referencing it.
    pub fn attach_file_meta(&self, cid: &str, meta: &FileMeta) -> Result<UpdateFragment, SessionError> {
        self.ensure_open()?;
        Ok(self.document.set_file_meta(
            cid,
            meta,
            &self.config.author_id,
            Some(&self.config.author_name),
        )?)
    }

    /// Upload `bytes` to `blobs` and attach the resulting content id.
    pub async fn attach_file(
        &self,
        blobs: &dyn BlobStore,
        name: &str,
        bytes: Vec<u8>,
        mime_type: Option<&str>,
    ) -> Result<String, SessionError> {
        self.ensure_open()?;
        let size = bytes.len() as u64;
        let cid = blobs.store(bytes, name).await?;

        let mut meta = FileMeta::new(name, size);
        if let Some(mime_type) = mime_type {
            meta = meta.with_mime_type(mime_type);
        }
        self.attach_file_meta(&cid, &meta)?;
        Ok(cid)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.document.messages()
    }

    pub fn files(&self) -> BTreeMap<String, FileMeta> {
        self.document.files()
    }

    pub fn view(&self) -> DocumentView {
        self.document.view()
    }

    /// Listen for document changes from any origin.
    pub fn subscribe<F>(&self, listener: F) -> ChangeSubscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.document.subscribe(listener)
    }

    /// Retry joining the room topic after the session went offline. A
    /// no-op while online.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.is_online() {
            return Ok(());
        }
        if let Some(mut stale) = self.coordinator.take() {
            stale.shutdown().await;
        }
        match self.start_coordinator().await {
            Ok(()) => {
                log::info!("Room {} back online", self.config.room_id);
                Ok(())
            }
            Err(e) => {
                self.transport_error = Some(e.clone());
                Err(e.into())
            }
        }
    }

    /// Start inspecting peer links. Replaces a monitor already running.
    pub fn start_monitor(&mut self, registry: Arc<dyn PeerRegistry>) {
        let monitor = PeerLinkMonitor::new(registry, self.config.monitor.clone());
        monitor.start();
        if let Some(previous) = self.monitor.replace(monitor) {
            previous.stop();
        }
    }

    pub fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    /// Latest link status per peer; empty without a monitor.
    pub fn peer_statuses(&self) -> StatusMap {
        self.monitor
            .as_ref()
            .map(PeerLinkMonitor::statuses)
            .unwrap_or_default()
    }

    pub fn peer_status(&self, peer_id: &str) -> Option<PeerLinkStatus> {
        self.monitor.as_ref().and_then(|monitor| monitor.status(peer_id))
    }

    /// Leave the room: stop syncing and monitoring, write out queued
    /// fragments and compact the room into a snapshot. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.stop_monitor();
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.shutdown().await;
        }

        let mut result = Ok(());
        if let Some(mut writer) = self.writer.take() {
            writer.drain().await;
            if let Err(e) = writer.persistence.save_snapshot(&self.document) {
                log::error!("Final snapshot of room {} failed: {e}", self.config.room_id);
                *self.persistence_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.clone());
                result = Err(e.into());
            }
        }

        log::info!("Left room {}", self.config.room_id);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

fn restore_room(
    store: Arc<dyn KeyValueStore>,
    config: &SessionConfig,
) -> (ReplicatedDocument, RestoreOutcome, Option<Arc<RoomPersistence>>) {
    let persistence = match RoomPersistence::open(store, &config.room_id) {
        Ok(persistence) => persistence.with_compaction_threshold(config.compaction_threshold),
        Err(e) => {
            log::error!("Storage for room {} unavailable: {e}", config.room_id);
            return (ReplicatedDocument::new(), RestoreOutcome::Failed(e), None);
        }
    };

    match persistence.load() {
        Ok(restored) => {
            let outcome = if !restored.from_snapshot && restored.replayed == 0 && restored.skipped == 0 {
                RestoreOutcome::Empty
            } else {
                RestoreOutcome::Restored {
                    from_snapshot: restored.from_snapshot,
                    replayed: restored.replayed,
                    skipped: restored.skipped,
                }
            };
            (restored.document, outcome, Some(Arc::new(persistence)))
        }
        Err(e) => {
            log::error!("Restoring room {} failed, starting empty: {e}", config.room_id);
            (
                ReplicatedDocument::new(),
                RestoreOutcome::Failed(e),
                Some(Arc::new(persistence)),
            )
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("room id must not be empty")]
    EmptyRoomId,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}
