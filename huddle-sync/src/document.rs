//! Replicated room document: an ordered message log plus a file-metadata map.
//!
//! Architecture:
//! ```text
//! append_message / set_file_meta          apply_remote / restore
//!            │                                     │
//!            ▼                                     ▼
//!      ┌──────────────────────── yrs Doc ────────────────────────┐
//!      │  Array "messages": JSON-encoded Message per entry      │
//!      │  Map   "files":    cid → JSON-encoded FileMeta         │
//!      └────────────────────────────┬────────────────────────────┘
//!                                   │ commit
//!                                   ▼
//!                      notification queue (FIFO)
//!                                   │ drained after commit
//!                                   ▼
//!                           change listeners
//! ```
//!
//! Ordering of `messages` across replicas comes from YATA insertion
//! semantics, never from the informational `timestamp`. For `files`, a
//! causally later write wins; of two concurrent writes to the same key, the
//! one from the replica with the higher client id wins.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, Doc, Map, Out, ReadTxn, StateVector, Transact, WriteTxn};

use crate::codec::{self, CodecError, UpdateFragment};

/// Root type holding the message log.
const MESSAGES: &str = "messages";
/// Root type holding file metadata keyed by content id.
const FILES: &str = "files";

// ───────────────────────────────────────────────────────────────────
// Data model
// ───────────────────────────────────────────────────────────────────

/// Body of a message: exactly one of text or a file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageContent {
    Text(String),
    /// Content id pointing into `files`
    FileRef(String),
}

impl MessageContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t),
            MessageContent::FileRef(_) => None,
        }
    }

    pub fn file_ref(&self) -> Option<&str> {
        match self {
            MessageContent::FileRef(cid) => Some(cid),
            MessageContent::Text(_) => None,
        }
    }
}

/// A chat message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    /// Milliseconds since the Unix epoch; informational only
    pub timestamp: u64,
    #[serde(flatten)]
    pub content: MessageContent,
}

/// Metadata for a blob referenced from the message log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Open-ended extension fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: Some(name.into()),
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Materialized, comparable view of the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentView {
    pub messages: Vec<Message>,
    pub files: BTreeMap<String, FileMeta>,
}

// ───────────────────────────────────────────────────────────────────
// Change feed
// ───────────────────────────────────────────────────────────────────

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Produced by a local mutation; must be published
    Local,
    /// Merged from a peer; must not be re-published
    Remote,
    /// Merged from a persisted snapshot
    Restore,
}

/// Delivered to listeners after a mutation has fully committed.
#[derive(Clone)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    /// The fragment that produced this change
    pub update: UpdateFragment,
    doc: Doc,
    view: OnceLock<Arc<DocumentView>>,
}

impl ChangeEvent {
    fn new(origin: ChangeOrigin, update: UpdateFragment, doc: Doc) -> Self {
        Self {
            origin,
            update,
            doc,
            view: OnceLock::new(),
        }
    }

    /// The committed view, materialized on first access.
    ///
    /// It includes this change and any change committed before the first
    /// call; later calls return the same view.
    pub fn view(&self) -> Arc<DocumentView> {
        self.view
            .get_or_init(|| {
                let txn = self.doc.transact();
                Arc::new(DocumentView {
                    messages: read_messages(&txn),
                    files: read_files(&txn),
                })
            })
            .clone()
    }
}

impl std::fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("origin", &self.origin)
            .field("update_len", &self.update.len())
            .finish_non_exhaustive()
    }
}

pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, ChangeListener)>,
}

/// Handle returned by [`ReplicatedDocument::subscribe`].
///
/// The listener is removed on [`ChangeSubscription::unsubscribe`] or drop.
pub struct ChangeSubscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl ChangeSubscription {
    pub fn unsubscribe(self) {}

    fn noop() -> Self {
        Self {
            id: u64::MAX,
            listeners: Weak::new(),
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Anything that can report view changes.
///
/// Callers check [`ChangeSource::supports_change_notification`] instead of
/// relying on registration failing silently.
pub trait ChangeSource {
    fn supports_change_notification(&self) -> bool;

    /// Register a listener. Returns `None` when notifications are unsupported.
    fn register(&self, listener: ChangeListener) -> Option<ChangeSubscription>;
}

/// Observe `source`, returning a handle that is inert when the source cannot
/// notify.
pub fn observe<S, F>(source: &S, on_change: F) -> ChangeSubscription
where
    S: ChangeSource + ?Sized,
    F: Fn(&ChangeEvent) + Send + Sync + 'static,
{
    if !source.supports_change_notification() {
        log::debug!("Change source does not support notifications; observer not registered");
        return ChangeSubscription::noop();
    }
    source
        .register(Arc::new(on_change))
        .unwrap_or_else(ChangeSubscription::noop)
}

// ───────────────────────────────────────────────────────────────────
// The store
// ───────────────────────────────────────────────────────────────────

/// Outcome of applying several fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Fragments that changed the view
    pub applied: usize,
    /// Well-formed fragments that changed nothing (duplicates, or buffered
    /// until their predecessors arrive)
    pub unchanged: usize,
    /// Malformed fragments that were skipped
    pub skipped: usize,
}

/// Convergent room document.
///
/// All operations take `&self`; each mutation is one yrs transaction and
/// listeners run only after that transaction has committed.
pub struct ReplicatedDocument {
    doc: Doc,
    listeners: Arc<Mutex<Listeners>>,
    pending: Mutex<VecDeque<ChangeEvent>>,
    draining: AtomicBool,
}

impl ReplicatedDocument {
    /// Create an empty document with a random client id.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create an empty document with a fixed client id.
    ///
    /// A client id must never be reused by two live replicas; this exists
    /// for deterministic tests and tools.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        {
            let mut txn = doc.transact_mut();
            txn.get_or_insert_array(MESSAGES);
            txn.get_or_insert_map(FILES);
        }
        Self {
            doc,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// The CRDT client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Append a message. Returns the fragment to publish, or `None` when the
    /// content is empty/whitespace-only text.
    pub fn append_message(
        &self,
        author_id: &str,
        author_name: &str,
        content: MessageContent,
    ) -> Result<Option<UpdateFragment>, DocumentError> {
        if let MessageContent::Text(text) = &content {
            if text.trim().is_empty() {
                return Ok(None);
            }
        }

        let entry = encode_entry(&new_message(author_id, author_name, content))?;
        let fragment = {
            let mut txn = self.doc.transact_mut();
            let messages = txn.get_or_insert_array(MESSAGES);
            messages.push_back(&mut txn, entry);
            UpdateFragment::new(txn.encode_update_v1())
        };

        self.notify(ChangeOrigin::Local, fragment.clone());
        Ok(Some(fragment))
    }

    /// Shorthand for appending a text message.
    pub fn send_text(
        &self,
        author_id: &str,
        author_name: &str,
        text: &str,
    ) -> Result<Option<UpdateFragment>, DocumentError> {
        self.append_message(author_id, author_name, MessageContent::Text(text.to_string()))
    }

    /// Record metadata for `cid` and append a message referencing it, as one
    /// transaction. `author_name` defaults to `author_id`.
    pub fn set_file_meta(
        &self,
        cid: &str,
        meta: &FileMeta,
        author_id: &str,
        author_name: Option<&str>,
    ) -> Result<UpdateFragment, DocumentError> {
        if cid.is_empty() {
            return Err(DocumentError::EmptyContentId);
        }

        let meta_entry = encode_entry(meta)?;
        let message = new_message(
            author_id,
            author_name.unwrap_or(author_id),
            MessageContent::FileRef(cid.to_string()),
        );
        let message_entry = encode_entry(&message)?;

        let fragment = {
            let mut txn = self.doc.transact_mut();
            let files = txn.get_or_insert_map(FILES);
            files.insert(&mut txn, cid.to_string(), meta_entry);
            let messages = txn.get_or_insert_array(MESSAGES);
            messages.push_back(&mut txn, message_entry);
            UpdateFragment::new(txn.encode_update_v1())
        };

        self.notify(ChangeOrigin::Local, fragment.clone());
        Ok(fragment)
    }

    // ─── Remote merge ─────────────────────────────────────────────────

    /// Merge an inbound fragment.
    ///
    /// Returns `true` when the materialized view changed. Duplicates and
    /// fragments still waiting for their causal predecessors return `false`;
    /// the latter are held by the CRDT and integrated once the missing
    /// fragments arrive.
    pub fn apply_remote(&self, fragment: &[u8]) -> Result<bool, DocumentError> {
        self.merge(fragment, ChangeOrigin::Remote)
    }

    /// Apply many fragments, skipping malformed ones.
    pub fn apply_remote_batch<I, B>(&self, fragments: I) -> BatchReport
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut report = BatchReport::default();
        for (index, fragment) in fragments.into_iter().enumerate() {
            match self.apply_remote(fragment.as_ref()) {
                Ok(true) => report.applied += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    log::warn!("Skipping fragment #{index}: {e}");
                    report.skipped += 1;
                }
            }
        }
        report
    }

    fn merge(&self, bytes: &[u8], origin: ChangeOrigin) -> Result<bool, DocumentError> {
        let update = codec::decode_update(bytes)?;

        // The integrated diff also covers buffered fragments this one unblocked.
        let integrated = {
            let mut txn = self.doc.transact_mut();
            let before = txn.state_vector();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
            (txn.state_vector() != before).then(|| txn.encode_diff_v1(&before))
        };

        match integrated {
            Some(diff) => {
                self.notify(origin, UpdateFragment::new(diff));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Encode the full document state.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a full-state snapshot. On an empty document this reproduces the
    /// snapshotted state exactly.
    pub fn restore(&self, snapshot: &[u8]) -> Result<(), DocumentError> {
        self.merge(snapshot, ChangeOrigin::Restore).map(|_| ())
    }

    /// Build a fresh replica from a snapshot.
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        document.restore(snapshot)?;
        Ok(document)
    }

    // ─── Reconciliation ───────────────────────────────────────────────

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encoded state vector, for [`crate::codec::Envelope::state_request`].
    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Updates this replica holds that the owner of `remote_state_vector`
    /// lacks, or `None` when it is not behind us.
    pub fn missing_updates(
        &self,
        remote_state_vector: &[u8],
    ) -> Result<Option<UpdateFragment>, DocumentError> {
        let remote = codec::decode_state_vector(remote_state_vector)?;
        let txn = self.doc.transact();
        let local = txn.state_vector();
        let behind = local
            .iter()
            .any(|(client, clock)| remote.get(client) < *clock);
        if !behind {
            return Ok(None);
        }
        Ok(Some(UpdateFragment::new(txn.encode_diff_v1(&remote))))
    }

    /// Whether the owner of `remote_state_vector` has seen updates we have not.
    pub fn is_behind(&self, remote_state_vector: &[u8]) -> Result<bool, DocumentError> {
        let remote = codec::decode_state_vector(remote_state_vector)?;
        let local = self.state_vector();
        Ok(remote
            .iter()
            .any(|(client, clock)| local.get(client) < *clock))
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Messages in merged order. Entries that do not parse are skipped.
    pub fn messages(&self) -> Vec<Message> {
        let txn = self.doc.transact();
        read_messages(&txn)
    }

    /// File metadata keyed by content id.
    pub fn files(&self) -> BTreeMap<String, FileMeta> {
        let txn = self.doc.transact();
        read_files(&txn)
    }

    pub fn file(&self, cid: &str) -> Option<FileMeta> {
        let txn = self.doc.transact();
        let files = txn.get_map(FILES)?;
        files
            .get(&txn, cid)
            .and_then(|value| decode_entry(&value, cid))
    }

    /// Messages and files read from one transaction.
    pub fn view(&self) -> DocumentView {
        let txn = self.doc.transact();
        DocumentView {
            messages: read_messages(&txn),
            files: read_files(&txn),
        }
    }

    pub fn message_count(&self) -> u32 {
        let txn = self.doc.transact();
        txn.get_array(MESSAGES).map_or(0, |messages| messages.len(&txn))
    }

    // ─── Listeners ────────────────────────────────────────────────────

    /// Register a listener invoked after every committed change.
    pub fn subscribe<F>(&self, listener: F) -> ChangeSubscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.add_listener(Arc::new(listener))
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }

    fn add_listener(&self, listener: ChangeListener) -> ChangeSubscription {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        ChangeSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Queue a change notification and drain the queue unless an outer frame
    /// is already draining it. A listener that mutates the document thus
    /// enqueues instead of recursing.
    fn notify(&self, origin: ChangeOrigin, update: UpdateFragment) {
        if self.listener_count() == 0 {
            return;
        }
        let event = ChangeEvent::new(origin, update, self.doc.clone());
        lock(&self.pending).push_back(event);

        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = lock(&self.pending).pop_front();
                let Some(event) = next else { break };
                self.dispatch(&event);
            }
            self.draining.store(false, Ordering::Release);
            // Another thread may have queued between the last pop and the release.
            if lock(&self.pending).is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, event: &ChangeEvent) {
        let listeners: Vec<ChangeListener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("Change listener panicked on {:?} change; continuing", event.origin);
            }
        }
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeSource for ReplicatedDocument {
    fn supports_change_notification(&self) -> bool {
        true
    }

    fn register(&self, listener: ChangeListener) -> Option<ChangeSubscription> {
        Some(self.add_listener(listener))
    }
}

// ───────────────────────────────────────────────────────────────────
// Helpers
// ───────────────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn new_message(author_id: &str, author_name: &str, content: MessageContent) -> Message {
    Message {
        id: Uuid::new_v4().to_string(),
        author_id: author_id.to_string(),
        author_name: author_name.to_string(),
        timestamp: now_millis(),
        content,
    }
}

fn encode_entry<T: Serialize>(value: &T) -> Result<String, DocumentError> {
    serde_json::to_string(value).map_err(|e| DocumentError::Encode(e.to_string()))
}

fn decode_entry<T: for<'de> Deserialize<'de>>(value: &Out, context: &str) -> Option<T> {
    match value {
        Out::Any(Any::String(json)) => match serde_json::from_str(json) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Ignoring unparseable entry {context}: {e}");
                None
            }
        },
        other => {
            log::warn!("Ignoring non-JSON entry {context}: {other:?}");
            None
        }
    }
}

fn read_messages<T: ReadTxn>(txn: &T) -> Vec<Message> {
    let Some(messages) = txn.get_array(MESSAGES) else {
        return Vec::new();
    };
    messages
        .iter(txn)
        .enumerate()
        .filter_map(|(index, value)| decode_entry(&value, &format!("messages[{index}]")))
        .collect()
}

fn read_files<T: ReadTxn>(txn: &T) -> BTreeMap<String, FileMeta> {
    let Some(files) = txn.get_map(FILES) else {
        return BTreeMap::new();
    };
    files
        .iter(txn)
        .filter_map(|(cid, value)| {
            decode_entry(&value, &format!("files[{cid}]")).map(|meta| (cid.to_string(), meta))
        })
        .collect()
}

/// Document errors.
#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to encode entry: {0}")]
    Encode(String),
    #[error("content id must not be empty")]
    EmptyContentId,
}
