//! # huddle-sync: replicated room documents for peer-to-peer chat
//!
//! Every client holds a full replica of its room's document (a message log
//! plus a file-reference map) as a Yrs CRDT. Local edits produce update
//! fragments that are broadcast on the room topic; peers merge them in any
//! order and converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   topic "huddle-room-<id>"   ┌──────────────┐
//! │ RoomSession  │ ◄──────────────────────────► │ RoomSession  │
//! │  (peer A)    │   Mesh / RelayTransport      │  (peer B)    │
//! └──────┬───────┘                              └──────┬───────┘
//!        │                                             │
//!        ▼                                             ▼
//! ┌──────────────┐  SyncCoordinator             ┌──────────────┐
//! │ Replicated   │  (Update, StateRequest,      │ Replicated   │
//! │ Document     │   StateResponse envelopes)   │ Document     │
//! └──────┬───────┘                              └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ RoomPersist- │ snapshot (LZ4) + update log
//! │ ence (Rocks) │
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: update fragments and the versioned wire envelope
//! - [`document`]: the replicated document and its change feed
//! - [`transport`]: broadcast/subscribe abstraction
//! - [`mesh`]: in-process peer mesh with partitions and link profiles
//! - [`relay`]: WebSocket topic relay server and client
//! - [`coordinator`]: keeps a document in sync with its topic
//! - [`peers`] / [`monitor`]: peer connection stats and link classification
//! - [`persistence`]: snapshot plus append log over RocksDB or memory
//! - [`blob`]: content-addressed blob store interface
//! - [`session`]: one client's membership in one room

pub mod blob;
pub mod codec;
pub mod coordinator;
pub mod document;
pub mod mesh;
pub mod monitor;
pub mod peers;
pub mod persistence;
pub mod relay;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use blob::{BlobError, BlobStore, MemoryBlobStore};
pub use codec::{CodecError, Envelope, EnvelopeKind, UpdateFragment, ENVELOPE_VERSION};
pub use coordinator::{CoordinatorConfig, SyncCoordinator, SyncError, SyncStats};
pub use document::{
    observe, BatchReport, ChangeEvent, ChangeOrigin, ChangeSource, ChangeSubscription,
    DocumentError, DocumentView, FileMeta, Message, MessageContent, ReplicatedDocument,
};
pub use mesh::{LinkProfile, Mesh, MeshNode, MeshStats};
pub use monitor::{
    classify, ConnectionType, MonitorConfig, MonitorState, PeerLinkMonitor, PeerLinkStatus,
    StatusMap,
};
pub use peers::{
    CandidatePairState, CandidatePairStats, CandidateStats, CandidateType, PeerConnection,
    PeerId, PeerRegistry, PeerStatsError, StaticPeerRegistry, StatsRecord,
};
pub use persistence::{
    KeyValueStore, MemoryStore, PersistenceError, RestoredDocument, RocksStore, RoomPersistence,
    StoreConfig,
};
pub use relay::{RelayConfig, RelayFrame, RelayHandle, RelayServer, RelayStats, RelayTransport};
pub use session::{RestoreOutcome, RoomSession, SessionConfig, SessionError};
pub use transport::{topic_for_room, BroadcastTransport, TopicSubscription, TransportError};
