//! Per-room snapshot plus append log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{BatchOp, KeyValueStore, PersistenceError};
use crate::codec::UpdateFragment;
use crate::document::ReplicatedDocument;

const SNAPSHOT_PREFIX: &[u8] = b"doc-";
const LOG_PREFIX: &[u8] = b"upd-";

/// Logged fragments after which a snapshot is due.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 500;

/// Result of [`RoomPersistence::load`].
pub struct RestoredDocument {
    pub document: ReplicatedDocument,
    /// Whether a snapshot record existed
    pub from_snapshot: bool,
    /// Log fragments merged after the snapshot
    pub replayed: usize,
    /// Log fragments that could not be read and were skipped
    pub skipped: usize,
}

/// Persistence adapter for one room.
///
/// Not meant to be shared between writers: a single task appends and
/// compacts, so log sequence numbers stay dense and ordered.
pub struct RoomPersistence {
    store: Arc<dyn KeyValueStore>,
    room_id: String,
    next_seq: AtomicU64,
    logged: AtomicU64,
    compaction_threshold: u64,
}

impl RoomPersistence {
    /// Attach to `room_id` in `store`, picking up the existing log.
    pub fn open(store: Arc<dyn KeyValueStore>, room_id: &str) -> Result<Self, PersistenceError> {
        if room_id.is_empty() {
            return Err(PersistenceError::EmptyRoomId);
        }

        let prefix = log_prefix(room_id);
        let entries = store.scan_prefix(&prefix)?;
        let next_seq = entries
            .last()
            .and_then(|(key, _)| parse_seq(&prefix, key))
            .map_or(0, |seq| seq + 1);

        Ok(Self {
            store,
            room_id: room_id.to_string(),
            next_seq: AtomicU64::new(next_seq),
            logged: AtomicU64::new(entries.len() as u64),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        })
    }

    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        self.compaction_threshold = threshold.max(1);
        self
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Rebuild the document: snapshot first, then the log in sequence order.
    ///
    /// A corrupt snapshot fails the whole load; corrupt log entries are
    /// skipped.
    pub fn load(&self) -> Result<RestoredDocument, PersistenceError> {
        let document = ReplicatedDocument::new();

        let from_snapshot = match self.store.get(&snapshot_key(&self.room_id))? {
            Some(compressed) => {
                let snapshot = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
                    PersistenceError::CorruptSnapshot {
                        room: self.room_id.clone(),
                        reason: e.to_string(),
                    }
                })?;
                document
                    .restore(&snapshot)
                    .map_err(|e| PersistenceError::CorruptSnapshot {
                        room: self.room_id.clone(),
                        reason: e.to_string(),
                    })?;
                true
            }
            None => false,
        };

        let mut replayed = 0;
        let mut skipped = 0;
        for (key, compressed) in self.store.scan_prefix(&log_prefix(&self.room_id))? {
            let fragment = match lz4_flex::decompress_size_prepended(&compressed) {
                Ok(fragment) => fragment,
                Err(e) => {
                    log::warn!("Skipping undecodable log entry {key:?} in room {}: {e}", self.room_id);
                    skipped += 1;
                    continue;
                }
            };
            match document.restore(&fragment) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    log::warn!("Skipping corrupt log entry {key:?} in room {}: {e}", self.room_id);
                    skipped += 1;
                }
            }
        }

        log::debug!(
            "Loaded room {} (snapshot: {from_snapshot}, replayed: {replayed}, skipped: {skipped})",
            self.room_id
        );
        Ok(RestoredDocument {
            document,
            from_snapshot,
            replayed,
            skipped,
        })
    }

    /// Append a fragment to the log. Returns its sequence number.
    pub fn append_update(&self, fragment: &UpdateFragment) -> Result<u64, PersistenceError> {
        let seq = self.next_seq.load(Ordering::SeqCst);
        let compressed = lz4_flex::compress_prepend_size(fragment.as_bytes());
        self.store.put(&log_key(&self.room_id, seq), &compressed)?;
        self.next_seq.store(seq + 1, Ordering::SeqCst);
        self.logged.fetch_add(1, Ordering::SeqCst);
        Ok(seq)
    }

    /// Write the full state of `document` and drop the log entries it
    /// covers, atomically. Returns how many log entries were folded in.
    pub fn save_snapshot(&self, document: &ReplicatedDocument) -> Result<usize, PersistenceError> {
        let compressed = lz4_flex::compress_prepend_size(&document.snapshot());
        let covered = self.store.scan_prefix(&log_prefix(&self.room_id))?;

        let mut ops = Vec::with_capacity(covered.len() + 1);
        ops.push(BatchOp::Put {
            key: snapshot_key(&self.room_id),
            value: compressed,
        });
        ops.extend(covered.iter().map(|(key, _)| BatchOp::Delete { key: key.clone() }));
        self.store.write_batch(ops)?;

        self.logged.store(0, Ordering::SeqCst);
        log::debug!(
            "Compacted room {}: folded {} log entries into snapshot",
            self.room_id,
            covered.len()
        );
        Ok(covered.len())
    }

    /// Whether the log has grown past the compaction threshold.
    pub fn needs_compaction(&self) -> bool {
        self.logged.load(Ordering::SeqCst) >= self.compaction_threshold
    }

    /// Fragments currently in the log.
    pub fn log_len(&self) -> u64 {
        self.logged.load(Ordering::SeqCst)
    }

    /// Remove everything stored for this room.
    pub fn clear(&self) -> Result<(), PersistenceError> {
        let mut ops = vec![BatchOp::Delete {
            key: snapshot_key(&self.room_id),
        }];
        ops.extend(
            self.store
                .scan_prefix(&log_prefix(&self.room_id))?
                .into_iter()
                .map(|(key, _)| BatchOp::Delete { key }),
        );
        self.store.write_batch(ops)?;
        self.logged.store(0, Ordering::SeqCst);
        Ok(())
    }
}

fn snapshot_key(room_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_PREFIX.len() + room_id.len());
    key.extend_from_slice(SNAPSHOT_PREFIX);
    key.extend_from_slice(room_id.as_bytes());
    key
}

/// `"upd-"` + room id length (u32 BE) + room id. The length keeps room `a`
/// from matching the entries of room `ab`.
fn log_prefix(room_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(LOG_PREFIX.len() + 4 + room_id.len());
    prefix.extend_from_slice(LOG_PREFIX);
    prefix.extend_from_slice(&(room_id.len() as u32).to_be_bytes());
    prefix.extend_from_slice(room_id.as_bytes());
    prefix
}

fn log_key(room_id: &str, seq: u64) -> Vec<u8> {
    let mut key = log_prefix(room_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn parse_seq(prefix: &[u8], key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = suffix.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FileMeta;
    use crate::persistence::MemoryStore;

    fn memory() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(snapshot_key("r1"), b"doc-r1".to_vec());
        let key = log_key("r1", 7);
        assert_eq!(&key[..4], b"upd-");
        assert_eq!(&key[4..8], &2u32.to_be_bytes());
        assert_eq!(&key[8..10], b"r1");
        assert_eq!(&key[10..], &7u64.to_be_bytes());
        assert_eq!(parse_seq(&log_prefix("r1"), &key), Some(7));
    }

    #[test]
    fn test_empty_room_rejected() {
        assert!(matches!(
            RoomPersistence::open(memory(), ""),
            Err(PersistenceError::EmptyRoomId)
        ));
    }

    #[test]
    fn test_load_empty_room() {
        let persistence = RoomPersistence::open(memory(), "r1").unwrap();
        let restored = persistence.load().unwrap();
        assert!(!restored.from_snapshot);
        assert_eq!(restored.replayed, 0);
        assert!(restored.document.messages().is_empty());
    }

    #[test]
    fn test_log_replay_restores_document() {
        let store = memory();
        let persistence = RoomPersistence::open(store.clone(), "r1").unwrap();

        let doc = ReplicatedDocument::new();
        let f1 = doc.send_text("u1", "Alice", "hello").unwrap().unwrap();
        let f2 = doc
            .set_file_meta("cid1", &FileMeta::new("a.png", 4), "u1", None)
            .unwrap();
        assert_eq!(persistence.append_update(&f1).unwrap(), 0);
        assert_eq!(persistence.append_update(&f2).unwrap(), 1);

        let reopened = RoomPersistence::open(store, "r1").unwrap();
        assert_eq!(reopened.log_len(), 2);
        let restored = reopened.load().unwrap();
        assert_eq!(restored.replayed, 2);
        assert_eq!(restored.document.view(), doc.view());
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let store = memory();
        let doc = ReplicatedDocument::new();
        {
            let persistence = RoomPersistence::open(store.clone(), "r1").unwrap();
            for text in ["a", "b", "c"] {
                let fragment = doc.send_text("u1", "Alice", text).unwrap().unwrap();
                persistence.append_update(&fragment).unwrap();
            }
        }
        let persistence = RoomPersistence::open(store, "r1").unwrap();
        let fragment = doc.send_text("u1", "Alice", "d").unwrap().unwrap();
        assert_eq!(persistence.append_update(&fragment).unwrap(), 3);
    }

    #[test]
    fn test_snapshot_compacts_log() {
        let store = memory();
        let persistence = RoomPersistence::open(store.clone(), "r1")
            .unwrap()
            .with_compaction_threshold(3);

        let doc = ReplicatedDocument::new();
        for i in 0..3 {
            let fragment = doc.send_text("u1", "Alice", &format!("m{i}")).unwrap().unwrap();
            persistence.append_update(&fragment).unwrap();
        }
        assert!(persistence.needs_compaction());

        assert_eq!(persistence.save_snapshot(&doc).unwrap(), 3);
        assert!(!persistence.needs_compaction());
        assert_eq!(store.len(), 1);

        let restored = persistence.load().unwrap();
        assert!(restored.from_snapshot);
        assert_eq!(restored.replayed, 0);
        assert_eq!(restored.document.view(), doc.view());
    }

    #[test]
    fn test_snapshot_then_log() {
        let store = memory();
        let persistence = RoomPersistence::open(store, "r1").unwrap();
        let doc = ReplicatedDocument::new();
        doc.send_text("u1", "Alice", "before").unwrap();
        persistence.save_snapshot(&doc).unwrap();

        let fragment = doc.send_text("u1", "Alice", "after").unwrap().unwrap();
        persistence.append_update(&fragment).unwrap();

        let restored = persistence.load().unwrap();
        assert!(restored.from_snapshot);
        assert_eq!(restored.replayed, 1);
        assert_eq!(restored.document.messages().len(), 2);
    }

    #[test]
    fn test_corrupt_log_entry_skipped() {
        let store = memory();
        let persistence = RoomPersistence::open(store.clone(), "r1").unwrap();
        let doc = ReplicatedDocument::new();
        let fragment = doc.send_text("u1", "Alice", "ok").unwrap().unwrap();
        persistence.append_update(&fragment).unwrap();

        store.insert_raw(&log_key("r1", 1), b"\x05\x00\x00\x00\xff");
        store.insert_raw(
            &log_key("r1", 2),
            &lz4_flex::compress_prepend_size(&[0xFF, 0xFF, 0xFF]),
        );

        let restored = persistence.load().unwrap();
        assert_eq!(restored.replayed, 1);
        assert_eq!(restored.skipped, 2);
        assert_eq!(restored.document.messages().len(), 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_error() {
        let store = memory();
        store.insert_raw(b"doc-r1", b"\x04\x00\x00\x00\xf0");
        let persistence = RoomPersistence::open(store, "r1").unwrap();
        assert!(matches!(
            persistence.load(),
            Err(PersistenceError::CorruptSnapshot { .. })
        ));
    }

    #[test]
    fn test_rooms_isolated() {
        let store = memory();
        let a = RoomPersistence::open(store.clone(), "a").unwrap();
        let ab = RoomPersistence::open(store.clone(), "ab").unwrap();

        let doc = ReplicatedDocument::new();
        let fragment = doc.send_text("u1", "Alice", "only in ab").unwrap().unwrap();
        ab.append_update(&fragment).unwrap();

        assert_eq!(a.load().unwrap().replayed, 0);
        assert_eq!(ab.load().unwrap().replayed, 1);

        ab.clear().unwrap();
        assert!(store.is_empty());
    }
}
