//! Persistence integration tests.
//!
//! Verifies:
//! - Room history survives a restart through RocksDB
//! - Snapshot plus log replay restores the exact view
//! - Rooms sharing one database stay isolated
//! - Compaction folds the log without losing data
//! - A corrupt snapshot leaves the session usable

use huddle_sync::document::{FileMeta, ReplicatedDocument};
use huddle_sync::mesh::Mesh;
use huddle_sync::persistence::{KeyValueStore, RocksStore, RoomPersistence, StoreConfig};
use huddle_sync::session::{RestoreOutcome, RoomSession, SessionConfig};

use std::sync::Arc;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &std::path::Path) -> Arc<dyn KeyValueStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

async fn open_session(
    mesh: &Mesh,
    peer: &str,
    room: &str,
    store: &Arc<dyn KeyValueStore>,
) -> RoomSession {
    RoomSession::open(
        SessionConfig::for_testing(room, "u1", "Alice"),
        Arc::new(mesh.join(peer)),
        Some(store.clone()),
    )
    .await
    .unwrap()
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempdir().unwrap();
    let mesh = Mesh::new();

    let view = {
        let store = open_store(dir.path());
        let mut session = open_session(&mesh, "first", "general", &store).await;
        session.send_text("before restart").unwrap();
        session
            .attach_file_meta("cidABC", &FileMeta::new("x.png", 10))
            .unwrap();
        let view = session.view();
        session.close().await.unwrap();
        view
    };

    let store = open_store(dir.path());
    let session = open_session(&mesh, "second", "general", &store).await;
    assert!(matches!(
        session.restore_outcome(),
        RestoreOutcome::Restored {
            from_snapshot: true,
            ..
        }
    ));
    assert_eq!(session.view(), view);
    assert_eq!(session.messages().len(), 2);
}

#[test]
fn test_snapshot_then_log_replay() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let persistence = RoomPersistence::open(store.clone(), "replay").unwrap();

    let doc = ReplicatedDocument::with_client_id(7);
    doc.send_text("u1", "Alice", "in snapshot").unwrap();
    persistence.save_snapshot(&doc).unwrap();

    let late = doc.send_text("u1", "Alice", "in log").unwrap().unwrap();
    persistence.append_update(&late).unwrap();

    let reopened = RoomPersistence::open(store, "replay").unwrap();
    assert_eq!(reopened.log_len(), 1);
    let restored = reopened.load().unwrap();
    assert!(restored.from_snapshot);
    assert_eq!(restored.replayed, 1);
    assert_eq!(restored.skipped, 0);
    assert_eq!(restored.document.view(), doc.view());
}

#[test]
fn test_log_only_restore_in_order() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let persistence = RoomPersistence::open(store, "log-only").unwrap();

    let doc = ReplicatedDocument::with_client_id(3);
    for i in 0..20 {
        let fragment = doc.send_text("u1", "Alice", &format!("line {i}")).unwrap().unwrap();
        persistence.append_update(&fragment).unwrap();
    }

    let restored = persistence.load().unwrap();
    assert!(!restored.from_snapshot);
    assert_eq!(restored.replayed, 20);
    let texts: Vec<String> = restored
        .document
        .messages()
        .iter()
        .filter_map(|m| m.content.text().map(str::to_string))
        .collect();
    assert_eq!(texts.first().map(String::as_str), Some("line 0"));
    assert_eq!(texts.last().map(String::as_str), Some("line 19"));
}

// ─── Isolation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rooms_isolated_in_one_database() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mesh = Mesh::new();

    // "a" is a textual prefix of "ab"; the length prefix keeps their logs
    // apart.
    let mut first = open_session(&mesh, "p1", "ab", &store).await;
    let mut second = open_session(&mesh, "p2", "a", &store).await;
    first.send_text("only in ab").unwrap();
    second.send_text("only in a").unwrap();
    second.send_text("again in a").unwrap();
    first.close().await.unwrap();
    second.close().await.unwrap();

    let ab = RoomPersistence::open(store.clone(), "ab").unwrap().load().unwrap();
    let a = RoomPersistence::open(store, "a").unwrap().load().unwrap();
    assert_eq!(ab.document.messages().len(), 1);
    assert_eq!(a.document.messages().len(), 2);
}

#[test]
fn test_clear_removes_room() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let persistence = RoomPersistence::open(store.clone(), "gone").unwrap();
    let doc = ReplicatedDocument::new();
    let fragment = doc.send_text("u1", "Alice", "bye").unwrap().unwrap();
    persistence.append_update(&fragment).unwrap();
    persistence.save_snapshot(&doc).unwrap();

    persistence.clear().unwrap();
    let restored = RoomPersistence::open(store, "gone").unwrap().load().unwrap();
    assert!(!restored.from_snapshot);
    assert!(restored.document.messages().is_empty());
}

// ─── Compaction ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_compaction_keeps_every_message() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let mesh = Mesh::new();
    let config = SessionConfig {
        compaction_threshold: 5,
        ..SessionConfig::for_testing("busy", "u1", "Alice")
    };

    let mut session = RoomSession::open(config, Arc::new(mesh.join("a")), Some(store.clone()))
        .await
        .unwrap();
    for i in 0..23 {
        session.send_text(&format!("message {i}")).unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(session.last_persistence_error().is_none());
    session.close().await.unwrap();

    let persistence = RoomPersistence::open(store, "busy").unwrap();
    assert_eq!(persistence.log_len(), 0);
    let restored = persistence.load().unwrap();
    assert_eq!(restored.document.messages().len(), 23);
}

// ─── Corruption ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_corrupt_snapshot_reported() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    store.put(b"doc-broken", b"\x04\x00\x00\x00\xf0").unwrap();

    let mesh = Mesh::new();
    let mut session = open_session(&mesh, "a", "broken", &store).await;
    assert!(session.restore_outcome().is_failure());
    assert!(session.messages().is_empty());

    session.send_text("fresh start").unwrap();
    session.close().await.unwrap();

    let restored = RoomPersistence::open(store, "broken").unwrap().load().unwrap();
    assert_eq!(restored.document.messages().len(), 1);
}
