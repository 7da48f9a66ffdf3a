use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use huddle_sync::codec::{Envelope, UpdateFragment};
use huddle_sync::document::{FileMeta, ReplicatedDocument};
use huddle_sync::monitor::classify;
use huddle_sync::peers::StatsRecord;
use huddle_sync::persistence::{MemoryStore, RoomPersistence};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

/// Fragments of a conversation between two authors.
fn conversation(len: usize) -> Vec<UpdateFragment> {
    let doc = ReplicatedDocument::with_client_id(1);
    (0..len)
        .filter_map(|i| {
            let author = if i % 2 == 0 { "alice" } else { "bob" };
            doc.send_text(author, author, &format!("message number {i}")).unwrap()
        })
        .collect()
}

fn bench_append_message(c: &mut Criterion) {
    let doc = ReplicatedDocument::new();

    c.bench_function("append_text_message", |b| {
        b.iter(|| {
            black_box(doc.send_text("u1", "Alice", black_box("hello there")).unwrap());
        })
    });
}

fn bench_append_with_listener(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_with_listener");
    for history in [1_000usize, 4_000] {
        let doc = ReplicatedDocument::with_client_id(2);
        for fragment in conversation(history) {
            doc.apply_remote(fragment.as_bytes()).unwrap();
        }
        let _sub = doc.subscribe(|event| {
            black_box(event.update.len());
        });

        group.bench_with_input(BenchmarkId::from_parameter(history), &history, |b, _| {
            b.iter(|| black_box(doc.send_text("u1", "Alice", "hello there").unwrap()))
        });
    }
    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let fragments = conversation(100);

    c.bench_function("apply_remote_100_fragments", |b| {
        b.iter(|| {
            let replica = ReplicatedDocument::with_client_id(2);
            for fragment in &fragments {
                black_box(replica.apply_remote(fragment.as_bytes()).unwrap());
            }
        })
    });
}

fn bench_envelope_codec(c: &mut Criterion) {
    let fragment = conversation(1).remove(0);
    let origin = Uuid::new_v4();
    let encoded = Envelope::update(origin, &fragment).encode().unwrap();

    c.bench_function("envelope_encode", |b| {
        b.iter(|| black_box(Envelope::update(black_box(origin), &fragment).encode().unwrap()))
    });
    c.bench_function("envelope_decode", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_restore(c: &mut Criterion) {
    let doc = ReplicatedDocument::with_client_id(2);
    for fragment in conversation(1_000) {
        doc.apply_remote(fragment.as_bytes()).unwrap();
    }
    doc.set_file_meta("cid", &FileMeta::new("x.png", 10), "u1", None)
        .unwrap();
    let snapshot = doc.snapshot();

    c.bench_function("snapshot_1k_messages", |b| b.iter(|| black_box(doc.snapshot())));
    c.bench_function("restore_1k_messages", |b| {
        b.iter(|| black_box(ReplicatedDocument::from_snapshot(black_box(&snapshot)).unwrap()))
    });
}

fn bench_view(c: &mut Criterion) {
    let doc = ReplicatedDocument::with_client_id(2);
    for fragment in conversation(1_000) {
        doc.apply_remote(fragment.as_bytes()).unwrap();
    }

    c.bench_function("materialize_view_1k_messages", |b| b.iter(|| black_box(doc.view())));
}

fn bench_persistence_append(c: &mut Criterion) {
    let fragments = conversation(100);
    let persistence = RoomPersistence::open(Arc::new(MemoryStore::new()), "bench")
        .unwrap()
        .with_compaction_threshold(u64::MAX);

    c.bench_function("persist_append_100_fragments", |b| {
        b.iter(|| {
            for fragment in &fragments {
                black_box(persistence.append_update(fragment).unwrap());
            }
        })
    });
}

fn bench_classify(c: &mut Criterion) {
    let report = r#"[
        {"type": "candidate-pair", "id": "CP0", "state": "failed", "localCandidateId": "L0"},
        {"type": "candidate-pair", "id": "CP1", "state": "succeeded", "selected": true,
         "localCandidateId": "L1", "url": "turn:example:3478"},
        {"type": "local-candidate", "id": "L0", "candidateType": "host", "address": "10.0.0.2"},
        {"type": "local-candidate", "id": "L1", "candidateType": "relay"},
        {"type": "remote-candidate", "id": "R1", "candidateType": "srflx"},
        {"type": "transport", "id": "T1"}
    ]"#;
    let records = StatsRecord::parse_report(report).unwrap();

    c.bench_function("classify_stats_report", |b| {
        b.iter(|| black_box(classify(black_box(&records))))
    });
}

criterion_group!(
    benches,
    bench_append_message,
    bench_append_with_listener,
    bench_apply_remote,
    bench_envelope_codec,
    bench_snapshot_restore,
    bench_view,
    bench_persistence_append,
    bench_classify,
);
criterion_main!(benches);
