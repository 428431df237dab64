use criterion::{black_box, criterion_group, criterion_main, Criterion};
use notero_collab::broadcast::BroadcastGroup;
use notero_collab::history::BoardHistory;
use notero_collab::protocol::{PeerInfo, SequencedDelta, SyncMessage};
use notero_collab::OfflineQueue;
use notero_core::Delta;
use uuid::Uuid;
use std::sync::Arc;

fn note_delta(client_seq: u64) -> Delta {
    Delta {
        map: "notes".into(),
        key: format!("\"note-{client_seq}\""),
        client_seq,
        op: br#"{"Set":{"key":"note-1","value":{"id":"note-1","text":"Buy milk","author":{"id":"u","name":"Brave Otter"}}}}"#.to_vec(),
    }
}

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let board = Uuid::new_v4();
    let delta = note_delta(1);

    c.bench_function("delta_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), black_box(board), black_box(&delta)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let msg = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), &note_delta(1)).unwrap();
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.delta_payload().unwrap());
        })
    });
}

fn bench_catch_up_encode(c: &mut Criterion) {
    let origin = Uuid::new_v4();
    let entries: Vec<SequencedDelta> = (1..=500u64)
        .map(|i| SequencedDelta {
            sequence: i,
            origin,
            delta: note_delta(i),
        })
        .collect();

    c.bench_function("sync_step2_encode_500", |b| {
        b.iter(|| {
            let msg = SyncMessage::sync_step2(Uuid::nil(), 500, black_box(&entries)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_history_record_and_since(c: &mut Criterion) {
    let origin = Uuid::new_v4();

    c.bench_function("history_record_1000_since_900", |b| {
        b.iter(|| {
            let mut history = BoardHistory::new();
            for i in 1..=1000u64 {
                history.record(origin, note_delta(i));
            }
            black_box(history.since(black_box(900)));
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("Peer{i}"));
                    receivers.push(group.add_peer(peer).await);
                }

                for i in 0..1000u64 {
                    let data = Arc::new(vec![i as u8; 64]);
                    group.broadcast_raw(black_box(data));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops_acked", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 1..=1000u64 {
                queue.enqueue(note_delta(i));
            }
            for i in 1..=1000u64 {
                queue.acknowledge("notes", i);
            }
            black_box(queue.len());
        })
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_catch_up_encode,
    bench_history_record_and_since,
    bench_broadcast_1000_messages,
    bench_offline_queue,
);
criterion_main!(benches);
