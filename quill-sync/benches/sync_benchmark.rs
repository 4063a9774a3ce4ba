use criterion::{criterion_group, criterion_main, Criterion};
use quill_sync::broadcast::BroadcastGroup;
use quill_sync::doc::{ReplicatedState, YrsState};
use quill_sync::presence::{PresenceEntry, PresenceTable, PresenceUpdate};
use quill_sync::protocol::{Frame, SyncMessage};
use quill_sync::registry::{Registry, RegistryConfig};
use serde_json::json;
use std::hint::black_box;

fn typing_deltas(count: u32) -> Vec<Vec<u8>> {
    let mut writer = YrsState::new();
    (0..count)
        .map(|i| writer.insert_text("content", i, "x"))
        .collect()
}

fn bench_update_frame_encode(c: &mut Criterion) {
    let delta = typing_deltas(1).remove(0);

    c.bench_function("update_frame_encode", |b| {
        b.iter(|| black_box(Frame::update(black_box(delta.clone())).encode()))
    });
}

fn bench_update_frame_decode(c: &mut Criterion) {
    let encoded = Frame::update(typing_deltas(1).remove(0)).encode();

    c.bench_function("update_frame_decode", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let update = PresenceUpdate {
        entries: (0..10)
            .map(|i| PresenceEntry {
                client_id: i,
                clock: 1,
                state: Some(json!({"name": format!("Peer{i}"), "color": "#70CFF8", "cursor": i})),
            })
            .collect(),
    };

    c.bench_function("presence_encode_10_peers", |b| {
        b.iter(|| black_box(black_box(&update).encode()))
    });
}

fn bench_presence_apply(c: &mut Criterion) {
    c.bench_function("presence_apply_cursor_move", |b| {
        let mut table = PresenceTable::new(0);
        let mut clock = 0;
        b.iter(|| {
            clock += 1;
            let update = PresenceUpdate {
                entries: vec![PresenceEntry {
                    client_id: 7,
                    clock,
                    state: Some(json!({"cursor": clock})),
                }],
            };
            black_box(table.apply_update(&update));
        })
    });
}

fn bench_merge_1000_keystrokes(c: &mut Criterion) {
    let deltas = typing_deltas(1000);

    c.bench_function("merge_1000_keystrokes", |b| {
        b.iter(|| {
            let mut replica = YrsState::new();
            for delta in &deltas {
                black_box(replica.apply_update(delta).unwrap());
            }
        })
    });
}

fn bench_diff_for_late_joiner(c: &mut Criterion) {
    let mut server = YrsState::new();
    for delta in typing_deltas(1000) {
        server.apply_update(&delta).unwrap();
    }
    let empty = YrsState::new().encode_state_vector();

    c.bench_function("diff_1000_keystrokes_for_late_joiner", |b| {
        b.iter(|| black_box(server.diff(black_box(&empty)).unwrap()))
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    c.bench_function("broadcast_1000_frames_100_peers", |b| {
        b.iter(|| {
            let group = BroadcastGroup::new(2048);
            let receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
            for i in 0..1000u32 {
                group.send(None, black_box(vec![i as u8; 64]));
            }
            black_box(receivers);
        })
    });
}

fn bench_session_update_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = Registry::new(RegistryConfig {
        broadcast_capacity: 4096,
        ..RegistryConfig::default()
    });
    let mut attachments = rt.block_on(async {
        let mut attachments = Vec::new();
        for _ in 0..100 {
            attachments.push(registry.attach("bench").await);
        }
        attachments
    });
    let session = attachments[0].session().clone();
    let origin = attachments[0].id();
    let mut writer = YrsState::new();
    let mut index = 0;

    c.bench_function("session_update_100_peers", |b| {
        b.iter(|| {
            let delta = writer.insert_text("content", index, "x");
            index += 1;
            black_box(session.handle_sync(origin, SyncMessage::Update(delta)).unwrap());
            for attachment in attachments.iter_mut().skip(1) {
                black_box(attachment.try_recv());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_frame_encode,
    bench_update_frame_decode,
    bench_presence_encode,
    bench_presence_apply,
    bench_merge_1000_keystrokes,
    bench_diff_for_late_joiner,
    bench_broadcast_100_peers,
    bench_session_update_fan_out,
);
criterion_main!(benches);
