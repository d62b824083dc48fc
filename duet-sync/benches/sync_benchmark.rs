use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use duet_sync::protocol::{DocUpdate, Frame, RelayRequest, ShellUpdate};
use duet_sync::relay::RelayHub;
use duet_sync::{SharedDocument, ShellRegistry};
use uuid::Uuid;

fn bench_local_edits(c: &mut Criterion) {
    c.bench_function("document_100_local_inserts", |b| {
        b.iter(|| {
            let doc = SharedDocument::new();
            for i in 0..100 {
                doc.insert(doc.len(), black_box(if i % 2 == 0 { "ab" } else { "c\n" }))
                    .unwrap();
            }
            black_box(doc.unconfirmed_len());
        })
    });
}

fn bench_receive_remote(c: &mut Criterion) {
    let author = SharedDocument::new();
    for _ in 0..100 {
        author.insert(author.len(), "line of text\n").unwrap();
    }
    let batch = author.unconfirmed();

    c.bench_function("document_receive_100_updates", |b| {
        b.iter(|| {
            let doc = SharedDocument::new();
            doc.receive(black_box(batch.clone())).unwrap();
            black_box(doc.len());
        })
    });
}

fn bench_set_text_diff(c: &mut Criterion) {
    let base: String = (0..200).map(|i| format!("let v{i} = {i};\n")).collect();
    let edited = base.replacen("let v100 = 100;", "let v100 = 1000;", 1);

    c.bench_function("document_set_text_small_diff", |b| {
        b.iter(|| {
            let doc = SharedDocument::new();
            doc.set_text(&base);
            doc.set_text(black_box(&edited));
            black_box(doc.unconfirmed_len());
        })
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let frame = Frame::Call {
        id: 7,
        request: RelayRequest::PushUpdates {
            doc_name: "bench-room".to_string(),
            version: 42,
            updates: vec![DocUpdate {
                client_id: Uuid::new_v4(),
                changes: vec![1u8; 64],
            }],
        },
    };

    c.bench_function("frame_roundtrip_push_64B", |b| {
        b.iter(|| {
            let encoded = black_box(&frame).encode().unwrap();
            black_box(Frame::decode(&encoded).unwrap());
        })
    });
}

fn bench_shell_padding(c: &mut Criterion) {
    let uuid = Uuid::new_v4();
    // Reverse order forces padding on the first record
    let updates: Vec<ShellUpdate> = (0..1000)
        .rev()
        .map(|index| ShellUpdate::Info {
            uuid,
            index,
            data: "output line\n".to_string(),
        })
        .collect();

    c.bench_function("shell_apply_1000_infos_reversed", |b| {
        b.iter(|| {
            let registry = ShellRegistry::new();
            registry.apply_remote(black_box(updates.clone()));
            black_box(registry.queue_len());
        })
    });
}

fn bench_shell_ack(c: &mut Criterion) {
    let owner = Uuid::new_v4();

    c.bench_function("shell_append_and_ack_1000", |b| {
        b.iter(|| {
            let registry = ShellRegistry::new();
            let uuid = Uuid::new_v4();
            registry.spawn(uuid, owner);
            for _ in 0..1000 {
                registry.append_output(uuid, "x\n").unwrap();
            }
            let pending = registry.pending_updates();
            registry.acknowledge(&pending);
            black_box(registry.queue_len());
        })
    });
}

fn bench_relay_push_pull(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("relay_push_pull_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let hub = RelayHub::new(1024, usize::MAX);
                let mut seats = Vec::new();
                for i in 0..100 {
                    let (seat, rx) = hub
                        .join(Uuid::new_v4(), "bench-room", &format!("Peer{i}"))
                        .await
                        .unwrap();
                    seats.push((seat, rx));
                }

                let (author, _) = &seats[0];
                let push = RelayRequest::PushUpdates {
                    doc_name: "bench-room".to_string(),
                    version: 0,
                    updates: vec![DocUpdate {
                        client_id: author.peer_id,
                        changes: vec![0u8; 64],
                    }],
                };
                black_box(hub.handle(author, push).await);

                let pull = RelayRequest::PullUpdates {
                    doc_name: "bench-room".to_string(),
                    version: Some(0),
                    shell_version: None,
                };
                black_box(hub.handle(&seats[99].0, pull).await);
            });
        })
    });
}

criterion_group!(
    benches,
    bench_local_edits,
    bench_receive_remote,
    bench_set_text_diff,
    bench_frame_roundtrip,
    bench_shell_padding,
    bench_shell_ack,
    bench_relay_push_pull,
);
criterion_main!(benches);
