use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gnutella_proto::header::Function;
use gnutella_session::{MqConfig, OutboundQueue};

fn fill(mq: &mut OutboundQueue, n: usize) {
    for i in 0..n {
        let ttl = 1 + (i % 6) as u8;
        let hops = (i % 3) as u8;
        mq.put(Function::Query, vec![0u8; 64], ttl, hops, 0);
    }
}

fn put_under_flow_control(c: &mut Criterion) {
    c.bench_function("put 5000 queries into a queue already in flow-control", |b| {
        b.iter(|| {
            let mut mq = OutboundQueue::new(
                MqConfig {
                    lowat: 1_000,
                    hiwat: 2_000,
                    maxsize: 500_000,
                    ..MqConfig::default()
                },
                0,
            );
            fill(&mut mq, 5_000);
            black_box(mq.size())
        })
    });
}

fn make_room_under_heavy_tombstoning(c: &mut Criterion) {
    c.bench_function("make_room search after heavy churn (qlink tombstone pressure)", |b| {
        b.iter(|| {
            let mut mq = OutboundQueue::new(
                MqConfig {
                    lowat: 1_000,
                    hiwat: 2_000,
                    maxsize: 4_000,
                    ..MqConfig::default()
                },
                0,
            );
            // Churn the queue so qlink accumulates tombstones before the
            // final push forces a make_room search.
            for round in 0..200 {
                fill(&mut mq, 10);
                for _ in 0..8 {
                    if let Some((_, bytes)) = mq.peek_write() {
                        let written = bytes.len();
                        mq.mark_written(written, round);
                    }
                }
            }
            mq.put(Function::Push, vec![0u8; 64], 1, 0, 0);
            black_box(mq.count())
        })
    });
}

criterion_group!(benches, put_under_flow_control, make_room_under_heavy_tombstoning);
criterion_main!(benches);
