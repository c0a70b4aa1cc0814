/// Benchmarks for server-side fan-out.
///
/// A broadcast serializes the frame once and queues it on every connection, so cost
/// should grow with the connection count and not with serialization.
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use finreview_realtime::server::Hub;
use finreview_realtime::server::hub::Outbound;
use finreview_realtime::types::Frame;

fn drain(outbound: &mut [Outbound]) {
    for rx in outbound {
        while rx.try_recv().is_ok() {}
    }
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub/broadcast");

    for connections in [1_usize, 16, 256, 1024] {
        let hub = Hub::default();
        let mut outbound: Vec<Outbound> = (0..connections).map(|_| hub.admit().1).collect();
        drain(&mut outbound);

        let frame = Frame::analysis_update(None, "a-1024", "completed");

        group.throughput(Throughput::Elements(connections as u64));
        group.bench_with_input(
            BenchmarkId::new("analysis_update", connections),
            &frame,
            |b, frame| {
                b.iter(|| {
                    let delivered = hub.broadcast(std::hint::black_box(frame));
                    drain(&mut outbound);
                    delivered
                });
            },
        );
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub/dispatch");

    let hub = Hub::default();
    let (sender, mut sender_rx) = hub.admit();
    let mut peers: Vec<Outbound> = (0..64).map(|_| hub.admit().1).collect();

    let ping = r#"{"type": "ping", "timestamp": 1700000000000}"#;
    group.bench_function("ping", |b| {
        b.iter(|| {
            let outcome = hub.dispatch(sender, std::hint::black_box(ping));
            while sender_rx.try_recv().is_ok() {}
            outcome
        });
    });

    let chat = r#"{"type": "chat", "userId": "analyst-1", "message": "figures reconciled"}"#;
    group.bench_function("chat to 65", |b| {
        b.iter(|| {
            let outcome = hub.dispatch(sender, std::hint::black_box(chat));
            while sender_rx.try_recv().is_ok() {}
            drain(&mut peers);
            outcome
        });
    });

    group.finish();
}

criterion_group!(hub_benches, bench_broadcast, bench_dispatch);
criterion_main!(hub_benches);
