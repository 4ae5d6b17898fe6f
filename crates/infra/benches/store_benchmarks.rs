use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use courier_infra::config::CourierOptions;
use courier_infra::message_store::{InMemoryMessageStore, MessageStore};
use courier_infra::outbox::MessagePublisher;
use courier_infra::sender::MessageSender;
use courier_messaging::{Content, InMemoryTransport, MessageStatus};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn payload() -> Content {
    Content::new(serde_json::json!({ "order_id": 42, "lines": [1, 2, 3] }))
}

/// Store a batch of outbound rows, then mark every other one failed.
async fn seeded_store(rows: usize) -> Arc<InMemoryMessageStore> {
    let options = CourierOptions::default().with_fallback_window(Duration::ZERO);
    let store = Arc::new(InMemoryMessageStore::new(options));
    let cancel = CancellationToken::new();

    for i in 0..rows {
        let m = store.store_message("orders.placed", &payload(), None, &cancel).await.unwrap();
        if i % 2 == 0 {
            store
                .change_publish_state(&m, MessageStatus::Failed, None, &cancel)
                .await
                .unwrap();
        }
    }
    store
}

fn bench_store_message(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("store_message");
    group.throughput(Throughput::Elements(1));

    let store = InMemoryMessageStore::new(CourierOptions::default());
    let cancel = CancellationToken::new();
    group.bench_function("auto_commit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(store.store_message("orders.placed", &payload(), None, &cancel).await.unwrap())
        })
    });

    group.bench_function("in_transaction", |b| {
        b.to_async(&rt).iter(|| async {
            let mut tx = store.begin(&cancel).await.unwrap();
            store
                .store_message("orders.placed", &payload(), Some(&mut tx), &cancel)
                .await
                .unwrap();
            store.commit(tx).await.unwrap();
        })
    });

    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish");

    let options = CourierOptions::default();
    let store = Arc::new(InMemoryMessageStore::new(options.clone()));
    let transport = Arc::new(InMemoryTransport::new());
    let sender = Arc::new(MessageSender::new(store.clone(), transport, options));
    let publisher = MessagePublisher::new(store, sender);
    let cancel = CancellationToken::new();

    group.bench_function("store_and_send", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(publisher.publish("orders.placed", payload(), &cancel).await.unwrap())
        })
    });

    group.finish();
}

fn bench_retry_query(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("retry_query");

    for rows in [100usize, 1_000, 10_000] {
        let store = rt.block_on(seeded_store(rows));
        let cancel = CancellationToken::new();
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    store
                        .get_published_messages_of_need_retry(Duration::ZERO, &cancel)
                        .await
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

fn bench_statistics(c: &mut Criterion) {
    let rt = runtime();
    let store = rt.block_on(seeded_store(10_000));
    let cancel = CancellationToken::new();

    c.bench_function("statistics_10k", |b| {
        b.to_async(&rt).iter(|| async {
            let stats = store.statistics(&cancel).await.unwrap();
            black_box(stats.published.total())
        })
    });

}

criterion_group!(
    benches,
    bench_store_message,
    bench_publish,
    bench_retry_query,
    bench_statistics
);
criterion_main!(benches);
