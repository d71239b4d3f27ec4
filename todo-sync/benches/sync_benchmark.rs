use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use todo_sync::connection::ConnectionRegistry;
use todo_sync::model::{Item, ItemId};
use todo_sync::ordering::{build_tree, cascade_delete};
use todo_sync::protocol::{OutboundFrame, TYPE_SAVE_ITEM};
use todo_sync::subscription::SubscriptionTracker;
use uuid::Uuid;

fn item(id: ItemId, parent_id: Option<ItemId>, after_id: Option<ItemId>) -> Item {
    Item {
        id,
        name: format!("item {id}"),
        cost: None,
        done: false,
        parent_id,
        after_id,
        list_id: 1,
        created_at: 0,
    }
}

/// One sibling chain of `n` items, stored in reverse order.
fn chain(n: ItemId) -> Vec<Item> {
    (1..=n)
        .rev()
        .map(|id| item(id, None, (id > 1).then_some(id - 1)))
        .collect()
}

/// 100 parents with 10 children each.
fn nested() -> Vec<Item> {
    let mut items = Vec::new();
    for p in 0..100 {
        let parent = p * 11 + 1;
        items.push(item(parent, None, (p > 0).then_some(parent - 11)));
        for c in 1..=10 {
            let id = parent + c;
            items.push(item(id, Some(parent), (c > 1).then_some(id - 1)));
        }
    }
    items
}

fn bench_build_tree_chain(c: &mut Criterion) {
    let items = chain(1_000);
    c.bench_function("build_tree_chain_1K", |b| {
        b.iter(|| black_box(build_tree(black_box(&items)).unwrap()))
    });
}

fn bench_build_tree_nested(c: &mut Criterion) {
    let items = nested();
    c.bench_function("build_tree_nested_1100", |b| {
        b.iter(|| black_box(build_tree(black_box(&items)).unwrap()))
    });
}

fn bench_cascade_delete(c: &mut Criterion) {
    let items = nested();
    c.bench_function("cascade_delete_parent_of_10", |b| {
        b.iter(|| black_box(cascade_delete(black_box(&items), 551)))
    });
}

fn bench_fanout_100_subscribers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(ConnectionRegistry::new(1024));
    let tracker = SubscriptionTracker::new(registry.clone());
    let list = Uuid::new_v4();

    let receivers: Vec<_> = rt.block_on(async {
        let mut receivers = Vec::new();
        for _ in 0..100 {
            let (conn, rx) = registry.register().await;
            tracker.subscribe(list, conn).await;
            receivers.push(rx);
        }
        receivers
    });

    let frame = OutboundFrame::broadcast(
        TYPE_SAVE_ITEM,
        json!({ "id": 1, "name": "milk", "cost": "2.50", "index": -1 }),
    );

    c.bench_function("fanout_100_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(tracker.fanout(&list, &frame).await.unwrap());
            })
        })
    });

    // Keep receivers alive so sends count as delivered, not failed.
    drop(receivers);
}

criterion_group!(
    benches,
    bench_build_tree_chain,
    bench_build_tree_nested,
    bench_cascade_delete,
    bench_fanout_100_subscribers,
);
criterion_main!(benches);
