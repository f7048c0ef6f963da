use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pool_orchestrator::prelude::*;
use pool_orchestrator::routing::TaskRouter;
use serde_json::{json, Value};
use tokio::runtime::Runtime;

fn synthetic(count: usize) -> HealthSnapshot {
    let pools = (0..count)
        .map(|i| {
            let active = i % 7;
            PoolHealth {
                pool_id: PoolId::new(),
                name: format!("p{}", i),
                status: PoolStatus::Healthy,
                backend_type: BackendType::Local,
                tags: Vec::new(),
                total_workers: 8,
                idle_workers: 8 - active,
                busy_workers: active,
                unhealthy_workers: 0,
                terminating_workers: 0,
                active_tasks: active,
                queued_tasks: 0,
                queue_capacity: 16,
                min_workers: 1,
                max_workers: 8,
                load_ratio: active as f64 / 8.0,
                utilization: active as f64 / 8.0,
                last_health_check: Some(Utc::now()),
            }
        })
        .collect();
    HealthSnapshot::capture(pools)
}

fn benchmark_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");

    for count in [4usize, 32, 256] {
        let snapshot = synthetic(count);
        let router = TaskRouter::default();
        let task = Task::new("bench", Value::Null).with_affinity_key("tenant-42");

        for strategy in RoutingStrategy::ALL {
            group.bench_with_input(BenchmarkId::new(strategy.as_str(), count), &count, |b, _| {
                b.iter(|| {
                    let decision = router
                        .route(&snapshot, &task, Some(strategy))
                        .expect("Failed to route");
                    black_box(decision);
                });
            });
        }
    }

    group.finish();
}

fn benchmark_execute(c: &mut Criterion) {
    let runtime = Runtime::new().expect("Failed to create runtime");
    let manager = PoolManager::new(ManagerConfig::default()).expect("Failed to create manager");
    let pool_id = runtime
        .block_on(manager.register(PoolConfig::new("bench", BackendType::Local).with_workers(4, 4)))
        .expect("Failed to register pool");

    c.bench_function("execute_echo", |b| {
        b.to_async(&runtime).iter(|| async {
            let result = manager
                .execute(pool_id, Task::new("echo", json!(1)))
                .await
                .expect("Failed to execute");
            black_box(result);
        });
    });

    c.bench_function("submit_least_loaded", |b| {
        b.to_async(&runtime).iter(|| async {
            let result = manager
                .submit(Task::new("echo", json!(1)), None)
                .await
                .expect("Failed to submit");
            black_box(result);
        });
    });

    runtime
        .block_on(manager.shutdown())
        .expect("Failed to shutdown manager");
}

fn benchmark_distribute(c: &mut Criterion) {
    let runtime = Runtime::new().expect("Failed to create runtime");
    let manager = PoolManager::new(ManagerConfig::default()).expect("Failed to create manager");
    runtime.block_on(async {
        for i in 0..4 {
            manager
                .register(PoolConfig::new(format!("p{}", i), BackendType::Local).with_workers(2, 4))
                .await
                .expect("Failed to register pool");
        }
    });

    let mut group = c.benchmark_group("distribute");
    let items: Vec<u64> = (0..32).collect();
    let task = Task::new("sum", json!({ "items": items }));

    group.bench_function("broadcast_4_pools", |b| {
        b.to_async(&runtime).iter(|| async {
            let report = manager
                .distribute(&task, DistributionStrategy::Broadcast, None, None)
                .await
                .expect("Failed to broadcast");
            black_box(report);
        });
    });

    group.bench_function("map_reduce_32_items", |b| {
        b.to_async(&runtime).iter(|| async {
            let report = manager
                .distribute(&task, DistributionStrategy::MapReduce, Some("items"), Some("sum"))
                .await
                .expect("Failed to map-reduce");
            black_box(report);
        });
    });

    group.finish();
    runtime
        .block_on(manager.shutdown())
        .expect("Failed to shutdown manager");
}

criterion_group!(benches, benchmark_route, benchmark_execute, benchmark_distribute);
criterion_main!(benches);
