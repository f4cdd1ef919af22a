//! Execution claiming benchmark
//!
//! Benchmarks the critical path: create execution → claim → complete.
//! This is the core scheduling performance metric.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use uuid::Uuid;

use durable_workflow::persistence::{ClaimOptions, ExecutionPatch, InMemoryStore, Store};
use durable_workflow::{Execution, ExecutionStatus};

async fn complete(store: &InMemoryStore, execution_id: Uuid) {
    store
        .update_execution_status(
            execution_id,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionPatch {
                result: Some(serde_json::json!({"ok": true})),
                completed_at: Some(Utc::now()),
                clear_lease: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

/// Benchmark single-threaded claiming (baseline)
fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1, 5, 10] {
        group.bench_with_input(
            BenchmarkId::new("batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let store = InMemoryStore::new();

                    let execution_count = (iters * batch_size as u64).max(100);
                    for i in 0..execution_count {
                        store
                            .create_execution(Execution::new(
                                Uuid::now_v7(),
                                "test_task",
                                serde_json::json!({"i": i}),
                            ))
                            .await
                            .unwrap();
                    }

                    let start = Instant::now();
                    let mut claimed_total = 0u64;

                    while claimed_total < execution_count {
                        let claimed = store
                            .claim(
                                "worker-1",
                                ClaimOptions {
                                    task_id: Some("test_task".to_string()),
                                },
                            )
                            .await
                            .unwrap();

                        match claimed {
                            Some(c) => {
                                complete(&store, c.execution.id).await;
                                claimed_total += 1;
                            }
                            None => break,
                        }
                    }

                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Benchmark concurrent claiming (contention)
fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/concurrent");
    group.sample_size(20);

    for workers in [2, 4, 8] {
        let execution_count = 5000u64;
        group.throughput(Throughput::Elements(execution_count));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter(|| async {
                    let store = Arc::new(InMemoryStore::new());

                    for i in 0..execution_count {
                        store
                            .create_execution(Execution::new(
                                Uuid::now_v7(),
                                "test_task",
                                serde_json::json!({"i": i}),
                            ))
                            .await
                            .unwrap();
                    }

                    let claimed_total = Arc::new(AtomicU64::new(0));

                    let mut handles = Vec::new();
                    for worker_id in 0..workers {
                        let store = store.clone();
                        let claimed_total = claimed_total.clone();

                        handles.push(tokio::spawn(async move {
                            let worker_name = format!("worker-{}", worker_id);
                            loop {
                                if claimed_total.load(Ordering::Relaxed) >= execution_count {
                                    break;
                                }

                                let claimed = store
                                    .claim(
                                        &worker_name,
                                        ClaimOptions {
                                            task_id: Some("test_task".to_string()),
                                        },
                                    )
                                    .await
                                    .unwrap();

                                match claimed {
                                    Some(c) => {
                                        complete(&store, c.execution.id).await;
                                        claimed_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                    None => tokio::task::yield_now().await,
                                }
                            }
                        }));
                    }

                    for handle in handles {
                        handle.await.unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark execution-creation latency
fn bench_enqueue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = InMemoryStore::new();

            let start = Instant::now();
            for i in 0..iters {
                store
                    .create_execution(Execution::new(
                        Uuid::now_v7(),
                        "test_task",
                        serde_json::json!({"i": i}),
                    ))
                    .await
                    .unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmark create-to-claim latency
fn bench_schedule_to_start(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("task_claiming/schedule_to_start");
    group.throughput(Throughput::Elements(100));

    for workers in [1, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter_custom(|_iters| async move {
                    let store = Arc::new(InMemoryStore::new());
                    let execution_count = 100u64;

                    let created_at: Arc<parking_lot::Mutex<Vec<(Uuid, Instant)>>> =
                        Arc::new(parking_lot::Mutex::new(Vec::new()));

                    for i in 0..execution_count {
                        let execution_id = Uuid::now_v7();
                        let create_time = Instant::now();
                        store
                            .create_execution(Execution::new(
                                execution_id,
                                "test_task",
                                serde_json::json!({"i": i}),
                            ))
                            .await
                            .unwrap();
                        created_at.lock().push((execution_id, create_time));
                    }

                    let total_latency = Arc::new(AtomicU64::new(0));
                    let claimed_count = Arc::new(AtomicU64::new(0));

                    let mut handles = Vec::new();
                    for worker_id in 0..workers {
                        let store = store.clone();
                        let created_at = created_at.clone();
                        let total_latency = total_latency.clone();
                        let claimed_count = claimed_count.clone();

                        handles.push(tokio::spawn(async move {
                            let worker_name = format!("worker-{}", worker_id);
                            loop {
                                let claimed = store
                                    .claim(
                                        &worker_name,
                                        ClaimOptions {
                                            task_id: Some("test_task".to_string()),
                                        },
                                    )
                                    .await
                                    .unwrap();

                                let Some(claimed) = claimed else {
                                    if claimed_count.load(Ordering::Relaxed) >= execution_count {
                                        break;
                                    }
                                    tokio::task::yield_now().await;
                                    continue;
                                };

                                let claim_time = Instant::now();
                                if let Some((_, create_time)) = created_at
                                    .lock()
                                    .iter()
                                    .find(|(id, _)| *id == claimed.execution.id)
                                {
                                    let latency = claim_time.duration_since(*create_time);
                                    total_latency.fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
                                }

                                complete(&store, claimed.execution.id).await;
                                claimed_count.fetch_add(1, Ordering::Relaxed);
                            }
                        }));
                    }

                    for handle in handles {
                        handle.await.unwrap();
                    }

                    let avg_latency_micros =
                        total_latency.load(Ordering::Relaxed) / execution_count.max(1);
                    Duration::from_micros(avg_latency_micros)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_single,
    bench_claim_concurrent,
    bench_enqueue,
    bench_schedule_to_start,
);

criterion_main!(benches);
