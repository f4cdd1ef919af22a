//! Concurrent workers benchmark
//!
//! Measures claim throughput and schedule-to-claim latency under
//! multi-worker contention against a single shared `InMemoryStore`,
//! the property spec §8 calls out for the Store/Worker boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use uuid::Uuid;

use durable_workflow::persistence::{ClaimOptions, ExecutionPatch, InMemoryStore, Store};
use durable_workflow::{Execution, ExecutionStatus};

async fn run_scenario(execution_count: u64, worker_count: usize) -> Vec<Duration> {
    let store = Arc::new(InMemoryStore::new());
    let created_at: Arc<Mutex<std::collections::HashMap<Uuid, Instant>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));

    for i in 0..execution_count {
        let execution_id = Uuid::now_v7();
        let created = Instant::now();
        store
            .create_execution(Execution::new(
                execution_id,
                "benchmark_task",
                serde_json::json!({ "i": i }),
            ))
            .await
            .unwrap();
        created_at.lock().insert(execution_id, created);
    }

    let completed = Arc::new(AtomicU64::new(0));
    let latencies = Arc::new(Mutex::new(Vec::with_capacity(execution_count as usize)));

    let mut handles = Vec::new();
    for worker_id in 0..worker_count {
        let store = store.clone();
        let created_at = created_at.clone();
        let completed = completed.clone();
        let latencies = latencies.clone();

        handles.push(tokio::spawn(async move {
            let worker_name = format!("worker-{}", worker_id);
            loop {
                if completed.load(Ordering::Relaxed) >= execution_count {
                    break;
                }

                let claimed = store
                    .claim(
                        &worker_name,
                        ClaimOptions {
                            task_id: Some("benchmark_task".to_string()),
                        },
                    )
                    .await
                    .unwrap();

                let Some(claimed) = claimed else {
                    tokio::task::yield_now().await;
                    continue;
                };

                let claim_time = Instant::now();
                if let Some(created) = created_at.lock().get(&claimed.execution.id).copied() {
                    latencies.lock().push(claim_time.duration_since(created));
                }

                store
                    .update_execution_status(
                        claimed.execution.id,
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

                completed.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    Arc::try_unwrap(latencies).unwrap().into_inner()
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx]
}

fn bench_concurrent_claim(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("concurrent_workers/claim_throughput");
    group.sample_size(10);

    for workers in [1, 10, 50, 100] {
        let execution_count = 2_000u64;
        group.throughput(Throughput::Elements(execution_count));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let start = Instant::now();
                        let mut latencies = run_scenario(execution_count, workers).await;
                        total += start.elapsed();

                        latencies.sort();
                        eprintln!(
                            "workers={workers} schedule-to-claim: p50={:?} p99={:?}",
                            percentile(&latencies, 0.50),
                            percentile(&latencies, 0.99)
                        );
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_concurrent_claim);
criterion_main!(benches);
