use crate::utils::*;
use applier::buffer::{ApplierSettings, TaskBufferingApplier};
use applier::chaos::{NoChaos, ProbabilisticChaos, ScriptedChaos};
use applier::sink::{MemorySink, Sink};
use model::augment::row::{AugmentedRow, AugmentedRowsEvent, CellChange, RowOp};
use model::binlog::event::BinlogEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replicator_core::metrics::{Counter, ReplicatorMetrics};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

/// Deterministic pseudo-random trace: `transactions` transactions over t1
/// and t2 with mixed operations. Returns the trace and the number of row
/// events it carries.
fn random_trace(seed: u64, transactions: usize) -> (Vec<BinlogEvent>, u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut builder = TraceBuilder::new().rotate(START_FILE).format_description();
    let mut rows_total = 0u64;

    for txn in 0..transactions {
        builder = builder.at(T0 + txn as u32).begin();
        for _ in 0..rng.gen_range(1..=4u32) {
            let rows: usize = rng.gen_range(1..=3);
            rows_total += rows as u64;
            match rng.gen_range(0..4) {
                0 => {
                    let images: Vec<(i64, i64, i64)> = (0..rows)
                        .map(|_| {
                            let id = rng.gen_range(1..100);
                            (id, rng.gen_range(0..10), rng.gen_range(0..10))
                        })
                        .collect();
                    builder = builder.insert_t1(&images);
                }
                1 => {
                    let images: Vec<((i64, i64, i64), (i64, i64, i64))> = (0..rows)
                        .map(|_| {
                            let id = rng.gen_range(1..100);
                            let a = rng.gen_range(0..10);
                            ((id, a, 0), (id, a + 1, 0))
                        })
                        .collect();
                    builder = builder.update_t1(&images);
                }
                2 => {
                    let images: Vec<(i64, i64, i64)> = (0..rows)
                        .map(|_| (rng.gen_range(1..100), 0, 0))
                        .collect();
                    builder = builder.delete_t1(&images);
                }
                _ => {
                    let images: Vec<(i64, i64)> = (0..rows)
                        .map(|_| (rng.gen_range(1..100), rng.gen_range(0..10)))
                        .collect();
                    builder = builder.insert_t2(&images);
                }
            }
        }
        builder = if txn % 2 == 0 {
            builder.commit()
        } else {
            builder.xid(txn as u64)
        };
    }
    (builder.build(), rows_total)
}

// Invariant: for any finite trace, the rows committed after drain equal the
// row events delivered, and the per-table totals add up to the same number.
#[traced_test]
#[tokio::test]
async fn row_conservation() {
    let (trace, rows_total) = random_trace(7, 30);
    let mut config = base_config();
    config.task_row_buffer_limit = 7;

    let outcome = run_trace(trace, config, Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    assert_eq!(outcome.metrics.sum(Counter::RowsReceived), rows_total);
    assert_eq!(outcome.metrics.sum(Counter::RowsCommitted), rows_total);
    let per_table = outcome.metrics.table_total("t1", Counter::RowsCommitted)
        + outcome.metrics.table_total("t2", Counter::RowsCommitted);
    assert_eq!(per_table, rows_total);
}

// Invariant: replaying the same trace twice yields byte-identical sink
// state: same keys, same timestamps, same values.
#[traced_test]
#[tokio::test]
async fn idempotent_replay() {
    let mut config = base_config();
    config.task_row_buffer_limit = 5;

    let (trace_a, _) = random_trace(11, 20);
    let (trace_b, _) = random_trace(11, 20);

    let first = run_trace(trace_a, config.clone(), Arc::new(NoChaos)).await;
    first.result.unwrap();
    let second = run_trace(trace_b, config, Arc::new(NoChaos)).await;
    second.result.unwrap();

    assert_eq!(first.sink.snapshot(), second.sink.snapshot());
}

// Invariant: within one transaction, cell timestamps are strictly
// increasing in producer order, even when every row shares one binlog
// second.
#[traced_test]
#[tokio::test]
async fn timestamp_monotonicity_within_a_transaction() {
    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(1, 1, 1), (2, 2, 2)])
        .insert_t1(&[(3, 3, 3), (4, 4, 4)])
        .insert_t1(&[(5, 5, 5)])
        .commit()
        .build();

    let outcome = run_trace(trace, base_config(), Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    let mut last = 0u64;
    for id in 1..=5u64 {
        let t = ts(T0, id);
        assert_eq!(
            outcome
                .sink
                .cell("t1", &id.to_string(), "row_status", t)
                .as_deref(),
            Some("I"),
            "row {id} missing at its expected timestamp"
        );
        assert!(t > last, "timestamps must strictly increase");
        last = t;
    }
}

// Invariant: a transaction spanning two tasks carries the same transaction
// UUID in both, and only the cut that saw it open carries it forward.
#[traced_test]
#[tokio::test]
async fn transaction_continuity_across_task_cuts() {
    let metrics = ReplicatorMetrics::new();
    let mut applier = TaskBufferingApplier::new(
        ApplierSettings::new(4),
        Arc::new(MemorySink::new()) as Arc<dyn Sink>,
        Arc::new(NoChaos),
        metrics.clone(),
    );
    let transaction = applier.current_transaction_id();

    applier.buffer_rows_event(&insert_event(&[1, 2])).unwrap();
    applier.rotate_current_task().await.unwrap();
    applier.buffer_rows_event(&insert_event(&[3, 4])).unwrap();

    let snapshots = applier.tasks_snapshot();
    let carrying: Vec<_> = snapshots
        .iter()
        .filter(|s| s.transactions.iter().any(|(id, _, _)| *id == transaction))
        .collect();
    assert_eq!(carrying.len(), 2, "both tasks must carry the transaction");

    applier.mark_current_transaction_for_commit(None).unwrap();
    applier.drain().await.unwrap();
    assert_eq!(metrics.sum(Counter::RowsCommitted), 4);
}

// Invariant: after drain, no task survives in any map.
#[traced_test]
#[tokio::test]
async fn no_phantom_tasks_after_drain() {
    let metrics = ReplicatorMetrics::new();
    let mut applier = TaskBufferingApplier::new(
        ApplierSettings::new(2),
        Arc::new(MemorySink::new()) as Arc<dyn Sink>,
        Arc::new(ScriptedChaos::new(1, 2)),
        metrics.clone(),
    );

    for round in 0..5u64 {
        applier
            .buffer_rows_event(&insert_event(&[round as i64 * 2, round as i64 * 2 + 1]))
            .unwrap();
        applier.mark_current_transaction_for_commit(None).unwrap();
        applier.force_flush().await.unwrap();
    }
    applier.drain().await.unwrap();

    assert_eq!(applier.live_task_count(), 0);
    assert!(applier.tasks_snapshot().is_empty());
    assert_eq!(metrics.sum(Counter::RowsCommitted), 10);
}

// Invariant: the live task count never exceeds POOL_SIZE + 1, even with a
// sink slow enough to keep every worker busy.
#[traced_test]
#[tokio::test]
async fn backpressure_bounds_live_tasks() {
    let metrics = ReplicatorMetrics::new();
    let mut applier = TaskBufferingApplier::new(
        ApplierSettings::new(2),
        Arc::new(SlowSink::new(Duration::from_millis(20))) as Arc<dyn Sink>,
        Arc::new(NoChaos),
        metrics.clone(),
    );

    let mut max_live = 0;
    for round in 0..10i64 {
        applier
            .buffer_rows_event(&insert_event(&[round * 2, round * 2 + 1]))
            .unwrap();
        applier.mark_current_transaction_for_commit(None).unwrap();
        applier.force_flush().await.unwrap();
        max_live = max_live.max(applier.live_task_count());
    }
    applier.drain().await.unwrap();

    assert!(
        max_live <= 3,
        "live tasks reached {max_live}, bound is POOL_SIZE + 1"
    );
    assert_eq!(metrics.sum(Counter::RowsCommitted), 20);
}

// Invariant: with chaos firing on every hook at 5%, the final sink state is
// identical to the chaos-free run.
#[traced_test]
#[tokio::test]
async fn chaos_tolerance() {
    let mut config = base_config();
    config.task_row_buffer_limit = 5;

    let (trace_calm, _) = random_trace(23, 15);
    let (trace_chaotic, _) = random_trace(23, 15);

    let calm = run_trace(trace_calm, config.clone(), Arc::new(NoChaos)).await;
    calm.result.unwrap();

    let chaotic = run_trace(
        trace_chaotic,
        config,
        Arc::new(ProbabilisticChaos::seeded(0.05, 99)),
    )
    .await;
    chaotic.result.unwrap();

    assert_eq!(calm.sink.snapshot(), chaotic.sink.snapshot());
    assert!(chaotic.metrics.sum(Counter::ApplierTasksSucceeded) > 0);
}

fn insert_event(ids: &[i64]) -> AugmentedRowsEvent {
    let mut event = AugmentedRowsEvent::default();
    for (i, id) in ids.iter().enumerate() {
        event.push(AugmentedRow {
            table: "t1".to_string(),
            op: RowOp::Insert,
            commit_micros: ts(T0, i as u64 + 1) + *id as u64 * 1_000,
            row_key: id.to_string(),
            cells: vec![CellChange {
                column: "a".to_string(),
                before: None,
                after: Some(id.to_string()),
            }],
        });
    }
    event
}
