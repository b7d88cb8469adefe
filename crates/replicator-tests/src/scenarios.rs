use crate::utils::*;
use applier::buffer::{ApplierSettings, TaskBufferingApplier};
use applier::chaos::{NoChaos, ScriptedChaos};
use applier::sink::MemorySink;
use model::binlog::event::{BinlogEvent, EventHeader};
use model::binlog::position::BinlogPosition;
use pipeline::augmenter::Augmenter;
use pipeline::orchestrator::{OrchestratorSettings, PipelineOrchestrator};
use pipeline::position::{FakeMicrosecondsCounter, PipelinePosition};
use pipeline::schema::SchemaCache;
use replicator_core::metrics::{Counter, ReplicatorMetrics};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

// Scenario: one transaction inserting a single row.
// Expected: the sink holds the column cell and the row_status marker, both
// versioned at T*1e6+1, and the counters report one row through one task.
#[traced_test]
#[tokio::test]
async fn s1_single_insert() {
    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .format_description()
        .begin()
        .insert_t1(&[(7, 1, 5)])
        .commit()
        .build();

    let outcome = run_trace(trace, base_config(), Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    let t = ts(T0, 1);
    assert_eq!(outcome.sink.cell("t1", "7", "a", t).as_deref(), Some("1"));
    assert_eq!(outcome.sink.cell("t1", "7", "row_status", t).as_deref(), Some("I"));
    assert_eq!(outcome.metrics.sum(Counter::RowsReceived), 1);
    assert_eq!(outcome.metrics.sum(Counter::ApplierTasksSucceeded), 1);
}

// Scenario: an update changing only column `a` (b keeps its value).
// Expected: only `a` and row_status are written at the update's timestamp;
// no cell for `b`.
#[traced_test]
#[tokio::test]
async fn s2_update_writes_only_changed_cells() {
    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(7, 1, 5)])
        .commit()
        .at(T0 + 10)
        .begin()
        .update_t1(&[((7, 1, 5), (7, 2, 5))])
        .commit()
        .build();

    let outcome = run_trace(trace, base_config(), Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    let t = ts(T0 + 10, 1);
    assert_eq!(outcome.sink.cell("t1", "7", "a", t).as_deref(), Some("2"));
    assert_eq!(outcome.sink.cell("t1", "7", "row_status", t).as_deref(), Some("U"));
    assert_eq!(outcome.sink.cell("t1", "7", "b", t), None);
    assert_eq!(outcome.sink.cell("t1", "7", "id", t), None);
}

// Scenario: a delete after an insert.
// Expected: the delete writes a single row_status='D' cell; the column
// cells from the insert survive as history.
#[traced_test]
#[tokio::test]
async fn s3_delete_preserves_history() {
    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(7, 1, 5)])
        .commit()
        .at(T0 + 20)
        .begin()
        .delete_t1(&[(7, 1, 5)])
        .commit()
        .build();

    let outcome = run_trace(trace, base_config(), Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    let delete_ts = ts(T0 + 20, 1);
    assert_eq!(
        outcome.sink.cell("t1", "7", "row_status", delete_ts).as_deref(),
        Some("D")
    );
    assert_eq!(outcome.sink.cell("t1", "7", "a", delete_ts), None);
    // History from the insert is untouched.
    assert_eq!(
        outcome.sink.cell("t1", "7", "a", ts(T0, 1)).as_deref(),
        Some("1")
    );
}

// Scenario: a transaction twice the size of the task row budget.
// Expected: the buffer is cut mid-transaction, producing two tasks, and
// every row still commits exactly once.
#[traced_test]
#[tokio::test]
async fn s4_transaction_spanning_two_tasks() {
    let mut config = base_config();
    config.task_row_buffer_limit = 4;

    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(1, 1, 1), (2, 2, 2), (3, 3, 3), (4, 4, 4)])
        .insert_t1(&[(5, 5, 5), (6, 6, 6), (7, 7, 7), (8, 8, 8)])
        .commit()
        .build();

    let outcome = run_trace(trace, config, Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    assert_eq!(outcome.metrics.sum(Counter::RowsReceived), 8);
    assert_eq!(outcome.metrics.sum(Counter::RowsCommitted), 8);
    assert_eq!(outcome.metrics.sum(Counter::ApplierTasksSucceeded), 2);
    for id in 1..=8 {
        let t = ts(T0, id);
        assert_eq!(
            outcome
                .sink
                .cell("t1", &id.to_string(), "row_status", t)
                .as_deref(),
            Some("I")
        );
    }
}

// Scenario: the chaos monkey fails the first flush attempt silently.
// Expected: the task is requeued and the retry succeeds; the failure and
// the success are both counted and the sink ends up complete.
#[traced_test]
#[tokio::test]
async fn s5_failed_task_is_retried() {
    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(7, 1, 5)])
        .commit()
        .build();

    let outcome = run_trace(trace, base_config(), Arc::new(ScriptedChaos::new(0, 1))).await;
    outcome.result.unwrap();

    assert_eq!(outcome.metrics.sum(Counter::ApplierTasksFailed), 1);
    assert_eq!(outcome.metrics.sum(Counter::ApplierTasksSucceeded), 1);
    assert_eq!(
        outcome.sink.cell("t1", "7", "a", ts(T0, 1)).as_deref(),
        Some("1")
    );
}

// Scenario: the binlog client delivers the same rotate twice.
// Expected: the duplicate is suppressed and the recorded binlog position is
// unchanged by it.
#[traced_test]
#[tokio::test]
async fn s6_duplicate_rotate_is_suppressed() {
    let metrics = ReplicatorMetrics::new();
    let positions = Arc::new(PipelinePosition::new(BinlogPosition::new(START_FILE, 4)));
    let counter = Arc::new(FakeMicrosecondsCounter::new());
    let applier = TaskBufferingApplier::new(
        ApplierSettings::new(2),
        Arc::new(MemorySink::new()),
        Arc::new(NoChaos),
        metrics.clone(),
    );
    let augmenter = Augmenter::new(SchemaCache::new(Arc::new(test_active_schema())));

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let orchestrator = PipelineOrchestrator::new(
        rx,
        applier,
        augmenter,
        metrics,
        Arc::clone(&positions),
        counter,
        OrchestratorSettings {
            ending_binlog_file: None,
            task_row_budget: 1000,
        },
        CancellationToken::new(),
    );

    let header = EventHeader {
        timestamp: T0,
        next_position: 44,
    };
    tx.send(BinlogEvent::Rotate {
        header,
        next_file: "mysql-bin.000002".to_string(),
        position: 4,
    })
    .await
    .unwrap();
    // The known double-rotate artifact: identical file name, later offset.
    tx.send(BinlogEvent::Rotate {
        header,
        next_file: "mysql-bin.000002".to_string(),
        position: 999,
    })
    .await
    .unwrap();
    drop(tx);

    orchestrator.run().await.unwrap();

    let position = positions.last_known();
    assert_eq!(position.file, "mysql-bin.000002");
    assert_eq!(position.offset, 4);
}

// The ending binlog file is inclusive: its events are applied, and the
// rotate past it flushes and stops before the next file's transactions.
#[traced_test]
#[tokio::test]
async fn ending_binlog_file_stops_after_flush() {
    let mut config = base_config();
    config.ending_binlog_file_name = Some(START_FILE.to_string());

    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(1, 1, 1)])
        .commit()
        .rotate("mysql-bin.000002")
        .begin()
        .insert_t1(&[(2, 2, 2)])
        .commit()
        .build();

    let outcome = run_trace(trace, config, Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    assert_eq!(outcome.metrics.sum(Counter::RowsCommitted), 1);
    assert_eq!(
        outcome
            .sink
            .cell("t1", "1", "row_status", ts(T0, 1))
            .as_deref(),
        Some("I")
    );
    assert_eq!(outcome.sink.cell("t1", "2", "row_status", ts(T0, 1)), None);
}

// Delta-tracked tables receive the same mutations a second time against
// the day-suffixed table, key-prefixed with the commit day.
#[traced_test]
#[tokio::test]
async fn delta_tables_get_a_second_copy() {
    let mut config = base_config();
    config.write_recent_changes_to_delta_tables = true;
    config.tables_for_which_to_track_daily_changes = vec!["t1".to_string()];

    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(7, 1, 5)])
        .commit()
        .build();

    let outcome = run_trace(trace, config, Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    let t = ts(T0, 1);
    // 2015-12-13 is the commit day of T0.
    let day = model::sink::row_key::commit_day(t);
    let delta_table = format!("t1_{day}");
    let delta_key = format!("{day}\u{1F}7");
    assert_eq!(
        outcome.sink.cell(&delta_table, &delta_key, "a", t).as_deref(),
        Some("1")
    );
    assert_eq!(outcome.sink.cell("t1", "7", "a", t).as_deref(), Some("1"));
    // Both copies count toward per-table totals under their own name.
    assert_eq!(outcome.metrics.table_total("t1", Counter::RowsCommitted), 1);
    assert_eq!(
        outcome.metrics.table_total(&delta_table, Counter::RowsCommitted),
        1
    );
}

// Xid events demarcate commits exactly like COMMIT query events.
#[traced_test]
#[tokio::test]
async fn xid_commits_the_transaction() {
    let trace = TraceBuilder::new()
        .rotate(START_FILE)
        .begin()
        .insert_t1(&[(7, 1, 5)])
        .xid(7777)
        .build();

    let outcome = run_trace(trace, base_config(), Arc::new(NoChaos)).await;
    outcome.result.unwrap();

    assert_eq!(outcome.metrics.sum(Counter::RowsCommitted), 1);
    assert_eq!(
        outcome
            .sink
            .cell("t1", "7", "row_status", ts(T0, 1))
            .as_deref(),
        Some("I")
    );
}
