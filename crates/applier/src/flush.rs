use crate::chaos::ChaosMonkey;
use crate::result::TaskResult;
use crate::sink::Sink;
use crate::task::{Task, TaskStatus, Transaction};
use replicator_core::metrics::{Counter, ReplicatorMetrics};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// A flush job that aborted instead of reporting a result. The reaper
/// treats `ChaosException` like any crashed worker (requeue); a vanished
/// task is a broken invariant and surfaces as fatal.
#[derive(Error, Debug)]
pub enum FlushError {
    #[error("chaos monkey exception {0}")]
    ChaosException(&'static str),

    #[error("task {0} disappeared from the buffer during flush")]
    TaskVanished(Uuid),
}

pub type SharedTasks = Arc<Mutex<HashMap<Uuid, Task>>>;

/// Flushes one submitted task to the sink.
///
/// Walks the row-id buffer for the row counts first, then writes each
/// transaction's per-table batches in buffer order. Any sink error is
/// recorded in the task's message log and the task reports WRITE_FAILED;
/// the buffers stay intact for the retry.
pub async fn flush_task(
    task_id: Uuid,
    tasks: SharedTasks,
    sink: Arc<dyn Sink>,
    chaos: Arc<dyn ChaosMonkey>,
    metrics: ReplicatorMetrics,
    dry_run: bool,
) -> Result<TaskResult, FlushError> {
    let transactions = snapshot_transactions(&tasks, task_id)?;

    let mut rows_in_task = 0u64;
    let mut per_table_rows: HashMap<String, u64> = HashMap::new();
    for transaction in &transactions {
        for batch in &transaction.tables {
            let rows = batch.row_keys.len() as u64;
            rows_in_task += rows;
            *per_table_rows.entry(batch.table.clone()).or_insert(0) += rows;
        }
    }
    info!(task = %task_id, rows = rows_in_task, "flushing task");

    if dry_run {
        set_status(&tasks, task_id, TaskStatus::WriteSucceeded)?;
        return Ok(TaskResult::new(task_id, true, rows_in_task, per_table_rows));
    }

    if chaos.throw_after_task_submitted() {
        return Err(FlushError::ChaosException("for submitted task"));
    }
    if chaos.fail_after_task_submitted() {
        set_status(&tasks, task_id, TaskStatus::WriteFailed)?;
        return Ok(TaskResult::new(task_id, false, rows_in_task, per_table_rows));
    }

    set_status(&tasks, task_id, TaskStatus::WriteInProgress)?;
    metrics.inc(Counter::ApplierTasksInProgress);

    if chaos.throw_for_task_in_progress() {
        return Err(FlushError::ChaosException("for task in progress"));
    }
    if chaos.fail_for_task_in_progress() {
        set_status(&tasks, task_id, TaskStatus::WriteFailed)?;
        return Ok(TaskResult::new(task_id, false, rows_in_task, per_table_rows));
    }

    for transaction in &transactions {
        let tables_in_transaction = transaction.tables.len();
        let mut flushed_tables = 0;

        for batch in &transaction.tables {
            if chaos.throw_before_flush() {
                return Err(FlushError::ChaosException("before flushing data"));
            }
            if chaos.fail_during_flush() {
                set_status(&tasks, task_id, TaskStatus::WriteFailed)?;
                return Ok(TaskResult::new(task_id, false, rows_in_task, per_table_rows));
            }

            match sink.put(&batch.table, &batch.mutations).await {
                Ok(()) => flushed_tables += 1,
                Err(err) => {
                    debug!(task = %task_id, table = %batch.table, "sink put failed: {err}");
                    push_message(&tasks, task_id, err.to_string())?;
                }
            }
        }

        // Errors reported by the sink while this transaction flushed.
        if has_messages(&tasks, task_id)? {
            set_status(&tasks, task_id, TaskStatus::WriteFailed)?;
            return Ok(TaskResult::new(task_id, false, rows_in_task, per_table_rows));
        }

        // Data integrity check: every table of the transaction must have
        // been written.
        if flushed_tables != tables_in_transaction {
            set_status(&tasks, task_id, TaskStatus::WriteFailed)?;
            return Ok(TaskResult::new(task_id, false, rows_in_task, per_table_rows));
        }
    }

    set_status(&tasks, task_id, TaskStatus::WriteSucceeded)?;
    Ok(TaskResult::new(task_id, true, rows_in_task, per_table_rows))
}

/// Snapshots the task's transactions and resets the message log so a
/// retried task starts its attempt with a clean slate.
fn snapshot_transactions(
    tasks: &SharedTasks,
    task_id: Uuid,
) -> Result<Vec<Transaction>, FlushError> {
    let mut tasks = tasks.lock().expect("task buffer lock poisoned");
    let task = tasks
        .get_mut(&task_id)
        .ok_or(FlushError::TaskVanished(task_id))?;
    task.messages.clear();
    Ok(task.transactions.clone())
}

fn set_status(tasks: &SharedTasks, task_id: Uuid, status: TaskStatus) -> Result<(), FlushError> {
    let mut tasks = tasks.lock().expect("task buffer lock poisoned");
    let task = tasks
        .get_mut(&task_id)
        .ok_or(FlushError::TaskVanished(task_id))?;
    task.status = status;
    Ok(())
}

fn push_message(tasks: &SharedTasks, task_id: Uuid, message: String) -> Result<(), FlushError> {
    let mut tasks = tasks.lock().expect("task buffer lock poisoned");
    let task = tasks
        .get_mut(&task_id)
        .ok_or(FlushError::TaskVanished(task_id))?;
    task.messages.push(message);
    Ok(())
}

fn has_messages(tasks: &SharedTasks, task_id: Uuid) -> Result<bool, FlushError> {
    let tasks = tasks.lock().expect("task buffer lock poisoned");
    tasks
        .get(&task_id)
        .map(|task| !task.messages.is_empty())
        .ok_or(FlushError::TaskVanished(task_id))
}
