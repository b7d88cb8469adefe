use crate::chaos::ChaosMonkey;
use crate::error::ApplierError;
use crate::flush::{flush_task, FlushError, SharedTasks};
use crate::result::TaskResult;
use crate::sink::Sink;
use crate::task::{Task, TaskStatus, Transaction, TransactionStatus};
use model::augment::row::{AugmentedRowsEvent, AugmentedSchemaChangeEvent};
use model::sink::mutation::{
    delta_mutations_for_row, delta_table_name, mutations_for_row, Mutation,
};
use model::sink::row_key::delta_row_key;
use replicator_core::error::InvariantViolation;
use replicator_core::fatal_assert;
use replicator_core::metrics::{Counter, ReplicatorMetrics};
use replicator_core::retry::RetryPolicy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How often the buffering side polls while waiting for a flush slot.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);
/// How often the wait is surfaced as a warning.
const BACKPRESSURE_WARN_EVERY_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct ApplierSettings {
    /// Flush worker pool size; also the bound on live tasks.
    pub pool_size: usize,
    /// Dry-run flushes report success without touching the sink.
    pub dry_run: bool,
    /// Tables whose mutations are emitted a second time against their
    /// day-suffixed delta table.
    pub delta_tables: HashSet<String>,
}

impl ApplierSettings {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            dry_run: false,
            delta_tables: HashSet::new(),
        }
    }

    pub fn from_config(config: &replicator_core::config::Configuration) -> Self {
        let delta_tables = if config.write_recent_changes_to_delta_tables {
            config
                .tables_for_which_to_track_daily_changes
                .iter()
                .cloned()
                .collect()
        } else {
            HashSet::new()
        };
        Self {
            pool_size: config.pool_size.max(1),
            dry_run: config.dry_run,
            delta_tables,
        }
    }
}

/// Introspection view over one buffered task, for reporting and tests.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub status: TaskStatus,
    pub transactions: Vec<(Uuid, TransactionStatus, usize)>,
}

/// The task-buffering applier.
///
/// Mutations are buffered into the current task's current transaction and
/// flushed task-by-task through a bounded worker pool. Because every cell is
/// timestamped from the binlog and row-based replication makes re-puts
/// idempotent, tasks may commit in any physical order; the sole ordering
/// obligation is per-table buffer order within a task.
///
/// The current task/transaction ids are owned by the orchestrator's thread
/// of control. Workers receive the task id as a job parameter and only ever
/// write their own task's status.
pub struct TaskBufferingApplier {
    settings: ApplierSettings,
    sink: Arc<dyn Sink>,
    chaos: Arc<dyn ChaosMonkey>,
    metrics: ReplicatorMetrics,

    tasks: SharedTasks,
    futures: HashMap<Uuid, JoinHandle<Result<TaskResult, FlushError>>>,

    current_task: Uuid,
    current_transaction: Uuid,
    rows_in_current_task: usize,
}

impl TaskBufferingApplier {
    pub fn new(
        settings: ApplierSettings,
        sink: Arc<dyn Sink>,
        chaos: Arc<dyn ChaosMonkey>,
        metrics: ReplicatorMetrics,
    ) -> Self {
        let current_task = Uuid::new_v4();
        let current_transaction = Uuid::new_v4();

        let mut task = Task::new(current_task);
        task.transactions.push(Transaction::open(current_transaction));

        let mut tasks = HashMap::new();
        tasks.insert(current_task, task);

        Self {
            settings,
            sink,
            chaos,
            metrics,
            tasks: Arc::new(Mutex::new(tasks)),
            futures: HashMap::new(),
            current_task,
            current_transaction,
            rows_in_current_task: 0,
        }
    }

    pub fn rows_buffered_in_current_task(&self) -> usize {
        self.rows_in_current_task
    }

    pub fn current_transaction_id(&self) -> Uuid {
        self.current_transaction
    }

    pub fn live_task_count(&self) -> usize {
        self.tasks.lock().expect("task buffer lock poisoned").len()
    }

    pub fn tasks_snapshot(&self) -> Vec<TaskSnapshot> {
        let tasks = self.tasks.lock().expect("task buffer lock poisoned");
        let mut snapshots: Vec<TaskSnapshot> = tasks
            .values()
            .map(|task| TaskSnapshot {
                id: task.id,
                status: task.status,
                transactions: task
                    .transactions
                    .iter()
                    .map(|t| (t.id, t.status, t.row_count()))
                    .collect(),
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Buffers every row of an augmented rows event, emitting the delta
    /// copies for tracked tables under the same transaction UUID.
    pub fn buffer_rows_event(&mut self, event: &AugmentedRowsEvent) -> Result<(), ApplierError> {
        for row in &event.rows {
            let mutations = mutations_for_row(row);
            self.push_row_to_task_buffer(row.table.clone(), row.row_key.clone(), mutations)?;

            if self.settings.delta_tables.contains(&row.table) {
                let delta_mutations = delta_mutations_for_row(row);
                let delta_table = delta_table_name(&row.table, row.commit_micros);
                let delta_key = delta_row_key(row.commit_micros, &row.row_key);
                self.push_row_to_task_buffer(delta_table, delta_key, delta_mutations)?;
            }
        }
        Ok(())
    }

    /// Appends one row's mutations into the current task's current
    /// transaction, lazily creating the table entry. A missing task or
    /// transaction slot can only mean the buffer bookkeeping is broken.
    fn push_row_to_task_buffer(
        &mut self,
        table: String,
        row_key: String,
        mutations: Vec<Mutation>,
    ) -> Result<(), ApplierError> {
        let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");

        let Some(task) = tasks.get_mut(&self.current_task) else {
            return Err(self.missing_task(self.current_task));
        };
        let Some(transaction) = task.transaction_mut(self.current_transaction) else {
            return Err(self.missing_transaction());
        };
        let batch = transaction.batch_mut(&table);
        batch.mutations.extend(mutations);
        batch.row_keys.push(row_key);

        drop(tasks);
        self.rows_in_current_task += 1;
        Ok(())
    }

    /// Marks the current transaction READY_FOR_COMMIT and installs a fresh
    /// transaction UUID inside the same task. No task cut happens here.
    pub fn mark_current_transaction_for_commit(
        &mut self,
        xid: Option<u64>,
    ) -> Result<(), ApplierError> {
        let next_transaction = Uuid::new_v4();
        {
            let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");
            let Some(task) = tasks.get_mut(&self.current_task) else {
                return Err(self.missing_task(self.current_task));
            };
            let Some(transaction) = task.transaction_mut(self.current_transaction) else {
                return Err(self.missing_transaction());
            };
            transaction.status = TransactionStatus::ReadyForCommit;
            transaction.xid = xid;

            task.transactions.push(Transaction::open(next_transaction));
        }
        self.current_transaction = next_transaction;
        Ok(())
    }

    /// Cuts the current task: marks it READY_FOR_PICK_UP and opens a fresh
    /// UUID buffer. An unfinished transaction is re-registered verbatim in
    /// the new task so all of its mutations share one UUID across tasks.
    ///
    /// Blocks (the sole backpressure point of the pipeline) while the live
    /// task count exceeds the pool size.
    pub async fn rotate_current_task(&mut self) -> Result<(), ApplierError> {
        self.block_until_slots_available().await?;

        // Nothing buffered: keep the current buffer for the next events.
        if self.rows_in_current_task == 0 {
            return Ok(());
        }

        let new_task_id = Uuid::new_v4();
        {
            let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");
            let Some(task) = tasks.get_mut(&self.current_task) else {
                return Err(self.missing_task(self.current_task));
            };
            task.status = TaskStatus::ReadyForPickUp;

            let open_ids = task.open_transaction_ids();
            fatal_assert!(
                open_ids.len() <= 1,
                "{} partial transactions in task {}, at most one may be open",
                open_ids.len(),
                self.current_task
            );

            let mut new_task = Task::new(new_task_id);
            let carried = open_ids.first().copied();
            let next_transaction = carried.unwrap_or_else(Uuid::new_v4);
            new_task.transactions.push(Transaction::open(next_transaction));
            if carried.is_some() {
                info!(
                    transaction = %next_transaction,
                    from_task = %self.current_task,
                    to_task = %new_task_id,
                    "carrying open transaction into new task"
                );
            }
            tasks.insert(new_task_id, new_task);
            self.current_transaction = next_transaction;

            let queued = tasks
                .values()
                .filter(|t| t.status == TaskStatus::ReadyForPickUp)
                .count();
            self.metrics.set(Counter::TaskQueueSize, queued as u64);
        }

        self.current_task = new_task_id;
        self.rows_in_current_task = 0;
        Ok(())
    }

    async fn block_until_slots_available(&mut self) -> Result<(), ApplierError> {
        let mut blocked_ms = 0u64;
        loop {
            self.reap_completed().await?;

            let live = self.live_task_count();
            if live <= self.settings.pool_size {
                return Ok(());
            }

            // Keep requeued tasks moving while we wait.
            self.submit_ready_tasks().await?;

            sleep(BACKPRESSURE_POLL).await;
            blocked_ms += BACKPRESSURE_POLL.as_millis() as u64;
            if blocked_ms % BACKPRESSURE_WARN_EVERY_MS == 0 {
                warn!(
                    live_tasks = live,
                    blocked_ms, "too many tasks already open, buffering is blocked"
                );
            }
        }
    }

    /// Submits every READY_FOR_PICK_UP task to the flush pool. A ready task
    /// without rows means the cut-over bookkeeping is broken.
    pub async fn submit_ready_tasks(&mut self) -> Result<(), ApplierError> {
        RetryPolicy::for_sink_connect()
            .run("sink connection", || self.sink.ensure_connection())
            .await
            .map_err(ApplierError::ConnectionExhausted)?;

        let ready: Vec<Uuid> = {
            let tasks = self.tasks.lock().expect("task buffer lock poisoned");
            tasks
                .values()
                .filter(|t| t.status == TaskStatus::ReadyForPickUp)
                .map(|t| t.id)
                .collect()
        };

        for task_id in ready {
            {
                let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");
                let Some(task) = tasks.get_mut(&task_id) else {
                    return Err(self.missing_task(task_id));
                };
                fatal_assert!(
                    task.has_rows(),
                    "task {task_id} is READY_FOR_PICK_UP but has no buffered rows"
                );
                task.status = TaskStatus::TaskSubmitted;
            }
            info!(task = %task_id, "submitting task");
            self.metrics.inc(Counter::ApplierTasksSubmitted);

            let handle = tokio::spawn(flush_task(
                task_id,
                Arc::clone(&self.tasks),
                Arc::clone(&self.sink),
                Arc::clone(&self.chaos),
                self.metrics.clone(),
                self.settings.dry_run,
            ));
            self.futures.insert(task_id, handle);
        }
        Ok(())
    }

    /// The completion reaper: reconciles finished flush jobs against the
    /// status map. Succeeded tasks are deleted from every map; failed or
    /// crashed jobs are requeued with their buffers intact.
    pub async fn reap_completed(&mut self) -> Result<(), ApplierError> {
        let finished: Vec<Uuid> = self
            .futures
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for task_id in finished {
            // The handle is discarded either way; a requeued task gets a
            // fresh future on resubmission.
            let handle = self.futures.remove(&task_id).expect("finished handle");

            match handle.await {
                Ok(Ok(result)) => self.reconcile(task_id, result)?,
                Ok(Err(FlushError::TaskVanished(id))) => {
                    return Err(InvariantViolation(format!(
                        "task {id} vanished from the buffer mid-flush"
                    ))
                    .into());
                }
                Ok(Err(err @ FlushError::ChaosException(_))) => {
                    error!(task = %task_id, "flush job raised: {err}; task will be retried");
                    self.requeue(task_id)?;
                    self.metrics.inc(Counter::ApplierTasksFailed);
                }
                Err(join_err) => {
                    warn!(
                        task = %task_id,
                        "flush worker died ({join_err}); task will be retried"
                    );
                    self.requeue(task_id)?;
                    self.metrics.inc(Counter::ApplierTasksFailed);
                }
            }
        }
        Ok(())
    }

    fn reconcile(&mut self, task_id: Uuid, result: TaskResult) -> Result<(), ApplierError> {
        let status = {
            let tasks = self.tasks.lock().expect("task buffer lock poisoned");
            let Some(task) = tasks.get(&task_id) else {
                return Err(self.missing_task(task_id));
            };
            task.status
        };

        match status {
            TaskStatus::WriteSucceeded => {
                fatal_assert!(
                    result.succeeded,
                    "task {task_id} reports failure but its status is WRITE_SUCCEEDED"
                );
                self.metrics.inc(Counter::ApplierTasksSucceeded);
                self.metrics.add(Counter::RowsCommitted, result.rows_in_task);
                for (table, rows) in &result.per_table_rows {
                    self.metrics
                        .add_table_total(table, Counter::RowsCommitted, *rows);
                }
                let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");
                // An open transaction in this task has already been copied
                // into its successor, so the whole entry can go.
                tasks.remove(&task_id);
                Ok(())
            }
            TaskStatus::WriteFailed => {
                fatal_assert!(
                    !result.succeeded,
                    "task {task_id} reports success but its status is WRITE_FAILED"
                );
                warn!(task = %task_id, "task failed, requeueing for retry");
                self.requeue(task_id)?;
                self.metrics.inc(Counter::ApplierTasksFailed);
                Ok(())
            }
            other => {
                // A worker died without reaching a terminal status.
                warn!(
                    task = %task_id,
                    status = ?other,
                    "task finished in a non-terminal status, treating as failed"
                );
                self.requeue(task_id)?;
                self.metrics.inc(Counter::ApplierTasksFailed);
                Ok(())
            }
        }
    }

    fn requeue(&mut self, task_id: Uuid) -> Result<(), ApplierError> {
        let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");
        let Some(task) = tasks.get_mut(&task_id) else {
            return Err(self.missing_task(task_id));
        };
        task.status = TaskStatus::ReadyForPickUp;
        Ok(())
    }

    fn missing_task(&self, task_id: Uuid) -> ApplierError {
        InvariantViolation(format!("task {task_id} missing from the task buffer")).into()
    }

    fn missing_transaction(&self) -> ApplierError {
        InvariantViolation(format!(
            "current transaction {} missing from task {}",
            self.current_transaction, self.current_task
        ))
        .into()
    }

    /// Cuts and submits whatever is buffered. Called on rotate events and
    /// before shutdown.
    pub async fn force_flush(&mut self) -> Result<(), ApplierError> {
        self.rotate_current_task().await?;
        self.submit_ready_tasks().await
    }

    /// Flushes everything and waits until every task has committed. On
    /// return all task maps and the futures map are empty. Terminal: the
    /// applier cannot buffer afterwards.
    pub async fn drain(&mut self) -> Result<(), ApplierError> {
        self.force_flush().await?;
        loop {
            self.reap_completed().await?;
            if self.live_task_count() <= 1 && self.futures.is_empty() {
                break;
            }
            self.submit_ready_tasks().await?;
            sleep(BACKPRESSURE_POLL).await;
        }

        let mut tasks = self.tasks.lock().expect("task buffer lock poisoned");
        if let Some(task) = tasks.get(&self.current_task) {
            fatal_assert!(
                !task.has_rows(),
                "current task {} still holds rows after drain",
                self.current_task
            );
        }
        tasks.remove(&self.current_task);
        Ok(())
    }

    /// DDL observed upstream; the schema cache is already refreshed by the
    /// orchestrator, the applier only records the fact.
    pub fn apply_schema_change(&self, event: &AugmentedSchemaChangeEvent) {
        info!(
            schema = %event.schema,
            position = %event.position,
            "schema change passed through: {}",
            event.sql
        );
    }

    /// Logs the status of every live task, the way operators inspect a
    /// wedged pipeline.
    pub fn dump_stats(&self) {
        for snapshot in self.tasks_snapshot() {
            info!(
                task = %snapshot.id,
                status = ?snapshot.status,
                transactions = snapshot.transactions.len(),
                rows = snapshot
                    .transactions
                    .iter()
                    .map(|(_, _, rows)| rows)
                    .sum::<usize>(),
                "task status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{NoChaos, ScriptedChaos};
    use crate::sink::MemorySink;
    use model::augment::row::{AugmentedRow, CellChange, RowOp};

    fn augmented_row(table: &str, key: &str, commit_micros: u64) -> AugmentedRow {
        AugmentedRow {
            table: table.to_string(),
            op: RowOp::Insert,
            commit_micros,
            row_key: key.to_string(),
            cells: vec![CellChange {
                column: "a".to_string(),
                before: None,
                after: Some("1".to_string()),
            }],
        }
    }

    fn rows_event(table: &str, keys: &[&str], base_micros: u64) -> AugmentedRowsEvent {
        let mut event = AugmentedRowsEvent::default();
        for (i, key) in keys.iter().enumerate() {
            event.push(augmented_row(table, key, base_micros + i as u64));
        }
        event
    }

    fn applier(pool_size: usize, sink: Arc<MemorySink>) -> TaskBufferingApplier {
        TaskBufferingApplier::new(
            ApplierSettings::new(pool_size),
            sink,
            Arc::new(NoChaos),
            ReplicatorMetrics::new(),
        )
    }

    #[tokio::test]
    async fn buffering_counts_rows_not_cells() {
        let mut applier = applier(2, Arc::new(MemorySink::new()));
        applier
            .buffer_rows_event(&rows_event("t1", &["1", "2"], 100))
            .unwrap();
        // Two rows, each carrying a data cell plus the row_status cell.
        assert_eq!(applier.rows_buffered_in_current_task(), 2);
    }

    #[tokio::test]
    async fn commit_opens_a_new_transaction_in_the_same_task() {
        let mut applier = applier(2, Arc::new(MemorySink::new()));
        let first = applier.current_transaction_id();
        applier
            .buffer_rows_event(&rows_event("t1", &["1"], 100))
            .unwrap();
        applier.mark_current_transaction_for_commit(Some(9)).unwrap();
        assert_ne!(applier.current_transaction_id(), first);
        assert_eq!(applier.live_task_count(), 1);

        let snapshot = &applier.tasks_snapshot()[0];
        assert_eq!(snapshot.transactions.len(), 2);
        assert_eq!(snapshot.transactions[0].1, TransactionStatus::ReadyForCommit);
        assert_eq!(snapshot.transactions[1].1, TransactionStatus::Open);
    }

    #[tokio::test]
    async fn task_cut_carries_the_open_transaction_forward() {
        let mut applier = applier(4, Arc::new(MemorySink::new()));
        let transaction = applier.current_transaction_id();

        applier
            .buffer_rows_event(&rows_event("t1", &["1", "2"], 100))
            .unwrap();
        applier.rotate_current_task().await.unwrap();

        // Same transaction UUID continues in the new task.
        assert_eq!(applier.current_transaction_id(), transaction);
        let snapshots = applier.tasks_snapshot();
        assert_eq!(snapshots.len(), 2);
        let carrying: Vec<_> = snapshots
            .iter()
            .filter(|s| s.transactions.iter().any(|(id, _, _)| *id == transaction))
            .collect();
        assert_eq!(carrying.len(), 2);
    }

    #[tokio::test]
    async fn task_cut_without_rows_is_a_noop() {
        let mut applier = applier(2, Arc::new(MemorySink::new()));
        let task_count = applier.live_task_count();
        applier.rotate_current_task().await.unwrap();
        assert_eq!(applier.live_task_count(), task_count);
    }

    #[tokio::test]
    async fn successful_flush_removes_the_task_from_every_map() {
        let sink = Arc::new(MemorySink::new());
        let mut applier = applier(2, Arc::clone(&sink));
        applier
            .buffer_rows_event(&rows_event("t1", &["1"], 100))
            .unwrap();
        applier.mark_current_transaction_for_commit(None).unwrap();
        applier.drain().await.unwrap();

        assert_eq!(applier.live_task_count(), 0);
        assert!(applier.futures.is_empty());
        assert_eq!(sink.cell("t1", "1", "a", 100).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn failed_flush_requeues_and_eventually_succeeds() {
        let sink = Arc::new(MemorySink::new());
        let metrics = ReplicatorMetrics::new();
        let mut applier = TaskBufferingApplier::new(
            ApplierSettings::new(2),
            Arc::clone(&sink) as Arc<dyn Sink>,
            Arc::new(ScriptedChaos::new(0, 1)),
            metrics.clone(),
        );
        applier
            .buffer_rows_event(&rows_event("t1", &["1"], 100))
            .unwrap();
        applier.mark_current_transaction_for_commit(None).unwrap();
        applier.drain().await.unwrap();

        assert_eq!(metrics.sum(Counter::ApplierTasksFailed), 1);
        assert_eq!(metrics.sum(Counter::ApplierTasksSucceeded), 1);
        assert_eq!(sink.cell("t1", "1", "a", 100).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn ready_task_without_rows_is_an_invariant_violation() {
        let mut applier = applier(2, Arc::new(MemorySink::new()));
        {
            let mut tasks = applier.tasks.lock().unwrap();
            let task = tasks.get_mut(&applier.current_task).unwrap();
            task.status = TaskStatus::ReadyForPickUp;
        }
        let err = applier.submit_ready_tasks().await.unwrap_err();
        assert!(matches!(err, ApplierError::Invariant(_)));
    }

    #[tokio::test]
    async fn dry_run_reports_success_without_writing() {
        let sink = Arc::new(MemorySink::new());
        let metrics = ReplicatorMetrics::new();
        let mut settings = ApplierSettings::new(2);
        settings.dry_run = true;
        let mut applier = TaskBufferingApplier::new(
            settings,
            Arc::clone(&sink) as Arc<dyn Sink>,
            Arc::new(NoChaos),
            metrics.clone(),
        );
        applier
            .buffer_rows_event(&rows_event("t1", &["1"], 100))
            .unwrap();
        applier.mark_current_transaction_for_commit(None).unwrap();
        applier.drain().await.unwrap();

        assert_eq!(sink.cell_count(), 0);
        assert_eq!(metrics.sum(Counter::ApplierTasksSucceeded), 1);
    }

    #[tokio::test]
    async fn backpressure_bounds_live_tasks() {
        let sink = Arc::new(MemorySink::new());
        let mut applier = applier(2, Arc::clone(&sink));
        for round in 0..6u64 {
            applier
                .buffer_rows_event(&rows_event("t1", &["1", "2"], 100 + round * 10))
                .unwrap();
            applier.mark_current_transaction_for_commit(None).unwrap();
            applier.force_flush().await.unwrap();
            assert!(applier.live_task_count() <= 3, "pool bound exceeded");
        }
        applier.drain().await.unwrap();
        assert_eq!(applier.live_task_count(), 0);
    }
}
