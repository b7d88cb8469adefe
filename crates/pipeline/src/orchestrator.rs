use crate::augmenter::Augmenter;
use crate::error::PipelineError;
use crate::position::{FakeMicrosecondsCounter, PipelinePosition};
use applier::buffer::TaskBufferingApplier;
use lazy_static::lazy_static;
use model::augment::row::AugmentedSchemaChangeEvent;
use model::binlog::event::{BinlogEvent, EventHeader, RowsEvent};
use model::binlog::position::BinlogPosition;
use regex::Regex;
use replicator_core::config::Configuration;
use replicator_core::metrics::{Counter, ReplicatorMetrics};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

lazy_static! {
    static ref DDL_STATEMENT: Regex =
        Regex::new(r"(?i)^\s*(ALTER|CREATE|DROP|RENAME|TRUNCATE)\b").unwrap();
}

/// What a query event means to the replication state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Begin,
    Commit,
    Ddl,
    Other,
}

/// Classifies a statement the way the binlog writes it: BEGIN/COMMIT markers
/// around row events, DDL for schema changes, anything else ignored.
/// Leading comments are tolerated.
fn classify_query(sql: &str) -> QueryKind {
    let stripped = strip_leading_comments(sql);
    if stripped.eq_ignore_ascii_case("BEGIN") {
        QueryKind::Begin
    } else if stripped.eq_ignore_ascii_case("COMMIT") {
        QueryKind::Commit
    } else if DDL_STATEMENT.is_match(stripped) {
        QueryKind::Ddl
    } else {
        QueryKind::Other
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    while let Some(body) = rest.strip_prefix("/*") {
        match body.find("*/") {
            Some(end) => rest = body[end + 2..].trim_start(),
            None => break,
        }
    }
    rest.trim_end()
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub ending_binlog_file: Option<String>,
    pub task_row_budget: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            ending_binlog_file: config.ending_binlog_file_name.clone(),
            task_row_budget: config.task_row_buffer_limit.max(1),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drains the binlog event stream, interpreting it as a state machine:
/// transaction demarcation, schema refreshes, rotate handling, and row
/// augmentation feeding the task-buffering applier.
///
/// Owns the fake-microseconds counter and the current binlog file name;
/// advances the shared positions on every event so the overseer can recover
/// the producer.
pub struct PipelineOrchestrator {
    receiver: mpsc::Receiver<BinlogEvent>,
    applier: TaskBufferingApplier,
    augmenter: Augmenter,
    metrics: ReplicatorMetrics,
    positions: Arc<PipelinePosition>,
    counter: Arc<FakeMicrosecondsCounter>,
    settings: OrchestratorSettings,
    cancel: CancellationToken,

    current_file: String,
    last_rotate_file: Option<String>,
}

impl PipelineOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver: mpsc::Receiver<BinlogEvent>,
        applier: TaskBufferingApplier,
        augmenter: Augmenter,
        metrics: ReplicatorMetrics,
        positions: Arc<PipelinePosition>,
        counter: Arc<FakeMicrosecondsCounter>,
        settings: OrchestratorSettings,
        cancel: CancellationToken,
    ) -> Self {
        let current_file = positions.last_known().file;
        Self {
            receiver,
            applier,
            augmenter,
            metrics,
            positions,
            counter,
            settings,
            cancel,
            current_file,
            last_rotate_file: None,
        }
    }

    /// Runs until the event stream closes, the ending binlog file is passed,
    /// or shutdown is requested. Always flushes and drains the applier
    /// before returning so no buffered row is lost.
    pub async fn run(mut self) -> Result<(), PipelineError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested, flushing buffered tasks");
                    break;
                }
                event = self.receiver.recv() => {
                    match event {
                        None => {
                            info!("event stream closed, flushing buffered tasks");
                            break;
                        }
                        Some(event) => {
                            if self.handle_event(event).await? == Flow::Stop {
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.applier.drain().await?;
        info!(position = %self.positions.last_known(), "orchestrator stopped");
        Ok(())
    }

    async fn handle_event(&mut self, event: BinlogEvent) -> Result<Flow, PipelineError> {
        self.metrics.inc(Counter::EventsObserved);
        self.record_replication_delay(event.header());

        match event {
            BinlogEvent::FormatDescription { header, server_version } => {
                debug!(%server_version, file = %self.current_file, "binlog file ready");
                self.advance(header);
            }
            BinlogEvent::Rotate { header, next_file, position } => {
                return self.apply_rotate(header, next_file, position).await;
            }
            BinlogEvent::Query { header, database, sql } => {
                self.apply_query(header, database, sql).await?;
            }
            BinlogEvent::Xid { header, xid } => {
                self.apply_commit(Some(xid)).await?;
                self.advance(header);
            }
            BinlogEvent::TableMap { header, schema, table, .. } => {
                debug!(%schema, %table, "table map");
                self.advance(header);
                self.positions.record_map_event(
                    BinlogPosition::new(self.current_file.clone(), header.next_position)
                        .with_fake_microseconds(self.counter.value()),
                );
            }
            BinlogEvent::Rows(rows) => {
                self.apply_rows(rows).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn apply_rotate(
        &mut self,
        _header: EventHeader,
        next_file: String,
        position: u64,
    ) -> Result<Flow, PipelineError> {
        // The binlog client is known to deliver the same rotate twice;
        // the duplicate must leave the position untouched.
        if self.last_rotate_file.as_deref() == Some(next_file.as_str()) {
            debug!(file = %next_file, "suppressing duplicate rotate");
            return Ok(Flow::Continue);
        }

        info!(from = %self.current_file, to = %next_file, "binlog rotate");
        self.applier.force_flush().await?;

        self.last_rotate_file = Some(next_file.clone());

        // Ending file is inclusive: rotating past it flushes, drains and
        // stops; the run() epilogue performs the drain.
        if let Some(ending) = &self.settings.ending_binlog_file {
            if next_file.as_str() > ending.as_str() {
                info!(ending = %ending, "reached the configured ending binlog file");
                return Ok(Flow::Stop);
            }
        }

        self.current_file = next_file;
        self.positions.record_event(
            BinlogPosition::new(self.current_file.clone(), position)
                .with_fake_microseconds(self.counter.value()),
        );
        Ok(Flow::Continue)
    }

    async fn apply_query(
        &mut self,
        header: EventHeader,
        database: String,
        sql: String,
    ) -> Result<(), PipelineError> {
        match classify_query(&sql) {
            QueryKind::Begin => {
                self.counter.reset();
            }
            QueryKind::Commit => {
                self.apply_commit(None).await?;
            }
            QueryKind::Ddl => {
                // The pre-event position versions the outgoing schema
                // generation.
                let pre_event_position = self.positions.last_known();
                self.augmenter
                    .schema_cache_mut()
                    .refresh(&database, pre_event_position.clone());
                let change = AugmentedSchemaChangeEvent {
                    schema: database,
                    sql,
                    position: pre_event_position,
                };
                self.applier.apply_schema_change(&change);
            }
            QueryKind::Other => {
                debug!("ignoring non-replicated statement");
            }
        }
        self.advance(header);
        Ok(())
    }

    async fn apply_commit(&mut self, xid: Option<u64>) -> Result<(), PipelineError> {
        self.applier.mark_current_transaction_for_commit(xid)?;
        self.cut_task_if_budget_reached().await?;
        // Commit boundaries double as housekeeping points: completed flush
        // jobs are reaped and requeued tasks resubmitted.
        self.applier.reap_completed().await?;
        self.applier.submit_ready_tasks().await?;
        Ok(())
    }

    async fn apply_rows(&mut self, rows: RowsEvent) -> Result<(), PipelineError> {
        let header = rows.header;
        let augmented = self.augmenter.augment(&rows, &self.counter).await?;
        self.metrics
            .add(Counter::RowsReceived, augmented.len() as u64);
        self.applier.buffer_rows_event(&augmented)?;
        self.advance(header);
        self.cut_task_if_budget_reached().await?;
        Ok(())
    }

    async fn cut_task_if_budget_reached(&mut self) -> Result<(), PipelineError> {
        if self.applier.rows_buffered_in_current_task() >= self.settings.task_row_budget {
            self.applier.rotate_current_task().await?;
            self.applier.submit_ready_tasks().await?;
        }
        Ok(())
    }

    fn advance(&mut self, header: EventHeader) {
        self.positions.record_event(
            BinlogPosition::new(self.current_file.clone(), header.next_position)
                .with_fake_microseconds(self.counter.value()),
        );
    }

    fn record_replication_delay(&self, header: &EventHeader) {
        let now = ReplicatorMetrics::now_secs();
        let delay = now.saturating_sub(header.timestamp as u64);
        self.metrics.set(Counter::ReplicationDelay, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_commit_markers_are_recognized() {
        assert_eq!(classify_query("BEGIN"), QueryKind::Begin);
        assert_eq!(classify_query("begin"), QueryKind::Begin);
        assert_eq!(classify_query("COMMIT"), QueryKind::Commit);
    }

    #[test]
    fn ddl_statements_are_recognized() {
        assert_eq!(
            classify_query("ALTER TABLE t1 ADD COLUMN c INT"),
            QueryKind::Ddl
        );
        assert_eq!(classify_query("create table t2 (id int)"), QueryKind::Ddl);
        assert_eq!(classify_query("TRUNCATE t1"), QueryKind::Ddl);
        assert_eq!(classify_query("DROP TABLE t1"), QueryKind::Ddl);
    }

    #[test]
    fn leading_comments_are_stripped() {
        assert_eq!(classify_query("/* ppid=4242 */ BEGIN"), QueryKind::Begin);
        assert_eq!(
            classify_query("/* hint */ /* more */ ALTER TABLE t1 DROP COLUMN c"),
            QueryKind::Ddl
        );
    }

    #[test]
    fn other_statements_are_ignored() {
        assert_eq!(classify_query("ANALYZE TABLE t1"), QueryKind::Other);
        assert_eq!(classify_query("GRANT ALL ON *.* TO x"), QueryKind::Other);
    }
}
