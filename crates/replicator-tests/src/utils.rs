use applier::chaos::ChaosMonkey;
use applier::sink::{MemorySink, Sink, SinkError};
use async_trait::async_trait;
use model::binlog::event::{BinlogEvent, EventHeader, RowImage, RowsEvent, RowsEventKind};
use model::core::column::{ColumnSchema, SqlType};
use model::core::value::Value;
use model::sink::mutation::Mutation;
use pipeline::error::PipelineError;
use pipeline::producer::ScriptedProducer;
use pipeline::schema::{FixedActiveSchema, TableSchema};
use replicator_core::config::Configuration;
use replicator_core::metrics::ReplicatorMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SCHEMA: &str = "shop";
pub const START_FILE: &str = "mysql-bin.000001";

/// The base trace second; sink timestamps derive from it.
pub const T0: u32 = 1_450_000_000;

/// `shop.t1 (id INT PRIMARY KEY, a INT, b INT)`, the table every scenario
/// replicates.
fn t1() -> TableSchema {
    TableSchema {
        schema: SCHEMA.to_string(),
        table: "t1".to_string(),
        columns: vec![
            ColumnSchema::new("id", SqlType::Integer),
            ColumnSchema::new("a", SqlType::Integer),
            ColumnSchema::new("b", SqlType::Integer),
        ],
        primary_key: vec![0],
    }
}

fn t2() -> TableSchema {
    TableSchema {
        schema: SCHEMA.to_string(),
        table: "t2".to_string(),
        columns: vec![
            ColumnSchema::new("id", SqlType::Integer),
            ColumnSchema::new("a", SqlType::Integer),
        ],
        primary_key: vec![0],
    }
}

pub fn test_active_schema() -> FixedActiveSchema {
    FixedActiveSchema::new().with_table(t1()).with_table(t2())
}

pub fn base_config() -> Configuration {
    Configuration {
        applier_type: "memory".to_string(),
        replicant_schema_name: SCHEMA.to_string(),
        replicant_db_active_host: Some("localhost".to_string()),
        starting_binlog_file_name: START_FILE.to_string(),
        starting_binlog_position: 4,
        pool_size: 4,
        task_row_buffer_limit: 1000,
        ..Configuration::default()
    }
}

/// Builds binlog event traces the way the producer would deliver them:
/// every rows event preceded by its table map, transactions bracketed by
/// BEGIN and COMMIT (or Xid).
pub struct TraceBuilder {
    events: Vec<BinlogEvent>,
    time: u32,
    position: u64,
}

impl Default for TraceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            time: T0,
            position: 4,
        }
    }

    fn header(&mut self) -> EventHeader {
        self.position += 40;
        EventHeader {
            timestamp: self.time,
            next_position: self.position,
        }
    }

    /// Advances the binlog clock; subsequent events carry the new second.
    pub fn at(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    pub fn rotate(mut self, next_file: &str) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::Rotate {
            header,
            next_file: next_file.to_string(),
            position: 4,
        });
        self
    }

    pub fn rotate_at_position(mut self, next_file: &str, position: u64) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::Rotate {
            header,
            next_file: next_file.to_string(),
            position,
        });
        self
    }

    pub fn format_description(mut self) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::FormatDescription {
            header,
            server_version: "5.6.27-log".to_string(),
        });
        self
    }

    pub fn begin(mut self) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::Query {
            header,
            database: SCHEMA.to_string(),
            sql: "BEGIN".to_string(),
        });
        self
    }

    pub fn commit(mut self) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::Query {
            header,
            database: SCHEMA.to_string(),
            sql: "COMMIT".to_string(),
        });
        self
    }

    pub fn xid(mut self, xid: u64) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::Xid { header, xid });
        self
    }

    pub fn ddl(mut self, sql: &str) -> Self {
        let header = self.header();
        self.events.push(BinlogEvent::Query {
            header,
            database: SCHEMA.to_string(),
            sql: sql.to_string(),
        });
        self
    }

    fn table_map(&mut self, table: &str) {
        let header = self.header();
        self.events.push(BinlogEvent::TableMap {
            header,
            table_id: 42,
            schema: SCHEMA.to_string(),
            table: table.to_string(),
        });
    }

    fn rows(&mut self, table: &str, kind: RowsEventKind, rows: Vec<RowImage>) {
        self.table_map(table);
        let header = self.header();
        self.events.push(BinlogEvent::Rows(RowsEvent {
            header,
            schema: SCHEMA.to_string(),
            table: table.to_string(),
            kind,
            rows,
        }));
    }

    pub fn insert_t1(mut self, rows: &[(i64, i64, i64)]) -> Self {
        let images = rows
            .iter()
            .map(|&(id, a, b)| RowImage::write(t1_row(id, a, b)))
            .collect();
        self.rows("t1", RowsEventKind::Write, images);
        self
    }

    pub fn update_t1(mut self, rows: &[((i64, i64, i64), (i64, i64, i64))]) -> Self {
        let images = rows
            .iter()
            .map(|&((id0, a0, b0), (id1, a1, b1))| {
                RowImage::update(t1_row(id0, a0, b0), t1_row(id1, a1, b1))
            })
            .collect();
        self.rows("t1", RowsEventKind::Update, images);
        self
    }

    pub fn delete_t1(mut self, rows: &[(i64, i64, i64)]) -> Self {
        let images = rows
            .iter()
            .map(|&(id, a, b)| RowImage::delete(t1_row(id, a, b)))
            .collect();
        self.rows("t1", RowsEventKind::Delete, images);
        self
    }

    pub fn insert_t2(mut self, rows: &[(i64, i64)]) -> Self {
        let images = rows
            .iter()
            .map(|&(id, a)| RowImage::write(vec![Value::SignedInt(id), Value::SignedInt(a)]))
            .collect();
        self.rows("t2", RowsEventKind::Write, images);
        self
    }

    pub fn build(self) -> Vec<BinlogEvent> {
        self.events
    }
}

fn t1_row(id: i64, a: i64, b: i64) -> Vec<Value> {
    vec![
        Value::SignedInt(id),
        Value::SignedInt(a),
        Value::SignedInt(b),
    ]
}

pub struct ReplayOutcome {
    pub sink: Arc<MemorySink>,
    pub metrics: ReplicatorMetrics,
    pub result: Result<(), PipelineError>,
}

/// Runs a trace through the full pipeline (producer seam, orchestrator,
/// augmenter, applier, overseer) into a fresh in-memory sink.
pub async fn run_trace(
    events: Vec<BinlogEvent>,
    config: Configuration,
    chaos: Arc<dyn ChaosMonkey>,
) -> ReplayOutcome {
    run_trace_into(events, config, chaos, Arc::new(MemorySink::new())).await
}

pub async fn run_trace_into(
    events: Vec<BinlogEvent>,
    config: Configuration,
    chaos: Arc<dyn ChaosMonkey>,
    sink: Arc<MemorySink>,
) -> ReplayOutcome {
    let metrics = ReplicatorMetrics::new();
    let cancel = CancellationToken::new();
    let (producer, receiver) = ScriptedProducer::new(events);

    let result = pipeline::run_pipeline(
        &config,
        producer,
        receiver,
        Arc::new(test_active_schema()),
        Arc::clone(&sink) as Arc<dyn Sink>,
        chaos,
        metrics.clone(),
        cancel,
    )
    .await;

    ReplayOutcome {
        sink,
        metrics,
        result,
    }
}

/// Sink that holds every put for a fixed delay; used to observe the
/// backpressure bound while flush workers are busy.
pub struct SlowSink {
    inner: MemorySink,
    delay: Duration,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemorySink::new(),
            delay,
        }
    }
}

#[async_trait]
impl Sink for SlowSink {
    async fn put(&self, table: &str, mutations: &[Mutation]) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(table, mutations).await
    }
}

/// The commit timestamp of the n-th row (1-based) of a transaction whose
/// rows share the binlog second `time`.
pub fn ts(time: u32, row: u64) -> u64 {
    time as u64 * 1_000_000 + row
}
