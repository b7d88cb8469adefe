use async_trait::async_trait;
use model::sink::mutation::Mutation;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("put to table '{table}' failed: {message}")]
    Put { table: String, message: String },

    #[error("sink connection lost: {0}")]
    ConnectionLost(String),
}

/// The column-store sink. Cluster configuration and connection bootstrap
/// live behind the concrete type; the pipeline only batches puts through
/// this seam. Implementations must tolerate idempotent re-puts at the same
/// (row, column, timestamp).
#[async_trait]
pub trait Sink: Send + Sync {
    /// Verifies the connection is usable, re-establishing it if possible.
    /// Called before task submission; the applier wraps it in the
    /// fixed-interval retry policy and treats exhaustion as fatal.
    async fn ensure_connection(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Applies one batched put. The batch belongs to a single table and is
    /// ordered; each mutation addresses one versioned cell.
    async fn put(&self, table: &str, mutations: &[Mutation]) -> Result<(), SinkError>;
}

/// Cell address within the in-memory sink: (table, row key, qualifier,
/// timestamp). Matches the persisted layout of the real cluster.
pub type CellKey = (String, String, String, u64);

/// In-memory sink used by the `memory` applier type, trace replay and the
/// test suite. Re-putting an existing cell overwrites it with the same
/// value, which makes replays byte-identical.
#[derive(Debug, Default)]
pub struct MemorySink {
    cells: Mutex<BTreeMap<CellKey, String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<CellKey, String> {
        self.cells.lock().expect("sink lock poisoned").clone()
    }

    pub fn cell(&self, table: &str, row_key: &str, qualifier: &str, ts: u64) -> Option<String> {
        self.cells
            .lock()
            .expect("sink lock poisoned")
            .get(&(
                table.to_string(),
                row_key.to_string(),
                qualifier.to_string(),
                ts,
            ))
            .cloned()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.lock().expect("sink lock poisoned").len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn put(&self, _table: &str, mutations: &[Mutation]) -> Result<(), SinkError> {
        let mut cells = self.cells.lock().expect("sink lock poisoned");
        for mutation in mutations {
            cells.insert(
                (
                    mutation.table.clone(),
                    mutation.row_key.clone(),
                    mutation.qualifier.clone(),
                    mutation.timestamp_micros,
                ),
                mutation.value.clone(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutation(row_key: &str, qualifier: &str, ts: u64, value: &str) -> Mutation {
        Mutation {
            table: "t1".to_string(),
            row_key: row_key.to_string(),
            qualifier: qualifier.to_string(),
            timestamp_micros: ts,
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn puts_are_idempotent() {
        let sink = MemorySink::new();
        let batch = vec![mutation("7", "a", 10, "1")];
        sink.put("t1", &batch).await.unwrap();
        sink.put("t1", &batch).await.unwrap();
        assert_eq!(sink.cell_count(), 1);
        assert_eq!(sink.cell("t1", "7", "a", 10).as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn versions_at_distinct_timestamps_coexist() {
        let sink = MemorySink::new();
        sink.put("t1", &[mutation("7", "a", 10, "1")]).await.unwrap();
        sink.put("t1", &[mutation("7", "a", 11, "2")]).await.unwrap();
        assert_eq!(sink.cell_count(), 2);
        assert_eq!(sink.cell("t1", "7", "a", 11).as_deref(), Some("2"));
    }
}
