use crate::binlog::position::BinlogPosition;
use serde::{Deserialize, Serialize};

/// Row operation markers, written to the sink as the `d:row_status` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

impl RowOp {
    pub fn marker(&self) -> &'static str {
        match self {
            RowOp::Insert => "I",
            RowOp::Update => "U",
            RowOp::Delete => "D",
        }
    }
}

/// One cell-level change: the old value is present only for updates and
/// deletes; for updates only cells whose encoded value actually changed are
/// carried at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    pub column: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// A row event joined with its schema: sink-encoded cell values, the
/// primary-key-derived row key, and the binlog-derived commit timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentedRow {
    pub table: String,
    pub op: RowOp,
    /// Microseconds since epoch: event second × 10⁶ + fake counter.
    pub commit_micros: u64,
    pub row_key: String,
    pub cells: Vec<CellChange>,
}

#[derive(Debug, Clone, Default)]
pub struct AugmentedRowsEvent {
    pub rows: Vec<AugmentedRow>,
}

impl AugmentedRowsEvent {
    pub fn push(&mut self, row: AugmentedRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Emitted when a DDL statement refreshes the schema cache; the position is
/// the pre-event binlog position used as the schema version key.
#[derive(Debug, Clone)]
pub struct AugmentedSchemaChangeEvent {
    pub schema: String,
    pub sql: String,
    pub position: BinlogPosition,
}
