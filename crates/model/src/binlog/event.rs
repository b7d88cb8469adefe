use crate::core::value::Value;
use serde::{Deserialize, Serialize};

/// Header fields shared by every binlog event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Event timestamp, seconds since epoch.
    pub timestamp: u32,
    /// Byte offset of the event's end within its binlog file.
    pub next_position: u64,
}

/// Typed binlog events as delivered by the producer.
///
/// Serde derives back the `replay` trace format: a JSON array of these
/// events is a complete, replayable capture of a binlog stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BinlogEvent {
    FormatDescription {
        header: EventHeader,
        server_version: String,
    },
    Rotate {
        header: EventHeader,
        next_file: String,
        position: u64,
    },
    Query {
        header: EventHeader,
        database: String,
        sql: String,
    },
    Xid {
        header: EventHeader,
        xid: u64,
    },
    TableMap {
        header: EventHeader,
        table_id: u64,
        schema: String,
        table: String,
    },
    Rows(RowsEvent),
}

impl BinlogEvent {
    pub fn header(&self) -> &EventHeader {
        match self {
            BinlogEvent::FormatDescription { header, .. }
            | BinlogEvent::Rotate { header, .. }
            | BinlogEvent::Query { header, .. }
            | BinlogEvent::Xid { header, .. }
            | BinlogEvent::TableMap { header, .. } => header,
            BinlogEvent::Rows(rows) => &rows.header,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowsEventKind {
    Write,
    Update,
    Delete,
}

/// One row image inside a rows event. Write events carry only `after`,
/// delete events only `before`, update events both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowImage {
    pub before: Option<Vec<Value>>,
    pub after: Option<Vec<Value>>,
}

impl RowImage {
    pub fn write(after: Vec<Value>) -> Self {
        Self {
            before: None,
            after: Some(after),
        }
    }

    pub fn update(before: Vec<Value>, after: Vec<Value>) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(before: Vec<Value>) -> Self {
        Self {
            before: Some(before),
            after: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEvent {
    pub header: EventHeader,
    pub schema: String,
    pub table: String,
    pub kind: RowsEventKind,
    pub rows: Vec<RowImage>,
}
