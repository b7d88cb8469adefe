use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A raw column value as delivered by the binlog client.
///
/// Text payloads are kept as bytes; the character set lives on the column
/// metadata, not on the value, so decoding is deferred to the type coder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f64),
    Decimal(BigDecimal),
    Text(Vec<u8>),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    /// Seconds since epoch, as stored in the binlog TIMESTAMP image.
    Timestamp(u32),
    /// Microseconds since midnight ("Time2" with fractional precision).
    Time(i64),
    /// 1-based index into the column's enum label list.
    Enum(u16),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn text(s: &str) -> Self {
        Value::Text(s.as_bytes().to_vec())
    }
}
