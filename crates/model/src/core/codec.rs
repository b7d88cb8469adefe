use crate::core::column::{CharsetHint, ColumnSchema, SqlType};
use crate::core::value::Value;
use bigdecimal::BigDecimal;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("enum index {index} out of range for column '{column}' ({labels} labels)")]
    EnumIndexOutOfRange {
        column: String,
        index: u16,
        labels: usize,
    },
}

/// Renders a raw binlog value into its sink cell encoding.
///
/// The encoding is stable and must not change between releases: downstream
/// consumers compare cell versions byte for byte.
///
/// * latin1 text is decoded to unicode (1:1 code-point mapping), utf8 text
///   passes through
/// * BLOB/BINARY becomes lowercase hex
/// * TIMESTAMP/DATETIME become epoch microseconds, no timezone conversion
/// * ENUM becomes its textual label
/// * TIME becomes microseconds since midnight
/// * numerics become canonical decimal strings
pub fn encode_cell(column: &ColumnSchema, value: &Value) -> Result<String, CodecError> {
    let encoded = match value {
        Value::Null => "NULL".to_string(),
        Value::SignedInt(v) => v.to_string(),
        Value::UnsignedInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Decimal(v) => v.normalized().to_string(),
        Value::DateTime(dt) => dt.and_utc().timestamp_micros().to_string(),
        Value::Timestamp(secs) => (*secs as i64 * 1_000_000).to_string(),
        Value::Time(micros) => micros.to_string(),
        Value::Enum(index) => encode_enum(column, *index)?,
        Value::Bytes(bytes) => hex::encode(bytes),
        Value::Text(bytes) => encode_text(column, bytes),
    };
    Ok(encoded)
}

fn encode_enum(column: &ColumnSchema, index: u16) -> Result<String, CodecError> {
    // MySQL stores 0 for a value outside the declared label set.
    if index == 0 {
        return Ok(String::new());
    }
    column
        .enum_labels
        .get(index as usize - 1)
        .cloned()
        .ok_or_else(|| CodecError::EnumIndexOutOfRange {
            column: column.name.clone(),
            index,
            labels: column.enum_labels.len(),
        })
}

fn encode_text(column: &ColumnSchema, bytes: &[u8]) -> String {
    if column.sql_type == SqlType::Blob {
        return hex::encode(bytes);
    }
    // A textual value on a decimal column is canonicalized the same way a
    // native decimal image would be.
    if column.sql_type == SqlType::Decimal {
        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Ok(decimal) = BigDecimal::from_str(text.trim()) {
                return decimal.normalized().to_string();
            }
        }
    }
    match column.charset {
        CharsetHint::Latin1 => latin1_to_string(bytes),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// latin1 is a 1:1 mapping of byte values onto the first 256 unicode
/// code points, so the decode can never fail.
fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn text_col(charset: CharsetHint) -> ColumnSchema {
        ColumnSchema::new("note", SqlType::Text).with_charset(charset)
    }

    #[test]
    fn latin1_text_decodes_to_unicode() {
        // 0xE9 is 'é' in latin1.
        let col = text_col(CharsetHint::Latin1);
        let encoded = encode_cell(&col, &Value::Text(vec![0x63, 0x61, 0x66, 0xE9])).unwrap();
        assert_eq!(encoded, "café");
    }

    #[test]
    fn utf8_text_passes_through() {
        let col = text_col(CharsetHint::Utf8);
        let encoded = encode_cell(&col, &Value::text("café")).unwrap();
        assert_eq!(encoded, "café");
    }

    #[test]
    fn blobs_become_lowercase_hex() {
        let col = ColumnSchema::new("payload", SqlType::Blob);
        let encoded = encode_cell(&col, &Value::Bytes(vec![0xDE, 0xAD, 0x01])).unwrap();
        assert_eq!(encoded, "dead01");
    }

    #[test]
    fn datetime_becomes_epoch_micros_without_tz_conversion() {
        let col = ColumnSchema::new("created_at", SqlType::DateTime);
        let dt = NaiveDate::from_ymd_opt(2016, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let encoded = encode_cell(&col, &Value::DateTime(dt)).unwrap();
        assert_eq!(encoded, (dt.and_utc().timestamp() * 1_000_000).to_string());
    }

    #[test]
    fn timestamp_seconds_scale_to_micros() {
        let col = ColumnSchema::new("updated_at", SqlType::Timestamp);
        let encoded = encode_cell(&col, &Value::Timestamp(1_450_000_000)).unwrap();
        assert_eq!(encoded, "1450000000000000");
    }

    #[test]
    fn enum_index_resolves_to_label() {
        let col = ColumnSchema::new("size", SqlType::Enum)
            .with_enum_labels(vec!["small".into(), "large".into()]);
        assert_eq!(encode_cell(&col, &Value::Enum(2)).unwrap(), "large");
        // MySQL's out-of-set sentinel encodes as the empty string.
        assert_eq!(encode_cell(&col, &Value::Enum(0)).unwrap(), "");
        assert!(encode_cell(&col, &Value::Enum(3)).is_err());
    }

    #[test]
    fn time_is_micros_since_midnight() {
        let col = ColumnSchema::new("at", SqlType::Time);
        let encoded = encode_cell(&col, &Value::Time(3_723_000_500)).unwrap();
        assert_eq!(encoded, "3723000500");
    }

    #[test]
    fn decimals_are_canonical() {
        let col = ColumnSchema::new("price", SqlType::Decimal);
        let decimal = BigDecimal::from_str("12.3400").unwrap();
        assert_eq!(encode_cell(&col, &Value::Decimal(decimal)).unwrap(), "12.34");
        assert_eq!(encode_cell(&col, &Value::text("12.3400")).unwrap(), "12.34");
    }

    #[test]
    fn null_encodes_as_marker() {
        let col = text_col(CharsetHint::Utf8);
        assert_eq!(encode_cell(&col, &Value::Null).unwrap(), "NULL");
    }
}
