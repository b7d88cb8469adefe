use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ENUM_TYPE: Regex = Regex::new(r"(?i)^enum\s*\((.*)\)$").unwrap();
    static ref ENUM_LABEL: Regex = Regex::new(r"'([^']*)'").unwrap();
}

/// Character set hint attached to textual columns, resolved from the
/// active schema's `CHARACTER_SET_NAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharsetHint {
    Latin1,
    Utf8,
    Binary,
    Other,
}

impl CharsetHint {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("latin1") => CharsetHint::Latin1,
            Some("utf8") | Some("utf8mb3") | Some("utf8mb4") => CharsetHint::Utf8,
            Some("binary") | None => CharsetHint::Binary,
            Some(_) => CharsetHint::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    Float,
    Decimal,
    Text,
    Blob,
    Date,
    DateTime,
    Timestamp,
    Time,
    Enum,
    Set,
    Json,
    Other(String),
}

impl SqlType {
    /// Maps an `information_schema.columns.DATA_TYPE` string.
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year"
            | "bit" => SqlType::Integer,
            "float" | "double" => SqlType::Float,
            "decimal" | "numeric" => SqlType::Decimal,
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => SqlType::Text,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                SqlType::Blob
            }
            "date" => SqlType::Date,
            "datetime" => SqlType::DateTime,
            "timestamp" => SqlType::Timestamp,
            "time" => SqlType::Time,
            "enum" => SqlType::Enum,
            "set" => SqlType::Set,
            "json" => SqlType::Json,
            other => SqlType::Other(other.to_string()),
        }
    }
}

/// Column metadata as resolved from the active schema at a given binlog
/// position. Enum labels are parsed out of the raw `COLUMN_TYPE` once, at
/// schema load, so the coder only ever does an index lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub sql_type: SqlType,
    pub charset: CharsetHint,
    /// Fractional-second (or TIME) precision, when the type carries one.
    pub precision: Option<u8>,
    /// Labels of an enum column, in declaration order.
    pub enum_labels: Vec<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            charset: CharsetHint::Binary,
            precision: None,
            enum_labels: Vec::new(),
        }
    }

    pub fn with_charset(mut self, charset: CharsetHint) -> Self {
        self.charset = charset;
        self
    }

    pub fn with_enum_labels(mut self, labels: Vec<String>) -> Self {
        self.enum_labels = labels;
        self
    }
}

/// Parses the label list out of a raw `enum('a','b',…)` column type.
/// Returns an empty list for anything that is not an enum declaration.
pub fn parse_enum_labels(column_type: &str) -> Vec<String> {
    let Some(caps) = ENUM_TYPE.captures(column_type.trim()) else {
        return Vec::new();
    };
    ENUM_LABEL
        .captures_iter(&caps[1])
        .map(|c| c[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enum_labels_in_declaration_order() {
        let labels = parse_enum_labels("enum('small','medium','large')");
        assert_eq!(labels, vec!["small", "medium", "large"]);
    }

    #[test]
    fn enum_parse_tolerates_case_and_whitespace() {
        let labels = parse_enum_labels("ENUM ('a','b')");
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn non_enum_types_yield_no_labels() {
        assert!(parse_enum_labels("varchar(255)").is_empty());
        assert!(parse_enum_labels("int(11)").is_empty());
    }

    #[test]
    fn charset_hints_cover_utf8_aliases() {
        assert_eq!(CharsetHint::from_name(Some("utf8mb4")), CharsetHint::Utf8);
        assert_eq!(CharsetHint::from_name(Some("latin1")), CharsetHint::Latin1);
        assert_eq!(CharsetHint::from_name(None), CharsetHint::Binary);
    }
}
