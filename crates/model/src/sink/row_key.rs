use chrono::{DateTime, Utc};

/// Separator between the parts of a composite row key.
///
/// 0x1F (ASCII unit separator) cannot appear in type-coded values: numeric,
/// temporal, hex and enum-label encodings never produce control bytes, and
/// free-text parts have all bytes below 0x20 stripped before joining. The
/// choice is load-bearing for key stability and must never change.
pub const KEY_SEPARATOR: char = '\u{1F}';

/// Builds the stable row fingerprint from the type-coded primary-key parts.
pub fn row_key(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| sanitize(part))
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string())
}

/// Delta-table keys carry the commit day so daily extractions scan a
/// contiguous key range.
pub fn delta_row_key(commit_micros: u64, key: &str) -> String {
    format!("{}{}{}", commit_day(commit_micros), KEY_SEPARATOR, key)
}

/// `YYYYMMDD` of the commit day, derived from the sink timestamp.
pub fn commit_day(commit_micros: u64) -> String {
    DateTime::<Utc>::from_timestamp_micros(commit_micros as i64)
        .map(|dt| dt.format("%Y%m%d").to_string())
        .unwrap_or_else(|| "00000000".to_string())
}

fn sanitize(part: &str) -> String {
    if part.chars().all(|c| c >= '\u{20}') {
        return part.to_string();
    }
    part.chars().filter(|&c| c >= '\u{20}').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_part_key_is_the_encoded_value() {
        assert_eq!(row_key(&["7".to_string()]), "7");
    }

    #[test]
    fn composite_keys_join_with_unit_separator() {
        let key = row_key(&["7".to_string(), "abc".to_string()]);
        assert_eq!(key, "7\u{1F}abc");
    }

    #[test]
    fn control_bytes_are_stripped_from_text_parts() {
        let key = row_key(&["a\u{1F}b\nc".to_string()]);
        assert_eq!(key, "abc");
    }

    #[test]
    fn delta_keys_prefix_the_commit_day() {
        // 2015-11-26 00:00:10 UTC
        let micros = 1_448_496_010_000_000u64;
        assert_eq!(delta_row_key(micros, "7"), "20151126\u{1F}7");
    }
}
