use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the replication stream: binlog file, byte offset within the
/// file, and the fake-microseconds counter at that point.
///
/// The counter disambiguates rows that share a binlog second; within one
/// transaction the triple is strictly increasing. It is part of the position
/// so that a restart resumes with the counter the stream left off at,
/// keeping sink timestamps unique across the restart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub offset: u64,
    pub fake_microseconds: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
            fake_microseconds: 0,
        }
    }

    pub fn with_fake_microseconds(mut self, counter: u64) -> Self {
        self.fake_microseconds = counter;
        self
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.file, self.offset, self.fake_microseconds)
    }
}

/// Commit timestamp in microseconds: the event's binlog second scaled to
/// micros, tie-broken by the fake counter.
pub fn commit_micros(event_seconds: u32, fake_microseconds: u64) -> u64 {
    event_seconds as u64 * 1_000_000 + fake_microseconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_by_file_then_offset() {
        let a = BinlogPosition::new("mysql-bin.000001", 500);
        let b = BinlogPosition::new("mysql-bin.000001", 900);
        let c = BinlogPosition::new("mysql-bin.000002", 4);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn commit_micros_tie_breaks_on_counter() {
        assert_eq!(commit_micros(10, 1), 10_000_001);
        assert!(commit_micros(10, 2) > commit_micros(10, 1));
    }
}
