use model::binlog::position::BinlogPosition;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Positions shared between the orchestrator (writer) and the overseer
/// (reader). `last_known` advances on every event; `last_map_event` only on
/// TableMap events and is the restart anchor handed back to the producer on
/// recovery.
#[derive(Debug)]
pub struct PipelinePosition {
    last_known: Mutex<BinlogPosition>,
    last_map_event: Mutex<BinlogPosition>,
}

impl PipelinePosition {
    pub fn new(start: BinlogPosition) -> Self {
        Self {
            last_known: Mutex::new(start.clone()),
            last_map_event: Mutex::new(start),
        }
    }

    pub fn record_event(&self, position: BinlogPosition) {
        *self.last_known.lock().expect("position lock poisoned") = position;
    }

    pub fn record_map_event(&self, position: BinlogPosition) {
        *self.last_map_event.lock().expect("position lock poisoned") = position;
    }

    pub fn last_known(&self) -> BinlogPosition {
        self.last_known.lock().expect("position lock poisoned").clone()
    }

    pub fn last_map_event(&self) -> BinlogPosition {
        self.last_map_event
            .lock()
            .expect("position lock poisoned")
            .clone()
    }
}

/// The intra-transaction tiebreaker appended to a binlog second.
///
/// Owned by the orchestrator: reset to zero at each transaction begin,
/// incremented once per augmented row. The overseer only ever writes it back
/// to a recorded value during producer recovery.
#[derive(Debug, Default)]
pub struct FakeMicrosecondsCounter(AtomicU64);

impl FakeMicrosecondsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Increments and returns the new value; the first row of a
    /// transaction gets 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_starts_each_transaction_at_one() {
        let counter = FakeMicrosecondsCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        counter.reset();
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn map_event_position_is_tracked_separately() {
        let positions = PipelinePosition::new(BinlogPosition::new("mysql-bin.000001", 4));
        positions.record_event(BinlogPosition::new("mysql-bin.000001", 500));
        assert_eq!(positions.last_known().offset, 500);
        assert_eq!(positions.last_map_event().offset, 4);

        positions.record_map_event(
            BinlogPosition::new("mysql-bin.000001", 450).with_fake_microseconds(3),
        );
        assert_eq!(positions.last_map_event().offset, 450);
        assert_eq!(positions.last_map_event().fake_microseconds, 3);
    }
}
