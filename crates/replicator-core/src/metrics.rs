use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counter identities with their stable graphite names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    EventsObserved,
    RowsReceived,
    RowsCommitted,
    ApplierTasksSubmitted,
    ApplierTasksInProgress,
    ApplierTasksSucceeded,
    ApplierTasksFailed,
    ReplicationDelay,
    TaskQueueSize,
}

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::EventsObserved => "events_observed",
            Counter::RowsReceived => "rows_received",
            Counter::RowsCommitted => "rows_committed",
            Counter::ApplierTasksSubmitted => "applier_tasks_submitted",
            Counter::ApplierTasksInProgress => "applier_tasks_in_progress",
            Counter::ApplierTasksSucceeded => "applier_tasks_succeeded",
            Counter::ApplierTasksFailed => "applier_tasks_failed",
            Counter::ReplicationDelay => "replication_delay",
            Counter::TaskQueueSize => "task_queue_size",
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// second-since-epoch -> counter -> value
    buckets: Mutex<BTreeMap<u64, HashMap<Counter, u64>>>,
    /// table -> counter -> value, updated on task success
    table_totals: Mutex<HashMap<String, HashMap<Counter, u64>>>,
}

/// Per-second time-bucketed counters plus per-table running totals.
///
/// Incrementing always targets the bucket for "now"; the overseer drains
/// strictly-past buckets, so a drained bucket can no longer receive
/// increments and the two sides only ever contend on the map lock.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorMetrics {
    inner: Arc<Inner>,
}

impl ReplicatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, delta: u64) {
        let mut buckets = self.inner.buckets.lock().expect("metrics lock poisoned");
        let bucket = buckets.entry(Self::now_secs()).or_default();
        *bucket.entry(counter).or_insert(0) += delta;
    }

    /// Gauge semantics: overwrite the value in the current bucket.
    pub fn set(&self, counter: Counter, value: u64) {
        let mut buckets = self.inner.buckets.lock().expect("metrics lock poisoned");
        let bucket = buckets.entry(Self::now_secs()).or_default();
        bucket.insert(counter, value);
    }

    pub fn add_table_total(&self, table: &str, counter: Counter, delta: u64) {
        let mut totals = self
            .inner
            .table_totals
            .lock()
            .expect("metrics lock poisoned");
        let entry = totals.entry(table.to_string()).or_default();
        *entry.entry(counter).or_insert(0) += delta;
    }

    /// Removes and returns all buckets older than `cutoff_secs`, ascending.
    /// Each bucket is drained exactly once.
    pub fn drain_before(&self, cutoff_secs: u64) -> Vec<(u64, Vec<(Counter, u64)>)> {
        let mut buckets = self.inner.buckets.lock().expect("metrics lock poisoned");
        let remaining = buckets.split_off(&cutoff_secs);
        let drained = std::mem::replace(&mut *buckets, remaining);
        drained
            .into_iter()
            .map(|(second, counters)| {
                let mut sorted: Vec<_> = counters.into_iter().collect();
                sorted.sort_by_key(|(c, _)| *c);
                (second, sorted)
            })
            .collect()
    }

    pub fn table_totals_snapshot(&self) -> Vec<(String, Vec<(Counter, u64)>)> {
        let totals = self
            .inner
            .table_totals
            .lock()
            .expect("metrics lock poisoned");
        let mut tables: Vec<_> = totals
            .iter()
            .map(|(table, counters)| {
                let mut sorted: Vec<_> = counters.iter().map(|(c, v)| (*c, *v)).collect();
                sorted.sort_by_key(|(c, _)| *c);
                (table.clone(), sorted)
            })
            .collect();
        tables.sort_by(|a, b| a.0.cmp(&b.0));
        tables
    }

    /// Sum of a counter across all undrained buckets. Test and report helper.
    pub fn sum(&self, counter: Counter) -> u64 {
        let buckets = self.inner.buckets.lock().expect("metrics lock poisoned");
        buckets
            .values()
            .filter_map(|bucket| bucket.get(&counter))
            .sum()
    }

    pub fn table_total(&self, table: &str, counter: Counter) -> u64 {
        let totals = self
            .inner
            .table_totals
            .lock()
            .expect("metrics lock poisoned");
        totals
            .get(table)
            .and_then(|counters| counters.get(&counter))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_accumulate_in_the_current_bucket() {
        let metrics = ReplicatorMetrics::new();
        metrics.inc(Counter::RowsReceived);
        metrics.add(Counter::RowsReceived, 4);
        assert_eq!(metrics.sum(Counter::RowsReceived), 5);
    }

    #[test]
    fn gauge_set_overwrites() {
        let metrics = ReplicatorMetrics::new();
        metrics.set(Counter::TaskQueueSize, 7);
        metrics.set(Counter::TaskQueueSize, 2);
        assert_eq!(metrics.sum(Counter::TaskQueueSize), 2);
    }

    #[test]
    fn drain_removes_past_buckets_in_ascending_order() {
        let metrics = ReplicatorMetrics::new();
        metrics.inc(Counter::EventsObserved);
        let drained = metrics.drain_before(u64::MAX);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1, vec![(Counter::EventsObserved, 1)]);
        // A second drain finds nothing: buckets drain exactly once.
        assert!(metrics.drain_before(u64::MAX).is_empty());
    }

    #[test]
    fn drain_spares_the_current_bucket() {
        let metrics = ReplicatorMetrics::new();
        metrics.inc(Counter::EventsObserved);
        let drained = metrics.drain_before(ReplicatorMetrics::now_secs());
        // The increment above landed in the bucket for "now", which a
        // cutoff of "now" must not touch.
        assert!(drained.is_empty());
        assert_eq!(metrics.sum(Counter::EventsObserved), 1);
    }

    #[test]
    fn table_totals_track_per_table() {
        let metrics = ReplicatorMetrics::new();
        metrics.add_table_total("orders", Counter::RowsCommitted, 3);
        metrics.add_table_total("orders", Counter::RowsCommitted, 2);
        assert_eq!(metrics.table_total("orders", Counter::RowsCommitted), 5);
        assert_eq!(metrics.table_total("other", Counter::RowsCommitted), 0);
    }
}
