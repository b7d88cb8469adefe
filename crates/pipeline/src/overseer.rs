use crate::error::PipelineError;
use crate::position::{FakeMicrosecondsCounter, PipelinePosition};
use crate::producer::{BinlogProducer, ProducerError};
use replicator_core::metrics::ReplicatorMetrics;
use replicator_core::stats::{bucket_lines, table_lines, StatsEmitter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_secs(1);

/// Once per second, makes sure the producer is alive. A stopped producer is
/// restarted from the last known map-event position with the
/// fake-microseconds counter rewound to that position's value. A connect
/// failure during this recovery is unrecoverable; anything else is logged
/// and retried on the next tick.
pub struct ProducerSupervisor {
    producer: Arc<dyn BinlogProducer>,
    positions: Arc<PipelinePosition>,
    counter: Arc<FakeMicrosecondsCounter>,
    cancel: CancellationToken,
}

impl ProducerSupervisor {
    pub fn new(
        producer: Arc<dyn BinlogProducer>,
        positions: Arc<PipelinePosition>,
        counter: Arc<FakeMicrosecondsCounter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            producer,
            positions,
            counter,
            cancel,
        }
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(TICK) => {}
            }
            self.check_producer().await?;
        }
    }

    async fn check_producer(&self) -> Result<(), PipelineError> {
        if self.producer.is_running() {
            debug!("producer is running");
            return Ok(());
        }

        let last_known = self.positions.last_known();
        let restart_anchor = self.positions.last_map_event();
        warn!(
            position = %last_known,
            anchor = %restart_anchor,
            "producer stopped running, attempting restart"
        );

        self.counter.set(restart_anchor.fake_microseconds);
        match self.producer.start_from_last_map_event().await {
            Ok(()) => {
                info!(
                    file = %self.producer.binlog_file_name(),
                    offset = self.producer.binlog_position(),
                    "producer restarted"
                );
                Ok(())
            }
            Err(err @ ProducerError::Connect(_)) => {
                error!("producer restart could not connect, cannot continue: {err}");
                Err(PipelineError::ProducerRestart(err))
            }
            Err(err) => {
                warn!("producer restart failed, will retry next tick: {err}");
                Ok(())
            }
        }
    }
}

/// Once per second, drains completed metric buckets (each exactly once, in
/// ascending time order) and pushes them, together with the per-table
/// totals of delta-tracked tables, to the graphite endpoint.
pub struct StatsReporter {
    metrics: ReplicatorMetrics,
    emitter: StatsEmitter,
    namespace: String,
    db_alias: String,
    delta_tables: Vec<String>,
    cancel: CancellationToken,
}

impl StatsReporter {
    pub fn new(
        metrics: ReplicatorMetrics,
        emitter: StatsEmitter,
        namespace: String,
        db_alias: String,
        delta_tables: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            metrics,
            emitter,
            namespace,
            db_alias,
            delta_tables,
            cancel,
        }
    }

    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Final flush so the tail of the run is not lost.
                    self.report().await;
                    return;
                }
                _ = sleep(TICK) => {}
            }
            self.report().await;
        }
    }

    async fn report(&self) {
        let now = ReplicatorMetrics::now_secs();
        let drained = self.metrics.drain_before(now);
        if drained.is_empty() {
            return;
        }

        let mut lines = Vec::new();
        for (second, counters) in &drained {
            lines.extend(bucket_lines(
                &self.namespace,
                &self.db_alias,
                *second,
                counters,
            ));
        }

        for (table, counters) in self.metrics.table_totals_snapshot() {
            if !self.delta_tables.contains(&table) {
                continue;
            }
            lines.extend(table_lines(
                &self.namespace,
                &self.db_alias,
                &table,
                now,
                &counters,
            ));
        }

        debug!(lines = lines.len(), "pushing stats");
        self.emitter.emit(&lines).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use model::binlog::position::BinlogPosition;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Producer that reports itself stopped and scripts the outcome of the
    /// restart attempts.
    struct FlakyProducer {
        running: AtomicBool,
        restarts: AtomicUsize,
        connect_fails: bool,
    }

    impl FlakyProducer {
        fn new(connect_fails: bool) -> Self {
            Self {
                running: AtomicBool::new(false),
                restarts: AtomicUsize::new(0),
                connect_fails,
            }
        }
    }

    #[async_trait]
    impl BinlogProducer for FlakyProducer {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn start(&self, _from: BinlogPosition) -> Result<(), ProducerError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn start_from_last_map_event(&self) -> Result<(), ProducerError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.connect_fails {
                return Err(ProducerError::Connect("refused".to_string()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn binlog_file_name(&self) -> String {
            "mysql-bin.000001".to_string()
        }

        fn binlog_position(&self) -> u64 {
            4
        }
    }

    fn supervisor(producer: Arc<FlakyProducer>) -> (ProducerSupervisor, Arc<FakeMicrosecondsCounter>) {
        let positions = Arc::new(PipelinePosition::new(
            BinlogPosition::new("mysql-bin.000001", 4).with_fake_microseconds(17),
        ));
        let counter = Arc::new(FakeMicrosecondsCounter::new());
        let supervisor = ProducerSupervisor::new(
            producer,
            positions,
            Arc::clone(&counter),
            CancellationToken::new(),
        );
        (supervisor, counter)
    }

    #[tokio::test]
    async fn restarts_a_stopped_producer_from_the_map_event_anchor() {
        let producer = Arc::new(FlakyProducer::new(false));
        let (supervisor, counter) = supervisor(Arc::clone(&producer));

        supervisor.check_producer().await.unwrap();

        assert_eq!(producer.restarts.load(Ordering::SeqCst), 1);
        assert!(producer.is_running());
        // Counter rewound to the anchor position's value.
        assert_eq!(counter.value(), 17);
    }

    #[tokio::test]
    async fn recovery_connect_failure_is_fatal() {
        let producer = Arc::new(FlakyProducer::new(true));
        let (supervisor, _) = supervisor(producer);

        let err = supervisor.check_producer().await.unwrap_err();
        assert!(matches!(err, PipelineError::ProducerRestart(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn running_producer_is_left_alone() {
        let producer = Arc::new(FlakyProducer::new(false));
        producer.running.store(true, Ordering::SeqCst);
        let (supervisor, _) = supervisor(Arc::clone(&producer));

        supervisor.check_producer().await.unwrap();
        assert_eq!(producer.restarts.load(Ordering::SeqCst), 0);
    }
}
