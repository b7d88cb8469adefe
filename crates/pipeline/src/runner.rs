use crate::augmenter::Augmenter;
use crate::error::PipelineError;
use crate::orchestrator::{OrchestratorSettings, PipelineOrchestrator};
use crate::overseer::{ProducerSupervisor, StatsReporter};
use crate::position::{FakeMicrosecondsCounter, PipelinePosition};
use crate::producer::BinlogProducer;
use crate::schema::{ActiveSchema, SchemaCache};
use applier::buffer::{ApplierSettings, TaskBufferingApplier};
use applier::chaos::ChaosMonkey;
use applier::sink::Sink;
use model::binlog::event::BinlogEvent;
use model::binlog::position::BinlogPosition;
use replicator_core::config::Configuration;
use replicator_core::error::InvariantViolation;
use replicator_core::metrics::ReplicatorMetrics;
use replicator_core::stats::StatsEmitter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn flatten(result: Result<Result<(), PipelineError>, JoinError>) -> Result<(), PipelineError> {
    match result {
        Ok(inner) => inner,
        Err(join_err) => {
            Err(InvariantViolation(format!("pipeline worker died: {join_err}")).into())
        }
    }
}

/// Assembles and runs the whole pipeline: seeds the schema cache, starts
/// the producer, then drives the orchestrator with the producer supervisor
/// and (when enabled) the stats reporter alongside it. Returns when the
/// event stream ends, the ending binlog file is passed, shutdown is
/// requested, or a fatal error surfaces.
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    config: &Configuration,
    producer: Arc<dyn BinlogProducer>,
    receiver: mpsc::Receiver<BinlogEvent>,
    active_schema: Arc<dyn ActiveSchema>,
    sink: Arc<dyn Sink>,
    chaos: Arc<dyn ChaosMonkey>,
    metrics: ReplicatorMetrics,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let start = BinlogPosition::new(
        config.starting_binlog_file_name.clone(),
        config.starting_binlog_position,
    );
    let positions = Arc::new(PipelinePosition::new(start.clone()));
    let counter = Arc::new(FakeMicrosecondsCounter::new());

    let mut cache = SchemaCache::new(active_schema);
    cache
        .seed(&config.replicant_schema_name)
        .await
        .map_err(|source| PipelineError::SchemaMiss {
            schema: config.replicant_schema_name.clone(),
            table: "*".to_string(),
            source,
        })?;

    if config.initial_snapshot_mode {
        info!("initial snapshot mode: streaming resumes from the configured position once the snapshot tooling has run");
    }

    producer
        .start(start)
        .await
        .map_err(PipelineError::ProducerStart)?;

    let applier = TaskBufferingApplier::new(
        ApplierSettings::from_config(config),
        sink,
        chaos,
        metrics.clone(),
    );
    let orchestrator = PipelineOrchestrator::new(
        receiver,
        applier,
        Augmenter::new(cache),
        metrics.clone(),
        Arc::clone(&positions),
        Arc::clone(&counter),
        OrchestratorSettings::from_config(config),
        cancel.clone(),
    );
    let supervisor = ProducerSupervisor::new(
        Arc::clone(&producer),
        Arc::clone(&positions),
        Arc::clone(&counter),
        cancel.clone(),
    );

    let stats_handle = if config.stats_enabled() {
        let emitter = StatsEmitter::bind(config.graphite_endpoint.clone())
            .await
            .map_err(PipelineError::StatsBind)?;
        let reporter = StatsReporter::new(
            metrics.clone(),
            emitter,
            config.graphite_stats_namespace.clone(),
            config.db_alias(),
            config.tables_for_which_to_track_daily_changes.clone(),
            cancel.clone(),
        );
        Some(tokio::spawn(reporter.run()))
    } else {
        None
    };

    let mut orchestrator_handle = tokio::spawn(orchestrator.run());
    let mut supervisor_handle = tokio::spawn(supervisor.run());

    let result = tokio::select! {
        res = &mut orchestrator_handle => {
            cancel.cancel();
            let supervisor_res = flatten(supervisor_handle.await);
            flatten(res).and(supervisor_res)
        }
        res = &mut supervisor_handle => {
            // The supervisor only finishes early when producer recovery
            // failed fatally; stop the orchestrator, which flushes what it
            // buffered before exiting.
            cancel.cancel();
            let orchestrator_res = flatten(orchestrator_handle.await);
            flatten(res).and(orchestrator_res)
        }
    };

    if let Some(handle) = stats_handle {
        let _ = handle.await;
    }
    result
}
