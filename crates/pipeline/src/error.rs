use crate::producer::ProducerError;
use crate::schema::SchemaError;
use applier::error::ApplierError;
use model::core::codec::CodecError;
use replicator_core::error::InvariantViolation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Applier(#[from] ApplierError),

    #[error("schema for {schema}.{table} could not be resolved: {source}")]
    SchemaMiss {
        schema: String,
        table: String,
        #[source]
        source: SchemaError,
    },

    #[error("row value could not be encoded: {0}")]
    Codec(#[from] CodecError),

    #[error("producer failed to start: {0}")]
    ProducerStart(#[source] ProducerError),

    #[error("producer restart failed during recovery: {0}")]
    ProducerRestart(#[source] ProducerError),

    #[error("stats emitter could not bind its socket: {0}")]
    StatsBind(#[source] std::io::Error),
}

impl PipelineError {
    /// Conditions the process must not survive: broken invariants, a dead
    /// producer that cannot be reconnected, exhausted sink retries.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Invariant(_)
            | PipelineError::Applier(_)
            | PipelineError::ProducerRestart(_) => true,
            PipelineError::SchemaMiss { .. }
            | PipelineError::Codec(_)
            | PipelineError::ProducerStart(_)
            | PipelineError::StatsBind(_) => false,
        }
    }
}
