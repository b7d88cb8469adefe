use crate::sink::SinkError;
use replicator_core::error::InvariantViolation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApplierError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("sink connection could not be re-established after all retries: {0}")]
    ConnectionExhausted(#[source] SinkError),
}

impl ApplierError {
    /// Everything the applier surfaces is unrecoverable by design:
    /// transient sink failures are absorbed by the requeue path instead.
    pub fn is_fatal(&self) -> bool {
        true
    }
}
