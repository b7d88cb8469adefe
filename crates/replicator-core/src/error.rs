use thiserror::Error;

/// A broken internal invariant: a state the pipeline can only reach through
/// a bug, never through bad input or a flaky collaborator.
///
/// Every crate folds this into its own error enum via `#[from]`; the CLI
/// maps any error chain containing one to the fatal exit status. This is the
/// single fatal-assert facility — nothing else in the codebase exits the
/// process from library code.
#[derive(Error, Debug)]
#[error("invariant violated: {0}")]
pub struct InvariantViolation(pub String);

/// Asserts a pipeline invariant, returning an `InvariantViolation` (converted
/// into the caller's error type) when it does not hold.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::error::InvariantViolation(format!($($arg)+)).into());
        }
    };
}

/// Process exit status for unrecoverable conditions, matching the original
/// operational contract (-1, i.e. status 255).
pub const FATAL_EXIT_CODE: i32 = -1;
