use pipeline::error::PipelineError;
use replicator_core::config::ConfigError;
use replicator_core::error::FATAL_EXIT_CODE;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("active schema is unavailable: {0}")]
    ActiveSchema(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("shutdown requested")]
    ShutdownRequested,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            // Standard exit code for SIGINT.
            CliError::ShutdownRequested => 130,
            CliError::Pipeline(err) if err.is_fatal() => FATAL_EXIT_CODE,
            _ => 1,
        }
    }
}
