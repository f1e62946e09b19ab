use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`super::TranscodeEngine`] implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} failed ({exit_detail})")]
    Failed {
        program: String,
        exit_detail: String,
        diagnostics: String,
    },
    #[error("{program} did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to convert to adaptive stream: {exit_detail}, output: {diagnostics}")]
    Engine {
        exit_detail: String,
        diagnostics: String,
    },
    #[error("transcode cancelled before completion")]
    Cancelled,
}

impl From<EngineError> for TranscodeError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Failed {
                exit_detail,
                diagnostics,
                ..
            } => TranscodeError::Engine {
                exit_detail,
                diagnostics,
            },
            EngineError::Cancelled { .. } => TranscodeError::Cancelled,
            other @ (EngineError::Spawn { .. } | EngineError::TimedOut { .. }) => {
                TranscodeError::Engine {
                    exit_detail: other.to_string(),
                    diagnostics: String::new(),
                }
            }
        }
    }
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;
