use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to list chunks in {dir}: {source}")]
    Discovery {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid chunk sequence pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("no chunks to merge into {destination}")]
    EmptyInput { destination: PathBuf },
    #[error("failed to create merged artifact {path}: {source}")]
    CreateArtifact {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {chunk_path} to merged artifact: {source}")]
    Chunk {
        chunk_path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to finalize merged artifact {path}: {source}")]
    Finalize {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl MergeError {
    /// True when the chunk directory itself could not be read.
    pub fn is_discovery(&self) -> bool {
        matches!(self, MergeError::Discovery { .. })
    }
}

pub type MergeResult<T> = Result<T, MergeError>;
