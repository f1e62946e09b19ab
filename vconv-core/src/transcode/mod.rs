mod engine;
mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use engine::{FfmpegEngine, TranscodeEngine};
pub use error::{EngineError, TranscodeError, TranscodeResult};

/// The merged artifact survived a successful transcode. Not a failure.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeOutcome {
    pub output_dir: PathBuf,
    pub diagnostics: String,
    pub cleanup: Option<CleanupWarning>,
}

/// Converts a merged artifact into a streaming package and removes the
/// artifact once the package exists.
#[derive(Clone)]
pub struct Transcoder {
    engine: Arc<dyn TranscodeEngine>,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder").finish_non_exhaustive()
    }
}

impl Transcoder {
    pub fn new(engine: Arc<dyn TranscodeEngine>) -> Self {
        Self { engine }
    }

    pub async fn transcode(
        &self,
        artifact: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> TranscodeResult<TranscodeOutcome> {
        fs::create_dir_all(output_dir)
            .await
            .map_err(|source| TranscodeError::OutputDirectory {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let diagnostics = self.engine.invoke(artifact, output_dir, cancel).await?;
        info!(path = %output_dir.display(), "converted to adaptive stream");

        let cleanup = match fs::remove_file(artifact).await {
            Ok(()) => {
                info!(file = %artifact.display(), "removed merged file");
                None
            }
            Err(err) => {
                warn!(file = %artifact.display(), error = %err, "failed to remove merged file");
                Some(CleanupWarning {
                    path: artifact.to_path_buf(),
                    message: err.to_string(),
                })
            }
        };

        Ok(TranscodeOutcome {
            output_dir: output_dir.to_path_buf(),
            diagnostics,
            cleanup,
        })
    }
}
