use std::path::Path;

use hex::encode as hex_encode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{ChunkRef, MergeError, MergeResult};

const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub chunk_count: usize,
    pub bytes_written: u64,
    pub sha256: String,
}

/// Streams ordered chunks into a single artifact through a fixed-size buffer.
#[derive(Debug, Clone)]
pub struct Reassembler {
    buffer_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Writes `chunks` in slice order to `destination`, truncating any file
    /// already there. On error the partially written artifact is kept.
    pub async fn merge(&self, chunks: &[ChunkRef], destination: &Path) -> MergeResult<MergeSummary> {
        if chunks.is_empty() {
            return Err(MergeError::EmptyInput {
                destination: destination.to_path_buf(),
            });
        }

        let mut output = File::create(destination)
            .await
            .map_err(|source| MergeError::CreateArtifact {
                path: destination.to_path_buf(),
                source,
            })?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; self.buffer_size];
        let mut bytes_written = 0u64;

        for chunk in chunks {
            let chunk_error = |source| MergeError::Chunk {
                chunk_path: chunk.path.clone(),
                source,
            };
            let mut input = File::open(&chunk.path).await.map_err(chunk_error)?;
            let mut copied = 0u64;
            loop {
                let read = input.read(&mut buffer).await.map_err(chunk_error)?;
                if read == 0 {
                    break;
                }
                output
                    .write_all(&buffer[..read])
                    .await
                    .map_err(chunk_error)?;
                hasher.update(&buffer[..read]);
                copied += read as u64;
            }
            output.flush().await.map_err(chunk_error)?;
            bytes_written += copied;
            debug!(chunk = %chunk.path.display(), sequence = ?chunk.sequence, bytes = copied, "appended chunk");
        }

        let finalize = |source| MergeError::Finalize {
            path: destination.to_path_buf(),
            source,
        };
        output.flush().await.map_err(finalize)?;
        output.sync_all().await.map_err(finalize)?;

        let summary = MergeSummary {
            chunk_count: chunks.len(),
            bytes_written,
            sha256: hex_encode(hasher.finalize()),
        };
        info!(
            path = %destination.display(),
            chunks = summary.chunk_count,
            bytes = summary.bytes_written,
            "merged chunks"
        );
        Ok(summary)
    }
}
