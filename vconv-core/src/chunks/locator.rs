use std::cmp::Ordering;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::fs;
use tracing::{debug, warn};

use super::{MergeError, MergeResult};

/// ASCII only; `\d` in `regex` also matches other Unicode decimal digits.
const DIGIT_RUN: &str = r"[0-9]+";

/// A chunk file found on disk together with its ordering key.
///
/// `sequence` is `None` when the file name carries no usable digit run; such
/// chunks sort ahead of every numbered chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub path: PathBuf,
    pub sequence: Option<u64>,
}

impl ChunkRef {
    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// Ascending sequence number; ties fall back to the file name bytes so
    /// the order never depends on directory enumeration.
    fn merge_order(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.file_name().cmp(&other.file_name()))
    }
}

#[derive(Debug, Clone)]
pub struct ChunkLocator {
    extension: String,
    digits: Regex,
}

impl ChunkLocator {
    pub fn new(extension: impl AsRef<str>) -> MergeResult<Self> {
        Ok(Self {
            extension: extension.as_ref().trim_start_matches('.').to_string(),
            digits: Regex::new(DIGIT_RUN)?,
        })
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Integer value of the first maximal digit run in the file name.
    pub fn sequence_of(&self, file_name: &str) -> Option<u64> {
        self.digits
            .find(file_name)
            .and_then(|found| found.as_str().parse().ok())
    }

    pub fn is_chunk(&self, path: &Path) -> bool {
        path.extension()
            .and_then(OsStr::to_str)
            .map(|ext| ext == self.extension)
            .unwrap_or(false)
    }

    /// Lists the chunk files of one upload directory in merge order.
    pub async fn locate(&self, dir: &Path) -> MergeResult<Vec<ChunkRef>> {
        let discovery = |source| MergeError::Discovery {
            dir: dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(dir).await.map_err(discovery)?;
        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(discovery)? {
            let path = entry.path();
            if !self.is_chunk(&path) {
                continue;
            }
            if entry.file_type().await.map_err(discovery)?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let sequence = self.sequence_of(&name.to_string_lossy());
            if sequence.is_none() {
                warn!(path = %path.display(), "chunk name has no sequence number; placing it first");
            }
            chunks.push(ChunkRef { path, sequence });
        }
        chunks.sort_by(ChunkRef::merge_order);
        debug!(dir = %dir.display(), count = chunks.len(), "located chunks");
        Ok(chunks)
    }
}
