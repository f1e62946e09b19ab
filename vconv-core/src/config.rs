use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "converter.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConverterConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub layout: LayoutSection,
    #[serde(default)]
    pub transcode: TranscodeSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub transport: TransportSection,
    /// Directory relative paths are resolved against. Set by the loader.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl ConverterConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn chunk_root(&self) -> PathBuf {
        self.resolve_path(&self.paths.chunk_root)
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
            .join(&self.paths.database_name)
    }

    pub fn error_journal_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
            .join("processing_errors.jsonl")
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.resolve_path(&self.transport.spool_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "worker.concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.layout.chunk_extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Invalid {
                field: "layout.chunk_extension",
                reason: "must not be empty".into(),
            });
        }
        for (field, value) in [
            ("layout.merged_file_name", &self.layout.merged_file_name),
            ("layout.output_dir_name", &self.layout.output_dir_name),
            ("layout.manifest_name", &self.layout.manifest_name),
        ] {
            if value.is_empty() || value.contains(['/', '\\']) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{value:?} must be a plain file name"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub chunk_root: String,
    pub data_dir: String,
    pub logs_dir: String,
    #[serde(default = "default_database_name")]
    pub database_name: String,
}

/// Naming conventions inside an upload directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutSection {
    pub chunk_extension: String,
    pub merged_file_name: String,
    pub output_dir_name: String,
    pub manifest_name: String,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            chunk_extension: "chunk".into(),
            merged_file_name: "merged.mp4".into(),
            output_dir_name: "mpeg-dash".into(),
            manifest_name: "output.mpd".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub program: String,
    /// Placed ahead of the converter arguments, for wrappers such as `nice`.
    pub program_args: Vec<String>,
    pub format: String,
    pub extra_args: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

impl TranscodeSection {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            program_args: Vec::new(),
            format: "dash".into(),
            extra_args: Vec::new(),
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge every delivery, failed or not.
    #[default]
    AckAlways,
    /// Hand failed deliveries back to the transport for another attempt.
    RequeueOnFailure,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub concurrency: usize,
    pub ack_policy: AckPolicy,
    pub poll_interval_ms: u64,
    pub claim_uploads: bool,
    pub claim_lease_seconds: u64,
    /// Claim owner. Must survive restarts so a restarted worker can take
    /// back its own claims; defaults to the host name.
    pub worker_id: Option<String>,
}

impl WorkerSection {
    pub fn worker_id(&self) -> String {
        match self.worker_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => default_worker_id(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_seconds)
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            concurrency: 2,
            ack_policy: AckPolicy::AckAlways,
            poll_interval_ms: 1_000,
            claim_uploads: true,
            claim_lease_seconds: 6 * 60 * 60,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub spool_dir: String,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            spool_dir: "spool".into(),
        }
    }
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("converter@{host}")
}

fn default_database_name() -> String {
    "converter.sqlite".into()
}

pub fn load_converter_config<P: AsRef<Path>>(path: P) -> Result<ConverterConfig> {
    let path = path.as_ref();
    let mut config: ConverterConfig = load_toml(path)?;
    config.base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
