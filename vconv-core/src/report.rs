//! Failure records for operators. Nothing in the pipeline reads them back.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::sqlite::{initialize_schema, open_configured, open_flags, PersistenceResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// `None` when the failing payload never yielded an identifier.
    pub video_id: Option<i64>,
    pub stage: String,
    pub error_message: String,
    pub cause_detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            video_id: row.get("video_id")?,
            stage: row.get("stage")?,
            error_message: row.get("error_message")?,
            cause_detail: row.get("cause_detail")?,
            timestamp: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteErrorStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteErrorStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: open_flags(false, true),
        }
    }

    pub fn read_only(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: open_flags(true, false),
        }
    }

    fn open(&self) -> PersistenceResult<Connection> {
        open_configured(&self.path, self.flags)
    }

    pub fn initialize(&self) -> PersistenceResult<()> {
        initialize_schema(&self.path, self.flags)
    }

    pub fn append(&self, record: &ErrorRecord) -> PersistenceResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO processing_errors (
                video_id, stage, error_message, cause_detail, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.video_id,
                &record.stage,
                &record.error_message,
                &record.cause_detail,
                record.timestamp,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_for_video(&self, video_id: i64, limit: usize) -> PersistenceResult<Vec<ErrorRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT video_id, stage, error_message, cause_detail, created_at
             FROM processing_errors
             WHERE video_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![video_id, limit as i64], ErrorRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_recent(&self, limit: usize) -> PersistenceResult<Vec<ErrorRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT video_id, stage, error_message, cause_detail, created_at
             FROM processing_errors
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], ErrorRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Persists and logs failures. Reporting never fails the caller; problems
/// writing a record are logged and swallowed.
#[derive(Debug, Clone, Default)]
pub struct ErrorReporter {
    store: Option<SqliteErrorStore>,
    journal_path: Option<PathBuf>,
}

impl ErrorReporter {
    pub fn new(store: SqliteErrorStore) -> Self {
        Self {
            store: Some(store),
            journal_path: None,
        }
    }

    /// Log-only reporter, for tooling that runs without a database.
    pub fn log_only() -> Self {
        Self::default()
    }

    pub fn with_journal(mut self, path: impl AsRef<Path>) -> Self {
        self.journal_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn report(
        &self,
        video_id: Option<i64>,
        stage: &str,
        message: &str,
        cause: &dyn std::error::Error,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            video_id,
            stage: stage.to_string(),
            error_message: message.to_string(),
            cause_detail: cause.to_string(),
            timestamp: Utc::now(),
        };

        let serialized = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize error record");
                format!("{record:?}")
            }
        };
        let subject = video_id.map_or_else(|| "unknown".to_string(), |id| id.to_string());
        error!(
            video_id = %subject,
            stage,
            error_details = %serialized,
            "processing error"
        );

        if let Some(store) = &self.store {
            if let Err(err) = store.append(&record) {
                error!(error = %err, "failed to persist error record");
            }
        }
        if let Some(path) = &self.journal_path {
            if let Err(err) = append_line(path, &serialized) {
                error!(path = %path.display(), error = %err, "failed to append error journal");
            }
        }
        record
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
