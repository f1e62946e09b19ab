//! Durable record of which uploads have been converted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::debug;

use crate::chunks::MergeSummary;
use crate::sqlite::{
    initialize_schema, open_configured, open_flags, PersistenceError, PersistenceResult,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedRecord {
    pub video_id: i64,
    pub processed_at: DateTime<Utc>,
    pub chunk_count: Option<i64>,
    pub merged_bytes: Option<i64>,
    pub artifact_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyProcessed,
    HeldElsewhere {
        owner: String,
        claimed_at: DateTime<Utc>,
    },
}

/// Storage consulted before a conversion and written after one succeeds.
///
/// `is_processed` and `mark_processed` alone leave a window in which two
/// workers can convert the same upload; `try_claim` closes it.
pub trait IdempotencyStore: Send + Sync {
    fn is_processed(&self, video_id: i64) -> PersistenceResult<bool>;

    /// Atomically reserves `video_id` for `owner`. A claim older than `lease`
    /// is treated as abandoned and may be taken over.
    fn try_claim(&self, video_id: i64, owner: &str, lease: Duration)
        -> PersistenceResult<ClaimOutcome>;

    fn release_claim(&self, video_id: i64, owner: &str) -> PersistenceResult<()>;

    /// Records a successful conversion. Repeated calls keep the first record.
    fn mark_processed(
        &self,
        video_id: i64,
        summary: Option<&MergeSummary>,
    ) -> PersistenceResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteIdempotencyStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteIdempotencyStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteIdempotencyStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> PersistenceResult<SqliteIdempotencyStore> {
        let path = self.path.ok_or(PersistenceError::MissingStore)?;
        Ok(SqliteIdempotencyStore {
            path,
            flags: open_flags(self.read_only, self.create_if_missing),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteIdempotencyStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteIdempotencyStore {
    pub fn builder() -> SqliteIdempotencyStoreBuilder {
        SqliteIdempotencyStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        SqliteIdempotencyStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> PersistenceResult<Connection> {
        open_configured(&self.path, self.flags)
    }

    pub fn initialize(&self) -> PersistenceResult<()> {
        initialize_schema(&self.path, self.flags)
    }

    pub fn record(&self, video_id: i64) -> PersistenceResult<Option<ProcessedRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT video_id, processed_at, chunk_count, merged_bytes, artifact_sha256
                 FROM processed_videos
                 WHERE video_id = ?1 AND processed = 1",
                params![video_id],
                |row| {
                    Ok(ProcessedRecord {
                        video_id: row.get(0)?,
                        processed_at: row.get(1)?,
                        chunk_count: row.get(2)?,
                        merged_bytes: row.get(3)?,
                        artifact_sha256: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl IdempotencyStore for SqliteIdempotencyStore {
    fn is_processed(&self, video_id: i64) -> PersistenceResult<bool> {
        let conn = self.open()?;
        let processed: Option<bool> = conn
            .query_row(
                "SELECT processed FROM processed_videos WHERE video_id = ?1",
                params![video_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(processed.unwrap_or(false))
    }

    fn try_claim(
        &self,
        video_id: i64,
        owner: &str,
        lease: Duration,
    ) -> PersistenceResult<ClaimOutcome> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(bool, Option<String>, Option<DateTime<Utc>>)> = tx
            .query_row(
                "SELECT processed, claim_owner, claimed_at
                 FROM processed_videos WHERE video_id = ?1",
                params![video_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let now = Utc::now();
        let outcome = match current {
            Some((true, _, _)) => ClaimOutcome::AlreadyProcessed,
            Some((false, Some(holder), Some(claimed_at)))
                if holder != owner && claim_is_live(now, claimed_at, lease) =>
            {
                ClaimOutcome::HeldElsewhere {
                    owner: holder,
                    claimed_at,
                }
            }
            _ => {
                tx.execute(
                    "INSERT INTO processed_videos (video_id, processed, claim_owner, claimed_at)
                     VALUES (?1, 0, ?2, ?3)
                     ON CONFLICT(video_id) DO UPDATE SET
                        claim_owner = excluded.claim_owner,
                        claimed_at = excluded.claimed_at",
                    params![video_id, owner, now],
                )?;
                ClaimOutcome::Claimed
            }
        };
        tx.commit()?;
        debug!(video_id, owner, outcome = ?outcome, "claim attempted");
        Ok(outcome)
    }

    fn release_claim(&self, video_id: i64, owner: &str) -> PersistenceResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE processed_videos SET claim_owner = NULL, claimed_at = NULL
             WHERE video_id = ?1 AND claim_owner = ?2 AND processed = 0",
            params![video_id, owner],
        )?;
        Ok(())
    }

    fn mark_processed(
        &self,
        video_id: i64,
        summary: Option<&MergeSummary>,
    ) -> PersistenceResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO processed_videos (
                video_id, processed, processed_at, chunk_count, merged_bytes, artifact_sha256,
                claim_owner, claimed_at
             ) VALUES (?1, 1, ?2, ?3, ?4, ?5, NULL, NULL)
             ON CONFLICT(video_id) DO UPDATE SET
                processed = 1,
                processed_at = excluded.processed_at,
                chunk_count = excluded.chunk_count,
                merged_bytes = excluded.merged_bytes,
                artifact_sha256 = excluded.artifact_sha256,
                claim_owner = NULL,
                claimed_at = NULL
             WHERE processed_videos.processed = 0",
            params![
                video_id,
                Utc::now(),
                summary.map(|s| s.chunk_count as i64),
                summary.map(|s| s.bytes_written as i64),
                summary.map(|s| s.sha256.as_str()),
            ],
        )?;
        Ok(())
    }
}

fn claim_is_live(now: DateTime<Utc>, claimed_at: DateTime<Utc>, lease: Duration) -> bool {
    match (now - claimed_at).to_std() {
        Ok(age) => age < lease,
        // Claimed "in the future" by a skewed clock; respect it.
        Err(_) => true,
    }
}
