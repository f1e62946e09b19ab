//! End-to-end processing of one conversion task.
//!
//! Stages run strictly in order: idempotency check, optional claim, chunk
//! merge, transcode, completion record. Any failure is reported through the
//! [`ErrorReporter`] and ends the task; nothing is retried here. Whether the
//! transport redelivers a failed task is decided by [`AckPolicy`].

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunks::{ChunkLocator, MergeError, MergeSummary, Reassembler};
use crate::config::{AckPolicy, ConverterConfig, LayoutSection, WorkerSection};
use crate::report::{ErrorRecord, ErrorReporter};
use crate::sqlite::PersistenceError;
use crate::task::{ParseError, UploadTask};
use crate::tracker::{ClaimOutcome, IdempotencyStore};
use crate::transcode::{CleanupWarning, TranscodeEngine, TranscodeError, Transcoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Parse,
    CheckIdempotency,
    Claim,
    Merge,
    Transcode,
    MarkProcessed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Parse => "parse",
            PipelineStage::CheckIdempotency => "check_idempotency",
            PipelineStage::Claim => "claim",
            PipelineStage::Merge => "merge",
            PipelineStage::Transcode => "transcode",
            PipelineStage::MarkProcessed => "mark_processed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to look up processing state: {0}")]
    Lookup(PersistenceError),
    #[error("failed to claim upload: {0}")]
    Claim(PersistenceError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error("failed to mark video as processed: {0}")]
    MarkProcessed(PersistenceError),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::Parse(_) => PipelineStage::Parse,
            PipelineError::Lookup(_) => PipelineStage::CheckIdempotency,
            PipelineError::Claim(_) => PipelineStage::Claim,
            PipelineError::Merge(_) => PipelineStage::Merge,
            PipelineError::Transcode(_) => PipelineStage::Transcode,
            PipelineError::MarkProcessed(_) => PipelineStage::MarkProcessed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Transcode(TranscodeError::Cancelled))
    }

    fn summary(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) => "failed to decode task payload",
            PipelineError::Lookup(_) => "failed to check whether video was processed",
            PipelineError::Claim(_) => "failed to claim video for processing",
            PipelineError::Merge(MergeError::Discovery { .. }) => "failed to discover chunks",
            PipelineError::Merge(_) => "failed to merge chunks",
            PipelineError::Transcode(_) => "error during video conversion",
            PipelineError::MarkProcessed(_) => "failed to mark video as processed",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// What the transport should do with the delivery that carried a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Ack,
    Requeue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        video_id: i64,
        merge: MergeSummary,
        output_dir: PathBuf,
        cleanup: Option<CleanupWarning>,
    },
    AlreadyProcessed {
        video_id: i64,
    },
    ClaimedElsewhere {
        video_id: i64,
        owner: String,
    },
    Cancelled {
        video_id: i64,
    },
    Failed {
        video_id: Option<i64>,
        stage: PipelineStage,
        record: ErrorRecord,
    },
}

impl TaskOutcome {
    pub fn video_id(&self) -> Option<i64> {
        match self {
            TaskOutcome::Completed { video_id, .. }
            | TaskOutcome::AlreadyProcessed { video_id }
            | TaskOutcome::ClaimedElsewhere { video_id, .. }
            | TaskOutcome::Cancelled { video_id } => Some(*video_id),
            TaskOutcome::Failed { video_id, .. } => *video_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Completed { .. } | TaskOutcome::AlreadyProcessed { .. }
        )
    }

    /// Undecodable payloads are always acknowledged; redelivering them cannot
    /// succeed. Cancelled work and uploads claimed by another worker are
    /// always handed back: the claim may belong to a worker that died.
    pub fn disposition(&self, policy: AckPolicy) -> Disposition {
        match self {
            TaskOutcome::Cancelled { .. } | TaskOutcome::ClaimedElsewhere { .. } => {
                Disposition::Requeue
            }
            TaskOutcome::Failed {
                stage: PipelineStage::Parse,
                ..
            } => Disposition::Ack,
            TaskOutcome::Failed { .. } if policy == AckPolicy::RequeueOnFailure => {
                Disposition::Requeue
            }
            _ => Disposition::Ack,
        }
    }
}

/// Everything a handler needs to know about the deployment, passed in at
/// construction.
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub chunk_root: PathBuf,
    pub layout: LayoutSection,
    pub claim_uploads: bool,
    pub claim_lease: Duration,
    /// Owner written into claims.
    pub worker_id: String,
}

impl HandlerSettings {
    pub fn new(chunk_root: impl Into<PathBuf>) -> Self {
        Self {
            chunk_root: chunk_root.into(),
            layout: LayoutSection::default(),
            claim_uploads: false,
            claim_lease: Duration::from_secs(6 * 60 * 60),
            worker_id: WorkerSection::default().worker_id(),
        }
    }

    pub fn from_config(config: &ConverterConfig) -> Self {
        Self {
            chunk_root: config.chunk_root(),
            layout: config.layout.clone(),
            claim_uploads: config.worker.claim_uploads,
            claim_lease: config.worker.claim_lease(),
            worker_id: config.worker.worker_id(),
        }
    }

    pub fn with_claims(mut self, enabled: bool, lease: Duration) -> Self {
        self.claim_uploads = enabled;
        self.claim_lease = lease;
        self
    }

    pub fn upload_dir(&self, video_id: i64) -> PathBuf {
        self.chunk_root.join(video_id.to_string())
    }

    pub fn merged_path(&self, video_id: i64) -> PathBuf {
        self.upload_dir(video_id).join(&self.layout.merged_file_name)
    }

    pub fn output_dir(&self, video_id: i64) -> PathBuf {
        self.upload_dir(video_id).join(&self.layout.output_dir_name)
    }
}

pub struct TaskHandler {
    settings: HandlerSettings,
    locator: ChunkLocator,
    reassembler: Reassembler,
    transcoder: Transcoder,
    tracker: Arc<dyn IdempotencyStore>,
    reporter: ErrorReporter,
    /// Uploads this handler is working on. The durable claim cannot tell
    /// two tasks of the same worker apart.
    in_flight: Mutex<HashSet<i64>>,
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandler")
            .field("settings", &self.settings)
            .finish()
    }
}

impl TaskHandler {
    pub fn new(
        settings: HandlerSettings,
        tracker: Arc<dyn IdempotencyStore>,
        engine: Arc<dyn TranscodeEngine>,
        reporter: ErrorReporter,
    ) -> Result<Self, MergeError> {
        let locator = ChunkLocator::new(&settings.layout.chunk_extension)?;
        Ok(Self {
            settings,
            locator,
            reassembler: Reassembler::new(),
            transcoder: Transcoder::new(engine),
            tracker,
            reporter,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.settings.worker_id = worker_id.into();
        self
    }

    pub fn settings(&self) -> &HandlerSettings {
        &self.settings
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Decodes a transport payload and processes it. A payload that does not
    /// decode is reported without an identifier and goes no further.
    pub async fn handle_payload(&self, payload: &[u8], cancel: &CancellationToken) -> TaskOutcome {
        match UploadTask::parse(payload) {
            Ok(task) => self.handle_task(&task, cancel).await,
            Err(err) => self.fail(None, PipelineError::Parse(err)),
        }
    }

    pub async fn handle_task(&self, task: &UploadTask, cancel: &CancellationToken) -> TaskOutcome {
        let video_id = task.video_id;

        debug!(video_id, stage = %PipelineStage::CheckIdempotency, "entering stage");
        match self.tracker.is_processed(video_id) {
            Ok(true) => {
                warn!(video_id, "video already processed");
                return TaskOutcome::AlreadyProcessed { video_id };
            }
            Ok(false) => {}
            Err(err) => return self.fail(Some(video_id), PipelineError::Lookup(err)),
        }

        let _in_flight = if self.settings.claim_uploads {
            match InFlight::enter(&self.in_flight, video_id) {
                Some(guard) => Some(guard),
                None => {
                    info!(video_id, "video is already being processed by this worker");
                    return TaskOutcome::ClaimedElsewhere {
                        video_id,
                        owner: self.settings.worker_id.clone(),
                    };
                }
            }
        } else {
            None
        };

        if self.settings.claim_uploads {
            debug!(video_id, stage = %PipelineStage::Claim, "entering stage");
            match self
                .tracker
                .try_claim(video_id, &self.settings.worker_id, self.settings.claim_lease)
            {
                Ok(ClaimOutcome::Claimed) => {}
                Ok(ClaimOutcome::AlreadyProcessed) => {
                    warn!(video_id, "video already processed");
                    return TaskOutcome::AlreadyProcessed { video_id };
                }
                Ok(ClaimOutcome::HeldElsewhere { owner, claimed_at }) => {
                    info!(video_id, owner = %owner, claimed_at = %claimed_at, "video is being processed by another worker");
                    return TaskOutcome::ClaimedElsewhere { video_id, owner };
                }
                Err(err) => return self.fail(Some(video_id), PipelineError::Claim(err)),
            }
        }

        match self.run_stages(video_id, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if self.settings.claim_uploads {
                    self.release_claim(video_id);
                }
                if err.is_cancelled() {
                    warn!(video_id, "video conversion cancelled");
                    TaskOutcome::Cancelled { video_id }
                } else {
                    self.fail(Some(video_id), err)
                }
            }
        }
    }

    async fn run_stages(&self, video_id: i64, cancel: &CancellationToken) -> PipelineResult<TaskOutcome> {
        let upload_dir = self.settings.upload_dir(video_id);
        let merged = self.settings.merged_path(video_id);
        let output_dir = self.settings.output_dir(video_id);

        debug!(video_id, stage = %PipelineStage::Merge, "entering stage");
        info!(video_id, path = %upload_dir.display(), "merging chunks");
        let chunks = self.locator.locate(&upload_dir).await?;
        let merge = self.reassembler.merge(&chunks, &merged).await?;

        debug!(video_id, stage = %PipelineStage::Transcode, "entering stage");
        let transcoded = self
            .transcoder
            .transcode(&merged, &output_dir, cancel)
            .await?;
        info!(video_id, "video conversion processed");

        debug!(video_id, stage = %PipelineStage::MarkProcessed, "entering stage");
        self.tracker
            .mark_processed(video_id, Some(&merge))
            .map_err(PipelineError::MarkProcessed)?;
        info!(video_id, "video marked as processed");

        Ok(TaskOutcome::Completed {
            video_id,
            merge,
            output_dir: transcoded.output_dir,
            cleanup: transcoded.cleanup,
        })
    }

    fn release_claim(&self, video_id: i64) {
        if let Err(err) = self.tracker.release_claim(video_id, &self.settings.worker_id) {
            warn!(video_id, error = %err, "failed to release claim");
        }
    }

    fn fail(&self, video_id: Option<i64>, error: PipelineError) -> TaskOutcome {
        let stage = error.stage();
        let record = self
            .reporter
            .report(video_id, stage.as_str(), error.summary(), &error);
        TaskOutcome::Failed {
            video_id,
            stage,
            record,
        }
    }
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    video_id: i64,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<i64>>, video_id: i64) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(video_id);
        inserted.then_some(Self { set, video_id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.video_id);
    }
}
