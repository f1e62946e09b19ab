#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vconv_core::{
    ClaimOutcome, EngineError, ErrorReporter, HandlerSettings, IdempotencyStore, MergeSummary,
    PersistenceError, PersistenceResult, SqliteErrorStore, SqliteIdempotencyStore, TaskHandler,
    TranscodeEngine,
};

pub enum Script {
    Succeed,
    SucceedAfter(Duration),
    Fail(&'static str),
    WaitForCancel,
}

/// Stands in for ffmpeg: writes a manifest and one segment, or fails.
pub struct ScriptedEngine {
    script: Script,
    pub calls: AtomicUsize,
    pub inputs: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<Vec<u8>> {
        self.inputs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TranscodeEngine for ScriptedEngine {
    async fn invoke(
        &self,
        input: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = std::fs::read(input).map_err(|source| EngineError::Spawn {
            program: "scripted".into(),
            source,
        })?;
        self.inputs.lock().unwrap().push(bytes);
        match self.script {
            Script::Succeed => Ok(write_package(output_dir)),
            Script::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(write_package(output_dir))
            }
            Script::Fail(diagnostics) => Err(EngineError::Failed {
                program: "scripted".into(),
                exit_detail: "exit status: 1".into(),
                diagnostics: diagnostics.into(),
            }),
            Script::WaitForCancel => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(EngineError::Cancelled { program: "scripted".into() }),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(String::new()),
                }
            }
        }
    }
}

fn write_package(output_dir: &Path) -> String {
    std::fs::write(output_dir.join("output.mpd"), "<MPD/>").unwrap();
    std::fs::write(output_dir.join("chunk-stream0-00001.m4s"), b"seg").unwrap();
    "Output #0, dash, to 'output.mpd'".into()
}

/// Wraps the SQLite store and fails selected operations.
pub struct FaultyStore {
    pub inner: SqliteIdempotencyStore,
    pub fail_lookup: bool,
    pub fail_mark: bool,
}

fn injected() -> PersistenceError {
    PersistenceError::Io {
        source: std::io::Error::new(std::io::ErrorKind::Other, "injected fault"),
        path: PathBuf::from("converter.sqlite"),
    }
}

impl IdempotencyStore for FaultyStore {
    fn is_processed(&self, video_id: i64) -> PersistenceResult<bool> {
        if self.fail_lookup {
            return Err(injected());
        }
        self.inner.is_processed(video_id)
    }

    fn try_claim(
        &self,
        video_id: i64,
        owner: &str,
        lease: Duration,
    ) -> PersistenceResult<ClaimOutcome> {
        self.inner.try_claim(video_id, owner, lease)
    }

    fn release_claim(&self, video_id: i64, owner: &str) -> PersistenceResult<()> {
        self.inner.release_claim(video_id, owner)
    }

    fn mark_processed(
        &self,
        video_id: i64,
        summary: Option<&MergeSummary>,
    ) -> PersistenceResult<()> {
        if self.fail_mark {
            return Err(injected());
        }
        self.inner.mark_processed(video_id, summary)
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub chunk_root: PathBuf,
    pub store: SqliteIdempotencyStore,
    pub errors: SqliteErrorStore,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let chunk_root = dir.path().join("upload");
        std::fs::create_dir_all(&chunk_root).unwrap();
        let db = dir.path().join("data").join("converter.sqlite");
        let store = SqliteIdempotencyStore::new(&db).unwrap();
        store.initialize().unwrap();
        let errors = SqliteErrorStore::new(&db);
        Self {
            dir,
            chunk_root,
            store,
            errors,
        }
    }

    pub fn upload_dir(&self, video_id: i64) -> PathBuf {
        self.chunk_root.join(video_id.to_string())
    }

    pub fn write_chunks(&self, video_id: i64, chunks: &[(&str, &[u8])]) -> PathBuf {
        let dir = self.upload_dir(video_id);
        std::fs::create_dir_all(&dir).unwrap();
        for (name, bytes) in chunks {
            std::fs::write(dir.join(name), bytes).unwrap();
        }
        dir
    }

    pub fn settings(&self) -> HandlerSettings {
        HandlerSettings::new(&self.chunk_root).with_claims(true, Duration::from_secs(3600))
    }

    pub fn handler(&self, engine: Arc<ScriptedEngine>) -> TaskHandler {
        self.handler_with_store(engine, Arc::new(self.store.clone()))
    }

    pub fn handler_with_store(
        &self,
        engine: Arc<ScriptedEngine>,
        store: Arc<dyn IdempotencyStore>,
    ) -> TaskHandler {
        TaskHandler::new(
            self.settings(),
            store,
            engine,
            ErrorReporter::new(self.errors.clone()),
        )
        .unwrap()
    }
}
