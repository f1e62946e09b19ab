//! Boundary to the message transport that delivers conversion tasks.
//!
//! The transport is expected to redeliver anything it hands out until the
//! delivery is acknowledged or requeued. [`SpoolDirectorySource`] is a
//! filesystem-backed transport for single-host deployments and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("spool io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type TransportResult<T> = Result<T, TransportError>;

#[async_trait]
pub trait Delivery: Send + Sync {
    /// Stable across redeliveries of the same message.
    fn id(&self) -> &str;
    fn payload(&self) -> &[u8];
    async fn ack(self: Box<Self>) -> TransportResult<()>;
    async fn requeue(self: Box<Self>) -> TransportResult<()>;
}

#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Next pending delivery, or `None` when nothing is waiting right now.
    async fn next_delivery(&self) -> TransportResult<Option<Box<dyn Delivery>>>;
}

const INBOX: &str = "inbox";
const PROCESSING: &str = "processing";
const DONE: &str = "done";
const MESSAGE_EXTENSION: &str = "json";

/// Messages are JSON files. A file moves `inbox/` -> `processing/` when
/// handed out, then to `done/` on ack or back to the end of `inbox/` on
/// requeue. Renames keep each hand-out exclusive between workers.
#[derive(Debug, Clone)]
pub struct SpoolDirectorySource {
    root: PathBuf,
}

impl SpoolDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inbox(&self) -> PathBuf {
        self.root.join(INBOX)
    }

    pub fn processing(&self) -> PathBuf {
        self.root.join(PROCESSING)
    }

    pub fn done(&self) -> PathBuf {
        self.root.join(DONE)
    }

    pub async fn initialize(&self) -> TransportResult<()> {
        for dir in [self.inbox(), self.processing(), self.done()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| TransportError::Io { source, path: dir })?;
        }
        Ok(())
    }

    /// Drops a message into the inbox. Returns its delivery id.
    pub async fn enqueue(&self, payload: &[u8]) -> TransportResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        let target = self.inbox().join(message_file_name(&id));
        let staging = target.with_extension("tmp");
        fs::write(&staging, payload)
            .await
            .map_err(|source| TransportError::Io {
                source,
                path: staging.clone(),
            })?;
        rename(&staging, &target).await?;
        debug!(id = %id, "enqueued task");
        Ok(id)
    }

    /// Returns messages stranded in `processing/` by a crashed worker to the
    /// inbox. Only safe while no worker is using this spool.
    pub async fn recover(&self) -> TransportResult<usize> {
        let stranded = list_messages(&self.processing()).await?;
        for path in &stranded {
            let Some(id) = delivery_id(path) else { continue };
            rename(path, &self.inbox().join(message_file_name(id))).await?;
        }
        if !stranded.is_empty() {
            info!(count = stranded.len(), "recovered stranded tasks");
        }
        Ok(stranded.len())
    }

    pub async fn pending(&self) -> TransportResult<usize> {
        Ok(list_messages(&self.inbox()).await?.len())
    }
}

#[async_trait]
impl TaskSource for SpoolDirectorySource {
    async fn next_delivery(&self) -> TransportResult<Option<Box<dyn Delivery>>> {
        for path in list_messages(&self.inbox()).await? {
            let Some(file_name) = path.file_name() else { continue };
            let Some(id) = delivery_id(&path).map(str::to_string) else {
                continue;
            };
            let claimed = self.processing().join(file_name);
            match fs::rename(&path, &claimed).await {
                Ok(()) => {}
                // Taken by another worker between listing and rename.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(TransportError::Io { source, path }),
            }
            let payload = fs::read(&claimed)
                .await
                .map_err(|source| TransportError::Io {
                    source,
                    path: claimed.clone(),
                })?;
            return Ok(Some(Box::new(SpoolDelivery {
                id,
                payload,
                path: claimed,
                spool: self.clone(),
            })));
        }
        Ok(None)
    }
}

struct SpoolDelivery {
    id: String,
    payload: Vec<u8>,
    path: PathBuf,
    spool: SpoolDirectorySource,
}

#[async_trait]
impl Delivery for SpoolDelivery {
    fn id(&self) -> &str {
        &self.id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self: Box<Self>) -> TransportResult<()> {
        let target = self.spool.done().join(message_file_name(&self.id));
        rename(&self.path, &target).await
    }

    async fn requeue(self: Box<Self>) -> TransportResult<()> {
        let target = self.spool.inbox().join(message_file_name(&self.id));
        warn!(id = %self.id, "requeueing task");
        rename(&self.path, &target).await
    }
}

/// `<timestamp>-<id>.json`; the timestamp prefix keeps the inbox FIFO.
fn message_file_name(id: &str) -> String {
    format!(
        "{}-{id}.{MESSAGE_EXTENSION}",
        Utc::now().format("%Y%m%dT%H%M%S%6f")
    )
}

fn delivery_id(path: &Path) -> Option<&str> {
    let stem = path.file_stem()?.to_str()?;
    stem.split_once('-').map(|(_, id)| id)
}

async fn list_messages(dir: &Path) -> TransportResult<Vec<PathBuf>> {
    let io_error = |source| TransportError::Io {
        source,
        path: dir.to_path_buf(),
    };
    let mut entries = fs::read_dir(dir).await.map_err(io_error)?;
    let mut messages = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(MESSAGE_EXTENSION) {
            messages.push(path);
        }
    }
    messages.sort();
    Ok(messages)
}

async fn rename(from: &Path, to: &Path) -> TransportResult<()> {
    fs::rename(from, to)
        .await
        .map_err(|source| TransportError::Io {
            source,
            path: from.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spool() -> (tempfile::TempDir, SpoolDirectorySource) {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolDirectorySource::new(dir.path().join("spool"));
        spool.initialize().await.unwrap();
        (dir, spool)
    }

    #[tokio::test]
    async fn deliveries_are_fifo_and_exclusive() {
        let (_dir, spool) = spool().await;
        let first = spool.enqueue(br#"{"video_id":1}"#).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = spool.enqueue(br#"{"video_id":2}"#).await.unwrap();

        let a = spool.next_delivery().await.unwrap().expect("first delivery");
        let b = spool.next_delivery().await.unwrap().expect("second delivery");
        assert_eq!(a.id(), first);
        assert_eq!(b.id(), second);
        assert_eq!(a.payload(), br#"{"video_id":1}"#);
        assert!(spool.next_delivery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_moves_to_done_and_requeue_returns_to_inbox() {
        let (_dir, spool) = spool().await;
        let id = spool.enqueue(b"{}").await.unwrap();

        let delivery = spool.next_delivery().await.unwrap().unwrap();
        delivery.requeue().await.unwrap();
        assert_eq!(spool.pending().await.unwrap(), 1);

        let delivery = spool.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.id(), id);
        delivery.ack().await.unwrap();
        assert_eq!(spool.pending().await.unwrap(), 0);
        assert_eq!(list_messages(&spool.done()).await.unwrap().len(), 1);
        assert!(list_messages(&spool.processing()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_returns_stranded_messages() {
        let (_dir, spool) = spool().await;
        spool.enqueue(b"{}").await.unwrap();
        let stranded = spool.next_delivery().await.unwrap().unwrap();
        drop(stranded);

        assert_eq!(spool.recover().await.unwrap(), 1);
        assert_eq!(spool.pending().await.unwrap(), 1);
    }

    #[test]
    fn delivery_id_strips_timestamp() {
        assert_eq!(
            delivery_id(Path::new("/s/inbox/20240101T000000000000-abc.json")),
            Some("abc")
        );
        assert_eq!(delivery_id(Path::new("/s/inbox/plain.json")), None);
    }
}
