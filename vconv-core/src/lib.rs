pub mod chunks;
pub mod config;
pub mod error;
pub mod handler;
pub mod report;
pub mod sqlite;
pub mod task;
pub mod tracker;
pub mod transcode;
pub mod transport;
pub mod worker;

pub use chunks::{ChunkLocator, ChunkRef, MergeError, MergeResult, MergeSummary, Reassembler};
pub use config::{
    load_converter_config, AckPolicy, ConverterConfig, LayoutSection, PathsSection,
    TranscodeSection, TransportSection, WorkerSection,
};
pub use error::{ConfigError, Result};
pub use handler::{
    Disposition, HandlerSettings, PipelineError, PipelineResult, PipelineStage, TaskHandler,
    TaskOutcome,
};
pub use report::{ErrorRecord, ErrorReporter, SqliteErrorStore};
pub use sqlite::{PersistenceError, PersistenceResult};
pub use task::{ParseError, UploadTask};
pub use tracker::{
    ClaimOutcome, IdempotencyStore, ProcessedRecord, SqliteIdempotencyStore,
    SqliteIdempotencyStoreBuilder,
};
pub use transcode::{
    CleanupWarning, EngineError, FfmpegEngine, TranscodeEngine, TranscodeError, TranscodeOutcome,
    TranscodeResult, Transcoder,
};
pub use transport::{Delivery, SpoolDirectorySource, TaskSource, TransportError, TransportResult};
pub use worker::{PoolReport, WorkerPool};
