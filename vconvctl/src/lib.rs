use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vconv_core::{
    load_converter_config, ChunkLocator, ConverterConfig, ErrorRecord, ErrorReporter,
    FfmpegEngine, HandlerSettings, MergeSummary, PoolReport, ProcessedRecord, Reassembler,
    SpoolDirectorySource, SqliteErrorStore, SqliteIdempotencyStore, TaskHandler, TaskOutcome,
    UploadTask, WorkerPool,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vconv_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] vconv_core::PersistenceError),
    #[error("merge error: {0}")]
    Merge(#[from] vconv_core::MergeError),
    #[error("transport error: {0}")]
    Transport(#[from] vconv_core::TransportError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("task failed at stage {stage}: {message}")]
    TaskFailed { stage: String, message: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Video chunk converter control interface", long_about = None)]
pub struct Cli {
    /// Caminho do converter.toml
    #[arg(long, default_value = "configs/converter.toml")]
    pub config: PathBuf,
    /// Formato de saída
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Nível de log quando RUST_LOG não está definido
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Cria o banco de dados, o spool e o diretório de uploads
    Init,
    /// Concatena os chunks de um diretório em um único arquivo
    Merge(MergeArgs),
    /// Processa uma única tarefa a partir de um payload JSON
    Handle(HandleArgs),
    /// Coloca uma tarefa de conversão no spool
    Enqueue(EnqueueArgs),
    /// Consome tarefas do spool
    Run(RunArgs),
    /// Exibe o estado de processamento de um vídeo
    Status(StatusArgs),
    /// Lista erros de processamento registrados
    Errors(ErrorsArgs),
    /// Gera scripts de autocompletar para o shell
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Diretório contendo os chunks
    pub dir: PathBuf,
    /// Arquivo de saída
    pub output: PathBuf,
    /// Extensão dos chunks (substitui layout.chunk_extension)
    #[arg(long)]
    pub extension: Option<String>,
}

#[derive(Args, Debug)]
pub struct HandleArgs {
    /// Arquivo com o payload da tarefa, ou "-" para stdin
    #[arg(long)]
    pub payload: String,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Identificador do vídeo
    pub video_id: i64,
    /// Caminho informativo do upload
    #[arg(long, default_value = "")]
    pub path: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Processa o que estiver no spool e encerra
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Substitui worker.concurrency
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Identificador do vídeo
    pub video_id: i64,
}

#[derive(Args, Debug)]
pub struct ErrorsArgs {
    /// Filtrar por vídeo
    #[arg(long)]
    pub video_id: Option<i64>,
    /// Limite de registros
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell alvo
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Logs go to stderr so that `--format json` output stays parseable.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(args.shell, &mut command, name, &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Init => {
            let report = runtime.block_on(context.init())?;
            render(&report, cli.format)?;
        }
        Commands::Merge(args) => {
            let report = runtime.block_on(context.merge(args))?;
            render(&report, cli.format)?;
        }
        Commands::Handle(args) => {
            let payload = read_payload(&args.payload)?;
            let outcome = runtime.block_on(context.handle(&payload))?;
            render(&outcome, cli.format)?;
            if let TaskOutcome::Failed { stage, record, .. } = outcome.0 {
                return Err(AppError::TaskFailed {
                    stage: stage.to_string(),
                    message: record.error_message,
                });
            }
        }
        Commands::Enqueue(args) => {
            let report = runtime.block_on(context.enqueue(args))?;
            render(&report, cli.format)?;
        }
        Commands::Run(args) => {
            let report = runtime.block_on(context.run_pool(args))?;
            render(&report, cli.format)?;
        }
        Commands::Status(args) => {
            let status = context.status(args.video_id)?;
            render(&status, cli.format)?;
        }
        Commands::Errors(args) => {
            let list = context.errors(args)?;
            render(&list, cli.format)?;
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn read_payload(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut buffer = Vec::new();
        std::io::stdin().read_to_end(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(std::fs::read(source)?)
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// Cancels the returned token on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping");
            trigger.cancel();
        }
    });
    token
}

#[derive(Debug)]
struct AppContext {
    config: ConverterConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_converter_config(&cli.config)?;
        Ok(Self { config })
    }

    fn tracker(&self) -> Result<SqliteIdempotencyStore> {
        Ok(SqliteIdempotencyStore::new(self.config.database_path())?)
    }

    fn spool(&self) -> SpoolDirectorySource {
        SpoolDirectorySource::new(self.config.spool_dir())
    }

    fn handler(&self) -> Result<TaskHandler> {
        let tracker = self.tracker()?;
        tracker.initialize()?;
        let reporter = ErrorReporter::new(SqliteErrorStore::new(self.config.database_path()))
            .with_journal(self.config.error_journal_path());
        let engine = FfmpegEngine::from_config(&self.config.transcode, &self.config.layout);
        Ok(TaskHandler::new(
            HandlerSettings::from_config(&self.config),
            Arc::new(tracker),
            Arc::new(engine),
            reporter,
        )?)
    }

    async fn init(&self) -> Result<InitReport> {
        let database = self.config.database_path();
        self.tracker()?.initialize()?;
        let spool = self.spool();
        spool.initialize().await?;
        let chunk_root = self.config.chunk_root();
        tokio::fs::create_dir_all(&chunk_root).await?;
        info!(database = %database.display(), "converter initialized");
        Ok(InitReport {
            database,
            spool: spool.root().to_path_buf(),
            chunk_root,
        })
    }

    async fn merge(&self, args: &MergeArgs) -> Result<MergeReport> {
        let extension = args
            .extension
            .as_deref()
            .unwrap_or(&self.config.layout.chunk_extension);
        let locator = ChunkLocator::new(extension)?;
        let chunks = locator.locate(&args.dir).await?;
        let summary = Reassembler::new().merge(&chunks, &args.output).await?;
        Ok(MergeReport {
            output: args.output.clone(),
            chunks: chunks.into_iter().map(|chunk| chunk.path).collect(),
            summary,
        })
    }

    async fn handle(&self, payload: &[u8]) -> Result<HandleReport> {
        let handler = self.handler()?;
        let cancel = shutdown_on_ctrl_c();
        Ok(HandleReport(handler.handle_payload(payload, &cancel).await))
    }

    async fn enqueue(&self, args: &EnqueueArgs) -> Result<EnqueueReport> {
        let spool = self.spool();
        spool.initialize().await?;
        let task = UploadTask::new(args.video_id, args.path.clone());
        let id = spool.enqueue(&task.to_payload()).await?;
        Ok(EnqueueReport {
            id,
            video_id: args.video_id,
        })
    }

    async fn run_pool(&self, args: &RunArgs) -> Result<PoolReport> {
        let handler = Arc::new(self.handler()?);
        let spool = self.spool();
        spool.initialize().await?;
        spool.recover().await?;

        let mut pool = WorkerPool::from_config(&self.config, handler, Arc::new(spool));
        if let Some(concurrency) = args.concurrency {
            pool = pool.with_concurrency(concurrency);
        }
        let shutdown = shutdown_on_ctrl_c();
        let report = if args.once {
            pool.run_until_idle(shutdown).await
        } else {
            pool.run(shutdown).await
        };
        Ok(report)
    }

    fn status(&self, video_id: i64) -> Result<VideoStatus> {
        let database = self.config.database_path();
        let tracker = SqliteIdempotencyStore::builder()
            .path(&database)
            .read_only(true)
            .create_if_missing(false)
            .build()?;
        let record = tracker.record(video_id)?;
        let recent_errors = SqliteErrorStore::read_only(&database).list_for_video(video_id, 5)?;
        Ok(VideoStatus {
            video_id,
            processed: record.is_some(),
            record,
            recent_errors,
        })
    }

    fn errors(&self, args: &ErrorsArgs) -> Result<ErrorList> {
        let store = SqliteErrorStore::read_only(self.config.database_path());
        let rows = match args.video_id {
            Some(video_id) => store.list_for_video(video_id, args.limit)?,
            None => store.list_recent(args.limit)?,
        };
        Ok(ErrorList { rows })
    }
}

#[derive(Debug, Serialize)]
pub struct InitReport {
    pub database: PathBuf,
    pub spool: PathBuf,
    pub chunk_root: PathBuf,
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        [
            format!("Banco: {}", self.database.display()),
            format!("Spool: {}", self.spool.display()),
            format!("Uploads: {}", self.chunk_root.display()),
        ]
        .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub chunks: Vec<PathBuf>,
    #[serde(flatten)]
    pub summary: MergeSummary,
}

impl DisplayFallback for MergeReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} chunks -> {} ({} bytes, sha256={})",
            self.summary.chunk_count,
            self.output.display(),
            self.summary.bytes_written,
            self.summary.sha256
        )];
        for chunk in &self.chunks {
            lines.push(format!("  - {}", file_label(chunk)));
        }
        lines.join("\n")
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct HandleReport(pub TaskOutcome);

impl DisplayFallback for HandleReport {
    fn display(&self) -> String {
        match &self.0 {
            TaskOutcome::Completed {
                video_id,
                merge,
                output_dir,
                cleanup,
            } => {
                let mut line = format!(
                    "Vídeo {video_id} convertido: {} chunks, {} bytes -> {}",
                    merge.chunk_count,
                    merge.bytes_written,
                    output_dir.display()
                );
                if let Some(warning) = cleanup {
                    line.push_str(&format!(
                        "\nAviso: {} não removido: {}",
                        warning.path.display(),
                        warning.message
                    ));
                }
                line
            }
            TaskOutcome::AlreadyProcessed { video_id } => {
                format!("Vídeo {video_id} já processado")
            }
            TaskOutcome::ClaimedElsewhere { video_id, owner } => {
                format!("Vídeo {video_id} em processamento por {owner}")
            }
            TaskOutcome::Cancelled { video_id } => format!("Vídeo {video_id}: cancelado"),
            TaskOutcome::Failed { record, .. } => format_error(record),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnqueueReport {
    pub id: String,
    pub video_id: i64,
}

impl DisplayFallback for EnqueueReport {
    fn display(&self) -> String {
        format!("Tarefa {} enfileirada para o vídeo {}", self.id, self.video_id)
    }
}

impl DisplayFallback for PoolReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("Tarefas tratadas: {}", self.handled())];
        let counts = [
            ("concluídas", self.completed),
            ("já processadas", self.already_processed),
            ("em outro worker", self.claimed_elsewhere),
            ("canceladas", self.cancelled),
            ("falhas", self.failed),
            ("devolvidas", self.requeued),
            ("erros de transporte", self.transport_errors),
            ("panics", self.panicked),
        ];
        for (label, count) in counts.iter().filter(|(_, count)| *count > 0) {
            lines.push(format!("  - {label}: {count}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct VideoStatus {
    pub video_id: i64,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ProcessedRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_errors: Vec<ErrorRecord>,
}

impl DisplayFallback for VideoStatus {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        match &self.record {
            Some(record) => {
                let chunks = record
                    .chunk_count
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let bytes = record
                    .merged_bytes
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                lines.push(format!(
                    "Vídeo {} processado em {} (chunks={chunks}, bytes={bytes})",
                    self.video_id,
                    record.processed_at.to_rfc3339()
                ));
            }
            None => lines.push(format!("Vídeo {} não processado", self.video_id)),
        }
        if !self.recent_errors.is_empty() {
            lines.push("Erros recentes:".to_string());
            for record in &self.recent_errors {
                lines.push(format!("  {}", format_error(record)));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorList {
    pub rows: Vec<ErrorRecord>,
}

impl DisplayFallback for ErrorList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Nenhum erro registrado".to_string();
        }
        self.rows
            .iter()
            .map(format_error)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn format_error(record: &ErrorRecord) -> String {
    let subject = record
        .video_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{} | video={} | stage={} | {}: {}",
        record.timestamp.to_rfc3339(),
        subject,
        record.stage,
        record.error_message,
        record.cause_detail
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new()?;
        let config_path = temp.path().join("converter.toml");
        fs::write(
            &config_path,
            r#"
[paths]
chunk_root = "upload"
data_dir = "data"
logs_dir = "logs"

[transcode]
program = "/nonexistent/ffmpeg"

[worker]
concurrency = 1
"#,
        )?;
        let cli = Cli {
            config: config_path,
            format: OutputFormat::Json,
            log_level: "warn".into(),
            command: Commands::Init,
        };
        let context = AppContext::new(&cli)?;
        Ok((temp, context))
    }

    #[tokio::test]
    async fn init_creates_storage_and_spool() {
        let (temp, context) = prepare_test_context().unwrap();
        let report = context.init().await.unwrap();
        assert!(report.database.exists());
        assert!(temp.path().join("spool").join("inbox").is_dir());
        assert!(temp.path().join("upload").is_dir());

        let status = context.status(1).unwrap();
        assert!(!status.processed);
        assert!(context
            .errors(&ErrorsArgs {
                video_id: None,
                limit: 5
            })
            .unwrap()
            .rows
            .is_empty());
    }

    #[tokio::test]
    async fn merge_command_concatenates_in_order() {
        let (temp, context) = prepare_test_context().unwrap();
        let dir = temp.path().join("chunks");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("10.chunk"), "c").unwrap();
        fs::write(dir.join("2.chunk"), "b").unwrap();
        fs::write(dir.join("1.chunk"), "a").unwrap();

        let output = temp.path().join("merged.mp4");
        let report = context
            .merge(&MergeArgs {
                dir,
                output: output.clone(),
                extension: None,
            })
            .await
            .unwrap();
        assert_eq!(report.summary.chunk_count, 3);
        assert_eq!(fs::read_to_string(output).unwrap(), "abc");
        assert!(report.display().contains("3 chunks"));
    }

    #[tokio::test]
    async fn malformed_payload_is_recorded() {
        let (_temp, context) = prepare_test_context().unwrap();
        context.init().await.unwrap();
        let report = context.handle(b"{not json").await.unwrap();
        assert!(matches!(report.0, TaskOutcome::Failed { video_id: None, .. }));

        let errors = context
            .errors(&ErrorsArgs {
                video_id: None,
                limit: 5,
            })
            .unwrap();
        assert_eq!(errors.rows.len(), 1);
        assert_eq!(errors.rows[0].stage, "parse");
        assert!(errors.display().contains("video=?"));
    }

    #[tokio::test]
    async fn missing_converter_is_reported_against_the_video() {
        let (temp, context) = prepare_test_context().unwrap();
        context.init().await.unwrap();
        let upload = temp.path().join("upload").join("5");
        fs::create_dir_all(&upload).unwrap();
        fs::write(upload.join("1.chunk"), "a").unwrap();

        let payload = UploadTask::new(5, "upload/5").to_payload();
        let report = context.handle(&payload).await.unwrap();
        assert!(matches!(report.0, TaskOutcome::Failed { video_id: Some(5), .. }));

        let status = context.status(5).unwrap();
        assert!(!status.processed);
        assert_eq!(status.recent_errors.len(), 1);
        assert_eq!(status.recent_errors[0].stage, "transcode");
    }

    #[tokio::test]
    async fn enqueue_then_run_once_drains_spool() {
        let (_temp, context) = prepare_test_context().unwrap();
        context.init().await.unwrap();
        let queued = context
            .enqueue(&EnqueueArgs {
                video_id: 9,
                path: String::new(),
            })
            .await
            .unwrap();
        assert!(!queued.id.is_empty());

        let report = context
            .run_pool(&RunArgs {
                once: true,
                concurrency: None,
            })
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(context.spool().pending().await.unwrap(), 0);
    }
}
