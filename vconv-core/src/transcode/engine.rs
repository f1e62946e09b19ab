use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::EngineError;
use crate::config::{LayoutSection, TranscodeSection};

/// External converter that turns one media file into an adaptive-streaming
/// package. Returns the engine's diagnostic text on success.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    async fn invoke(
        &self,
        input: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;
}

/// Runs ffmpeg (or a wrapper around it) as a child process.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    program: PathBuf,
    program_args: Vec<String>,
    format: String,
    manifest_name: String,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
}

impl FfmpegEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let defaults = TranscodeSection::default();
        let layout = LayoutSection::default();
        Self {
            program: program.into(),
            program_args: defaults.program_args,
            format: defaults.format,
            manifest_name: layout.manifest_name,
            extra_args: defaults.extra_args,
            timeout: None,
        }
    }

    pub fn from_config(transcode: &TranscodeSection, layout: &LayoutSection) -> Self {
        Self {
            program: PathBuf::from(&transcode.program),
            program_args: transcode.program_args.clone(),
            format: transcode.format.clone(),
            manifest_name: layout.manifest_name.clone(),
            extra_args: transcode.extra_args.clone(),
            timeout: transcode.timeout(),
        }
    }

    pub fn with_program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn manifest_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.manifest_name)
    }

    pub fn args(&self, input: &Path, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.program_args.iter().map(OsString::from).collect();
        args.extend(["-y", "-hide_banner", "-nostdin", "-i"].map(OsString::from));
        args.push(input.as_os_str().to_os_string());
        args.push("-f".into());
        args.push(OsString::from(&self.format));
        args.extend(self.extra_args.iter().map(OsString::from));
        args.push(self.manifest_path(output_dir).into_os_string());
        args
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    async fn wait(&self, command: &mut Command) -> Result<(ExitStatus, String), EngineError> {
        let program = self.program_name();
        let child = command.spawn().map_err(|source| EngineError::Spawn {
            program: program.clone(),
            source,
        })?;
        let output = collect_output(child);
        let result = match self.timeout {
            Some(limit) => timeout(limit, output)
                .await
                .map_err(|_| EngineError::TimedOut {
                    program: program.clone(),
                    after: limit,
                })?,
            None => output.await,
        };
        result.map_err(|source| EngineError::Spawn { program, source })
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn invoke(
        &self,
        input: &Path,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(input, output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(program = %self.program.display(), input = %input.display(), "starting transcode engine");

        // Dropping the wait future drops the child, which kills it.
        let (status, diagnostics) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EngineError::Cancelled { program: self.program_name() });
            }
            output = self.wait(&mut command) => output?,
        };

        if status.success() {
            Ok(diagnostics)
        } else {
            Err(EngineError::Failed {
                program: self.program_name(),
                exit_detail: status.to_string(),
                diagnostics,
            })
        }
    }
}

/// Reads stdout and stderr together, keeping lines in the order they
/// arrive, then waits for the exit status.
async fn collect_output(mut child: Child) -> std::io::Result<(ExitStatus, String)> {
    let mut stdout = child.stdout.take().map(BufReader::new);
    let mut stderr = child.stderr.take().map(BufReader::new);
    let mut transcript = String::new();

    while stdout.is_some() || stderr.is_some() {
        let (line, from_stdout) = tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => (line?, true),
            line = next_line(&mut stderr), if stderr.is_some() => (line?, false),
        };
        match line {
            Some(line) => transcript.push_str(&line),
            None if from_stdout => stdout = None,
            None => stderr = None,
        }
    }

    let status = child.wait().await?;
    Ok((status, transcript.trim_end().to_string()))
}

async fn next_line<R>(reader: &mut Option<R>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(reader) = reader.as_mut() else {
        return Ok(None);
    };
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}
