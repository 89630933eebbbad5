//! Subprocess execution harness for external worker tools.
//!
//! The harness spawns a tool, captures both output streams line by line while
//! echoing a dimmed copy to the operator console, and classifies the run.
//! External tools are not trusted to report failure through the exit code
//! alone: a clean exit still fails when the output carries a failure marker
//! or the expected artifact is missing or empty.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::HarnessConfig;
use crate::error::HarnessError;

const DIM_START: &str = "\x1b[2m";
const DIM_END: &str = "\x1b[0m";

/// Longest output line kept; the rest of a longer line is dropped.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Artifact the tool must leave behind for the run to count as a success.
    pub expected_output: PathBuf,
    /// Overrides the harness default when set.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        expected_output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            expected_output: expected_output.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Command line for debug logs. Never logged above debug level since
    /// arguments may carry API keys.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Captured streams of a finished process.
#[derive(Debug, Default)]
struct Captured {
    stdout: String,
    stderr: String,
}

enum RunEnd {
    Finished(Result<(ExitStatus, Captured), HarnessError>),
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Harness {
    failure_markers: Vec<String>,
    default_timeout: Duration,
    console_echo: bool,
}

impl Harness {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            failure_markers: config.failure_markers.clone(),
            default_timeout: config.timeout,
            console_echo: true,
        }
    }

    /// Turns the dimmed console copy of tool output on or off.
    pub fn with_console_echo(mut self, echo: bool) -> Self {
        self.console_echo = echo;
        self
    }

    pub fn failure_markers(&self) -> &[String] {
        &self.failure_markers
    }

    /// Runs `spec` to completion and returns the expected output path.
    ///
    /// Cancellation of `cancel` or expiry of the timeout kills the process;
    /// whatever output was captured up to that point is discarded.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::Spawn`] if the program cannot be started
    /// - [`HarnessError::NonZeroExit`] with the captured stderr
    /// - [`HarnessError::FailureMarker`] when a marker appears despite exit 0
    /// - [`HarnessError::MissingOutput`] / [`HarnessError::EmptyOutput`]
    /// - [`HarnessError::Cancelled`] / [`HarnessError::TimedOut`]
    pub async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, HarnessError> {
        debug!("Command: {}", spec.display());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout_task = tokio::spawn(capture_lines(child.stdout.take(), self.console_echo));
        let stderr_task = tokio::spawn(capture_lines(child.stderr.take(), self.console_echo));

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let end = tokio::select! {
            _ = cancel.cancelled() => RunEnd::Cancelled,
            _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
            result = drain_and_wait(&mut child, &spec.program, stdout_task, stderr_task) => {
                RunEnd::Finished(result)
            }
        };

        match end {
            RunEnd::Finished(result) => {
                let (status, captured) = result?;
                self.classify(spec, status, captured).await
            }
            RunEnd::Cancelled => {
                kill(&mut child, &spec.program).await;
                Err(HarnessError::Cancelled {
                    program: spec.program.clone(),
                })
            }
            RunEnd::TimedOut => {
                error!("{} timed out after {:?}", spec.program, timeout);
                kill(&mut child, &spec.program).await;
                Err(HarnessError::TimedOut {
                    program: spec.program.clone(),
                    timeout,
                })
            }
        }
    }

    async fn classify(
        &self,
        spec: &CommandSpec,
        status: ExitStatus,
        captured: Captured,
    ) -> Result<PathBuf, HarnessError> {
        if !status.success() {
            let stderr = captured.stderr.trim().to_string();
            if !stderr.is_empty() {
                error!("{} stderr: {}", spec.program, stderr);
            }
            return Err(HarnessError::NonZeroExit {
                program: spec.program.clone(),
                code: status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr,
            });
        }

        for output in [&captured.stderr, &captured.stdout] {
            if let Some(marker) = self.find_marker(output) {
                return Err(HarnessError::FailureMarker {
                    program: spec.program.clone(),
                    marker: marker.to_string(),
                    output: output.clone(),
                });
            }
        }

        check_output(&spec.expected_output, captured.stdout).await?;
        Ok(spec.expected_output.clone())
    }

    fn find_marker(&self, output: &str) -> Option<&str> {
        self.failure_markers
            .iter()
            .map(String::as_str)
            .find(|marker| !marker.is_empty() && output.contains(marker))
    }
}

/// Waits for both readers to hit end-of-stream, then for the exit status.
///
/// Reading first keeps output that is still buffered in the pipes when the
/// process exits.
async fn drain_and_wait(
    child: &mut Child,
    program: &str,
    stdout_task: JoinHandle<String>,
    stderr_task: JoinHandle<String>,
) -> Result<(ExitStatus, Captured), HarnessError> {
    let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
    let captured = Captured {
        stdout: stdout.unwrap_or_default(),
        stderr: stderr.unwrap_or_default(),
    };

    let status = child.wait().await.map_err(|source| HarnessError::Io {
        program: program.to_string(),
        source,
    })?;

    Ok((status, captured))
}

async fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill {}: {}", program, e);
    }
}

async fn capture_lines<R>(reader: Option<R>, echo: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };

    let mut reader = BufReader::new(reader);
    let mut captured = String::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut raw)
            .await;
        match read {
            Ok(0) => break,
            Ok(n) => {
                if n == MAX_LINE_BYTES && raw.last() != Some(&b'\n') {
                    if let Err(e) = skip_rest_of_line(&mut reader).await {
                        debug!("Output reader stopped (may be normal): {}", e);
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\n', '\r']);
                captured.push_str(line);
                captured.push('\n');
                if echo {
                    eprintln!("{}  │ {}{}", DIM_START, line, DIM_END);
                }
            }
            Err(e) => {
                debug!("Output reader stopped (may be normal): {}", e);
                break;
            }
        }
    }

    captured
}

async fn skip_rest_of_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let n = buf.len();
                reader.consume(n);
            }
        }
    }
}

async fn check_output(path: &Path, stdout: String) -> Result<(), HarnessError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(HarnessError::EmptyOutput {
            path: path.to_path_buf(),
            stdout,
        }),
        Err(_) => Err(HarnessError::MissingOutput {
            path: path.to_path_buf(),
            stdout,
        }),
    }
}
