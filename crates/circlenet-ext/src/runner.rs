//! Detection script execution
//!
//! The interpreter's stdout and stderr are drained by two reader tasks into a
//! single channel while the runner waits for exit, so a chatty script can
//! never stall on a full pipe.

use crate::error::DetectionError;
use crate::telemetry::SCRIPT_TARGET;
use crate::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a finished script ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success { output: String },
    Failure { exit_code: i32, output: String },
}

impl JobOutcome {
    pub fn output(&self) -> &str {
        match self {
            JobOutcome::Success { output } | JobOutcome::Failure { output, .. } => output,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

/// Environment additions for the interpreter process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnv {
    /// Prepended to the inherited PATH
    pub search_path_prefix: Option<PathBuf>,
    /// Exported as PYTHONPATH
    pub library_path: Option<PathBuf>,
}

impl ProcessEnv {
    /// PATH gains the interpreter's own directory
    pub fn for_interpreter(interpreter: &Path, library_path: Option<PathBuf>) -> Self {
        ProcessEnv {
            search_path_prefix: interpreter
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf),
            library_path,
        }
    }

    /// PATH value with the prefix in front of `inherited`
    pub fn search_path(&self, inherited: Option<OsString>) -> Option<OsString> {
        let prefix = self.search_path_prefix.clone()?;
        let mut paths = vec![prefix];
        if let Some(inherited) = inherited {
            paths.extend(std::env::split_paths(&inherited));
        }
        std::env::join_paths(paths).ok()
    }

    fn apply(&self, cmd: &mut Command) {
        if let Some(path) = self.search_path(std::env::var_os("PATH")) {
            cmd.env("PATH", path);
        }
        if let Some(lib) = &self.library_path {
            cmd.env("PYTHONPATH", lib);
        }
    }
}

/// One interpreter launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub args: Vec<String>,
    pub env: ProcessEnv,
}

impl Invocation {
    /// Full argument vector, interpreter first
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = vec![
            self.interpreter.clone().into_os_string(),
            self.script.clone().into_os_string(),
        ];
        argv.extend(self.args.iter().map(OsString::from));
        argv
    }
}

/// Runs the detection script and captures its merged output
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        ProcessRunner { timeout }
    }

    /// Launch, drain and wait.
    ///
    /// Launch problems, timeout and cancellation are errors; a script that ran
    /// and exited nonzero is a `JobOutcome::Failure`.
    pub async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        if cancel.is_cancelled() {
            return Err(DetectionError::Cancelled);
        }

        let start = Instant::now();
        let mut cmd = Command::new(&invocation.interpreter);
        cmd.arg(&invocation.script)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        invocation.env.apply(&mut cmd);

        info!(
            interpreter = %invocation.interpreter.display(),
            script = %invocation.script.display(),
            "Starting detection script"
        );
        let mut child = cmd
            .spawn()
            .map_err(|source| DetectionError::ProcessLaunchFailure {
                program: invocation.interpreter.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(stderr, tx.clone())));
        }
        drop(tx);
        let collector = tokio::spawn(collect_output(rx));

        // One deadline covers both the exit and the output drain
        let deadline = self.timeout.map(|d| tokio::time::Instant::now() + d);
        let timeout_secs = self.timeout.map(|d| d.as_secs()).unwrap_or_default();
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!("Cancelling detection script");
                let _ = child.kill().await;
                return Err(DetectionError::Cancelled);
            }
            _ = sleep_until_or_forever(deadline) => {
                error!(secs = timeout_secs, "Detection script timed out");
                let _ = child.kill().await;
                return Err(DetectionError::Timeout { secs: timeout_secs });
            }
        };

        // A background grandchild can hold the pipes open after the script exits
        let interrupted = tokio::select! {
            _ = drain(&mut readers) => None,
            _ = cancel.cancelled() => {
                warn!("Cancelled while draining script output");
                Some(DetectionError::Cancelled)
            }
            _ = sleep_until_or_forever(deadline) => {
                error!(secs = timeout_secs, "Script output still open at timeout");
                Some(DetectionError::Timeout { secs: timeout_secs })
            }
        };
        if let Some(err) = interrupted {
            for reader in &readers {
                reader.abort();
            }
            collector.abort();
            return Err(err);
        }
        let output = collector.await.unwrap_or_default();

        let duration_ms = start.elapsed().as_millis() as u64;
        // Killed by a signal: no exit code
        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            info!(duration_ms, "Python script executed successfully.");
            Ok(JobOutcome::Success { output })
        } else {
            error!(exit_code, duration_ms, "Python script exited with error code: {}", exit_code);
            error!("Python script output: {}", output);
            Ok(JobOutcome::Failure { exit_code, output })
        }
    }
}

/// Find `name` with the platform's command lookup (`which`, or `where` on Windows)
pub async fn discover_interpreter(name: &str) -> Result<PathBuf> {
    let probe = if cfg!(windows) { "where" } else { "which" };
    let not_found = || DetectionError::InterpreterNotFound {
        name: name.to_string(),
    };

    let output = Command::new(probe)
        .arg(name)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|_| not_found())?;
    if !output.status.success() {
        return Err(not_found());
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
        .ok_or_else(not_found)
}

/// Ask the interpreter where its user site-packages live
pub async fn discover_library_path(interpreter: &Path) -> Option<PathBuf> {
    let output = Command::new(interpreter)
        .args(["-c", "import site; print(site.getusersitepackages())"])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed reading script output");
                break;
            }
        }
    }
}

async fn collect_output(mut rx: mpsc::UnboundedReceiver<String>) -> String {
    let mut output = String::new();
    while let Some(line) = rx.recv().await {
        debug!(target: SCRIPT_TARGET, "{}", line);
        output.push_str(&line);
        output.push('\n');
    }
    output
}

async fn drain(readers: &mut [tokio::task::JoinHandle<()>]) {
    for reader in readers.iter_mut() {
        let _ = reader.await;
    }
}

async fn sleep_until_or_forever(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
