use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::error::{RestoreError, Result};
use crate::ui::RestoreUi;

/// Default namespaced temp area for safety backups, deferred datastore
/// fragments, NIC repair snapshots and the firewall rollback state.
pub const DEFAULT_TMP_DIR: &str = "/tmp/proxsave";

/// Time source. Swapped for a fixed clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// One argv element, flagged when it must never appear in logs or errors.
#[derive(Debug, Clone)]
pub struct CmdArg {
    pub value: String,
    pub redact: bool,
}

/// A subprocess invocation. Carries redaction metadata so the runner can
/// build both a real argv and a display argv; error messages only ever
/// include the display form.
#[derive(Debug, Clone)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<CmdArg>,
}

impl CmdSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(CmdArg {
            value: value.into(),
            redact: false,
        });
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            self = self.arg(value);
        }
        self
    }

    pub fn secret_arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(CmdArg {
            value: value.into(),
            redact: true,
        });
        self
    }

    pub fn argv(&self) -> Vec<&str> {
        self.args.iter().map(|a| a.value.as_str()).collect()
    }

    /// Render the command with secret positions replaced by `<redacted>`.
    pub fn display_line(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.redact {
                out.push_str("<redacted>");
            } else {
                out.push_str(&arg.value);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub status_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Subprocess capability. Every external tool the pipeline touches
/// (`mount`, `systemctl`, the manager tools, `pvesh`, `ethtool`,
/// `udevadm`, `chattr`, streaming decompressors) goes through here.
pub trait CommandRunner: Send + Sync {
    /// Run to completion with a deadline, honoring the cancellation token.
    fn run(&self, spec: &CmdSpec, timeout: Duration, cancel: &CancelToken) -> Result<CmdOutput>;

    /// Spawn a long-lived filter process reading `input` on stdin and
    /// return its stdout as a stream. Used for external decompressors.
    fn open_stream(&self, spec: &CmdSpec, input: std::fs::File) -> Result<Box<dyn Read + Send>>;
}

/// Run a command and convert a non-zero exit into a `Tool` error carrying
/// only the redacted display line.
pub fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CmdSpec,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<CmdOutput> {
    let output = runner.run(spec, timeout, cancel)?;
    if output.success() {
        Ok(output)
    } else {
        Err(RestoreError::Tool {
            command: spec.display_line(),
            detail: format!(
                "exit {}: {}",
                output
                    .status_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.stderr_text().trim()
            ),
        })
    }
}

/// Production runner: spawn, poll `try_wait`, kill on deadline or
/// cancellation.
#[derive(Debug, Default)]
pub struct SystemRunner;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CmdSpec, timeout: Duration, cancel: &CancelToken) -> Result<CmdOutput> {
        tracing::debug!("running: {}", spec.display_line());

        let mut child = Command::new(&spec.program)
            .args(spec.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RestoreError::Tool {
                command: spec.display_line(),
                detail: format!("spawn failed: {e}"),
            })?;

        let deadline = std::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RestoreError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => {
                    let mut stdout = Vec::new();
                    let mut stderr = Vec::new();
                    if let Some(mut out) = child.stdout.take() {
                        let _ = out.read_to_end(&mut stdout);
                    }
                    if let Some(mut err) = child.stderr.take() {
                        let _ = err.read_to_end(&mut stderr);
                    }
                    return Ok(CmdOutput {
                        status_code: status.code(),
                        stdout,
                        stderr,
                    });
                }
                None => {
                    if std::time::Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(RestoreError::Timeout {
                            command: spec.display_line(),
                            seconds: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn open_stream(&self, spec: &CmdSpec, input: std::fs::File) -> Result<Box<dyn Read + Send>> {
        tracing::debug!("streaming: {}", spec.display_line());

        let child = Command::new(&spec.program)
            .args(spec.argv())
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RestoreError::Tool {
                command: spec.display_line(),
                detail: format!("spawn failed: {e}"),
            })?;

        Ok(Box::new(ChildStream { child }))
    }
}

/// Keeps the child alive while its stdout is being consumed; kills it when
/// the reader is dropped mid-stream.
struct ChildStream {
    child: std::process::Child,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.child.stdout.as_mut() {
            Some(out) => out.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Capability bundle handed to every pipeline component. No singletons in
/// the core; tests construct this with scripted implementations.
#[derive(Clone)]
pub struct Env {
    pub clock: Arc<dyn Clock>,
    pub runner: Arc<dyn CommandRunner>,
    pub ui: Arc<dyn RestoreUi>,
    pub tmp_dir: PathBuf,
}

impl Env {
    pub fn system(ui: Arc<dyn RestoreUi>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            runner: Arc::new(SystemRunner),
            ui,
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
        }
    }

    /// `YYYYMMDD_HHMMSS` stamp from the capability clock, used to name
    /// safety backups, export directories and deferral files.
    pub fn timestamp(&self) -> String {
        format_timestamp(self.clock.now())
    }
}

pub fn format_timestamp(now: SystemTime) -> String {
    let datetime: chrono::DateTime<chrono::Local> = now.into();
    datetime.format("%Y%m%d_%H%M%S").to_string()
}
