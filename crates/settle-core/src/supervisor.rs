//! Process supervision for the process under test.
//!
//! Starts a command with no stdin, streams its combined stdout/stderr into a
//! shared [`OutputBuffer`] that can be read at any time, and guarantees the
//! process is stopped: [`ProcessHandle::kill`] is idempotent, and dropping a
//! handle that was never stopped kills the process.
//!
//! # Example
//!
//! ```no_run
//! use settle_core::supervisor::{ProcessSpec, ProcessSupervisor};
//!
//! # async fn demo() -> Result<(), settle_core::supervisor::SupervisorError> {
//! let spec = ProcessSpec::new("traefik").arg("--configFile=/tmp/settle.toml");
//! let mut handle = ProcessSupervisor::new().start(&spec)?;
//! println!("{}", handle.output().contents());
//! handle.kill().await?;
//! handle.kill().await?; // no-op
//! # Ok(())
//! # }
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `kill` waits for the output readers to hit EOF.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from starting or stopping a supervised process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The program could not be spawned.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Stopping the process failed for a reason other than it already being gone.
    #[error("failed to stop {label} (pid {pid:?}): {source}")]
    Kill {
        label: String,
        pid: Option<u32>,
        #[source]
        source: io::Error,
    },

    /// Waiting for the process failed.
    #[error("failed to wait for {label}: {source}")]
    Wait {
        label: String,
        #[source]
        source: io::Error,
    },
}

/// Growable, shareable capture of a process's combined output.
///
/// Writers append continuously; readers can read it at any point.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes.
    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Returns the captured output as text, replacing invalid UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Number of bytes captured.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panicking writer cannot leave the Vec in an invalid state.
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Command line for a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program to execute (path or name on PATH).
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory, if different from the current one.
    pub current_dir: Option<PathBuf>,
    /// Window between SIGTERM and SIGKILL; `None` kills immediately.
    pub stop_grace: Option<Duration>,
    /// Name used in logs and diagnostics. Defaults to the program.
    pub label: String,
}

impl ProcessSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            stop_grace: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Sends SIGTERM first and waits up to `grace` before force killing.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = Some(grace);
        self
    }

    /// Sets the label used in logs.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Starts supervised processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Creates a supervisor.
    pub fn new() -> Self {
        Self
    }

    /// Spawns the process and starts capturing its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, spec: &ProcessSpec) -> Result<ProcessHandle, SupervisorError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        info!(label = %spec.label, ?pid, args = ?spec.args, "started process");

        let output = OutputBuffer::new();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, output.clone()));
        }

        Ok(ProcessHandle {
            label: spec.label.clone(),
            pid,
            child,
            output,
            readers,
            stop_grace: spec.stop_grace,
            stopped: false,
        })
    }
}

fn spawn_reader<R>(stream: R, output: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    // Raw bytes, one line at a time: the process may write anything, and
    // `OutputBuffer::contents` is the only place it gets decoded.
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => output.append(&line),
                Err(err) => {
                    debug!(error = %err, "output stream closed with error");
                    break;
                }
            }
        }
    })
}

/// A running (or stopped) supervised process.
///
/// Owned by exactly one scenario. The process is stopped exactly once: by
/// [`kill`](Self::kill), by [`wait`](Self::wait) observing its exit, or on drop.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    child: Child,
    output: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
    stop_grace: Option<Duration>,
    stopped: bool,
}

impl ProcessHandle {
    /// OS process id, if the process was still running when spawned.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Label given in the spec.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Captured combined output; readable while the process runs.
    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        !self.stopped && matches!(self.child.try_wait(), Ok(None))
    }

    /// Waits for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus, SupervisorError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| SupervisorError::Wait {
                label: self.label.clone(),
                source,
            })?;
        self.stopped = true;
        self.drain_readers().await;
        Ok(status)
    }

    /// Stops the process. Calling this on an exited or already-killed
    /// process is a no-op.
    pub async fn kill(&mut self) -> Result<(), SupervisorError> {
        if self.stopped {
            return Ok(());
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(label = %self.label, %status, "process already exited");
            }
            Ok(None) => match self.stop_grace {
                Some(grace) => self.terminate(grace).await?,
                None => self.force_kill().await?,
            },
            Err(source) => {
                return Err(SupervisorError::Kill {
                    label: self.label.clone(),
                    pid: self.pid,
                    source,
                });
            }
        }

        self.stopped = true;
        self.drain_readers().await;
        info!(label = %self.label, pid = ?self.pid, "process stopped");
        Ok(())
    }

    async fn force_kill(&mut self) -> Result<(), SupervisorError> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(err) if is_already_stopped(&err) => Ok(()),
            Err(source) => Err(SupervisorError::Kill {
                label: self.label.clone(),
                pid: self.pid,
                source,
            }),
        }
    }

    #[cfg(unix)]
    async fn terminate(&mut self, grace: Duration) -> Result<(), SupervisorError> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return self.force_kill().await;
        };

        if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            let err = io::Error::from(errno);
            if is_already_stopped(&err) {
                return Ok(());
            }
            warn!(label = %self.label, error = %err, "failed to send SIGTERM");
            return self.force_kill().await;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(label = %self.label, %status, "process exited after SIGTERM");
                Ok(())
            }
            Ok(Err(source)) => Err(SupervisorError::Wait {
                label: self.label.clone(),
                source,
            }),
            Err(_) => {
                warn!(label = %self.label, ?grace, "process ignored SIGTERM, force killing");
                self.force_kill().await
            }
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self, _grace: Duration) -> Result<(), SupervisorError> {
        self.force_kill().await
    }

    async fn drain_readers(&mut self) {
        for mut reader in std::mem::take(&mut self.readers) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                .await
                .is_err()
            {
                // A grandchild may still hold the pipe open.
                reader.abort();
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        match self.child.start_kill() {
            Ok(()) => debug!(label = %self.label, "killed process on drop"),
            Err(err) if is_already_stopped(&err) => {}
            Err(err) => warn!(label = %self.label, error = %err, "failed to kill process on drop"),
        }
    }
}

/// Whether a kill error only means the process is already gone.
fn is_already_stopped(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::InvalidInput {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32)
    }
    #[cfg(not(unix))]
    {
        false
    }
}
