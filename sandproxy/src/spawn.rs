//! Worker creation strategies.
//!
//! - **ProcessSpawner**: a real child process; the channel is its stdin/stdout,
//!   stderr is inherited for diagnostics
//! - **InProcessSpawner**: the engine on a tokio task over an in-memory duplex
//!   pipe, for tests and same-machine setups without process isolation
//!
//! Either way the host receives a [`WorkerChannel`] that owns both pipe ends
//! and a [`WorkerHandle`] that can wait for or kill the worker.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::session::Session;
use crate::worker::{StepRunner, run_worker};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Default in-memory pipe capacity for in-process workers.
const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("worker {0} was not captured")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Process(ExitStatus),
    /// In-process worker task finished; `error` is set if it failed or was aborted.
    Task { error: Option<String> },
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        match self {
            Self::Process(status) => status.success(),
            Self::Task { error } => error.is_none(),
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process(status) => write!(f, "{status}"),
            Self::Task { error: None } => f.write_str("task finished"),
            Self::Task { error: Some(e) } => write!(f, "task failed: {e}"),
        }
    }
}

enum HandleKind {
    Process(Child),
    Task(JoinHandle<io::Result<Session>>),
}

/// Owned handle to a running worker.
pub struct WorkerHandle {
    kind: HandleKind,
    exit: Option<WorkerExit>,
}

impl WorkerHandle {
    pub fn process(child: Child) -> Self {
        Self {
            kind: HandleKind::Process(child),
            exit: None,
        }
    }

    pub fn task(handle: JoinHandle<io::Result<Session>>) -> Self {
        Self {
            kind: HandleKind::Task(handle),
            exit: None,
        }
    }

    /// OS process id, if this is a live child process.
    pub fn id(&self) -> Option<u32> {
        match &self.kind {
            HandleKind::Process(child) => child.id(),
            HandleKind::Task(_) => None,
        }
    }

    /// Exit status, once observed.
    pub fn exit(&self) -> Option<&WorkerExit> {
        self.exit.as_ref()
    }

    /// Wait for the worker to end. Safe to call repeatedly.
    pub async fn wait(&mut self) -> io::Result<WorkerExit> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let exit = match &mut self.kind {
            HandleKind::Process(child) => WorkerExit::Process(child.wait().await?),
            HandleKind::Task(handle) => match handle.await {
                Ok(Ok(_)) => WorkerExit::Task { error: None },
                Ok(Err(e)) => WorkerExit::Task {
                    error: Some(e.to_string()),
                },
                Err(e) => WorkerExit::Task {
                    error: Some(e.to_string()),
                },
            },
        };
        self.exit = Some(exit.clone());
        Ok(exit)
    }

    /// Request termination without waiting.
    pub fn start_kill(&mut self) -> io::Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match &mut self.kind {
            HandleKind::Process(child) => child.start_kill(),
            HandleKind::Task(handle) => {
                handle.abort();
                Ok(())
            }
        }
    }

    /// Terminate and reap.
    pub async fn kill(&mut self) -> io::Result<WorkerExit> {
        self.start_kill()?;
        self.wait().await
    }
}

/// Both ends of the host's side of the channel, plus the worker they lead to.
pub struct WorkerChannel {
    /// Worker output (its stdout).
    pub reader: BoxedReader,
    /// Worker input (its stdin).
    pub writer: BoxedWriter,
    pub handle: WorkerHandle,
}

/// Extension point for different worker spawn strategies.
///
/// This abstraction enables testing the host controller without a real
/// worker subprocess.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerChannel, SpawnError>;
}

/// Spawns the worker as a child process.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<WorkerChannel, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;

        tracing::debug!(program = %self.program.display(), pid = ?child.id(), "Spawned worker process");

        Ok(WorkerChannel {
            reader: Box::pin(stdout),
            writer: Box::pin(stdin),
            handle: WorkerHandle::process(child),
        })
    }
}

/// Runs the engine on a tokio task, connected through an in-memory pipe.
///
/// A fresh runner is built per spawn, so every worker gets its own session.
pub struct InProcessSpawner<F> {
    make_runner: F,
}

impl<F, R> InProcessSpawner<F>
where
    F: Fn() -> R + Send + Sync,
    R: StepRunner,
{
    pub fn new(make_runner: F) -> Self {
        Self { make_runner }
    }
}

impl<F, R> WorkerSpawner for InProcessSpawner<F>
where
    F: Fn() -> R + Send + Sync,
    R: StepRunner,
{
    fn spawn(&self) -> Result<WorkerChannel, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpawnError::Other(format!("no tokio runtime: {e}")))?;

        let (host_side, worker_side) = tokio::io::duplex(DUPLEX_BUFFER);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let task = runtime.spawn(run_worker((self.make_runner)(), worker_read, worker_write));

        let (host_read, host_write) = tokio::io::split(host_side);
        tracing::debug!("Spawned in-process worker task");

        Ok(WorkerChannel {
            reader: Box::pin(host_read),
            writer: Box::pin(host_write),
            handle: WorkerHandle::task(task),
        })
    }
}
