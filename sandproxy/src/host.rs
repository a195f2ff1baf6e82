//! Host controller - owns the worker, its channel and the session logs.
//!
//! Flow:
//! 1. Open the log collector and spawn the worker
//! 2. `send` one command at a time; stream items are persisted and handed to
//!    the progress callback until the matching response arrives
//! 3. `stop` asks the worker to shut down, waits out the grace period, then
//!    kills it and closes the logs
//!
//! If the worker goes away mid-command the session is marked failed and every
//! later `send` returns [`HostError::NotRunning`]. Nothing is retried.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{Frame, JsonLinesCodec};
use crate::bridge::protocol::{Command, ErrorCode, Response, StreamItem, WorkerMessage};
use crate::collector::{CollectorError, LogCollector, LogCounts};
use crate::config::HostConfig;
use crate::session::SessionStatus;
use crate::spawn::{BoxedReader, BoxedWriter, SpawnError, WorkerChannel, WorkerExit, WorkerHandle};

/// How long to wait for a worker that closed its output to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("worker terminated: {reason}")]
    WorkerTerminated {
        reason: String,
        exit: Option<WorkerExit>,
    },
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// The worker answered with a response that does not match the command.
    /// The channel stays open and the session mirror is unchanged, so the
    /// controller remains usable.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker is not running")]
    NotRunning,
    #[error(transparent)]
    Collector(#[from] CollectorError),
}

/// Host's view of the worker session, driven by responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSession {
    id: Option<String>,
    status: SessionStatus,
}

impl HostSession {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    fn observe(&mut self, response: &Response) {
        match response {
            Response::Ready { session_id, .. } => {
                self.id = Some(session_id.clone());
                self.status = SessionStatus::Ready;
            }
            Response::Complete { .. } => self.status = SessionStatus::Running,
            Response::Error { fatal: true, .. } => self.status = SessionStatus::Failed,
            Response::Error {
                code: ErrorCode::StepFailure,
                ..
            } => self.status = SessionStatus::Running,
            Response::Error { .. } | Response::Pong { .. } => {}
            Response::ShuttingDown => self.status = SessionStatus::Complete,
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub commands_sent: u64,
    pub responses: u64,
    pub events: u64,
    pub metrics: u64,
    /// Lines that were not valid messages.
    pub malformed_lines: u64,
    /// Well-formed messages of a type this host does not know.
    pub unknown_lines: u64,
}

impl HostStats {
    fn count(&mut self, item: &StreamItem) {
        match item {
            StreamItem::Event(_) => self.events += 1,
            StreamItem::Metric(_) => self.metrics += 1,
        }
    }
}

/// Outcome of [`HostController::stop`].
#[derive(Debug, Clone, PartialEq)]
pub struct StopSummary {
    pub exit: Option<WorkerExit>,
    /// The worker had to be killed.
    pub forced: bool,
    pub logs: LogCounts,
    pub session_status: SessionStatus,
}

fn ignore_progress(_: &StreamItem) {}

pub struct HostController {
    reader: FramedRead<BoxedReader, JsonLinesCodec<WorkerMessage>>,
    writer: FramedWrite<BoxedWriter, JsonLinesCodec<Command>>,
    worker: WorkerHandle,
    collector: LogCollector,
    session: HostSession,
    stats: HostStats,
    command_timeout: Option<Duration>,
    shutdown_grace: Duration,
    channel_open: bool,
    killed: bool,
    stopped: Option<StopSummary>,
}

impl HostController {
    /// Open the session logs and spawn the worker.
    pub async fn start(config: HostConfig) -> Result<Self, HostError> {
        let collector = LogCollector::create(&config.log_dir)?;
        let WorkerChannel {
            reader,
            writer,
            handle,
        } = config.spawner.spawn()?;

        tracing::info!(
            log_dir = %config.log_dir.display(),
            pid = ?handle.id(),
            "Worker started"
        );

        Ok(Self {
            reader: FramedRead::new(reader, JsonLinesCodec::new()),
            writer: FramedWrite::new(writer, JsonLinesCodec::new()),
            worker: handle,
            collector,
            session: HostSession::default(),
            stats: HostStats::default(),
            command_timeout: config.command_timeout,
            shutdown_grace: config.shutdown_grace,
            channel_open: true,
            killed: false,
            stopped: None,
        })
    }

    pub fn session(&self) -> &HostSession {
        &self.session
    }

    pub fn stats(&self) -> HostStats {
        self.stats
    }

    pub fn log_dir(&self) -> &Path {
        self.collector.dir()
    }

    /// OS process id of the worker, when it is a child process.
    pub fn worker_id(&self) -> Option<u32> {
        self.worker.id()
    }

    pub fn is_running(&self) -> bool {
        self.channel_open
    }

    /// Send a command and wait for its response, using the configured timeout.
    pub async fn send(&mut self, command: Command) -> Result<Response, HostError> {
        let timeout = self.command_timeout;
        self.exchange(command, timeout, &mut ignore_progress).await
    }

    /// Like [`send`](Self::send), handing every event and metric to `progress`
    /// as it arrives.
    pub async fn send_with_progress<F>(
        &mut self,
        command: Command,
        mut progress: F,
    ) -> Result<Response, HostError>
    where
        F: FnMut(&StreamItem) + Send,
    {
        let timeout = self.command_timeout;
        self.exchange(command, timeout, &mut progress).await
    }

    /// Like [`send`](Self::send) with an explicit timeout. On expiry the
    /// worker is killed.
    pub async fn send_with_timeout(
        &mut self,
        command: Command,
        timeout: Duration,
    ) -> Result<Response, HostError> {
        self.exchange(command, Some(timeout), &mut ignore_progress)
            .await
    }

    async fn exchange(
        &mut self,
        command: Command,
        timeout: Option<Duration>,
        progress: &mut (dyn FnMut(&StreamItem) + Send),
    ) -> Result<Response, HostError> {
        if !self.channel_open {
            return Err(HostError::NotRunning);
        }

        let kind = command.kind();
        tracing::debug!(kind, session_id = ?command.session_id(), "Sending command");

        let outcome = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.roundtrip(&command, progress)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::error!(kind, ?limit, "Command timed out, killing worker");
                        self.kill_worker().await;
                        return Err(HostError::Timeout(limit));
                    }
                }
            }
            None => self.roundtrip(&command, progress).await,
        };

        let (response, collector_error) = outcome?;
        self.stats.responses += 1;
        self.session.observe(&response);
        if matches!(response, Response::ShuttingDown) {
            self.channel_open = false;
        }

        if response.is_error() {
            tracing::warn!(kind, ?response, "Worker answered with an error");
        } else {
            tracing::debug!(kind, status = response.status(), "Received response");
        }

        match collector_error {
            Some(e) => Err(HostError::Collector(e)),
            None => Ok(response),
        }
    }

    /// Write one command and read until its response.
    ///
    /// A log write failure does not stop the read loop; it is returned next to
    /// the response so the channel stays in step.
    async fn roundtrip(
        &mut self,
        command: &Command,
        progress: &mut (dyn FnMut(&StreamItem) + Send),
    ) -> Result<(Response, Option<CollectorError>), HostError> {
        if let Err(e) = self.writer.send(command.clone()).await {
            return Err(self
                .worker_lost(format!("failed to write command: {e}"))
                .await);
        }
        self.stats.commands_sent += 1;

        let mut collector_error = None;
        loop {
            match self.reader.next().await {
                Some(Ok(Frame::Message(message))) => match message.into_item() {
                    Ok(item) => {
                        self.stats.count(&item);
                        if let Err(e) = self.collector.record(&item) {
                            tracing::error!(error = %e, "Failed to persist worker output");
                            collector_error.get_or_insert(e);
                        }
                        progress(&item);
                    }
                    Err(response) => {
                        if !response.answers(command) {
                            return Err(HostError::Protocol(format!(
                                "'{}' response does not answer '{}' command",
                                response.status(),
                                command.kind()
                            )));
                        }
                        return Ok((response, collector_error));
                    }
                },
                Some(Ok(Frame::Unknown { kind })) => {
                    self.stats.unknown_lines += 1;
                    tracing::warn!(%kind, "Skipping unknown message type from worker");
                }
                Some(Ok(Frame::Malformed(e))) => {
                    self.stats.malformed_lines += 1;
                    tracing::warn!(error = %e, "Skipping malformed line from worker");
                }
                Some(Err(e)) => {
                    return Err(self.worker_lost(format!("channel read failed: {e}")).await);
                }
                None => {
                    return Err(self
                        .worker_lost("worker closed its output before responding".to_string())
                        .await);
                }
            }
        }
    }

    async fn worker_lost(&mut self, reason: String) -> HostError {
        self.channel_open = false;
        self.session.status = SessionStatus::Failed;

        let exit = match tokio::time::timeout(REAP_TIMEOUT, self.worker.wait()).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to reap worker");
                None
            }
            Err(_) => {
                tracing::warn!("Worker closed its output but is still running, killing");
                self.kill_worker().await
            }
        };

        tracing::error!(
            %reason,
            exit = ?exit.as_ref().map(ToString::to_string),
            session_id = ?self.session.id(),
            "Worker terminated"
        );
        HostError::WorkerTerminated { reason, exit }
    }

    async fn kill_worker(&mut self) -> Option<WorkerExit> {
        self.channel_open = false;
        self.killed = true;
        self.session.status = SessionStatus::Failed;
        match self.worker.kill().await {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::error!(error = %e, "Failed to kill worker");
                None
            }
        }
    }

    /// Shut the worker down and close the logs. Calling again returns the
    /// first summary.
    pub async fn stop(&mut self) -> Result<StopSummary, HostError> {
        if let Some(summary) = &self.stopped {
            return Ok(summary.clone());
        }
        let grace = self.shutdown_grace;

        if self.channel_open {
            let shutdown = Command::Shutdown {
                session_id: self.session.id.clone(),
            };
            match self
                .exchange(shutdown, Some(grace), &mut ignore_progress)
                .await
            {
                Ok(Response::ShuttingDown) => tracing::debug!("Worker acknowledged shutdown"),
                Ok(other) => {
                    tracing::warn!(status = other.status(), "Worker did not acknowledge shutdown")
                }
                Err(e) => tracing::warn!(error = %e, "Shutdown request failed"),
            }
        }

        // EOF on the command channel for a worker that is still reading.
        if let Err(e) = self.writer.close().await {
            tracing::debug!(error = %e, "Closing command channel failed");
        }
        self.channel_open = false;

        let exit = match tokio::time::timeout(grace, self.worker.wait()).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for worker");
                None
            }
            Err(_) => {
                tracing::warn!(?grace, "Worker did not exit within grace period, killing");
                self.kill_worker().await
            }
        };

        let logs = self.collector.close()?;
        let summary = StopSummary {
            exit,
            forced: self.killed,
            logs,
            session_status: self.session.status,
        };
        tracing::info!(
            exit = ?summary.exit.as_ref().map(ToString::to_string),
            forced = summary.forced,
            events = logs.events,
            metrics = logs.metrics,
            status = %summary.session_status,
            "Worker stopped"
        );
        self.stopped = Some(summary.clone());
        Ok(summary)
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        if self.stopped.is_none() && self.worker.exit().is_none() {
            tracing::debug!("Host controller dropped while worker running, killing it");
            let _ = self.worker.start_kill();
        }
    }
}
