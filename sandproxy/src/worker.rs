//! Worker side of the channel - runs inside the worker process.
//!
//! This module provides the I/O loop around the [`WorkerEngine`]. The host
//! side (spawning, response correlation, log collection) is in host.rs.
//!
//! Architecture:
//! - Command channel (stdin): one command at a time, never pipelined
//! - Output channel (stdout): events and metrics streamed live while a step
//!   runs, then exactly one response
//! - stderr: tracing output only
//!
//! Per command, the engine and a forwarder run concurrently on the same task.
//! The engine emits through an [`Emitter`]; the forwarder writes each item to
//! stdout as it arrives. The response is written only once the emitter is
//! dropped and the forwarder has drained, so nothing attributable to a command
//! can follow its response.

use std::io;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{Frame, JsonLinesCodec};
use crate::bridge::protocol::{Command, Event, Metric, Response, StreamItem, WorkerMessage};
use crate::engine::WorkerEngine;
use crate::session::Session;

/// Handle for emitting progress while a command is processed.
///
/// Not `Clone`, and only ever lent out by reference: once the command handler
/// returns, nothing can emit on behalf of that command anymore.
pub struct Emitter {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl Emitter {
    pub fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }

    pub fn event(&self, name: impl Into<String>, data: Value) -> io::Result<()> {
        self.emit(StreamItem::Event(Event::new(name, data)))
    }

    pub fn metric(&self, name: impl Into<String>, value: f64) -> io::Result<()> {
        self.emit(StreamItem::Metric(Metric::new(name, value)))
    }

    /// Non-finite metric values are refused with `InvalidInput`; JSON has no
    /// encoding for them.
    pub fn emit(&self, item: StreamItem) -> io::Result<()> {
        if let StreamItem::Metric(metric) = &item
            && !metric.value.is_finite()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("metric '{}' has non-finite value {}", metric.name, metric.value),
            ));
        }
        self.tx
            .send(item.into())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "output channel closed"))
    }
}

/// Step execution failure.
///
/// Recoverable failures leave the session running; fatal ones move it to
/// `failed` and no further steps are accepted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub fatal: bool,
}

impl StepError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// Everything a step callable gets to see about the step it runs.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub session_id: String,
    pub step_id: String,
    /// 1-based position of this attempt among successful steps.
    pub step_number: u64,
    /// Params declared for the step in the manifest.
    pub params: Value,
    /// Payload carried by the `exec_step` command.
    pub payload: Value,
    /// Session configuration from the manifest.
    pub config: Map<String, Value>,
}

/// Trait for the step callable - the pipeline logic executed by the worker.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync + 'static {
    /// Run one step, emitting progress through `emitter`.
    async fn run(&self, step: StepRequest, emitter: &Emitter) -> Result<Value, StepError>;
}

/// Run the worker loop over stdin/stdout until shutdown or EOF.
pub async fn run_stdio_worker<R: StepRunner>(runner: R) -> io::Result<Session> {
    run_worker(runner, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the worker loop over an arbitrary byte stream pair.
///
/// Returns the final session once a `shutdown` has been answered or the host
/// closed the command channel.
pub async fn run_worker<R, Rd, Wr>(runner: R, reader: Rd, writer: Wr) -> io::Result<Session>
where
    R: StepRunner,
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let engine = WorkerEngine::new(runner);
    let mut session = Session::new();
    let mut commands = FramedRead::new(reader, JsonLinesCodec::<Command>::new());
    let mut output = FramedWrite::new(writer, JsonLinesCodec::<WorkerMessage>::new());

    tracing::info!("Worker ready for commands");

    loop {
        let frame = match commands.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Command channel error");
                return Err(e);
            }
            None => {
                tracing::info!("Command channel closed (host gone?), exiting");
                break;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (response, forwarded) = tokio::join!(
            handle_then_close(&engine, &mut session, frame, Emitter::new(tx)),
            forward_stream(&mut rx, &mut output),
        );
        if let Err(e) = forwarded {
            tracing::error!(error = %e, "Failed to forward worker output");
            return Err(e);
        }

        let shutting_down = matches!(response, Response::ShuttingDown);
        tracing::debug!(status = response.status(), "Sending response");
        output.send(WorkerMessage::Response(response)).await?;

        if shutting_down {
            tracing::info!(session_id = ?session.id(), "Shutdown acknowledged");
            break;
        }
    }

    tracing::info!(
        status = %session.status(),
        step_counter = session.step_counter(),
        "Worker exiting"
    );
    Ok(session)
}

/// Handle one command; the emitter is dropped on return, ending the stream.
async fn handle_then_close<R: StepRunner>(
    engine: &WorkerEngine<R>,
    session: &mut Session,
    frame: Frame<Command>,
    emitter: Emitter,
) -> Response {
    engine.handle(session, frame, &emitter).await
}

async fn forward_stream<W: AsyncWrite + Unpin>(
    rx: &mut mpsc::UnboundedReceiver<WorkerMessage>,
    output: &mut FramedWrite<W, JsonLinesCodec<WorkerMessage>>,
) -> io::Result<()> {
    while let Some(msg) = rx.recv().await {
        output.send(msg).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ErrorCode, Manifest, StepDescriptor};
    use crate::session::SessionStatus;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct CountingRunner;

    #[async_trait::async_trait]
    impl StepRunner for CountingRunner {
        async fn run(&self, step: StepRequest, emitter: &Emitter) -> Result<Value, StepError> {
            for i in 1..=2u32 {
                emitter.metric("progress", f64::from(i) / 2.0).ok();
                tokio::task::yield_now().await;
            }
            Ok(json!({"step": step.step_id}))
        }
    }

    fn line(cmd: &Command) -> String {
        let mut s = serde_json::to_string(cmd).unwrap();
        s.push('\n');
        s
    }

    async fn read_messages(output: &[u8]) -> Vec<WorkerMessage> {
        let mut lines = BufReader::new(output).lines();
        let mut out = Vec::new();
        while let Some(l) = lines.next_line().await.unwrap() {
            out.push(serde_json::from_str(&l).unwrap());
        }
        out
    }

    #[test]
    fn step_error_constructors() {
        assert!(!StepError::recoverable("x").fatal);
        assert!(StepError::fatal("x").fatal);
        assert_eq!(StepError::fatal("boom").to_string(), "boom");
    }

    #[tokio::test]
    async fn emitter_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = Emitter::new(tx);
        emitter.event("a", json!({})).unwrap();
        drop(rx);
        let err = emitter.metric("b", 1.0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn emitter_refuses_non_finite_metrics() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = Emitter::new(tx);
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = emitter.metric("loss", value).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        emitter.metric("loss", 0.5).unwrap();
        drop(emitter);

        let mut sent = Vec::new();
        while let Some(msg) = rx.recv().await {
            sent.push(msg);
        }
        assert!(matches!(sent.as_slice(), [WorkerMessage::Metric(m)] if m.value == 0.5));
    }

    struct NanRunner;

    #[async_trait::async_trait]
    impl StepRunner for NanRunner {
        async fn run(&self, _step: StepRequest, emitter: &Emitter) -> Result<Value, StepError> {
            match emitter.metric("loss", f64::NAN) {
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(json!({"rejected": true})),
                other => Err(StepError::fatal(format!("unexpected emit result: {other:?}"))),
            }
        }
    }

    #[tokio::test]
    async fn runner_sees_non_finite_metric_rejection() {
        let manifest = Manifest::new(vec![StepDescriptor::new("a")]);
        let mut input = line(&Command::Prepare {
            session_id: "s1".to_string(),
            manifest,
        });
        input.push_str(&line(&Command::ExecStep {
            session_id: "s1".to_string(),
            step_id: "a".to_string(),
            payload: Value::Null,
        }));

        let mut output = Vec::new();
        run_worker(NanRunner, input.as_bytes(), &mut output)
            .await
            .unwrap();

        let messages = read_messages(&output).await;
        assert!(messages.iter().all(|m| match m {
            WorkerMessage::Metric(m) => m.value.is_finite(),
            _ => true,
        }));
        assert!(matches!(
            messages.last(),
            Some(WorkerMessage::Response(Response::Complete { output, .. }))
                if output == &json!({"rejected": true})
        ));
    }

    #[tokio::test]
    async fn responses_follow_their_stream_items() {
        let manifest = Manifest::new(vec![StepDescriptor::new("a"), StepDescriptor::new("b")]);
        let mut input = String::new();
        input.push_str(&line(&Command::Prepare {
            session_id: "s1".to_string(),
            manifest,
        }));
        for step in ["a", "b"] {
            input.push_str(&line(&Command::ExecStep {
                session_id: "s1".to_string(),
                step_id: step.to_string(),
                payload: Value::Null,
            }));
        }
        input.push_str(&line(&Command::Shutdown {
            session_id: Some("s1".to_string()),
        }));
        // Never read: the worker stops at shutdown.
        input.push_str(&line(&Command::Ping { echo: json!(1) }));

        let mut output = Vec::new();
        let session = run_worker(CountingRunner, input.as_bytes(), &mut output)
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Complete);
        assert_eq!(session.step_counter(), 2);

        let messages = read_messages(&output).await;
        let statuses: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Response(r) => Some(r.status()),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec!["ready", "complete", "complete", "shutting_down"]);

        // Each step: step_start, progress x2, step_duration_ms, step_complete, response.
        let first_step: Vec<String> = messages[3..9]
            .iter()
            .map(|m| match m {
                WorkerMessage::Event(e) => format!("event:{}", e.name),
                WorkerMessage::Metric(m) => format!("metric:{}", m.name),
                WorkerMessage::Response(r) => format!("response:{}", r.status()),
            })
            .collect();
        assert_eq!(
            first_step,
            vec![
                "event:step_start",
                "metric:progress",
                "metric:progress",
                "metric:step_duration_ms",
                "event:step_complete",
                "response:complete",
            ]
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_lines_get_error_responses() {
        let input = "garbage\n{\"kind\":\"teleport\"}\n{\"kind\":\"ping\",\"echo\":\"hi\"}\n";
        let mut output = Vec::new();
        let session = run_worker(CountingRunner, input.as_bytes(), &mut output)
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Uninitialized);

        let messages = read_messages(&output).await;
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[0],
            WorkerMessage::Response(Response::Error { code: ErrorCode::MalformedMessage, .. })
        ));
        assert!(matches!(
            &messages[1],
            WorkerMessage::Response(Response::Error { code: ErrorCode::ProtocolError, message, .. })
                if message == "unknown command"
        ));
        assert_eq!(
            messages[2],
            WorkerMessage::Response(Response::Pong { echo: json!("hi") })
        );
    }

    #[tokio::test]
    async fn exits_cleanly_when_host_closes_channel() {
        let (host_side, worker_side) = tokio::io::duplex(4096);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (host_read, mut host_write) = tokio::io::split(host_side);

        let worker = tokio::spawn(run_worker(CountingRunner, worker_read, worker_write));

        host_write
            .write_all(line(&Command::Ping { echo: json!(7) }).as_bytes())
            .await
            .unwrap();
        let mut replies = BufReader::new(host_read).lines();
        let reply: WorkerMessage =
            serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply, WorkerMessage::Response(Response::Pong { echo: json!(7) }));

        host_write.shutdown().await.unwrap();
        drop(host_write);
        let session = worker.await.unwrap().unwrap();
        assert_eq!(session.status(), SessionStatus::Uninitialized);
    }
}
