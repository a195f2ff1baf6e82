//! Worker engine - the per-command state machine.
//!
//! States: `uninitialized → ready → running → {complete | failed}`.
//!
//! Each call to [`WorkerEngine::handle`] processes exactly one decoded line
//! to completion: zero or more events/metrics through the emitter, then the
//! returned response. The session is passed in by the caller; the engine
//! keeps no state of its own besides the step runner.

use std::time::Instant;

use serde_json::json;

use crate::bridge::codec::Frame;
use crate::bridge::protocol::{Command, ErrorCode, Manifest, ManifestError, Response};
use crate::session::Session;
use crate::worker::{Emitter, StepRequest, StepRunner};

pub struct WorkerEngine<R> {
    runner: R,
}

impl<R: StepRunner> WorkerEngine<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Handle one incoming line.
    ///
    /// Lines that did not decode into a known command are answered with an
    /// error response and leave the session untouched.
    pub async fn handle(
        &self,
        session: &mut Session,
        frame: Frame<Command>,
        emitter: &Emitter,
    ) -> Response {
        match frame {
            Frame::Message(command) => self.handle_command(session, command, emitter).await,
            Frame::Unknown { kind } => {
                tracing::warn!(%kind, "Unknown command kind");
                Response::protocol_error("unknown command")
            }
            Frame::Malformed(e) => {
                tracing::warn!(error = %e, "Malformed command line");
                Response::error(ErrorCode::MalformedMessage, format!("malformed message: {e}"))
            }
        }
    }

    pub async fn handle_command(
        &self,
        session: &mut Session,
        command: Command,
        emitter: &Emitter,
    ) -> Response {
        tracing::debug!(kind = command.kind(), status = %session.status(), "Handling command");
        match command {
            Command::Ping { echo } => Response::Pong { echo },
            Command::Prepare {
                session_id,
                manifest,
            } => prepare(session, session_id, manifest, emitter),
            Command::ExecStep {
                session_id,
                step_id,
                payload,
            } => {
                self.exec_step(session, session_id, step_id, payload, emitter)
                    .await
            }
            Command::Shutdown { session_id } => shutdown(session, session_id.as_deref()),
        }
    }

    async fn exec_step(
        &self,
        session: &mut Session,
        session_id: String,
        step_id: String,
        payload: serde_json::Value,
        emitter: &Emitter,
    ) -> Response {
        let Some(active_id) = session.id() else {
            return step_protocol_error(step_id, "no session prepared");
        };
        if active_id != session_id {
            let message = format!("session id mismatch: active session is '{active_id}'");
            return step_protocol_error(step_id, message);
        }
        if !session.status().accepts_steps() {
            let message = format!("session is {}", session.status());
            return step_protocol_error(step_id, message);
        }
        let Some(descriptor) = session.step(&step_id) else {
            let message = format!("step '{step_id}' is not in the manifest");
            return step_protocol_error(step_id, message);
        };

        let step_number = session.step_counter() + 1;
        let request = StepRequest {
            session_id,
            step_id: step_id.clone(),
            step_number,
            params: descriptor.params.clone(),
            payload,
            config: session.config().clone(),
        };

        tracing::info!(%step_id, step_number, "Step starting");
        emit(
            emitter.event(
                "step_start",
                json!({"step_id": step_id, "step_number": step_number}),
            ),
        );

        let started = Instant::now();
        let result = self.runner.run(request, emitter).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                let step_counter = session.record_success();
                tracing::info!(%step_id, step_counter, duration_ms, "Step complete");
                emit(emitter.metric("step_duration_ms", duration_ms));
                emit(emitter.event(
                    "step_complete",
                    json!({"step_id": step_id, "step_counter": step_counter}),
                ));
                Response::Complete {
                    step_id,
                    step_counter,
                    output,
                }
            }
            Err(e) => {
                session.record_failure(e.fatal);
                tracing::warn!(%step_id, error = %e, fatal = e.fatal, "Step failed");
                emit(emitter.event(
                    "step_failed",
                    json!({"step_id": step_id, "message": e.message, "fatal": e.fatal}),
                ));
                Response::Error {
                    step_id: Some(step_id),
                    code: ErrorCode::StepFailure,
                    message: e.message,
                    fatal: e.fatal,
                }
            }
        }
    }
}

fn prepare(
    session: &mut Session,
    session_id: String,
    manifest: Manifest,
    emitter: &Emitter,
) -> Response {
    if let Some(active) = session.id() {
        return Response::protocol_error(format!("session '{active}' is already prepared"));
    }
    let validated = if session_id.is_empty() {
        Err(ManifestError::EmptySessionId)
    } else {
        manifest.validate()
    };
    if let Err(e) = validated {
        tracing::warn!(%session_id, error = %e, "Rejecting manifest");
        return Response::error(ErrorCode::InvalidManifest, e.to_string());
    }

    let steps_total = manifest.steps.len();
    session.initialize(session_id.clone(), manifest);
    tracing::info!(%session_id, steps_total, "Session initialized");

    emit(emitter.event(
        "session_initialized",
        json!({"session_id": session_id, "steps_total": steps_total}),
    ));
    emit(emitter.metric("steps_total", steps_total as f64));

    Response::Ready {
        session_id,
        steps_total,
    }
}

fn shutdown(session: &mut Session, session_id: Option<&str>) -> Response {
    if let Some(id) = session_id
        && !session.accepts_id(id)
    {
        return Response::protocol_error(format!(
            "session id mismatch: active session is '{}'",
            session.id().unwrap_or_default()
        ));
    }
    session.complete();
    Response::ShuttingDown
}

fn step_protocol_error(step_id: String, message: impl Into<String>) -> Response {
    Response::Error {
        step_id: Some(step_id),
        code: ErrorCode::ProtocolError,
        message: message.into(),
        fatal: false,
    }
}

/// A failed emit means the output channel is gone; the I/O loop reports that.
fn emit(result: std::io::Result<()>) {
    if let Err(e) = result {
        tracing::debug!(error = %e, "Dropping stream item");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::MalformedMessage;
    use crate::bridge::protocol::{StepDescriptor, WorkerMessage};
    use crate::session::SessionStatus;
    use crate::worker::StepError;
    use serde_json::Value;
    use tokio::sync::mpsc;

    /// Fails steps whose params say so; emits one progress metric otherwise.
    struct ParamRunner;

    #[async_trait::async_trait]
    impl StepRunner for ParamRunner {
        async fn run(&self, step: StepRequest, emitter: &Emitter) -> Result<Value, StepError> {
            match step.params.get("fail").and_then(Value::as_str) {
                Some("fatal") => Err(StepError::fatal("fatal failure")),
                Some(_) => Err(StepError::recoverable("soft failure")),
                None => {
                    emitter.metric("progress", 1.0).unwrap();
                    Ok(json!({"n": step.step_number, "payload": step.payload}))
                }
            }
        }
    }

    struct Harness {
        engine: WorkerEngine<ParamRunner>,
        session: Session,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                engine: WorkerEngine::new(ParamRunner),
                session: Session::new(),
            }
        }

        async fn send(&mut self, command: Command) -> (Vec<WorkerMessage>, Response) {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let emitter = Emitter::new(tx);
            let response = self
                .engine
                .handle_command(&mut self.session, command, &emitter)
                .await;
            drop(emitter);
            let mut items = Vec::new();
            while let Some(item) = rx.recv().await {
                items.push(item);
            }
            (items, response)
        }

        async fn prepared() -> Self {
            let mut h = Self::new();
            let (_, response) = h.send(prepare_cmd("run_123", manifest())).await;
            assert!(matches!(response, Response::Ready { .. }));
            h
        }
    }

    fn manifest() -> Manifest {
        Manifest::new(vec![
            StepDescriptor::new("fetch"),
            StepDescriptor::new("flaky").with_params(json!({"fail": "soft"})),
            StepDescriptor::new("doom").with_params(json!({"fail": "fatal"})),
        ])
    }

    fn prepare_cmd(id: &str, manifest: Manifest) -> Command {
        Command::Prepare {
            session_id: id.to_string(),
            manifest,
        }
    }

    fn exec(step_id: &str) -> Command {
        Command::ExecStep {
            session_id: "run_123".to_string(),
            step_id: step_id.to_string(),
            payload: Value::Null,
        }
    }

    fn names(items: &[WorkerMessage]) -> Vec<String> {
        items
            .iter()
            .map(|m| match m {
                WorkerMessage::Event(e) => format!("event:{}", e.name),
                WorkerMessage::Metric(m) => format!("metric:{}={}", m.name, m.value),
                WorkerMessage::Response(r) => format!("response:{}", r.status()),
            })
            .collect()
    }

    fn code_of(response: &Response) -> Option<ErrorCode> {
        match response {
            Response::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn prepare_with_three_steps() {
        let mut h = Harness::new();
        let (items, response) = h.send(prepare_cmd("run_123", manifest())).await;

        assert_eq!(
            response,
            Response::Ready {
                session_id: "run_123".to_string(),
                steps_total: 3
            }
        );
        assert_eq!(
            names(&items),
            vec!["event:session_initialized", "metric:steps_total=3"]
        );
        assert_eq!(h.session.status(), SessionStatus::Ready);
        assert_eq!(h.session.step_counter(), 0);
    }

    #[tokio::test]
    async fn ping_never_mutates_session() {
        let mut h = Harness::new();
        for echo in [json!(null), json!("x"), json!({"deep": [1, 2, {"a": true}]})] {
            let (items, response) = h.send(Command::Ping { echo: echo.clone() }).await;
            assert!(items.is_empty());
            assert_eq!(response, Response::Pong { echo });
            assert_eq!(h.session.status(), SessionStatus::Uninitialized);
        }

        let mut h = Harness::prepared().await;
        h.send(exec("fetch")).await;
        let (_, response) = h.send(Command::Ping { echo: json!(1) }).await;
        assert_eq!(response, Response::Pong { echo: json!(1) });
        assert_eq!(h.session.step_counter(), 1);
        assert_eq!(h.session.status(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn exec_step_emits_in_order_and_counts() {
        let mut h = Harness::prepared().await;

        for expected in 1..=3u64 {
            let (items, response) = h.send(exec("fetch")).await;
            let names = names(&items);
            assert_eq!(names[0], "event:step_start");
            assert_eq!(names[1], "metric:progress=1");
            assert!(names[2].starts_with("metric:step_duration_ms="));
            assert_eq!(names[3], "event:step_complete");
            assert_eq!(items.len(), 4);
            match response {
                Response::Complete {
                    step_id,
                    step_counter,
                    output,
                } => {
                    assert_eq!(step_id, "fetch");
                    assert_eq!(step_counter, expected);
                    assert_eq!(output["n"], json!(expected));
                }
                other => panic!("expected complete, got {other:?}"),
            }
            assert_eq!(h.session.step_counter(), expected);
        }
        assert_eq!(h.session.status(), SessionStatus::Running);
    }

    #[tokio::test]
    async fn payload_reaches_runner() {
        let mut h = Harness::prepared().await;
        let (_, response) = h
            .send(Command::ExecStep {
                session_id: "run_123".to_string(),
                step_id: "fetch".to_string(),
                payload: json!({"rows": 10}),
            })
            .await;
        match response {
            Response::Complete { output, .. } => assert_eq!(output["payload"], json!({"rows": 10})),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recoverable_failure_keeps_running() {
        let mut h = Harness::prepared().await;
        let (items, response) = h.send(exec("flaky")).await;

        assert_eq!(names(&items), vec!["event:step_start", "event:step_failed"]);
        assert_eq!(
            response,
            Response::Error {
                step_id: Some("flaky".to_string()),
                code: ErrorCode::StepFailure,
                message: "soft failure".to_string(),
                fatal: false,
            }
        );
        assert_eq!(h.session.status(), SessionStatus::Running);
        assert_eq!(h.session.step_counter(), 0);

        let (_, response) = h.send(exec("fetch")).await;
        assert!(matches!(response, Response::Complete { step_counter: 1, .. }));
    }

    #[tokio::test]
    async fn fatal_failure_fails_session() {
        let mut h = Harness::prepared().await;
        let (_, response) = h.send(exec("doom")).await;
        assert!(response.is_fatal());
        assert_eq!(h.session.status(), SessionStatus::Failed);

        let (items, response) = h.send(exec("fetch")).await;
        assert!(items.is_empty());
        assert_eq!(code_of(&response), Some(ErrorCode::ProtocolError));
        assert_eq!(h.session.status(), SessionStatus::Failed);

        let (_, response) = h.send(Command::Ping { echo: json!(0) }).await;
        assert_eq!(response, Response::Pong { echo: json!(0) });
    }

    #[tokio::test]
    async fn exec_step_rejections() {
        let mut h = Harness::new();
        let (items, response) = h.send(exec("fetch")).await;
        assert!(items.is_empty());
        assert_eq!(code_of(&response), Some(ErrorCode::ProtocolError));

        let mut h = Harness::prepared().await;
        let (_, response) = h
            .send(Command::ExecStep {
                session_id: "other".to_string(),
                step_id: "fetch".to_string(),
                payload: Value::Null,
            })
            .await;
        assert_eq!(code_of(&response), Some(ErrorCode::ProtocolError));

        let (_, response) = h.send(exec("missing")).await;
        match response {
            Response::Error { step_id, code, .. } => {
                assert_eq!(step_id.as_deref(), Some("missing"));
                assert_eq!(code, ErrorCode::ProtocolError);
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(h.session.step_counter(), 0);
        assert_eq!(h.session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn second_prepare_is_protocol_error() {
        let mut h = Harness::prepared().await;
        for id in ["run_123", "run_456"] {
            let (items, response) = h.send(prepare_cmd(id, manifest())).await;
            assert!(items.is_empty());
            assert_eq!(code_of(&response), Some(ErrorCode::ProtocolError));
        }
        assert_eq!(h.session.id(), Some("run_123"));
        assert_eq!(h.session.steps_total(), 3);
    }

    #[tokio::test]
    async fn invalid_manifest_leaves_session_uninitialized() {
        let mut h = Harness::new();
        let (items, response) = h.send(prepare_cmd("run_123", Manifest::default())).await;
        assert!(items.is_empty());
        assert_eq!(code_of(&response), Some(ErrorCode::InvalidManifest));
        assert_eq!(h.session.status(), SessionStatus::Uninitialized);

        let (items, response) = h.send(prepare_cmd("", manifest())).await;
        assert!(items.is_empty());
        assert_eq!(code_of(&response), Some(ErrorCode::InvalidManifest));
        assert!(matches!(
            &response,
            Response::Error { message, .. } if message == "session_id must not be empty"
        ));
        assert_eq!(h.session.status(), SessionStatus::Uninitialized);

        // Still preparable afterwards.
        let (_, response) = h.send(prepare_cmd("run_123", manifest())).await;
        assert!(matches!(response, Response::Ready { .. }));
    }

    #[tokio::test]
    async fn shutdown_completes_from_any_state() {
        let mut h = Harness::new();
        let (items, response) = h.send(Command::Shutdown { session_id: None }).await;
        assert!(items.is_empty());
        assert_eq!(response, Response::ShuttingDown);
        assert_eq!(h.session.status(), SessionStatus::Complete);

        let mut h = Harness::prepared().await;
        h.send(exec("doom")).await;
        let (_, response) = h
            .send(Command::Shutdown {
                session_id: Some("run_123".to_string()),
            })
            .await;
        assert_eq!(response, Response::ShuttingDown);
        assert_eq!(h.session.status(), SessionStatus::Complete);
    }

    #[tokio::test]
    async fn shutdown_for_other_session_is_rejected() {
        let mut h = Harness::prepared().await;
        let (_, response) = h
            .send(Command::Shutdown {
                session_id: Some("someone_else".to_string()),
            })
            .await;
        assert_eq!(code_of(&response), Some(ErrorCode::ProtocolError));
        assert_eq!(h.session.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames() {
        let engine = WorkerEngine::new(ParamRunner);
        let mut session = Session::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let emitter = Emitter::new(tx);

        let response = engine
            .handle(
                &mut session,
                Frame::Unknown {
                    kind: "teleport".to_string(),
                },
                &emitter,
            )
            .await;
        assert_eq!(response, Response::protocol_error("unknown command"));

        let response = engine
            .handle(
                &mut session,
                Frame::Malformed(MalformedMessage::NotAnObject),
                &emitter,
            )
            .await;
        assert_eq!(code_of(&response), Some(ErrorCode::MalformedMessage));
        assert_eq!(session.status(), SessionStatus::Uninitialized);
    }
}
