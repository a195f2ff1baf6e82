//! Wire protocol types for host-worker communication.
//!
//! One channel, the worker's stdin/stdout, carrying one JSON object per line:
//! - **Commands** (host → worker), discriminated by `kind`
//! - **Worker messages** (worker → host), discriminated by `type`: any number
//!   of events and metrics, then exactly one response per command

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A message family that carries a string discriminator field on the wire.
///
/// The codec uses this to tell a malformed line apart from a well-formed
/// message of a kind the reading side does not know.
pub trait Tagged: Serialize + DeserializeOwned {
    /// Name of the discriminator field.
    const TAG: &'static str;
    /// Discriminator values this side understands.
    const KINDS: &'static [&'static str];
}

/// Commands from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Liveness check. The echo value comes back untouched.
    Ping { echo: Value },

    /// Establishes the session. Must precede any `exec_step`.
    Prepare {
        session_id: String,
        manifest: Manifest,
    },

    ExecStep {
        session_id: String,
        step_id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },

    /// Session id may be omitted when no session was ever prepared.
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Prepare { .. } => "prepare",
            Self::ExecStep { .. } => "exec_step",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Ping { .. } => None,
            Self::Prepare { session_id, .. } | Self::ExecStep { session_id, .. } => {
                Some(session_id)
            }
            Self::Shutdown { session_id } => session_id.as_deref(),
        }
    }
}

impl Tagged for Command {
    const TAG: &'static str = "kind";
    const KINDS: &'static [&'static str] = &["ping", "prepare", "exec_step", "shutdown"];
}

/// Pipeline description sent with `prepare`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub steps: Vec<StepDescriptor>,
    /// Opaque session configuration handed to every step.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("session_id must not be empty")]
    EmptySessionId,
    #[error("manifest declares no steps")]
    NoSteps,
    #[error("step at index {0} has an empty id")]
    EmptyStepId(usize),
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
}

impl Manifest {
    pub fn new(steps: Vec<StepDescriptor>) -> Self {
        Self {
            steps,
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.steps.is_empty() {
            return Err(ManifestError::NoSteps);
        }
        let mut seen = HashSet::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.is_empty() {
                return Err(ManifestError::EmptyStepId(index));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(ManifestError::DuplicateStepId(step.id.clone()));
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Machine-readable reason carried by an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The step callable failed.
    StepFailure,
    /// Well-formed command that is not valid in the current state.
    ProtocolError,
    InvalidManifest,
    /// The command line could not be decoded.
    MalformedMessage,
}

/// Terminal reply to exactly one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ready {
        session_id: String,
        steps_total: usize,
    },

    Complete {
        step_id: String,
        step_counter: u64,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        output: Value,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        code: ErrorCode,
        message: String,
        /// Set when the error moved the session to `failed`.
        #[serde(default)]
        fatal: bool,
    },

    Pong {
        echo: Value,
    },

    ShuttingDown,
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            step_id: None,
            code,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::error(ErrorCode::ProtocolError, message)
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
            Self::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Error { fatal: true, .. })
    }

    /// Whether this response is a plausible reply to `command`.
    ///
    /// An error answers anything; every other status must match the command
    /// kind and echo back its identifying field.
    pub fn answers(&self, command: &Command) -> bool {
        match (self, command) {
            (Self::Error { .. }, _) => true,
            (Self::Pong { echo }, Command::Ping { echo: sent }) => echo == sent,
            (Self::Ready { session_id, .. }, Command::Prepare { session_id: sent, .. }) => {
                session_id == sent
            }
            (Self::Complete { step_id, .. }, Command::ExecStep { step_id: sent, .. }) => {
                step_id == sent
            }
            (Self::ShuttingDown, Command::Shutdown { .. }) => true,
            _ => false,
        }
    }
}

/// Point-in-time progress notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Non-object data is wrapped as `{"value": data}`.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data: into_map(data),
            ts: Utc::now(),
        }
    }
}

/// Point-in-time numeric measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub ts: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            ts: Utc::now(),
        }
    }
}

fn into_map(data: Value) -> Map<String, Value> {
    match data {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Messages from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Event(Event),
    Metric(Metric),
    Response(Response),
}

impl Tagged for WorkerMessage {
    const TAG: &'static str = "type";
    const KINDS: &'static [&'static str] = &["event", "metric", "response"];
}

/// Non-terminal output of a command, as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Event),
    Metric(Metric),
}

impl StreamItem {
    pub fn name(&self) -> &str {
        match self {
            Self::Event(e) => &e.name,
            Self::Metric(m) => &m.name,
        }
    }
}

impl From<StreamItem> for WorkerMessage {
    fn from(item: StreamItem) -> Self {
        match item {
            StreamItem::Event(e) => Self::Event(e),
            StreamItem::Metric(m) => Self::Metric(m),
        }
    }
}

impl WorkerMessage {
    /// Split into the stream item or the terminal response.
    pub fn into_item(self) -> Result<StreamItem, Response> {
        match self {
            Self::Event(e) => Ok(StreamItem::Event(e)),
            Self::Metric(m) => Ok(StreamItem::Metric(m)),
            Self::Response(r) => Err(r),
        }
    }
}
