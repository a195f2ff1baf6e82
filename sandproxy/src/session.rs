//! Session state tracking.
//!
//! Exactly one [`Session`] exists per worker. It is an owned value handed to
//! every command-handling call; the engine is its only mutator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bridge::protocol::{Manifest, StepDescriptor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Uninitialized,
    Ready,
    Running,
    Complete,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether `exec_step` is accepted in this state.
    pub fn accepts_steps(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution context of one worker.
#[derive(Debug, Default)]
pub struct Session {
    id: Option<String>,
    step_counter: u64,
    config: Map<String, Value>,
    steps: Vec<StepDescriptor>,
    status: SessionStatus,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn step_counter(&self) -> u64 {
        self.step_counter
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn steps_total(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_initialized(&self) -> bool {
        self.id.is_some()
    }

    /// True when no session exists yet or `session_id` names the active one.
    pub fn accepts_id(&self, session_id: &str) -> bool {
        self.id.as_deref().is_none_or(|id| id == session_id)
    }

    /// Caller validates the manifest and checks the session is uninitialized.
    pub(crate) fn initialize(&mut self, session_id: String, manifest: Manifest) {
        debug_assert!(!self.is_initialized());
        self.id = Some(session_id);
        self.step_counter = 0;
        self.config = manifest.config;
        self.steps = manifest.steps;
        self.status = SessionStatus::Ready;
    }

    /// Returns the new counter value.
    pub(crate) fn record_success(&mut self) -> u64 {
        self.step_counter += 1;
        self.status = SessionStatus::Running;
        self.step_counter
    }

    pub(crate) fn record_failure(&mut self, fatal: bool) {
        self.status = if fatal {
            SessionStatus::Failed
        } else {
            SessionStatus::Running
        };
    }

    pub(crate) fn complete(&mut self) {
        self.status = SessionStatus::Complete;
    }
}
