//! Built-in step runner driven by step params.
//!
//! Used by the `sandproxy-worker` binary, where real pipeline logic is not
//! linked in. Each step's manifest params are overlaid with the `exec_step`
//! payload and the `action` key selects the behavior:
//!
//! - `noop` (default): one `progress` metric, no output
//! - `work`: `units` progress metrics, optionally `delay_ms` apart
//! - `sleep`: wait `ms` milliseconds
//! - `fail`: fail with `message`, fatal when `fatal` is set
//! - `exit`: emit an `exiting` event, then terminate the process with `code`

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::worker::{Emitter, StepError, StepRequest, StepRunner};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Script {
    Noop,
    Work {
        #[serde(default = "default_units")]
        units: u32,
        #[serde(default)]
        delay_ms: u64,
    },
    Sleep {
        ms: u64,
    },
    Fail {
        #[serde(default = "default_fail_message")]
        message: String,
        #[serde(default)]
        fatal: bool,
    },
    Exit {
        #[serde(default = "default_exit_code")]
        code: i32,
        #[serde(default = "default_exit_delay")]
        delay_ms: u64,
    },
}

fn default_units() -> u32 {
    1
}

fn default_fail_message() -> String {
    "step failed".to_string()
}

fn default_exit_code() -> i32 {
    1
}

fn default_exit_delay() -> u64 {
    50
}

impl Script {
    /// Payload keys override manifest params.
    fn resolve(params: &Value, payload: &Value) -> Result<Self, StepError> {
        let mut merged = serde_json::Map::new();
        for source in [params, payload] {
            match source {
                Value::Object(map) => {
                    merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Value::Null => {}
                other => {
                    return Err(StepError::recoverable(format!(
                        "step params must be an object, got {other}"
                    )));
                }
            }
        }
        merged
            .entry("action")
            .or_insert_with(|| Value::String("noop".to_string()));

        serde_json::from_value(Value::Object(merged))
            .map_err(|e| StepError::recoverable(format!("invalid step script: {e}")))
    }
}

pub struct ScriptedRunner {
    allow_exit: bool,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    /// Runner that refuses `exit` (safe to embed in-process).
    pub fn new() -> Self {
        Self { allow_exit: false }
    }

    /// Runner for a dedicated worker process, where `exit` may end the process.
    pub fn for_process() -> Self {
        Self { allow_exit: true }
    }
}

#[async_trait::async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(&self, step: StepRequest, emitter: &Emitter) -> Result<Value, StepError> {
        let script = Script::resolve(&step.params, &step.payload)?;
        tracing::debug!(step_id = %step.step_id, ?script, "Running scripted step");

        match script {
            Script::Noop => {
                emitter.metric("progress", 1.0).ok();
                Ok(Value::Null)
            }
            Script::Work { units, delay_ms } => {
                for unit in 1..=units {
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    emitter
                        .metric("progress", f64::from(unit) / f64::from(units))
                        .ok();
                }
                Ok(json!({"units": units}))
            }
            Script::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"slept_ms": ms}))
            }
            Script::Fail { message, fatal } => Err(StepError { message, fatal }),
            Script::Exit { code, delay_ms } => {
                if !self.allow_exit {
                    return Err(StepError::fatal(
                        "exit action is only available in a worker process",
                    ));
                }
                emitter.event("exiting", json!({"code": code})).ok();
                // Give the output forwarder a chance to flush the event first.
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                tracing::warn!(code, "Exiting worker process from step");
                std::process::exit(code);
            }
        }
    }
}
