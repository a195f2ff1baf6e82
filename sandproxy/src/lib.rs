//! sandproxy: drive a long-lived, isolated worker over a line-oriented channel.

pub mod bridge;
pub mod collector;
pub mod config;
pub mod engine;
pub mod host;
pub mod scripted;
pub mod session;
pub mod spawn;
pub mod telemetry;
pub mod worker;

pub use collector::{CollectorError, LogCollector, LogCounts, LogRecord, read_log};
pub use config::{ConfigError, HostConfig};
pub use engine::WorkerEngine;
pub use host::{HostController, HostError, HostSession, HostStats, StopSummary};
pub use scripted::ScriptedRunner;
pub use session::{Session, SessionStatus};
pub use spawn::{
    InProcessSpawner, ProcessSpawner, SpawnError, WorkerChannel, WorkerExit, WorkerHandle,
    WorkerSpawner,
};
pub use worker::{Emitter, StepError, StepRequest, StepRunner, run_stdio_worker, run_worker};
