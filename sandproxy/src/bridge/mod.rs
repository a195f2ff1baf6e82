//! Channel bridge for host-worker communication.
//!
//! This module provides the wire protocol and codec shared by the host
//! controller and the worker engine.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Command, Response, Event, Metric, WorkerMessage)
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;

pub use codec::{Frame, JsonLinesCodec, MalformedMessage};
pub use protocol::{
    Command, ErrorCode, Event, Manifest, ManifestError, Metric, Response, StepDescriptor,
    StreamItem, WorkerMessage,
};
