//! Line-delimited JSON codec for the worker channel.
//!
//! Uses LinesCodec for framing + serde_json for serialization. Each message is
//! one JSON object on its own line, so a streaming reader can demarcate
//! messages without a length prefix.
//!
//! Decoding never fails on bad content: a line that is not a well-formed
//! message comes out as [`Frame::Malformed`] and the stream resumes at the
//! next newline. Only transport I/O errors end the stream.

use std::io;
use std::marker::PhantomData;

use serde::Serialize;
use serde_json::Value;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::Tagged;

/// Upper bound on a single line. Longer lines are discarded as malformed.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Why a line could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing string discriminator field '{0}'")]
    MissingDiscriminator(&'static str),

    /// Known kind, but its fields do not match the expected shape.
    #[error("invalid '{kind}' message: {reason}")]
    InvalidFields { kind: String, reason: String },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    Message(T),
    /// Well-formed object whose discriminator names a kind this side does not know.
    Unknown { kind: String },
    Malformed(MalformedMessage),
}

/// Decode a single line (without its terminator).
pub fn decode_line<T: Tagged>(line: &str) -> Frame<T> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Frame::Malformed(MalformedMessage::InvalidJson(e.to_string())),
    };

    let Value::Object(ref object) = value else {
        return Frame::Malformed(MalformedMessage::NotAnObject);
    };

    let Some(kind) = object.get(T::TAG).and_then(Value::as_str) else {
        return Frame::Malformed(MalformedMessage::MissingDiscriminator(T::TAG));
    };

    if !T::KINDS.contains(&kind) {
        return Frame::Unknown {
            kind: kind.to_string(),
        };
    }

    let kind = kind.to_string();
    match serde_json::from_value(value) {
        Ok(msg) => Frame::Message(msg),
        Err(e) => Frame::Malformed(MalformedMessage::InvalidFields {
            kind,
            reason: e.to_string(),
        }),
    }
}

/// Codec that frames messages by newline and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization plus discriminator
/// checks.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    max_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            _phantom: PhantomData,
        }
    }

    fn frame<M: Tagged>(
        &self,
        line: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Option<Frame<M>>>, io::Error> {
        // Outer None: need more bytes. Inner None: blank line, keep going.
        match line {
            Ok(Some(line)) if line.trim().is_empty() => Ok(Some(None)),
            Ok(Some(line)) => Ok(Some(Some(decode_line(&line)))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Some(Frame::Malformed(
                MalformedMessage::LineTooLong {
                    max: self.max_length,
                },
            )))),
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Some(Frame::Malformed(MalformedMessage::InvalidUtf8))))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl<T: Tagged> Decoder for JsonLinesCodec<T> {
    type Item = Frame<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self.inner.decode(src);
            match self.frame(line)? {
                Some(Some(frame)) => return Ok(Some(frame)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self.inner.decode_eof(src);
            match self.frame(line)? {
                Some(Some(frame)) => return Ok(Some(frame)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding line");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large line being encoded"
            );
        }
        self.inner.encode(json, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            LinesCodecError::MaxLineLengthExceeded => {
                io::Error::new(io::ErrorKind::InvalidInput, "line exceeds max length")
            }
        })
    }
}
