//! Message codec and line framing for channel traffic.
//!
//! A [`Message`] travels as a [`WireUnit`], a small keyed record modelled on
//! a platform message: a `what` discriminant, two integer arguments, an
//! optional reply path, and a `data` bundle holding the optional payload
//! under [`PAYLOAD_KEY`].
//!
//! On local sockets each wire unit is one JSON object per `\n`-terminated
//! line. [`FrameCodec`] wraps [`LinesCodec`] and drops lines over 1 MiB.

use std::fmt::{Display, Formatter};
use std::io;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::models::message::{Message, ReplyPath, PAYLOAD_KEY, WHAT_CONNECT, WHAT_MESSAGE};
use crate::{AppError, Result};

/// Maximum line length accepted by [`FrameCodec`]: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Transport-level container a [`Message`] is encoded into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireUnit {
    /// Message kind discriminant.
    pub what: i32,
    /// First integer argument.
    #[serde(default)]
    pub arg1: i32,
    /// Second integer argument.
    #[serde(default)]
    pub arg2: i32,
    /// Reply address, set on connect messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Keyed extras; carries the optional payload.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl WireUnit {
    /// Parse one JSON line into a wire unit.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Malformed`] if the line is not a JSON object
    /// with an integer `what` field.
    pub fn from_line(line: &str) -> std::result::Result<Self, DecodeError> {
        serde_json::from_str(line).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Serialise into a single JSON line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Codec` if serialisation fails.
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Codec(format!("failed to serialise wire unit: {e}")))
    }
}

/// Why a wire unit could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The `what` discriminant is not a known message kind.
    UnknownKind(i32),
    /// A connect unit arrived without a reply path.
    MissingReplyPath,
    /// The payload entry exists but is not a string.
    InvalidPayload,
    /// The raw line is not a wire unit at all.
    Malformed(String),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownKind(what) => write!(f, "unknown message kind {what}"),
            Self::MissingReplyPath => write!(f, "connect message without reply path"),
            Self::InvalidPayload => write!(f, "payload is not a string"),
            Self::Malformed(msg) => write!(f, "malformed wire unit: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a message. The schema is closed, so encoding cannot fail.
#[must_use]
pub fn encode(message: &Message) -> WireUnit {
    match message {
        Message::Connect { reply_path } => WireUnit {
            what: WHAT_CONNECT,
            reply_to: Some(reply_path.as_str().to_owned()),
            ..WireUnit::default()
        },
        Message::Data {
            arg1,
            arg2,
            payload,
        } => {
            let mut data = serde_json::Map::new();
            if let Some(text) = payload {
                data.insert(
                    PAYLOAD_KEY.to_owned(),
                    serde_json::Value::String(text.clone()),
                );
            }
            WireUnit {
                what: WHAT_MESSAGE,
                arg1: *arg1,
                arg2: *arg2,
                reply_to: None,
                data,
            }
        }
    }
}

/// Decode a wire unit.
///
/// An absent `data` bundle or payload entry decodes to `payload: None`.
/// Data units ignore any stray `reply_to`; connect units ignore the
/// integer arguments and the bundle.
///
/// # Errors
///
/// - [`DecodeError::UnknownKind`] for an unrecognised `what`.
/// - [`DecodeError::MissingReplyPath`] for a connect unit without `reply_to`.
/// - [`DecodeError::InvalidPayload`] when the payload entry is not a string.
pub fn decode(mut unit: WireUnit) -> std::result::Result<Message, DecodeError> {
    match unit.what {
        WHAT_CONNECT => {
            let reply_to = unit
                .reply_to
                .filter(|path| !path.is_empty())
                .ok_or(DecodeError::MissingReplyPath)?;
            Ok(Message::connect(ReplyPath::new(reply_to)))
        }
        WHAT_MESSAGE => {
            let payload = match unit.data.remove(PAYLOAD_KEY) {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(text)) => Some(text),
                Some(_) => return Err(DecodeError::InvalidPayload),
            };
            Ok(Message::data(unit.arg1, unit.arg2, payload))
        }
        other => Err(DecodeError::UnknownKind(other)),
    }
}

/// Newline framing for local-socket streams.
///
/// Lines longer than [`MAX_LINE_BYTES`] and lines that are not UTF-8 are
/// logged and skipped; the stream stays usable. Only I/O failures surface
/// as errors.
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Ok(line) => return Ok(line),
                Err(err) => skip_or_fail(err)?,
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src) {
                Ok(line) => return Ok(line),
                Err(err) => skip_or_fail(err)?,
            }
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        if item.len() > MAX_LINE_BYTES {
            return Err(AppError::Codec(format!(
                "line too long: exceeded {MAX_LINE_BYTES} bytes"
            )));
        }
        self.0.encode(item, dst).map_err(|err| match err {
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
            LinesCodecError::MaxLineLengthExceeded => {
                AppError::Codec(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
            }
        })
    }
}

/// `LinesCodec` has already consumed (or started discarding) the offending
/// line when it reports these, so decoding can resume at the next line.
fn skip_or_fail(err: LinesCodecError) -> Result<()> {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            warn!(limit = MAX_LINE_BYTES, "frame codec: skipping oversized line");
            Ok(())
        }
        LinesCodecError::Io(io_err) if io_err.kind() == io::ErrorKind::InvalidData => {
            warn!(error = %io_err, "frame codec: skipping non-UTF-8 line");
            Ok(())
        }
        LinesCodecError::Io(io_err) => Err(AppError::Io(io_err.to_string())),
    }
}
