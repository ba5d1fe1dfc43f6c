//! Channel message schema and out-of-band request types.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Discriminant of a connect message on the wire.
pub const WHAT_CONNECT: i32 = 0;
/// Discriminant of a data message on the wire.
pub const WHAT_MESSAGE: i32 = 1;
/// Key of the optional string payload inside a wire unit's `data` bundle.
pub const PAYLOAD_KEY: &str = "tether.payload";

/// Reserved request action that starts the service.
pub const ACTION_START: &str = "tether.action.START";
/// Reserved request action that stops the service.
pub const ACTION_STOP: &str = "tether.action.STOP";

/// Opaque address a message recipient uses to reply to the sender.
///
/// The recipient borrows it: it may send through it but the sender owns
/// the underlying endpoint and its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyPath(String);

impl ReplyPath {
    /// Wrap a transport-specific address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Transport-specific address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReplyPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a channel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Handshake carrying the sender's reply path.
    Connect,
    /// Application data.
    Data,
}

impl MessageKind {
    /// Wire discriminant for this kind.
    #[must_use]
    pub fn what(self) -> i32 {
        match self {
            Self::Connect => WHAT_CONNECT,
            Self::Data => WHAT_MESSAGE,
        }
    }
}

/// A decoded channel message.
///
/// A connect message always carries a reply path; a data message always
/// carries both integer arguments while its payload is independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake telling the receiver how to reach the sender.
    Connect {
        /// Where replies for the sender should go.
        reply_path: ReplyPath,
    },
    /// Application data.
    Data {
        /// First integer argument.
        arg1: i32,
        /// Second integer argument.
        arg2: i32,
        /// Optional text payload.
        payload: Option<String>,
    },
}

impl Message {
    /// Build a connect message.
    #[must_use]
    pub fn connect(reply_path: ReplyPath) -> Self {
        Self::Connect { reply_path }
    }

    /// Build a data message.
    #[must_use]
    pub fn data(arg1: i32, arg2: i32, payload: Option<String>) -> Self {
        Self::Data {
            arg1,
            arg2,
            payload,
        }
    }

    /// Kind of this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Connect { .. } => MessageKind::Connect,
            Self::Data { .. } => MessageKind::Data,
        }
    }
}

/// Application-defined out-of-band request for the service's generic intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    /// Action verb; [`ACTION_START`] and [`ACTION_STOP`] are reserved.
    pub action: String,
    /// Free-form request parameters.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl RawRequest {
    /// Build a request with no extras.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            extras: serde_json::Map::new(),
        }
    }

    /// Attach one extra parameter.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Whether the action is one of the reserved lifecycle actions.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        self.action == ACTION_START || self.action == ACTION_STOP
    }
}

/// Marker returned by a service that asks to be kept in the foreground.
///
/// The channel forwards it to the hosting process untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundIndicator {
    /// Short label describing the foreground work.
    pub label: String,
}

impl ForegroundIndicator {
    /// Build an indicator with the given label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}
