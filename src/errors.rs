//! Error types shared across the channel.

use std::fmt::{Display, Formatter};

use crate::ipc::codec::DecodeError;

/// Shared channel result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every channel failure mode.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Wire unit could not be framed, parsed, or decoded.
    Codec(String),
    /// Host transport failure (process launch, bind, socket setup).
    Transport(String),
    /// Remote peer is torn down or already dead.
    PeerUnreachable(String),
    /// Operation requires an established connection.
    NotConnected,
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::PeerUnreachable(msg) => write!(f, "peer unreachable: {msg}"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
