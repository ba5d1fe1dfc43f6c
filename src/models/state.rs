//! Connection state shared by both channel sides.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Lifecycle state of one side of a channel.
///
/// The only forward path is `Disconnected -> Connecting -> Connected`;
/// every state may fall back to `Disconnected`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No peer is held.
    #[default]
    Disconnected,
    /// Bind or reply-path setup is in flight.
    Connecting,
    /// A live peer is held and its death monitor is armed.
    Connected,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connecting | Self::Connected, Self::Disconnected)
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}
