//! Bound peer references.
//!
//! A [`PeerRef`] is what a side holds after binding to (or being given a
//! reply path for) a remote peer. It pairs a single-writer outbound queue
//! with a liveness signal the host transport trips when it detects that
//! the remote communication endpoint is gone.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::WireUnit;
use crate::{AppError, Result};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a peer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Handle to a bound remote peer.
///
/// Clones share the same outbound queue and liveness signal.
#[derive(Debug, Clone)]
pub struct PeerRef {
    id: PeerId,
    outbound: mpsc::UnboundedSender<WireUnit>,
    liveness: CancellationToken,
}

impl PeerRef {
    /// Wrap a transport's outbound queue and liveness signal.
    ///
    /// The transport drains `outbound` from a single writer task and
    /// cancels `liveness` once the remote endpoint is gone.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<WireUnit>, liveness: CancellationToken) -> Self {
        Self {
            id: PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)),
            outbound,
            liveness,
        }
    }

    /// Identifier of this reference.
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Whether the remote endpoint is still believed alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.liveness.is_cancelled() && !self.outbound.is_closed()
    }

    /// Liveness signal; cancelled when the remote endpoint is gone.
    #[must_use]
    pub fn liveness(&self) -> &CancellationToken {
        &self.liveness
    }

    /// Hand a wire unit to the transport's writer.
    ///
    /// One-way and ordered; completes as soon as the unit is queued.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PeerUnreachable` if the peer is already gone or
    /// its writer has shut down.
    pub fn deliver(&self, unit: WireUnit) -> Result<()> {
        if self.liveness.is_cancelled() {
            return Err(AppError::PeerUnreachable(format!("{} is gone", self.id)));
        }
        self.outbound
            .send(unit)
            .map_err(|_| AppError::PeerUnreachable(format!("{} writer closed", self.id)))
    }
}
