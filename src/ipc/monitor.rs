//! Peer-death monitoring.
//!
//! [`DeathWatch`] is the host primitive: it links a one-shot callback to
//! the demise of a bound peer. [`LinkDeathWatch`] implements it on top of
//! a [`PeerRef`]'s liveness signal. [`PeerDeathMonitor`] is what each
//! channel side owns: at most one armed registration, disarmed exactly
//! once on clean teardown so no death callback can fire after the logical
//! connection is gone.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ipc::peer::{PeerId, PeerRef};
use crate::{AppError, Result};

/// Callback run once when a watched peer dies.
pub type DeathCallback = Box<dyn FnOnce() + Send + 'static>;

/// Host primitive that reports abrupt termination of a bound peer.
pub trait DeathWatch: Send + Sync {
    /// Link `callback` to the death of `peer`.
    ///
    /// The callback runs at most once, and never after
    /// [`unregister`](Self::unregister) for the same peer has returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PeerUnreachable` if `peer` is already dead; the
    /// callback is dropped without running.
    fn register(&self, peer: &PeerRef, callback: DeathCallback) -> Result<()>;

    /// Remove the registration for `peer`. Unknown peers are ignored.
    fn unregister(&self, peer: &PeerRef);
}

/// [`DeathWatch`] driven by the peer's liveness token.
///
/// Each registration runs a small task that waits for either the peer's
/// liveness token or its own unlink token.
#[derive(Debug, Default)]
pub struct LinkDeathWatch {
    links: Arc<Mutex<HashMap<PeerId, (u64, CancellationToken)>>>,
    generation: AtomicU64,
}

impl LinkDeathWatch {
    /// Shared instance suitable for [`PeerDeathMonitor::new`].
    #[must_use]
    pub fn shared() -> Arc<dyn DeathWatch> {
        Arc::new(Self::default())
    }
}

impl DeathWatch for LinkDeathWatch {
    fn register(&self, peer: &PeerRef, callback: DeathCallback) -> Result<()> {
        if !peer.is_alive() {
            return Err(AppError::PeerUnreachable(format!(
                "{} died before it could be linked",
                peer.id()
            )));
        }

        let id = peer.id();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let unlink = CancellationToken::new();
        if let Some((_, previous)) = self.links.lock().insert(id, (generation, unlink.clone())) {
            previous.cancel();
        }

        let links = Arc::clone(&self.links);
        let liveness = peer.liveness().clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                () = unlink.cancelled() => {
                    debug!(peer = %id, "death link removed");
                }

                () = liveness.cancelled() => {
                    let still_linked = {
                        let mut links = links.lock();
                        match links.get(&id) {
                            Some((current, _)) if *current == generation => {
                                links.remove(&id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if still_linked {
                        info!(peer = %id, "peer died");
                        callback();
                    }
                }
            }
        });

        Ok(())
    }

    fn unregister(&self, peer: &PeerRef) {
        if let Some((_, unlink)) = self.links.lock().remove(&peer.id()) {
            unlink.cancel();
        }
    }
}

/// One side's death monitor: a single optional registration.
pub struct PeerDeathMonitor {
    watch: Arc<dyn DeathWatch>,
    armed: Mutex<Option<PeerRef>>,
}

impl Debug for PeerDeathMonitor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDeathMonitor")
            .field("armed", &self.armed_peer())
            .finish_non_exhaustive()
    }
}

impl PeerDeathMonitor {
    /// Create an unarmed monitor over the given primitive.
    #[must_use]
    pub fn new(watch: Arc<dyn DeathWatch>) -> Self {
        Self {
            watch,
            armed: Mutex::new(None),
        }
    }

    /// Register `callback` against `peer`, replacing any earlier registration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PeerUnreachable` if `peer` is already dead. The
    /// monitor is left unarmed and the callback never runs.
    pub fn arm(&self, peer: &PeerRef, callback: DeathCallback) -> Result<()> {
        let mut armed = self.armed.lock();
        if let Some(previous) = armed.take() {
            self.watch.unregister(&previous);
        }
        self.watch.register(peer, callback)?;
        debug!(peer = %peer.id(), "death monitor armed");
        *armed = Some(peer.clone());
        Ok(())
    }

    /// Remove the current registration.
    ///
    /// Returns `true` if a registration was removed; disarming an unarmed
    /// monitor is a no-op returning `false`.
    pub fn disarm(&self) -> bool {
        let Some(peer) = self.armed.lock().take() else {
            return false;
        };
        self.watch.unregister(&peer);
        debug!(peer = %peer.id(), "death monitor disarmed");
        true
    }

    /// Forget the registration for `id` after its callback has fired.
    ///
    /// The primitive already consumed the registration, so it is not
    /// unregistered again.
    pub fn release(&self, id: PeerId) -> bool {
        let mut armed = self.armed.lock();
        if armed.as_ref().is_some_and(|peer| peer.id() == id) {
            *armed = None;
            true
        } else {
            false
        }
    }

    /// Peer currently armed, if any.
    #[must_use]
    pub fn armed_peer(&self) -> Option<PeerId> {
        self.armed.lock().as_ref().map(PeerRef::id)
    }
}
