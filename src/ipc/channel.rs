//! Connection state machine shared by both channel sides.
//!
//! [`ChannelCore`] owns one side's single peer slot, its connection state,
//! and its death monitor. Every transition happens under one lock and is
//! checked against the current state first, so racing callers (an explicit
//! disconnect against a death notification, say) resolve to one winner and
//! the loser becomes a no-op.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ipc::codec::{encode, MAX_LINE_BYTES};
use crate::ipc::dispatch::Inbound;
use crate::ipc::monitor::{DeathCallback, DeathWatch, PeerDeathMonitor};
use crate::ipc::peer::{PeerId, PeerRef};
use crate::models::message::Message;
use crate::models::state::ConnectionState;
use crate::{AppError, Result};

/// Outcome of [`ChannelCore::establish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Establish {
    /// Monitor armed, state is now `Connected`.
    Connected,
    /// The peer was already dead; state is back to `Disconnected`.
    PeerGone,
    /// The side left `Connecting` while the bind was in flight.
    Superseded,
}

#[derive(Debug, Default)]
struct Slot {
    state: ConnectionState,
    peer: Option<PeerRef>,
}

/// One side's peer slot, state, and death monitor.
#[derive(Debug)]
pub struct ChannelCore {
    side: &'static str,
    slot: Mutex<Slot>,
    monitor: PeerDeathMonitor,
    events: mpsc::UnboundedSender<Inbound>,
}

impl ChannelCore {
    /// Create a disconnected core.
    ///
    /// Death notifications are posted to `events` as [`Inbound::PeerDied`]
    /// so they are handled on the side's dispatch task.
    #[must_use]
    pub fn new(
        side: &'static str,
        watch: Arc<dyn DeathWatch>,
        events: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            side,
            slot: Mutex::new(Slot::default()),
            monitor: PeerDeathMonitor::new(watch),
            events,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    /// Whether a live peer is held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Identifier of the held peer, if any.
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        self.slot.lock().peer.as_ref().map(PeerRef::id)
    }

    /// This side's death monitor.
    #[must_use]
    pub fn monitor(&self) -> &PeerDeathMonitor {
        &self.monitor
    }

    /// `Disconnected -> Connecting`. Returns `false` in any other state.
    pub fn begin_connecting(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Disconnected {
            return false;
        }
        self.transition(&mut slot, ConnectionState::Connecting);
        true
    }

    /// Arm the death monitor against `peer` and move to `Connected`.
    ///
    /// Only valid from `Connecting`. If the peer is already dead the side
    /// falls back to `Disconnected` and is never reported connected.
    pub fn establish(&self, peer: PeerRef) -> Establish {
        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Connecting {
            debug!(side = self.side, state = %slot.state, "connect superseded");
            return Establish::Superseded;
        }

        let id = peer.id();
        let events = self.events.clone();
        let side = self.side;
        let on_death: DeathCallback = Box::new(move || {
            if events.send(Inbound::PeerDied(id)).is_err() {
                debug!(side, peer = %id, "dispatcher gone before death could be reported");
            }
        });

        match self.monitor.arm(&peer, on_death) {
            Ok(()) => {
                slot.peer = Some(peer);
                self.transition(&mut slot, ConnectionState::Connected);
                Establish::Connected
            }
            Err(err) => {
                debug!(side = self.side, peer = %id, error = %err, "cannot arm death monitor");
                self.transition(&mut slot, ConnectionState::Disconnected);
                Establish::PeerGone
            }
        }
    }

    /// `Connecting -> Disconnected` after a failed bind.
    pub fn abort_connecting(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ConnectionState::Connecting {
            return false;
        }
        self.transition(&mut slot, ConnectionState::Disconnected);
        true
    }

    /// Clean teardown: disarm, release the peer, move to `Disconnected`.
    ///
    /// Returns `false` if already disconnected.
    pub fn teardown(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state == ConnectionState::Disconnected {
            return false;
        }
        self.monitor.disarm();
        slot.peer = None;
        self.transition(&mut slot, ConnectionState::Disconnected);
        true
    }

    /// Handle a fired death notification for `id`.
    ///
    /// Returns `false` when `id` is not the held peer, which covers
    /// notifications that lost a race with teardown or a reconnect.
    pub fn peer_died(&self, id: PeerId) -> bool {
        let mut slot = self.slot.lock();
        if slot.peer.as_ref().map(PeerRef::id) != Some(id) {
            debug!(side = self.side, peer = %id, "ignoring death of stale peer");
            return false;
        }
        self.monitor.release(id);
        slot.peer = None;
        self.transition(&mut slot, ConnectionState::Disconnected);
        true
    }

    /// Send a data message to the held peer.
    ///
    /// Returns `false` without side effects when not connected, and `false`
    /// when the message cannot reach the peer. Death reporting is left to
    /// the monitor.
    pub fn send(&self, arg1: i32, arg2: i32, payload: Option<String>) -> bool {
        match self.try_send(arg1, arg2, payload) {
            Ok(()) => true,
            Err(err) => {
                debug!(side = self.side, error = %err, "send dropped");
                false
            }
        }
    }

    /// Like [`send`](Self::send), reporting why a message was not handed
    /// to the transport.
    ///
    /// # Errors
    ///
    /// - `AppError::NotConnected` when no live peer is held.
    /// - `AppError::Codec` when the encoded message exceeds
    ///   [`MAX_LINE_BYTES`] and could never be framed.
    /// - `AppError::PeerUnreachable` when the transport reports the peer gone.
    pub fn try_send(&self, arg1: i32, arg2: i32, payload: Option<String>) -> Result<()> {
        let slot = self.slot.lock();
        let Some(peer) = slot
            .peer
            .as_ref()
            .filter(|_| slot.state == ConnectionState::Connected)
        else {
            return Err(AppError::NotConnected);
        };

        let unit = encode(&Message::data(arg1, arg2, payload));
        let encoded = unit.to_line()?.len();
        if encoded > MAX_LINE_BYTES {
            return Err(AppError::Codec(format!(
                "message of {encoded} bytes exceeds the {MAX_LINE_BYTES} byte frame limit"
            )));
        }

        peer.deliver(unit)
    }

    fn transition(&self, slot: &mut Slot, next: ConnectionState) {
        debug_assert!(
            slot.state == next || slot.state.can_transition_to(next),
            "illegal channel transition {} -> {next}",
            slot.state
        );
        debug!(side = self.side, from = %slot.state, to = %next, "channel state transition");
        slot.state = next;
    }
}

/// Cloneable send capability handed to application hooks.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    core: Arc<ChannelCore>,
}

impl ChannelSender {
    /// Wrap a core.
    #[must_use]
    pub fn new(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Send a data message; see [`ChannelCore::send`].
    pub fn send(&self, arg1: i32, arg2: i32, payload: Option<String>) -> bool {
        self.core.send(arg1, arg2, payload)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Whether a live peer is held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}
