//! Ordered, single-task dispatch of inbound channel traffic.
//!
//! Each channel side owns one unbounded [`Inbound`] queue. The transport
//! pushes raw wire units and service requests into it, and the death
//! monitor pushes [`Inbound::PeerDied`]. [`run_dispatcher`] drains the
//! queue on a single task, decodes wire units, and hands each resulting
//! [`Event`] to the side's [`Dispatch`] implementation one at a time, so
//! application hooks never run concurrently for the same side.
//!
//! Undecodable units are logged and dropped; the loop keeps going.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ipc::codec::{decode, WireUnit};
use crate::ipc::peer::PeerId;
use crate::models::message::{Message, RawRequest};

/// Raw item queued for a channel side.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Wire unit received from a peer.
    Unit(WireUnit),
    /// Out-of-band request received on the service intake.
    Request(RawRequest),
    /// The death monitor fired for this peer.
    PeerDied(PeerId),
}

/// Decoded item handed to a [`Dispatch`] implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A well-formed channel message.
    Message(Message),
    /// An out-of-band request.
    Request(RawRequest),
    /// A bound peer died.
    PeerDied(PeerId),
}

/// Receiver side of a dispatch loop.
pub trait Dispatch: Send + Sync {
    /// Process one event. Runs to completion before the next event.
    fn dispatch(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Drain `inbound` in arrival order until it closes or `cancel` fires.
pub async fn run_dispatcher<D>(
    side: &'static str,
    target: Arc<D>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    cancel: CancellationToken,
) where
    D: Dispatch + ?Sized,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(side, "dispatcher: cancellation received, stopping");
                break;
            }

            item = inbound.recv() => {
                let Some(item) = item else {
                    debug!(side, "dispatcher: inbound queue closed, stopping");
                    break;
                };

                let event = match item {
                    Inbound::Unit(unit) => match decode_unit(side, unit) {
                        Some(message) => Event::Message(message),
                        None => continue,
                    },
                    Inbound::Request(request) => Event::Request(request),
                    Inbound::PeerDied(peer) => Event::PeerDied(peer),
                };

                target.dispatch(event).await;
            }
        }
    }
}

fn decode_unit(side: &'static str, unit: WireUnit) -> Option<Message> {
    let what = unit.what;
    match decode(unit) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(side, what, error = %err, "dispatcher: dropping undecodable wire unit");
            None
        }
    }
}
