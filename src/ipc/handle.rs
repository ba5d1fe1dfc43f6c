//! Client-side channel handle.
//!
//! A [`ChannelHandle`] is owned by a short-lived client. It starts and
//! binds the named background service, hands it a reply path in a connect
//! message, and reports lifecycle and inbound messages through a
//! [`PeerListener`].
//!
//! Listener callbacks for inbound messages and peer death run on the
//! handle's dispatch task; the connected and disconnected callbacks run
//! inside [`ChannelHandle::connect`] and [`ChannelHandle::disconnect`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::channel::{ChannelCore, Establish};
use crate::ipc::codec::encode;
use crate::ipc::dispatch::{run_dispatcher, Dispatch, Event, Inbound};
use crate::ipc::monitor::{DeathWatch, LinkDeathWatch};
use crate::ipc::peer::PeerRef;
use crate::ipc::transport::{ClientTransport, ServiceTarget};
use crate::models::message::{Message, RawRequest, ReplyPath};
use crate::models::state::ConnectionState;
use crate::Result;

/// Receiver of a handle's lifecycle and message events.
pub trait PeerListener: Send + Sync {
    /// The connection to the service is established.
    fn on_peer_connected(&self);

    /// The connection was closed by [`ChannelHandle::disconnect`].
    fn on_peer_disconnected(&self);

    /// The service vanished without a clean disconnect.
    fn on_peer_died(&self);

    /// A data message arrived while connected.
    fn on_message(&self, arg1: i32, arg2: i32, payload: Option<String>);
}

struct HandleDispatch<L> {
    core: Arc<ChannelCore>,
    listener: Arc<L>,
}

impl<L: PeerListener> Dispatch for HandleDispatch<L> {
    fn dispatch(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match event {
                Event::Message(Message::Data {
                    arg1,
                    arg2,
                    payload,
                }) => {
                    if self.core.is_connected() {
                        self.listener.on_message(arg1, arg2, payload);
                    } else {
                        debug!("handle: dropping message received while not connected");
                    }
                }
                Event::Message(Message::Connect { reply_path }) => {
                    debug!(%reply_path, "handle: ignoring connect message");
                }
                Event::Request(request) => {
                    debug!(action = %request.action, "handle: ignoring raw request");
                }
                Event::PeerDied(peer) => {
                    if self.core.peer_died(peer) {
                        info!(peer = %peer, "service died");
                        self.listener.on_peer_died();
                    }
                }
            }
        })
    }
}

/// Client side of the channel.
pub struct ChannelHandle<T, L> {
    target: ServiceTarget,
    transport: Arc<T>,
    listener: Arc<L>,
    core: Arc<ChannelCore>,
    inbound: mpsc::UnboundedSender<Inbound>,
    reply_path: Mutex<Option<ReplyPath>>,
    dispatcher: CancellationToken,
}

impl<T, L> ChannelHandle<T, L>
where
    T: ClientTransport + 'static,
    L: PeerListener + 'static,
{
    /// Create a disconnected handle for `target`.
    ///
    /// Starts the handle's dispatch task, so it must be called from within
    /// a tokio runtime.
    #[must_use]
    pub fn new(target: ServiceTarget, transport: Arc<T>, listener: Arc<L>) -> Self {
        Self::with_death_watch(target, transport, listener, LinkDeathWatch::shared())
    }

    /// Like [`new`](Self::new) with an explicit death primitive.
    #[must_use]
    pub fn with_death_watch(
        target: ServiceTarget,
        transport: Arc<T>,
        listener: Arc<L>,
        watch: Arc<dyn DeathWatch>,
    ) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        let core = Arc::new(ChannelCore::new("handle", watch, inbound.clone()));
        let dispatcher = CancellationToken::new();

        let dispatch = Arc::new(HandleDispatch {
            core: Arc::clone(&core),
            listener: Arc::clone(&listener),
        });
        tokio::spawn(run_dispatcher("handle", dispatch, rx, dispatcher.clone()));

        Self {
            target,
            transport,
            listener,
            core,
            inbound,
            reply_path: Mutex::new(None),
            dispatcher,
        }
    }

    /// Service this handle connects to.
    #[must_use]
    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    /// The listener.
    #[must_use]
    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Whether the service is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Whether the handle currently has a death monitor armed.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.core.monitor().armed_peer().is_some()
    }

    /// Start, bind, and connect to the service.
    ///
    /// A no-op unless disconnected. On success the listener sees either
    /// `on_peer_connected`, or `on_peer_died` if the service vanished
    /// during the handshake.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the service could not be started or
    /// bound; the handle is back to `Disconnected` and no callback runs.
    pub async fn connect(&self) -> Result<()> {
        if !self.core.begin_connecting() {
            debug!(service = self.target.name(), state = %self.core.state(), "connect ignored");
            return Ok(());
        }

        let (peer, reply_path) = match self.bind_service().await {
            Ok(bound) => bound,
            Err(err) => {
                warn!(service = self.target.name(), error = %err, "bind failed");
                self.core.abort_connecting();
                return Err(err);
            }
        };

        if let Err(err) = peer.deliver(encode(&Message::connect(reply_path))) {
            info!(service = self.target.name(), error = %err, "service gone before handshake");
            if self.core.abort_connecting() {
                self.listener.on_peer_died();
            }
            if let Err(err) = self.transport.unbind(&self.target).await {
                debug!(error = %err, "unbind after failed handshake failed");
            }
            return Ok(());
        }

        match self.core.establish(peer) {
            Establish::Connected => {
                info!(service = self.target.name(), "service connected");
                self.listener.on_peer_connected();
            }
            Establish::PeerGone => {
                info!(service = self.target.name(), "service died during connect");
                self.listener.on_peer_died();
            }
            Establish::Superseded => {
                if let Err(err) = self.transport.unbind(&self.target).await {
                    debug!(error = %err, "unbind after superseded connect failed");
                }
            }
        }
        Ok(())
    }

    /// Unbind from and stop the service.
    ///
    /// A no-op when already disconnected. Both teardown steps are attempted
    /// even if one fails; failures are logged, not returned.
    pub async fn disconnect(&self) {
        if !self.core.teardown() {
            debug!(service = self.target.name(), "disconnect ignored: already disconnected");
            return;
        }

        if let Err(err) = self.transport.unbind(&self.target).await {
            warn!(service = self.target.name(), error = %err, "unbind failed");
        }
        if let Err(err) = self.transport.stop_process(&self.target).await {
            warn!(service = self.target.name(), error = %err, "stop request failed");
        }

        info!(service = self.target.name(), "service disconnected");
        self.listener.on_peer_disconnected();
    }

    /// Send a data message to the service.
    ///
    /// Returns `false` when not connected, when the message is too large
    /// to frame, or when the service is gone.
    pub fn send(&self, arg1: i32, arg2: i32, payload: Option<String>) -> bool {
        self.core.send(arg1, arg2, payload)
    }

    /// Send a data message, reporting why it was not handed to the transport.
    ///
    /// # Errors
    ///
    /// See [`ChannelCore::try_send`].
    pub fn try_send(&self, arg1: i32, arg2: i32, payload: Option<String>) -> Result<()> {
        self.core.try_send(arg1, arg2, payload)
    }

    /// Deliver an out-of-band request to the service's intake.
    ///
    /// Requests carrying a reserved lifecycle action are dropped.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the intake cannot be reached.
    pub async fn send_raw(&self, request: RawRequest) -> Result<()> {
        if request.is_lifecycle() {
            debug!(action = %request.action, "dropping reserved lifecycle action");
            return Ok(());
        }
        self.transport.send_request(&self.target, request).await
    }

    async fn bind_service(&self) -> Result<(PeerRef, ReplyPath)> {
        self.transport.start_process(&self.target).await?;
        let reply_path = self.ensure_reply_path().await?;
        let peer = self.transport.bind(&self.target).await?;
        Ok((peer, reply_path))
    }

    async fn ensure_reply_path(&self) -> Result<ReplyPath> {
        let mut slot = self.reply_path.lock().await;
        if let Some(ref path) = *slot {
            return Ok(path.clone());
        }
        let path = self.transport.open_reply_path(self.inbound.clone()).await?;
        debug!(reply_path = %path, "reply path opened");
        *slot = Some(path.clone());
        Ok(path)
    }
}

impl<T, L> Drop for ChannelHandle<T, L> {
    fn drop(&mut self) {
        self.core.teardown();
        self.dispatcher.cancel();
    }
}
