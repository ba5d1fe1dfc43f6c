//! Service-side channel endpoint.
//!
//! A [`ChannelEndpoint`] lives for as long as its hosting process. It holds
//! at most one connected client, learned from that client's connect
//! message, and drives the application's [`ServiceHooks`] from a single
//! dispatch task.
//!
//! Out-of-band requests share the same queue: [`ACTION_START`] and
//! [`ACTION_STOP`] drive [`ChannelEndpoint::start`] and
//! [`ChannelEndpoint::stop`]; every other action reaches
//! [`ServiceHooks::on_raw_request`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ipc::channel::{ChannelCore, ChannelSender, Establish};
use crate::ipc::dispatch::{run_dispatcher, Dispatch, Event, Inbound};
use crate::ipc::monitor::DeathWatch;
use crate::ipc::transport::ReplyConnector;
use crate::models::message::{
    ForegroundIndicator, Message, RawRequest, ReplyPath, ACTION_START, ACTION_STOP,
};
use crate::models::state::ConnectionState;

/// Application logic hosted behind an endpoint.
///
/// All hooks run on the endpoint's dispatch task; a hook that blocks
/// holds up every later message.
pub trait ServiceHooks: Send + Sync {
    /// The service received its start action. Return an indicator to ask
    /// the hosting process to keep the service in the foreground.
    fn on_service_started(&self) -> Option<ForegroundIndicator>;

    /// The service received its stop action and is about to terminate.
    fn on_service_stopped(&self);

    /// A client connected; `channel` can reach it.
    fn on_peer_connected(&self, channel: &ChannelSender);

    /// The connected client died, or was already dead when it connected.
    fn on_peer_died(&self);

    /// A data message arrived.
    fn on_message(&self, channel: &ChannelSender, arg1: i32, arg2: i32, payload: Option<String>);

    /// A non-lifecycle request arrived on the intake.
    fn on_raw_request(&self, request: RawRequest);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Service side of the channel.
pub struct ChannelEndpoint<H, C> {
    hooks: H,
    connector: C,
    core: Arc<ChannelCore>,
    sender: ChannelSender,
    inbound: mpsc::UnboundedSender<Inbound>,
    lifecycle: Mutex<Lifecycle>,
    foreground: Mutex<Option<ForegroundIndicator>>,
    shutdown: CancellationToken,
}

impl<H, C> ChannelEndpoint<H, C>
where
    H: ServiceHooks + 'static,
    C: ReplyConnector + 'static,
{
    /// Create an endpoint and the receiving half of its inbound queue.
    ///
    /// Feed the receiver to [`run_dispatcher`], or use [`spawn`](Self::spawn).
    #[must_use]
    pub fn new(
        hooks: H,
        connector: C,
        watch: Arc<dyn DeathWatch>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let core = Arc::new(ChannelCore::new("endpoint", watch, inbound.clone()));
        let endpoint = Arc::new(Self {
            hooks,
            connector,
            sender: ChannelSender::new(Arc::clone(&core)),
            core,
            inbound,
            lifecycle: Mutex::new(Lifecycle::Idle),
            foreground: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        (endpoint, rx)
    }

    /// Create an endpoint and start its dispatch task.
    ///
    /// The task ends once [`stop`](Self::stop) has run. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn spawn(hooks: H, connector: C, watch: Arc<dyn DeathWatch>) -> (Arc<Self>, JoinHandle<()>) {
        let (endpoint, rx) = Self::new(hooks, connector, watch);
        let task = tokio::spawn(run_dispatcher(
            "endpoint",
            Arc::clone(&endpoint),
            rx,
            endpoint.shutdown.clone(),
        ));
        (endpoint, task)
    }

    /// Queue that feeds this endpoint's dispatch task.
    #[must_use]
    pub fn inbound(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inbound.clone()
    }

    /// Cancelled once the service has stopped and its host may exit.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The application hooks.
    #[must_use]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Send capability for the connected client.
    #[must_use]
    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Whether a client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Whether the endpoint currently has a death monitor armed.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.core.monitor().armed_peer().is_some()
    }

    /// Foreground indicator returned by the start hook, if any.
    #[must_use]
    pub fn foreground(&self) -> Option<ForegroundIndicator> {
        self.foreground.lock().clone()
    }

    /// Activate the service. Only the first call runs the start hook.
    pub fn start(&self) -> Option<ForegroundIndicator> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Idle {
                debug!(lifecycle = ?*lifecycle, "start ignored");
                return None;
            }
            *lifecycle = Lifecycle::Running;
        }

        let indicator = self.hooks.on_service_started();
        self.foreground.lock().clone_from(&indicator);
        info!(foreground = indicator.is_some(), "service started");
        indicator
    }

    /// Stop the service: drop the client, disarm its death monitor, run the
    /// stop hook, and release the shutdown token. Idempotent.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                debug!("stop ignored: already stopped");
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }

        self.core.teardown();
        self.hooks.on_service_stopped();
        info!("service stopped");
        self.shutdown.cancel();
    }

    /// Send a data message to the connected client.
    pub fn send(&self, arg1: i32, arg2: i32, payload: Option<String>) -> bool {
        self.core.send(arg1, arg2, payload)
    }

    async fn on_connect(&self, reply_path: ReplyPath) {
        if self.core.teardown() {
            debug!("replacing connected client");
        }
        if !self.core.begin_connecting() {
            return;
        }

        let peer = match self.connector.connect_reply(&reply_path).await {
            Ok(peer) => peer,
            Err(err) => {
                warn!(reply_path = %reply_path, error = %err, "client unreachable on connect");
                if self.core.abort_connecting() {
                    self.hooks.on_peer_died();
                }
                return;
            }
        };

        match self.core.establish(peer) {
            Establish::Connected => {
                info!(reply_path = %reply_path, "client connected");
                self.hooks.on_peer_connected(&self.sender);
            }
            Establish::PeerGone => {
                info!(reply_path = %reply_path, "client died before connect completed");
                self.hooks.on_peer_died();
            }
            Establish::Superseded => {}
        }
    }

    fn on_request(&self, request: RawRequest) {
        match request.action.as_str() {
            ACTION_START => {
                if let Some(indicator) = self.start() {
                    info!(label = %indicator.label, "service requested foreground execution");
                }
            }
            ACTION_STOP => self.stop(),
            _ => self.hooks.on_raw_request(request),
        }
    }
}

impl<H, C> Dispatch for ChannelEndpoint<H, C>
where
    H: ServiceHooks + 'static,
    C: ReplyConnector + 'static,
{
    fn dispatch(&self, event: Event) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match event {
                Event::Message(Message::Connect { reply_path }) => self.on_connect(reply_path).await,
                Event::Message(Message::Data {
                    arg1,
                    arg2,
                    payload,
                }) => self.hooks.on_message(&self.sender, arg1, arg2, payload),
                Event::Request(request) => self.on_request(request),
                Event::PeerDied(peer) => {
                    if self.core.peer_died(peer) {
                        self.hooks.on_peer_died();
                    }
                }
            }
        })
    }
}
