//! Echo responder hosted by the `tether-echo` service.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::ipc::channel::ChannelSender;
use crate::ipc::endpoint::ServiceHooks;
use crate::models::message::{ForegroundIndicator, RawRequest};

/// Sends every data message straight back to the client.
#[derive(Debug, Default)]
pub struct EchoHooks {
    foreground: Option<String>,
    echoed: AtomicU64,
}

impl EchoHooks {
    /// Echo responder running as a plain background service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the host to keep the service in the foreground under `label`.
    #[must_use]
    pub fn with_foreground(mut self, label: impl Into<String>) -> Self {
        self.foreground = Some(label.into());
        self
    }

    /// Number of messages echoed back successfully.
    #[must_use]
    pub fn echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

impl ServiceHooks for EchoHooks {
    fn on_service_started(&self) -> Option<ForegroundIndicator> {
        self.foreground.as_deref().map(ForegroundIndicator::new)
    }

    fn on_service_stopped(&self) {
        info!(echoed = self.echoed(), "echo service stopped");
    }

    fn on_peer_connected(&self, _channel: &ChannelSender) {
        info!("client connected");
    }

    fn on_peer_died(&self) {
        info!("client died");
    }

    fn on_message(&self, channel: &ChannelSender, arg1: i32, arg2: i32, payload: Option<String>) {
        debug!(arg1, arg2, "echo message");
        if channel.send(arg1, arg2, payload) {
            self.echoed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_raw_request(&self, request: RawRequest) {
        info!(action = %request.action, extras = request.extras.len(), "raw request ignored");
    }
}
