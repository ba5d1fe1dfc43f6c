//! Host transport seams.
//!
//! The channel core never talks to sockets or processes directly. The
//! client side consumes a [`ClientTransport`] (process lifecycle, binding,
//! request intake, reply path) and the service side a [`ReplyConnector`]
//! (turning a borrowed reply path into a sendable [`PeerRef`]). The
//! per-peer send primitive is [`PeerRef::deliver`] and the death primitive
//! is [`DeathWatch`](crate::ipc::monitor::DeathWatch).

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::config::ChannelConfig;
use crate::ipc::dispatch::Inbound;
use crate::ipc::peer::PeerRef;
use crate::models::message::{RawRequest, ReplyPath};
use crate::Result;

/// Boxed future returned by transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Named background process a handle connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTarget {
    name: String,
}

impl ServiceTarget {
    /// Target the service registered under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Target the service named by `config.ipc_name`.
    #[must_use]
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.ipc_name.clone())
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Host facilities a client-side handle relies on.
pub trait ClientTransport: Send + Sync {
    /// Ensure the background process is running and deliver the reserved
    /// start action to it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the process cannot be launched or
    /// reached.
    fn start_process<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<()>>;

    /// Deliver the reserved stop action to the background process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the process cannot be reached.
    fn stop_process<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<()>>;

    /// Deliver an arbitrary request to the process's generic intake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the intake cannot be reached.
    fn send_request<'a>(
        &'a self,
        target: &'a ServiceTarget,
        request: RawRequest,
    ) -> BoxFuture<'a, Result<()>>;

    /// Bind to the running process and return a reference to its channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the binding cannot be established.
    fn bind<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<PeerRef>>;

    /// Release the binding created by [`bind`](Self::bind).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the binding cannot be released.
    fn unbind<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<()>>;

    /// Open an address peers can reply to. Units received on it are pushed
    /// into `inbound` as [`Inbound::Unit`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the address cannot be opened.
    fn open_reply_path(
        &self,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> BoxFuture<'_, Result<ReplyPath>>;
}

/// Service-side facility that reaches a client through its reply path.
pub trait ReplyConnector: Send + Sync {
    /// Connect to `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PeerUnreachable` if nothing answers at `path`.
    fn connect_reply<'a>(&'a self, path: &'a ReplyPath) -> BoxFuture<'a, Result<PeerRef>>;
}
