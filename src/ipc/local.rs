//! Local-socket host transport.
//!
//! Services listen on two namespaced local sockets: the binding socket,
//! named after the service, and the request intake at `<name>.intake`.
//! Clients own a reply socket with a unique name and hand that name to
//! the service in their connect message; the service dials it to reply.
//!
//! Every connection carries traffic one way only. The side that writes
//! keeps reading its half of the stream purely to notice end-of-stream,
//! which is how the death of the remote process is detected.
//!
//! ## Intake protocol
//!
//! One [`RawRequest`] JSON object per line; the service answers each with
//! one [`IntakeReply`] line:
//!
//! ```json
//! {"action": "tether.action.START"}
//! {"ok": true}
//! ```

use std::collections::HashMap;
use std::io;
use std::process::Stdio;

use futures_util::StreamExt;
use interprocess::local_socket::tokio::{prelude::*, SendHalf};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions, Name, ToNsName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChannelConfig, INTAKE_SUFFIX};
use crate::ipc::codec::{FrameCodec, WireUnit};
use crate::ipc::dispatch::Inbound;
use crate::ipc::peer::PeerRef;
use crate::ipc::transport::{BoxFuture, ClientTransport, ServiceTarget};
use crate::models::message::{RawRequest, ReplyPath, ACTION_START, ACTION_STOP};
use crate::{AppError, Result};

/// Prefix of client reply socket names.
pub const REPLY_PREFIX: &str = "tether-reply-";

/// Answer written by the service for each intake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeReply {
    /// Whether the request was queued.
    pub ok: bool,
    /// Reason for rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntakeReply {
    /// Request accepted.
    #[must_use]
    pub fn accepted() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// Request rejected with `reason`.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(reason.into()),
        }
    }
}

/// Intake socket name of the service registered as `service`.
#[must_use]
pub fn intake_name(service: &str) -> String {
    format!("{service}{INTAKE_SUFFIX}")
}

fn socket_name(name: &str) -> io::Result<Name<'static>> {
    name.to_owned().to_ns_name::<GenericNamespaced>()
}

pub(crate) fn listen(name: &str) -> Result<LocalSocketListener> {
    let socket = socket_name(name)
        .map_err(|err| AppError::Transport(format!("invalid socket name '{name}': {err}")))?;
    ListenerOptions::new()
        .name(socket)
        .create_tokio()
        .map_err(|err| AppError::Transport(format!("failed to listen on '{name}': {err}")))
}

pub(crate) async fn connect(name: &str) -> io::Result<LocalSocketStream> {
    LocalSocketStream::connect(socket_name(name)?).await
}

/// Wrap a connection this side only writes to as a [`PeerRef`].
///
/// Returns the peer and a release token. Cancelling the release token
/// closes the connection without reporting death; end-of-stream or a
/// write failure trips the peer's liveness signal instead.
pub(crate) fn link_stream(label: String, stream: LocalSocketStream) -> (PeerRef, CancellationToken) {
    let (recv, send) = stream.split();
    let liveness = CancellationToken::new();
    let release = liveness.child_token();
    let (outbound, rx) = mpsc::unbounded_channel();

    tokio::spawn(run_writer(
        label.clone(),
        send,
        rx,
        liveness.clone(),
        release.clone(),
    ));
    tokio::spawn(watch_eof(label, recv, liveness.clone(), release.clone()));

    (PeerRef::new(outbound, liveness), release)
}

async fn run_writer(
    label: String,
    mut send: SendHalf,
    mut outbound: mpsc::UnboundedReceiver<WireUnit>,
    liveness: CancellationToken,
    release: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = release.cancelled() => {
                debug!(%label, "link writer: released, stopping");
                break;
            }

            unit = outbound.recv() => {
                let Some(unit) = unit else {
                    debug!(%label, "link writer: outbound queue closed, stopping");
                    break;
                };

                let mut line = match unit.to_line() {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(%label, error = %err, "link writer: dropping unit");
                        continue;
                    }
                };
                line.push('\n');

                if let Err(err) = send.write_all(line.as_bytes()).await {
                    info!(%label, error = %err, "link writer: write failed, peer gone");
                    liveness.cancel();
                    break;
                }
            }
        }
    }

    release.cancel();
}

async fn watch_eof<R>(
    label: String,
    recv: R,
    liveness: CancellationToken,
    release: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(recv, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = release.cancelled() => return,

            frame = framed.next() => match frame {
                Some(Ok(_)) => {
                    debug!(%label, "link watcher: ignoring traffic on write-only link");
                }
                Some(Err(err)) => {
                    info!(%label, error = %err, "link watcher: read failed");
                    break;
                }
                None => {
                    debug!(%label, "link watcher: end of stream");
                    break;
                }
            }
        }
    }

    liveness.cancel();
}

/// Read wire units from `stream` into `inbound` until end-of-stream.
pub(crate) async fn run_unit_reader<R>(
    label: String,
    stream: R,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, FrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(%label, "unit reader: cancellation received, stopping");
                break;
            }

            () = inbound.closed() => {
                debug!(%label, "unit reader: dispatcher gone, stopping");
                break;
            }

            frame = framed.next() => match frame {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WireUnit::from_line(&line) {
                        Ok(unit) => {
                            if inbound.send(Inbound::Unit(unit)).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%label, error = %err, "unit reader: skipping line"),
                    }
                }
                Some(Err(err)) => {
                    warn!(%label, error = %err, "unit reader: read failed");
                    break;
                }
                None => {
                    debug!(%label, "unit reader: end of stream");
                    break;
                }
            }
        }
    }
}

async fn run_reply_listener(
    name: String,
    listener: LocalSocketListener,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            () = inbound.closed() => break,

            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    debug!(reply_path = %name, "reply connection accepted");
                    tokio::spawn(run_unit_reader(
                        name.clone(),
                        stream,
                        inbound.clone(),
                        cancel.clone(),
                    ));
                }
                Err(err) => warn!(reply_path = %name, %err, "reply accept failed"),
            }
        }
    }

    debug!(reply_path = %name, "reply listener closed");
}

/// [`ClientTransport`] over namespaced local sockets.
///
/// Launches the service program when its intake is not reachable and
/// keeps the launched child so a later stop can reap it.
#[derive(Debug)]
pub struct LocalHost {
    config: ChannelConfig,
    bindings: Mutex<HashMap<String, CancellationToken>>,
    children: Mutex<HashMap<String, Child>>,
    closed: CancellationToken,
}

impl LocalHost {
    /// Create a transport using `config` for launching and timeouts.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            bindings: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Transport configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether this transport launched the process for `target`.
    #[must_use]
    pub fn launched(&self, target: &ServiceTarget) -> bool {
        self.children.lock().contains_key(target.name())
    }

    async fn request(&self, target: &ServiceTarget, request: &RawRequest) -> Result<()> {
        let intake = intake_name(target.name());
        let stream = connect(&intake)
            .await
            .map_err(|err| AppError::Transport(format!("service intake '{intake}' unreachable: {err}")))?;
        let (recv, mut send) = stream.split();

        let mut line = serde_json::to_string(request)
            .map_err(|err| AppError::Codec(format!("failed to serialise request: {err}")))?;
        line.push('\n');
        send.write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Transport(format!("failed to write request: {err}")))?;

        let mut framed = FramedRead::new(recv, FrameCodec::new());
        let reply = match framed.next().await {
            Some(Ok(line)) => serde_json::from_str::<IntakeReply>(&line)
                .map_err(|err| AppError::Codec(format!("invalid intake reply: {err}")))?,
            Some(Err(err)) => return Err(err),
            None => {
                return Err(AppError::Transport(format!(
                    "service intake '{intake}' closed before replying"
                )))
            }
        };

        if reply.ok {
            debug!(action = %request.action, service = target.name(), "request accepted");
            Ok(())
        } else {
            Err(AppError::Transport(format!(
                "request '{}' rejected: {}",
                request.action,
                reply.error.unwrap_or_default()
            )))
        }
    }

    async fn launch(&self, target: &ServiceTarget) -> Result<()> {
        let program = self.config.resolve_service_program()?;
        let child = Command::new(&program)
            .args(&self.config.service_args)
            .arg("--ipc-name")
            .arg(target.name())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| {
                AppError::Transport(format!("failed to launch '{}': {err}", program.display()))
            })?;

        info!(
            service = target.name(),
            program = %program.display(),
            pid = ?child.id(),
            "service process launched"
        );
        self.children.lock().insert(target.name().to_owned(), child);

        self.wait_for_intake(target).await
    }

    async fn wait_for_intake(&self, target: &ServiceTarget) -> Result<()> {
        let intake = intake_name(target.name());
        let deadline = Instant::now() + self.config.startup_timeout();

        loop {
            let attempt = match connect(&intake).await {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };

            if let Some(status) = self.exited(target) {
                return Err(AppError::Transport(format!(
                    "service '{}' exited during startup: {status}",
                    target.name()
                )));
            }

            if Instant::now() >= deadline {
                return Err(AppError::Transport(format!(
                    "service '{}' did not open its intake within {} ms: {attempt}",
                    target.name(),
                    self.config.startup_timeout_ms
                )));
            }

            sleep(self.config.connect_retry()).await;
        }
    }

    fn exited(&self, target: &ServiceTarget) -> Option<std::process::ExitStatus> {
        let mut children = self.children.lock();
        let status = children.get_mut(target.name())?.try_wait().ok().flatten()?;
        children.remove(target.name());
        Some(status)
    }

    async fn reap(&self, target: &ServiceTarget, mut child: Child) {
        match timeout(self.config.startup_timeout(), child.wait()).await {
            Ok(Ok(status)) => debug!(service = target.name(), %status, "service process exited"),
            Ok(Err(err)) => warn!(service = target.name(), %err, "failed to wait for service process"),
            Err(_) => {
                warn!(service = target.name(), "service process ignored stop; killing");
                if let Err(err) = child.kill().await {
                    warn!(service = target.name(), %err, "failed to kill service process");
                }
            }
        }
    }
}

impl ClientTransport for LocalHost {
    fn start_process<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if connect(&intake_name(target.name())).await.is_ok() {
                debug!(service = target.name(), "service already running");
            } else {
                self.launch(target).await?;
            }
            self.request(target, &RawRequest::new(ACTION_START)).await
        })
    }

    fn stop_process<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let result = self.request(target, &RawRequest::new(ACTION_STOP)).await;
            let child = self.children.lock().remove(target.name());
            if let Some(child) = child {
                self.reap(target, child).await;
            }
            result
        })
    }

    fn send_request<'a>(
        &'a self,
        target: &'a ServiceTarget,
        request: RawRequest,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.request(target, &request).await })
    }

    fn bind<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<PeerRef>> {
        Box::pin(async move {
            let stream = connect(target.name()).await.map_err(|err| {
                AppError::Transport(format!("cannot bind to '{}': {err}", target.name()))
            })?;
            let (peer, release) = link_stream(format!("{} binding", target.name()), stream);

            let previous = self
                .bindings
                .lock()
                .insert(target.name().to_owned(), release);
            if let Some(previous) = previous {
                previous.cancel();
            }

            debug!(service = target.name(), peer = %peer.id(), "bound to service");
            Ok(peer)
        })
    }

    fn unbind<'a>(&'a self, target: &'a ServiceTarget) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let release = self.bindings.lock().remove(target.name());
            if let Some(release) = release {
                release.cancel();
                debug!(service = target.name(), "binding released");
            } else {
                debug!(service = target.name(), "unbind: no binding held");
            }
            Ok(())
        })
    }

    fn open_reply_path(
        &self,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> BoxFuture<'_, Result<ReplyPath>> {
        Box::pin(async move {
            let name = format!("{REPLY_PREFIX}{}", Uuid::new_v4().simple());
            let listener = listen(&name)?;
            tokio::spawn(run_reply_listener(
                name.clone(),
                listener,
                inbound,
                self.closed.child_token(),
            ));
            Ok(ReplyPath::new(name))
        })
    }
}

impl Drop for LocalHost {
    fn drop(&mut self) {
        self.closed.cancel();
        for (_, release) in self.bindings.lock().drain() {
            release.cancel();
        }
    }
}
