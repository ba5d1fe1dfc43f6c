//! Service host over local sockets.
//!
//! [`spawn_service`] opens the binding socket and the request intake for a
//! [`ChannelEndpoint`] and feeds both into the endpoint's dispatch queue.
//! The host winds down once the endpoint has stopped.

use std::sync::Arc;

use futures_util::StreamExt;
use interprocess::local_socket::tokio::prelude::*;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ChannelConfig;
use crate::ipc::codec::FrameCodec;
use crate::ipc::dispatch::Inbound;
use crate::ipc::endpoint::{ChannelEndpoint, ServiceHooks};
use crate::ipc::local::{connect, intake_name, link_stream, listen, run_unit_reader, IntakeReply};
use crate::ipc::monitor::LinkDeathWatch;
use crate::ipc::peer::PeerRef;
use crate::ipc::transport::{BoxFuture, ReplyConnector};
use crate::models::message::{RawRequest, ReplyPath};
use crate::{AppError, Result};

/// [`ReplyConnector`] that dials a client's reply socket.
#[derive(Debug, Default)]
pub struct LocalConnector;

impl ReplyConnector for LocalConnector {
    fn connect_reply<'a>(&'a self, path: &'a ReplyPath) -> BoxFuture<'a, Result<PeerRef>> {
        Box::pin(async move {
            let stream = connect(path.as_str()).await.map_err(|err| {
                AppError::PeerUnreachable(format!("reply path '{path}' unreachable: {err}"))
            })?;
            // The endpoint drops the peer on teardown, which closes the
            // outbound queue and with it the connection.
            let (peer, _release) = link_stream(format!("{path} reply"), stream);
            Ok(peer)
        })
    }
}

/// A running service host.
pub struct RunningService<H> {
    endpoint: Arc<ChannelEndpoint<H, LocalConnector>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<H: ServiceHooks + 'static> RunningService<H> {
    /// The hosted endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &Arc<ChannelEndpoint<H, LocalConnector>> {
        &self.endpoint
    }

    /// Wait until the endpoint has stopped and every host task has ended.
    pub async fn wait(self) {
        self.endpoint.shutdown_token().cancelled().await;
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(%err, "service task ended abnormally");
            }
        }
        info!("service host exited");
    }
}

/// Start hosting `hooks` under `config.ipc_name`.
///
/// # Errors
///
/// Returns `AppError::Transport` if either socket cannot be opened, for
/// example because another instance already owns the name.
pub fn spawn_service<H>(config: &ChannelConfig, hooks: H) -> Result<RunningService<H>>
where
    H: ServiceHooks + 'static,
{
    let binding_name = config.ipc_name.clone();
    let intake = intake_name(&binding_name);

    let binding = listen(&binding_name)?;
    let intake_listener = listen(&intake)?;

    let (endpoint, dispatcher) =
        ChannelEndpoint::spawn(hooks, LocalConnector, LinkDeathWatch::shared());
    let shutdown = endpoint.shutdown_token();

    info!(ipc_name = %binding_name, intake = %intake, "service listening");

    let binding_task = tokio::spawn(
        accept_bindings(binding, endpoint.inbound(), shutdown.clone())
            .instrument(info_span!("binding", name = %binding_name)),
    );
    let intake_task = tokio::spawn(
        accept_requests(intake_listener, endpoint.inbound(), shutdown)
            .instrument(info_span!("intake", name = %intake)),
    );

    Ok(RunningService {
        endpoint,
        tasks: vec![dispatcher, binding_task, intake_task],
    })
}

async fn accept_bindings(
    listener: LocalSocketListener,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    debug!("client bound");
                    tokio::spawn(run_unit_reader(
                        "binding".to_owned(),
                        stream,
                        inbound.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(%err, "binding accept failed"),
            }
        }
    }
    debug!("binding listener closed");
}

async fn accept_requests(
    listener: LocalSocketListener,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    tokio::spawn(handle_requests(stream, inbound.clone(), shutdown.clone()));
                }
                Err(err) => warn!(%err, "intake accept failed"),
            }
        }
    }
    debug!("intake listener closed");
}

async fn handle_requests(
    stream: LocalSocketStream,
    inbound: mpsc::UnboundedSender<Inbound>,
    shutdown: CancellationToken,
) {
    let (recv, mut send) = stream.split();
    let mut framed = FramedRead::new(recv, FrameCodec::new());

    loop {
        let line = tokio::select! {
            biased;

            () = shutdown.cancelled() => break,

            frame = framed.next() => match frame {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(%err, "intake read failed");
                    break;
                }
                None => break,
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let (reply, request) = match serde_json::from_str::<RawRequest>(&line) {
            Ok(request) => (IntakeReply::accepted(), Some(request)),
            Err(err) => (IntakeReply::rejected(format!("invalid request: {err}")), None),
        };

        // Acknowledge first: a stop request may end the process as soon
        // as it is queued.
        let mut reply_line = match serde_json::to_string(&reply) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "failed to serialise intake reply");
                break;
            }
        };
        reply_line.push('\n');
        if let Err(err) = send.write_all(reply_line.as_bytes()).await {
            warn!(%err, "failed to write intake reply");
            break;
        }

        if let Some(request) = request {
            debug!(action = %request.action, "request received");
            if inbound.send(Inbound::Request(request)).is_err() {
                break;
            }
        }
    }
}
