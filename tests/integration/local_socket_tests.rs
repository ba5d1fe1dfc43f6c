//! Channel over real namespaced local sockets.
//!
//! Each test uses a fresh socket name; `serial` keeps socket setup and
//! process launches from competing for the runtime under load.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use serial_test::serial;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use uuid::Uuid;

use tether::echo::EchoHooks;
use tether::ipc::codec::{encode, MAX_LINE_BYTES};
use tether::ipc::handle::ChannelHandle;
use tether::ipc::local::LocalHost;
use tether::ipc::service::spawn_service;
use tether::ipc::transport::ServiceTarget;
use tether::models::message::{Message, RawRequest};
use tether::models::state::ConnectionState;
use tether::{AppError, ChannelConfig};

use super::test_helpers::{eventually, Hook, RecordingHooks, RecordingListener, Seen};

fn unique_name() -> String {
    format!("tether-test-{}", Uuid::new_v4().simple())
}

fn test_config(program: PathBuf) -> ChannelConfig {
    ChannelConfig {
        ipc_name: unique_name(),
        service_program: Some(program),
        startup_timeout_ms: 5000,
        connect_retry_ms: 20,
        ..ChannelConfig::default()
    }
}

fn in_process_config() -> ChannelConfig {
    test_config(PathBuf::from("/nonexistent/tether-echo"))
}

fn client(
    config: &ChannelConfig,
) -> (
    ChannelHandle<LocalHost, RecordingListener>,
    Arc<LocalHost>,
    Arc<RecordingListener>,
) {
    let host = Arc::new(LocalHost::new(config.clone()));
    let listener = Arc::new(RecordingListener::default());
    let handle = ChannelHandle::new(
        ServiceTarget::from_config(config),
        Arc::clone(&host),
        Arc::clone(&listener),
    );
    (handle, host, listener)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn echo_round_trip_reuses_running_service() {
    let config = in_process_config();
    let service = spawn_service(&config, EchoHooks::new()).unwrap();
    let endpoint = Arc::clone(service.endpoint());
    let (handle, host, listener) = client(&config);

    handle.connect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert!(!host.launched(handle.target()));
    assert!(eventually(|| endpoint.is_connected()).await);

    assert!(handle.send(0, 0, Some("over the socket".into())));
    assert!(handle.send(9, 8, None));
    assert!(eventually(|| listener.messages().len() == 2).await);
    assert_eq!(
        listener.messages(),
        vec![
            Seen::Message(0, 0, Some("over the socket".into())),
            Seen::Message(9, 8, None),
        ]
    );

    handle.disconnect().await;
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
    assert_eq!(listener.count(&Seen::Disconnected), 1);
    assert_eq!(listener.count(&Seen::Died), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn service_stopping_is_seen_as_death_by_client() {
    let config = in_process_config();
    let service = spawn_service(&config, EchoHooks::new()).unwrap();
    let endpoint = Arc::clone(service.endpoint());
    let (handle, _host, listener) = client(&config);

    handle.connect().await.unwrap();
    assert!(eventually(|| endpoint.is_connected()).await);

    endpoint.stop();

    assert!(eventually(|| listener.count(&Seen::Died) == 1).await);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(!handle.send(0, 0, Some("too late".into())));
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn dropped_client_is_seen_as_death_by_service() {
    let config = in_process_config();
    let service = spawn_service(&config, RecordingHooks::default()).unwrap();
    let endpoint = Arc::clone(service.endpoint());
    let (handle, host, _listener) = client(&config);

    handle.connect().await.unwrap();
    assert!(eventually(|| endpoint.hooks().count(&Hook::Connected) == 1).await);

    drop(handle);
    drop(host);

    assert!(eventually(|| endpoint.hooks().count(&Hook::Died) == 1).await);
    assert_eq!(endpoint.state(), ConnectionState::Disconnected);

    endpoint.stop();
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
}

fn data_line(arg1: i32, arg2: i32, payload: &str) -> Vec<u8> {
    let mut line = encode(&Message::data(arg1, arg2, Some(payload.to_owned())))
        .to_line()
        .unwrap();
    line.push('\n');
    line.into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn oversized_send_is_refused_without_dropping_the_link() {
    let config = in_process_config();
    let service = spawn_service(&config, RecordingHooks::default()).unwrap();
    let endpoint = Arc::clone(service.endpoint());
    let (handle, _host, listener) = client(&config);

    handle.connect().await.unwrap();
    assert!(eventually(|| endpoint.hooks().count(&Hook::Connected) == 1).await);

    assert!(!handle.send(1, 1, Some("x".repeat(2 * MAX_LINE_BYTES))));
    assert!(matches!(
        handle.try_send(1, 1, Some("x".repeat(2 * MAX_LINE_BYTES))),
        Err(AppError::Codec(_))
    ));
    assert!(handle.send(2, 2, Some("after".into())));

    assert!(eventually(|| endpoint.hooks().messages().len() == 1).await);
    assert_eq!(
        endpoint.hooks().messages(),
        vec![Hook::Message(2, 2, Some("after".into()))]
    );
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(listener.count(&Seen::Died), 0);
    assert_eq!(endpoint.hooks().count(&Hook::Died), 0);

    handle.disconnect().await;
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn binding_reader_survives_garbage_lines() {
    let config = in_process_config();
    let service = spawn_service(&config, RecordingHooks::default()).unwrap();
    let endpoint = Arc::clone(service.endpoint());

    let name = config
        .ipc_name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .unwrap();
    let mut stream = LocalSocketStream::connect(name).await.unwrap();

    let mut oversized = vec![b'a'; MAX_LINE_BYTES + 1];
    oversized.push(b'\n');
    stream.write_all(&oversized).await.unwrap();
    stream.write_all(b"\xff\xfe\n").await.unwrap();
    stream.write_all(b"not json\n").await.unwrap();
    stream.write_all(&data_line(1, 2, "after")).await.unwrap();

    assert!(eventually(|| endpoint.hooks().messages().len() == 1).await);

    stream.write_all(&data_line(3, 4, "still reading")).await.unwrap();
    assert!(eventually(|| endpoint.hooks().messages().len() == 2).await);
    assert_eq!(
        endpoint.hooks().messages(),
        vec![
            Hook::Message(1, 2, Some("after".into())),
            Hook::Message(3, 4, Some("still reading".into())),
        ]
    );

    drop(stream);
    endpoint.stop();
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_senders_keep_per_task_order() {
    const TASKS: i32 = 4;
    const PER_TASK: i32 = 50;

    let config = in_process_config();
    let service = spawn_service(&config, RecordingHooks::default()).unwrap();
    let endpoint = Arc::clone(service.endpoint());
    let (handle, _host, listener) = client(&config);
    let handle = Arc::new(handle);

    handle.connect().await.unwrap();
    assert!(eventually(|| endpoint.hooks().count(&Hook::Connected) == 1).await);

    let padding = "x".repeat(512);
    let senders: Vec<_> = (0..TASKS)
        .map(|task| {
            let handle = Arc::clone(&handle);
            let padding = padding.clone();
            tokio::spawn(async move {
                for seq in 0..PER_TASK {
                    assert!(handle.send(task, seq, Some(format!("{task}:{seq}:{padding}"))));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.unwrap();
    }

    let total = usize::try_from(TASKS * PER_TASK).unwrap();
    assert!(eventually(|| endpoint.hooks().messages().len() == total).await);

    let mut next_seq = vec![0; usize::try_from(TASKS).unwrap()];
    for hook in endpoint.hooks().messages() {
        let Hook::Message(task, seq, Some(payload)) = &hook else {
            panic!("unexpected hook {hook:?}");
        };
        let (task, seq) = (*task, *seq);
        assert_eq!(*payload, format!("{task}:{seq}:{padding}"));
        let slot = &mut next_seq[usize::try_from(task).unwrap()];
        assert_eq!(seq, *slot, "task {task} out of order");
        *slot += 1;
    }
    assert!(next_seq.iter().all(|&n| n == PER_TASK));
    assert_eq!(listener.count(&Seen::Died), 0);

    handle.disconnect().await;
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn raw_request_reaches_service_hook() {
    let config = in_process_config();
    let service = spawn_service(&config, RecordingHooks::default()).unwrap();
    let endpoint = Arc::clone(service.endpoint());
    let (handle, _host, _listener) = client(&config);

    handle
        .send_raw(RawRequest::new("refresh").with_extra("reason", "test"))
        .await
        .unwrap();

    assert!(eventually(|| endpoint.hooks().count(&Hook::Raw("refresh".into())) == 1).await);
    assert_eq!(endpoint.hooks().count(&Hook::Started), 0);

    endpoint.stop();
    timeout(Duration::from_secs(5), service.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn second_service_on_same_name_is_rejected() {
    let config = in_process_config();
    let first = spawn_service(&config, EchoHooks::new()).unwrap();

    let err = spawn_service(&config, EchoHooks::new()).err().unwrap();
    assert!(matches!(err, AppError::Transport(_)));

    first.endpoint().stop();
    timeout(Duration::from_secs(5), first.wait()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn missing_service_program_fails_connect() {
    let config = in_process_config();
    let (handle, _host, listener) = client(&config);

    let err = handle.connect().await.unwrap_err();

    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert!(listener.seen().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn launches_echo_binary_and_reaps_it_on_disconnect() {
    let config = test_config(PathBuf::from(env!("CARGO_BIN_EXE_tether-echo")));
    let (handle, host, listener) = client(&config);

    handle.connect().await.unwrap();
    assert!(host.launched(handle.target()));
    assert_eq!(listener.seen(), vec![Seen::Connected]);

    assert!(handle.send(4, 2, Some("from another process".into())));
    assert!(eventually(|| listener.messages().len() == 1).await);
    assert_eq!(
        listener.messages(),
        vec![Seen::Message(4, 2, Some("from another process".into()))]
    );

    handle.disconnect().await;
    assert!(!host.launched(handle.target()));
    assert_eq!(
        listener.seen().last(),
        Some(&Seen::Disconnected),
        "seen: {:?}",
        listener.seen()
    );
}
