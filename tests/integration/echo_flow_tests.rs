//! The echo responder end to end over the loopback host.

use tether::echo::EchoHooks;
use tether::models::message::RawRequest;

use super::test_helpers::{eventually, harness_with, Seen};

#[tokio::test]
async fn chat_line_is_echoed_back() {
    let h = harness_with(EchoHooks::new());
    h.handle.connect().await.unwrap();

    assert!(h.handle.send(0, 0, Some("hello".into())));

    assert!(eventually(|| h.listener.messages().len() == 1).await);
    assert_eq!(
        h.listener.messages(),
        vec![Seen::Message(0, 0, Some("hello".into()))]
    );
    assert_eq!(h.hooks().echoed(), 1);
}

#[tokio::test]
async fn echo_preserves_arguments_and_absent_payload() {
    let h = harness_with(EchoHooks::new());
    h.handle.connect().await.unwrap();

    assert!(h.handle.send(7, -3, None));
    assert!(h.handle.send(i32::MAX, i32::MIN, Some("edge".into())));

    assert!(eventually(|| h.listener.messages().len() == 2).await);
    assert_eq!(
        h.listener.messages(),
        vec![
            Seen::Message(7, -3, None),
            Seen::Message(i32::MAX, i32::MIN, Some("edge".into())),
        ]
    );
}

#[tokio::test]
async fn foreground_label_reaches_the_endpoint() {
    let h = harness_with(EchoHooks::new().with_foreground("chat echo"));
    h.handle.connect().await.unwrap();

    assert!(eventually(|| h.endpoint.foreground().is_some()).await);
    assert_eq!(
        h.endpoint.foreground().map(|indicator| indicator.label),
        Some("chat echo".to_owned())
    );
}

#[tokio::test]
async fn raw_request_does_not_disturb_the_channel() {
    let h = harness_with(EchoHooks::new());
    h.handle.connect().await.unwrap();

    h.handle.send_raw(RawRequest::new("ping")).await.unwrap();
    assert!(h.handle.send(1, 1, Some("after".into())));

    assert!(eventually(|| h.listener.messages().len() == 1).await);
    assert!(h.handle.is_connected());
}

#[tokio::test]
async fn disconnect_stops_the_echo_service() {
    let h = harness_with(EchoHooks::new());
    h.handle.connect().await.unwrap();

    h.handle.disconnect().await;

    assert!(eventually(|| h.endpoint.shutdown_token().is_cancelled()).await);
    assert!(!h.endpoint.is_connected());
    assert_eq!(h.listener.seen(), vec![Seen::Connected, Seen::Disconnected]);
}
