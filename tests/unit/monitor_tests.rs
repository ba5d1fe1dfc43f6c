//! Unit tests for the death watch primitive and per-side monitor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether::ipc::codec::WireUnit;
use tether::ipc::monitor::{DeathCallback, DeathWatch, LinkDeathWatch, PeerDeathMonitor};
use tether::ipc::peer::PeerRef;
use tether::AppError;

type LivePeer = (PeerRef, CancellationToken, mpsc::UnboundedReceiver<WireUnit>);

fn live_peer() -> LivePeer {
    let (tx, rx) = mpsc::unbounded_channel();
    let liveness = CancellationToken::new();
    (PeerRef::new(tx, liveness.clone()), liveness, rx)
}

fn counter() -> (Arc<AtomicUsize>, DeathCallback) {
    let fired = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&fired);
    let callback: DeathCallback = Box::new(move || {
        inner.fetch_add(1, Ordering::SeqCst);
    });
    (fired, callback)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn link_fires_once_when_liveness_trips() {
    let watch = LinkDeathWatch::default();
    let (peer, liveness, _rx) = live_peer();
    let (fired, callback) = counter();

    watch.register(&peer, callback).unwrap();
    liveness.cancel();
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);

    watch.unregister(&peer);
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unregister_prevents_callback() {
    let watch = LinkDeathWatch::default();
    let (peer, liveness, _rx) = live_peer();
    let (fired, callback) = counter();

    watch.register(&peer, callback).unwrap();
    watch.unregister(&peer);
    liveness.cancel();
    settle().await;

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn registering_dead_peer_fails_without_running_callback() {
    let watch = LinkDeathWatch::default();
    let (peer, liveness, _rx) = live_peer();
    liveness.cancel();
    let (fired, callback) = counter();

    let err = watch.register(&peer, callback).unwrap_err();
    settle().await;

    assert!(matches!(err, AppError::PeerUnreachable(_)));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn peer_with_closed_writer_counts_as_dead() {
    let watch = LinkDeathWatch::default();
    let (peer, _liveness, rx) = live_peer();
    drop(rx);
    let (_fired, callback) = counter();

    assert!(watch.register(&peer, callback).is_err());
}

#[tokio::test]
async fn reregistering_same_peer_replaces_callback() {
    let watch = LinkDeathWatch::default();
    let (peer, liveness, _rx) = live_peer();
    let (first, first_cb) = counter();
    let (second, second_cb) = counter();

    watch.register(&peer, first_cb).unwrap();
    watch.register(&peer, second_cb).unwrap();
    liveness.cancel();
    settle().await;

    assert_eq!(first.load(Ordering::SeqCst), 0);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disarming_unarmed_monitor_is_noop() {
    let monitor = PeerDeathMonitor::new(LinkDeathWatch::shared());
    assert!(!monitor.disarm());
    assert!(monitor.armed_peer().is_none());
}

#[tokio::test]
async fn disarm_happens_once() {
    let monitor = PeerDeathMonitor::new(LinkDeathWatch::shared());
    let (peer, liveness, _rx) = live_peer();
    let (fired, callback) = counter();

    monitor.arm(&peer, callback).unwrap();
    assert_eq!(monitor.armed_peer(), Some(peer.id()));

    assert!(monitor.disarm());
    assert!(!monitor.disarm());

    liveness.cancel();
    settle().await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn arming_replaces_previous_registration() {
    let monitor = PeerDeathMonitor::new(LinkDeathWatch::shared());
    let (old_peer, old_liveness, _old_rx) = live_peer();
    let (new_peer, new_liveness, _new_rx) = live_peer();
    let (old_fired, old_cb) = counter();
    let (new_fired, new_cb) = counter();

    monitor.arm(&old_peer, old_cb).unwrap();
    monitor.arm(&new_peer, new_cb).unwrap();
    assert_eq!(monitor.armed_peer(), Some(new_peer.id()));

    old_liveness.cancel();
    settle().await;
    assert_eq!(old_fired.load(Ordering::SeqCst), 0);

    new_liveness.cancel();
    settle().await;
    assert_eq!(new_fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_arm_leaves_monitor_unarmed() {
    let monitor = PeerDeathMonitor::new(LinkDeathWatch::shared());
    let (live, _live_liveness, _live_rx) = live_peer();
    let (dead, dead_liveness, _dead_rx) = live_peer();
    dead_liveness.cancel();
    let (_a, live_cb) = counter();
    let (_b, dead_cb) = counter();

    monitor.arm(&live, live_cb).unwrap();
    assert!(monitor.arm(&dead, dead_cb).is_err());
    assert!(monitor.armed_peer().is_none());
}

#[tokio::test]
async fn release_only_matches_armed_peer() {
    let monitor = PeerDeathMonitor::new(LinkDeathWatch::shared());
    let (peer, _liveness, _rx) = live_peer();
    let (other, _other_liveness, _other_rx) = live_peer();
    let (_fired, callback) = counter();

    monitor.arm(&peer, callback).unwrap();

    assert!(!monitor.release(other.id()));
    assert!(monitor.release(peer.id()));
    assert!(monitor.armed_peer().is_none());
    assert!(!monitor.disarm());
}
