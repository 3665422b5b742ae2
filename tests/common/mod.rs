#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use stonewire::dispatch::DispatchItem;
use stonewire::{
    ChannelDispatch, ConnectionEvent, HostType, Message, Messenger, MessengerConfig,
    NoneAuthenticator, PeerAddr, PeerStats, Policy,
};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

pub const WAIT: Duration = Duration::from_secs(10);

pub fn fast_config() -> MessengerConfig {
    let mut config = MessengerConfig::new();
    config.initial_backoff = Duration::from_millis(20);
    config.max_backoff = Duration::from_millis(200);
    config.tcp_read_timeout = Duration::from_secs(30);
    config
}

/// a bound-and-listening messenger with a channel dispatch sink
pub async fn messenger(
    host_type: HostType,
    policy: Policy,
) -> (Arc<Messenger>, UnboundedReceiver<DispatchItem>) {
    messenger_with(fast_config(), host_type, policy).await
}

pub async fn messenger_with(
    config: MessengerConfig,
    host_type: HostType,
    policy: Policy,
) -> (Arc<Messenger>, UnboundedReceiver<DispatchItem>) {
    let (dispatch, rx) = ChannelDispatch::new();
    let msgr = Messenger::new(
        Arc::new(config),
        host_type,
        dispatch,
        Arc::new(NoneAuthenticator),
    );
    msgr.set_default_policy(policy);
    msgr.bind(Some("127.0.0.1:0".parse().unwrap()))
        .await
        .unwrap();
    msgr.start().unwrap();
    (msgr, rx)
}

/// next delivered message, skipping control events
pub async fn next_message(rx: &mut UnboundedReceiver<DispatchItem>) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await.expect("dispatch channel closed") {
                DispatchItem::Message { msg, .. } => return msg,
                other => tracing::debug!("skipping {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

/// next control event, skipping messages
pub async fn next_event(rx: &mut UnboundedReceiver<DispatchItem>) -> ConnectionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await.expect("dispatch channel closed") {
                DispatchItem::Event(event) => return event,
                other => tracing::debug!("skipping {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

pub async fn expect_no_message(rx: &mut UnboundedReceiver<DispatchItem>, for_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(for_ms);
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if left.is_zero() {
            return;
        }
        match tokio::time::timeout(left, rx.recv()).await {
            Ok(Some(DispatchItem::Message { msg, .. })) => {
                panic!("unexpected message delivered: {:?}", msg)
            }
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

/// poll the pipe snapshot until the predicate holds
pub async fn wait_for_stats(
    msgr: &Messenger,
    addr: &PeerAddr,
    what: &str,
    pred: impl Fn(&PeerStats) -> bool,
) -> PeerStats {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(stats) = msgr.peer_stats(addr).await {
            if pred(&stats) {
                return stats;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}; last stats {:?}", what, stats);
            }
        } else if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}; no pipe", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// poll until the registry has no pipe for the peer
pub async fn wait_for_no_pipe(msgr: &Messenger, addr: &PeerAddr) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while msgr.peer_stats(addr).await.is_some() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for pipe to {:?} to go away", addr);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
