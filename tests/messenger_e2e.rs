//! End-to-end scenarios over real loopback sockets: two messengers, real
//! handshakes, faults injected by half-shutting sockets.

mod common;

use std::time::Duration;

use common::*;
use stonewire::dispatch::DispatchItem;
use stonewire::{ConnectionEvent, HostType, Message, PipeState, Policy, PRIO_DEFAULT};

#[tokio::test(flavor = "multi_thread")]
async fn clean_open_and_single_message() {
    let (a, _arx) = messenger(HostType::Store, Policy::lossless_peer()).await;
    let (b, mut brx) = messenger(HostType::Store, Policy::lossless_peer()).await;

    let msg = Message::new(7, PRIO_DEFAULT).with_front(&b"hi"[..]);
    a.send_message(msg, b.my_addr(), HostType::Store)
        .await
        .unwrap();

    let got = next_message(&mut brx).await;
    assert_eq!(&got.front[..], b"hi");
    assert_eq!(got.seq, 1);
    assert!(got.middle.is_empty());
    assert_eq!(got.data_len(), 0);

    // sender side: message acked, nothing pending, session open
    let a_stats = wait_for_stats(&a, &b.my_addr(), "a open and drained", |s| {
        s.state == PipeState::Open && s.out_seq == 1 && s.sent_len == 0 && s.out_queue_len == 0
    })
    .await;
    assert_eq!(a_stats.connect_seq, 1);

    // receiver side: in_seq advanced and acked
    let b_stats = wait_for_stats(&b, &a.my_addr(), "b caught up", |s| {
        s.state == PipeState::Open && s.in_seq == 1 && s.in_seq_acked == 1
    })
    .await;
    assert_eq!(b_stats.connect_seq, 1);

    a.shutdown().await;
    b.shutdown().await;
    a.wait().await;
    b.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reply_through_connection_handle() {
    let (a, mut arx) = messenger(HostType::Store, Policy::lossless_peer()).await;
    let (b, mut brx) = messenger(HostType::Store, Policy::lossless_peer()).await;

    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"ping"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();

    // the accept event carries the connection handle; replying through it
    //  reuses the same pipe
    let conn = loop {
        match next_event(&mut brx).await {
            ConnectionEvent::Accepted(conn) => break conn,
            other => tracing::debug!("skipping {:?}", other),
        }
    };
    assert_eq!(next_message(&mut brx).await.front, &b"ping"[..]);

    b.send_message_on(
        Message::new(2, PRIO_DEFAULT).with_front(&b"pong"[..]),
        &conn,
    )
    .await
    .unwrap();

    assert_eq!(next_message(&mut arx).await.front, &b"pong"[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_race_converges_to_one_session() {
    let (a, mut arx) = messenger(HostType::Store, Policy::lossless_peer()).await;
    let (b, mut brx) = messenger(HostType::Store, Policy::lossless_peer()).await;

    // both sides dial at once
    let (ra, rb) = tokio::join!(
        a.send_message(
            Message::new(1, PRIO_DEFAULT).with_front(&b"from-a"[..]),
            b.my_addr(),
            HostType::Store,
        ),
        b.send_message(
            Message::new(1, PRIO_DEFAULT).with_front(&b"from-b"[..]),
            a.my_addr(),
            HostType::Store,
        ),
    );
    ra.unwrap();
    rb.unwrap();

    // the race resolves deterministically (address comparison) and neither
    //  message is lost or duplicated
    assert_eq!(next_message(&mut brx).await.front, &b"from-a"[..]);
    assert_eq!(next_message(&mut arx).await.front, &b"from-b"[..]);

    wait_for_stats(&a, &b.my_addr(), "a open", |s| s.state == PipeState::Open).await;
    wait_for_stats(&b, &a.my_addr(), "b open", |s| s.state == PipeState::Open).await;

    expect_no_message(&mut arx, 300).await;
    expect_no_message(&mut brx, 300).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_replays_queued_messages() {
    let (a, _arx) = messenger(HostType::Client, Policy::lossless_client()).await;
    let (b, mut brx) = messenger(HostType::Store, Policy::stateful_server()).await;

    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"one"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    assert_eq!(next_message(&mut brx).await.front, &b"one"[..]);
    wait_for_stats(&a, &b.my_addr(), "first message acked", |s| {
        s.state == PipeState::Open && s.sent_len == 0 && s.out_seq == 1
    })
    .await;

    // kill the transport out from under the open session
    assert!(a.inject_socket_fault(&b.my_addr()).await);

    // the client schedules a reconnect with a bumped session epoch
    wait_for_stats(&a, &b.my_addr(), "a reconnecting", |s| {
        s.connect_seq >= 2
    })
    .await;

    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"two"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"three"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();

    // delivered in order, exactly once, on the replacement session
    assert_eq!(next_message(&mut brx).await.front, &b"two"[..]);
    assert_eq!(next_message(&mut brx).await.front, &b"three"[..]);
    expect_no_message(&mut brx, 300).await;

    // the sequence space survived the reconnect
    wait_for_stats(&b, &a.my_addr(), "b sequence caught up", |s| {
        s.state == PipeState::Open && s.in_seq == 3
    })
    .await;
    wait_for_stats(&a, &b.my_addr(), "a drained", |s| {
        s.state == PipeState::Open && s.out_seq == 3 && s.sent_len == 0
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lossy_fault_is_terminal() {
    let (a, mut arx) = messenger(HostType::Client, Policy::lossy_client()).await;
    let (b, _brx) = messenger(HostType::Store, Policy::stateless_server()).await;

    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"hello"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    wait_for_stats(&a, &b.my_addr(), "a open", |s| {
        s.state == PipeState::Open && s.sent_len == 0 && s.out_seq == 1
    })
    .await;

    assert!(a.inject_socket_fault(&b.my_addr()).await);

    // no reconnect: the pipe is unregistered and a reset event surfaces
    wait_for_no_pipe(&a, &b.my_addr()).await;
    loop {
        match next_event(&mut arx).await {
            ConnectionEvent::Reset(_) => break,
            other => tracing::debug!("skipping {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_required_feature_aborts_connect() {
    let (a, _arx) = messenger(HostType::Client, Policy::lossless_client()).await;

    let mut b_policy = Policy::stateful_server();
    b_policy.features_required |= stonewire::wire::feature::MSG_AUTH;
    let (b, mut brx) = messenger(HostType::Store, b_policy).await;

    // a does not offer message signing
    let mut a_policy = Policy::lossless_client();
    a_policy.features_supported &= !stonewire::wire::feature::MSG_AUTH;
    a.set_default_policy(a_policy);

    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"nope"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();

    // the connecting side gives up after one FEATURES round and the pipe
    //  closes; nothing reaches the dispatch queue
    wait_for_no_pipe(&a, &b.my_addr()).await;
    expect_no_message(&mut brx, 300).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_delivery_still_delivers_in_order() {
    let mut config = fast_config();
    config.inject_delay_type = "client".to_string();
    config.inject_delay_probability = 1.0;
    config.inject_delay_max = Duration::from_millis(50);
    let (b, mut brx) = messenger_with(config, HostType::Store, Policy::stateful_server()).await;
    let (a, _arx) = messenger(HostType::Client, Policy::lossless_client()).await;

    for text in [&b"first"[..], &b"second"[..]] {
        a.send_message(
            Message::new(1, PRIO_DEFAULT).with_front(text),
            b.my_addr(),
            HostType::Store,
        )
        .await
        .unwrap();
    }

    assert_eq!(next_message(&mut brx).await.front, &b"first"[..]);
    assert_eq!(next_message(&mut brx).await.front, &b"second"[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_payload_roundtrip() {
    let (a, _arx) = messenger(HostType::Store, Policy::lossless_peer()).await;
    let (b, mut brx) = messenger(HostType::Store, Policy::lossless_peer()).await;

    // open the session and grab the connection handle
    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"open"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    let conn = loop {
        match next_event(&mut brx).await {
            ConnectionEvent::Accepted(conn) => break conn,
            other => tracing::debug!("skipping {:?}", other),
        }
    };
    assert_eq!(next_message(&mut brx).await.front, &b"open"[..]);

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    // a posted rx buffer receives the data section in one piece
    conn.post_rx_buffer(42, bytes::BytesMut::new());
    a.send_message(
        Message::new(5, PRIO_DEFAULT)
            .with_front(&b"f"[..])
            .with_middle(&b"m"[..])
            .with_data(payload.clone(), 512)
            .with_tid(42),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    let got = next_message(&mut brx).await;
    assert_eq!(got.front, &b"f"[..]);
    assert_eq!(got.middle, &b"m"[..]);
    assert_eq!(got.data.len(), 1);
    assert_eq!(&got.concat_data()[..], &payload[..]);

    // without one, the receive layout is the aligned head/middle/tail split
    a.send_message(
        Message::new(5, PRIO_DEFAULT)
            .with_data(payload.clone(), 512)
            .with_tid(43),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    let got = next_message(&mut brx).await;
    assert_eq!(got.data.len(), 3);
    assert_eq!(got.data_off, 512);
    assert_eq!(&got.concat_data()[..], &payload[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn mark_down_discards_quietly() {
    let (a, mut arx) = messenger(HostType::Store, Policy::lossless_peer()).await;
    let (b, mut brx) = messenger(HostType::Store, Policy::lossless_peer()).await;

    a.send_message(
        Message::new(1, PRIO_DEFAULT).with_front(&b"hi"[..]),
        b.my_addr(),
        HostType::Store,
    )
    .await
    .unwrap();
    assert_eq!(next_message(&mut brx).await.front, &b"hi"[..]);

    a.mark_down(b.my_addr()).await;
    wait_for_no_pipe(&a, &b.my_addr()).await;

    // the discard notification reached a's sink
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no discard notification"
        );
        if let Ok(Some(DispatchItem::Discarded(_))) =
            tokio::time::timeout(Duration::from_secs(5), arx.recv()).await
        {
            break;
        }
    }
}
