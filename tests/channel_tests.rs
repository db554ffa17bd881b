// tests/channel_tests.rs

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use common::{checkpoint, wait_until};
use exam_checkpoint::{
    channel::{
        ChannelOptions, ChannelState, CheckpointChannel,
        memory::{MemoryTransport, ServerEnd},
    },
    error::AppError,
    models::{
        checkpoint::CheckpointAck,
        message::{ClientMessage, ServerMessage},
    },
};

fn options() -> ChannelOptions {
    ChannelOptions {
        ack_timeout: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        heartbeat_timeout: Duration::from_secs(30),
    }
}

async fn connected(transport: &Arc<MemoryTransport>) -> (CheckpointChannel, ServerEnd) {
    let channel = CheckpointChannel::new(1, "token-1", transport.clone(), options());
    channel.start();
    let end = transport.accept().await.expect("no connection");
    channel.connect().await.expect("channel did not connect");
    (channel, end)
}

fn ack(question_id: i64, sequence: i64) -> ServerMessage {
    ServerMessage::CheckpointAck(CheckpointAck {
        question_id,
        sequence,
        saved_at: Utc::now(),
        time_remaining_seconds: 1_200,
    })
}

#[tokio::test]
async fn connects_with_attempt_and_token() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, end) = connected(&transport).await;

    assert_eq!(end.attempt_id, 1);
    assert_eq!(end.token, "token-1");
    assert_eq!(channel.state(), ChannelState::Connected { recovered: false });
}

#[tokio::test]
async fn deliver_resolves_on_matching_ack() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, mut end) = connected(&transport).await;

    let server = tokio::spawn(async move {
        match end.recv().await {
            Some(ClientMessage::Checkpoint {
                question_id,
                sequence,
                ..
            }) => {
                // An unrelated ack first; it must not resolve the waiter.
                end.send(&ack(question_id, sequence + 10));
                end.send(&ack(question_id, sequence));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        end
    });

    let ack = channel.deliver(&checkpoint(1, 7, "B", 1)).await.unwrap();
    assert_eq!((ack.question_id, ack.sequence), (7, 1));
    server.await.unwrap();
}

#[tokio::test]
async fn missing_ack_times_out() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, _end) = connected(&transport).await;

    match channel.deliver(&checkpoint(1, 7, "B", 1)).await {
        Err(AppError::AckTimeout {
            question_id: 7,
            sequence: 1,
        }) => {}
        other => panic!("expected ack timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn checkpoint_error_rejects_waiter() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, mut end) = connected(&transport).await;

    tokio::spawn(async move {
        if let Some(ClientMessage::Checkpoint { question_id, .. }) = end.recv().await {
            end.send(&ServerMessage::CheckpointError {
                question_id,
                sequence: None,
                reason: "Attempt 1 is already submitted".to_string(),
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    match channel.deliver(&checkpoint(1, 7, "B", 3)).await {
        Err(AppError::CheckpointRejected {
            question_id,
            sequence,
            reason,
        }) => {
            assert_eq!((question_id, sequence), (7, 3));
            assert!(reason.contains("submitted"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn deliver_without_link_is_disconnected() {
    let transport = Arc::new(MemoryTransport::new());
    let channel = CheckpointChannel::new(1, "t", transport, options());

    assert!(matches!(
        channel.deliver(&checkpoint(1, 7, "B", 1)).await,
        Err(AppError::Disconnected)
    ));
    assert!(!channel.send_time_sync());
}

#[tokio::test]
async fn rejects_checkpoint_for_other_attempt() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, _end) = connected(&transport).await;

    assert!(matches!(
        channel.deliver(&checkpoint(2, 7, "B", 1)).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn ping_is_answered_and_messages_fan_out() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, mut end) = connected(&transport).await;

    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let _by_kind = channel.on_message("time_update", move |m| sink.lock().unwrap().push(m.clone()));
    let all = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&all);
    let _any = channel.on_any_message(move |_| *counter.lock().unwrap() += 1);

    end.send_raw("{not json");
    end.send(&ServerMessage::Ping);
    assert!(matches!(end.recv().await, Some(ClientMessage::Pong { .. })));

    end.send(&ServerMessage::TimeUpdate {
        server_time: Utc::now(),
        time_remaining_seconds: 600,
        elapsed_seconds: 4_800,
        is_expired: false,
    });

    let u = Arc::clone(&updates);
    assert!(wait_until(|| {
        let u = Arc::clone(&u);
        async move { u.lock().unwrap().len() == 1 }
    })
    .await);
    // Malformed frame dropped; ping and time update delivered.
    assert_eq!(*all.lock().unwrap(), 2);
}

#[tokio::test]
async fn reconnects_after_link_drop() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, end) = connected(&transport).await;

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _subscription = channel.on_state(move |s| sink.lock().unwrap().push(*s));

    drop(end);
    let _second = transport.accept().await.expect("no reconnection");

    let c = channel.clone();
    assert!(wait_until(|| {
        let c = c.clone();
        async move { c.state() == ChannelState::Connected { recovered: true } }
    })
    .await);
    assert!(
        states
            .lock()
            .unwrap()
            .contains(&ChannelState::Reconnecting { attempt: 1 })
    );
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn gives_up_after_reconnect_ceiling_until_manual_reconnect() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_reachable(false);
    let channel = CheckpointChannel::new(1, "t", transport.clone(), options());
    channel.start();

    assert!(matches!(channel.connect().await, Err(AppError::Disconnected)));
    assert_eq!(channel.state(), ChannelState::Disconnected);
    // First try plus three reconnects.
    assert_eq!(transport.open_count(), 4);

    transport.set_reachable(true);
    channel.reconnect();
    let _end = transport.accept().await.expect("no connection after reconnect");
    channel.connect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected { recovered: true });
}

#[tokio::test]
async fn reconnect_from_outside_the_runtime() {
    let transport = Arc::new(MemoryTransport::new());
    transport.set_reachable(false);
    let channel = CheckpointChannel::new(1, "t", transport.clone(), options());
    assert!(matches!(channel.connect().await, Err(AppError::Disconnected)));

    transport.set_reachable(true);
    let remote = channel.clone();
    let signal = std::thread::spawn(move || remote.reconnect());
    assert!(signal.join().is_ok());

    let _end = transport.accept().await.expect("no connection after reconnect");
    channel.connect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Connected { recovered: true });
}

#[tokio::test]
async fn disconnect_closes_and_fails_pending() {
    let transport = Arc::new(MemoryTransport::new());
    let (channel, _end) = connected(&transport).await;

    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.deliver(&checkpoint(1, 7, "B", 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    channel.disconnect();

    assert!(matches!(pending.await.unwrap(), Err(AppError::Disconnected)));
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(!channel.send_flag(7, true));
}
