mod common;

use common::*;
use huddle_core::CallState;
use huddle_protocol::events::error_code;
use huddle_protocol::{ClientEvent, MessageContent, ServerEvent};

#[tokio::test]
async fn presence_snapshot_tracks_connected_users() {
    let (addr, _state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    alice.wait_for_snapshot(&[1]).await;

    let mut bob = TestClient::identify(&addr, 2).await;
    alice.wait_for_snapshot(&[1, 2]).await;
    bob.wait_for_snapshot(&[1, 2]).await;

    bob.close().await;
    alice.wait_for_snapshot(&[1]).await;
}

#[tokio::test]
async fn message_is_delivered_and_echoed() {
    let (addr, _state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    let mut bob = TestClient::identify(&addr, 2).await;
    alice.wait_for_snapshot(&[1, 2]).await;
    bob.wait_for_snapshot(&[1, 2]).await;

    alice
        .send(&ClientEvent::MessageSend {
            receiver_id: 2,
            content: MessageContent::text("hi"),
        })
        .await;

    let delivered = bob.recv_message().await;
    let echoed = alice.recv_message().await;

    assert_eq!(delivered.sender_id, 1);
    assert_eq!(delivered.receiver_id, 2);
    assert_eq!(delivered.content, MessageContent::text("hi"));
    // Sender and receiver converge on the same server-assigned message.
    assert_eq!(delivered.id, echoed.id);
}

#[tokio::test]
async fn message_to_offline_user_lands_in_mailbox() {
    let (addr, state) = start_server(&[(1, "alice"), (3, "carol")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    alice.wait_for_snapshot(&[1]).await;

    alice
        .send(&ClientEvent::MessageSend {
            receiver_id: 3,
            content: MessageContent::text("hi"),
        })
        .await;
    let echoed = alice.recv_message().await;

    // Carol was offline: no realtime delivery, but the message is durable
    // and waits in her mailbox for the reconnect pull.
    let mailbox = state.relay.history(3).await.unwrap();
    assert_eq!(mailbox.len(), 1);
    assert_eq!(mailbox[0].id, echoed.id);
    assert!(!mailbox[0].read);
}

#[tokio::test]
async fn mark_read_has_no_realtime_notification() {
    let (addr, state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    let mut bob = TestClient::identify(&addr, 2).await;
    alice.wait_for_snapshot(&[1, 2]).await;
    bob.wait_for_snapshot(&[1, 2]).await;

    alice
        .send(&ClientEvent::MessageSend {
            receiver_id: 2,
            content: MessageContent::text("hi"),
        })
        .await;
    bob.recv_message().await;
    alice.recv_message().await;

    bob.send(&ClientEvent::MarkRead { peer_id: 1 }).await;

    let mailbox = state.relay.history(2).await.unwrap();
    assert!(mailbox.iter().all(|m| m.read));
    alice.expect_silence().await;
}

#[tokio::test]
async fn send_before_identify_is_rejected() {
    let (addr, _state) = start_server(&[(2, "bob")]).await;

    let mut anon = TestClient::connect(&addr).await;
    anon.send(&ClientEvent::MessageSend {
        receiver_id: 2,
        content: MessageContent::text("hi"),
    })
    .await;

    let event = anon
        .recv_matching(|e| matches!(e, ServerEvent::Error { .. }))
        .await;
    match event {
        ServerEvent::Error { code, .. } => assert_eq!(code, error_code::AUTH_REQUIRED),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn call_negotiation_and_disconnect_teardown() {
    let (addr, state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    let mut bob = TestClient::identify(&addr, 2).await;
    alice.wait_for_snapshot(&[1, 2]).await;
    bob.wait_for_snapshot(&[1, 2]).await;

    alice.send(&ClientEvent::CallRequest { callee_id: 2 }).await;
    let ringing = bob
        .recv_matching(|e| matches!(e, ServerEvent::CallRequest { .. }))
        .await;
    assert_eq!(ringing, ServerEvent::CallRequest { from: 1 });

    bob.send(&ClientEvent::CallAccept { caller_id: 1 }).await;
    let accepted = alice
        .recv_matching(|e| matches!(e, ServerEvent::CallAccept { .. }))
        .await;
    assert_eq!(accepted, ServerEvent::CallAccept { from: 2 });
    assert_eq!(state.calls.session_state(1, 2), Some(CallState::Negotiating));

    alice
        .send(&ClientEvent::CallOffer {
            peer_id: 2,
            sdp: "offer-sdp".into(),
        })
        .await;
    let offer = bob
        .recv_matching(|e| matches!(e, ServerEvent::CallOffer { .. }))
        .await;
    assert_eq!(
        offer,
        ServerEvent::CallOffer {
            from: 1,
            sdp: "offer-sdp".into()
        }
    );

    bob.send(&ClientEvent::CallAnswer {
        peer_id: 1,
        sdp: "answer-sdp".into(),
    })
    .await;
    let answer = alice
        .recv_matching(|e| matches!(e, ServerEvent::CallAnswer { .. }))
        .await;
    assert_eq!(
        answer,
        ServerEvent::CallAnswer {
            from: 2,
            sdp: "answer-sdp".into()
        }
    );
    assert_eq!(state.calls.session_state(1, 2), Some(CallState::Active));

    // Bob vanishing mid-call ends the session as if he hung up.
    bob.close().await;
    let ended = alice
        .recv_matching(|e| matches!(e, ServerEvent::CallEnd { .. }))
        .await;
    assert_eq!(ended, ServerEvent::CallEnd { from: 2 });
    assert_eq!(state.calls.session_state(1, 2), None);
}

#[tokio::test]
async fn duplicate_call_request_is_rejected() {
    let (addr, state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    let mut bob = TestClient::identify(&addr, 2).await;
    alice.wait_for_snapshot(&[1, 2]).await;
    bob.wait_for_snapshot(&[1, 2]).await;

    alice.send(&ClientEvent::CallRequest { callee_id: 2 }).await;
    bob.recv_matching(|e| matches!(e, ServerEvent::CallRequest { .. }))
        .await;

    alice.send(&ClientEvent::CallRequest { callee_id: 2 }).await;
    let rejected = alice
        .recv_matching(|e| matches!(e, ServerEvent::Error { .. }))
        .await;
    match rejected {
        ServerEvent::Error { code, .. } => assert_eq!(code, error_code::ALREADY_IN_PROGRESS),
        _ => unreachable!(),
    }

    // The original session is untouched and the callee rang only once.
    assert_eq!(state.calls.session_state(1, 2), Some(CallState::Ringing));
    bob.expect_silence().await;
}

#[tokio::test]
async fn calling_an_offline_user_is_invalid_target() {
    let (addr, state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let mut alice = TestClient::identify(&addr, 1).await;
    alice.wait_for_snapshot(&[1]).await;

    alice.send(&ClientEvent::CallRequest { callee_id: 2 }).await;
    let rejected = alice
        .recv_matching(|e| matches!(e, ServerEvent::Error { .. }))
        .await;
    match rejected {
        ServerEvent::Error { code, .. } => assert_eq!(code, error_code::INVALID_TARGET),
        _ => unreachable!(),
    }
    assert_eq!(state.calls.session_count(), 0);
}

#[tokio::test]
async fn rest_routes_serve_directory_and_mailbox() {
    let (addr, _state) = start_server(&[(1, "alice"), (2, "bob")]).await;

    let health = http_get(&addr, "/health").await;
    assert!(health.contains("200 OK"));

    let users = http_get(&addr, "/api/users").await;
    assert!(users.contains("200 OK"));
    assert!(users.contains("alice"));
    assert!(users.contains("bob"));

    let mut alice = TestClient::identify(&addr, 1).await;
    alice.wait_for_snapshot(&[1]).await;
    alice
        .send(&ClientEvent::MessageSend {
            receiver_id: 2,
            content: MessageContent::text("hello bob"),
        })
        .await;
    alice.recv_message().await;

    let mailbox = http_get(&addr, "/api/messages/2").await;
    assert!(mailbox.contains("200 OK"));
    assert!(mailbox.contains("hello bob"));
}
