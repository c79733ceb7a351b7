mod common;

use common::{eventually, Net};

use cairn_core::events::{EngineEvent, EventKind};
use cairn_media::{CallState, ConnectionState, MediaKind};
use cairn_shared::protocol::CallType;

#[tokio::test]
async fn test_call_over_the_hub() {
    let net = Net::new();
    let alice = net.peer('a', "alice").await;
    let bob = net.peer('b', "bob").await;
    let mut bob_calls = bob.messenger.subscribe_kind(EventKind::Call);

    let conv = alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();
    let call = alice
        .messenger
        .start_call(&conv.id, CallType::Audio)
        .await
        .unwrap();

    eventually("bob to ring", || {
        bob.messenger
            .calls()
            .call(&call.id)
            .map_or(false, |c| c.state == CallState::Ringing)
    })
    .await;
    match bob_calls.recv().await {
        Some(EngineEvent::IncomingCall {
            call_id,
            from,
            call_type,
        }) => {
            assert_eq!(call_id, call.id);
            assert_eq!(from, *alice.wallet());
            assert_eq!(call_type, CallType::Audio);
        }
        other => panic!("unexpected event {other:?}"),
    }

    eventually("the peer connection to come up", || {
        alice
            .messenger
            .peers()
            .connection(bob.wallet())
            .map_or(false, |c| c.connection_state == ConnectionState::Connected)
    })
    .await;

    bob.messenger.accept_call(&call.id).await.unwrap();
    eventually("both sides to be connected", || {
        [&alice, &bob].iter().all(|p| {
            p.messenger
                .calls()
                .call(&call.id)
                .map_or(false, |c| c.state == CallState::Connected)
        })
    })
    .await;

    let muted = bob.messenger.toggle_media(&call.id, MediaKind::Audio).unwrap();
    assert!(!muted);

    alice.messenger.end_call(&call.id).await.unwrap();
    assert_eq!(alice.messenger.call_history().len(), 1);
    eventually("the hangup to end bob's call", || {
        bob.messenger.active_calls().is_empty() && bob.messenger.call_history().len() == 1
    })
    .await;
}

#[tokio::test]
async fn test_declined_call_ends_for_the_caller() {
    let net = Net::new();
    let alice = net.peer('a', "alice").await;
    let bob = net.peer('b', "bob").await;

    let conv = alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();
    let call = alice
        .messenger
        .start_call(&conv.id, CallType::Video)
        .await
        .unwrap();
    eventually("bob to ring", || bob.messenger.calls().call(&call.id).is_some()).await;

    bob.messenger.decline_call(&call.id).await.unwrap();
    eventually("alice's call to end", || {
        alice.messenger.calls().call(&call.id).is_none()
    })
    .await;
    assert_eq!(alice.messenger.call_history()[0].state, CallState::Ended);
}
