mod common;

use std::time::Duration;

use common::{eventually, test_config, Net};

use cairn_core::error::{EngineError, SyncError};
use cairn_core::sync::SyncOutcome;
use cairn_core::DeliveryStatus;

#[tokio::test]
async fn test_offline_recipient_catches_up_on_sync() {
    let net = Net::new();
    let alice = net.peer('a', "alice").await;
    let bob = net.peer('b', "bob").await;

    bob.pubsub.set_online(false);
    let conv = alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();
    let sent = alice.messenger.send_message(&conv.id, "hello").await.unwrap();
    assert_eq!(sent.queued_for, vec![bob.wallet().clone()]);
    assert_eq!(
        alice.messenger.offline().pending_for(bob.wallet()).unwrap().len(),
        1
    );

    // nothing reached bob while he was away
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob.messenger.conversation(&conv.id).is_none());

    bob.pubsub.set_online(true);
    let report = bob.messenger.sync().await.unwrap();
    assert_eq!(report.queued, 1);
    assert_eq!(report.failed, 0);
    assert!(report
        .conversations
        .iter()
        .all(|c| matches!(c.outcome, SyncOutcome::Completed { .. })));

    let messages = bob.messenger.get_decrypted(&conv.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].decrypted_content.as_deref(), Some("hello"));

    eventually("alice to drop the acknowledged queue entry", || {
        alice.messenger.offline().pending_for(bob.wallet()).unwrap().is_empty()
    })
    .await;
    assert_eq!(
        alice.messenger.list_messages(&conv.id).unwrap()[0].delivery_status,
        DeliveryStatus::Delivered
    );
    eventually("alice to see bob online", || {
        alice.messenger.is_online(bob.wallet())
    })
    .await;

    // the queue was cleared, a second sync pulls nothing new
    let again = bob.messenger.sync().await.unwrap();
    assert_eq!(again.queued, 0);
    assert_eq!(again.pulled, 0);
}

#[tokio::test]
async fn test_sync_walks_back_from_the_announced_head() {
    let net = Net::new();
    let alice = net.peer('a', "alice").await;
    let bob = net.peer('b', "bob").await;

    let conv = alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();
    alice.messenger.send_message(&conv.id, "one").await.unwrap();
    eventually("bob to receive the first message", || {
        bob.messenger.list_messages(&conv.id).unwrap().len() == 1
    })
    .await;

    // bob misses the next three, and their queue entries are lost
    bob.pubsub.set_online(false);
    for text in ["two", "three", "four"] {
        alice.messenger.send_message(&conv.id, text).await.unwrap();
    }
    net.directory.remove(&format!("offline:{}", bob.wallet()));
    bob.pubsub.set_online(true);

    let report = bob.messenger.sync().await.unwrap();
    assert_eq!(report.queued, 0);
    assert_eq!(report.pulled, 3);

    let texts: Vec<String> = bob
        .messenger
        .get_decrypted(&conv.id)
        .unwrap()
        .into_iter()
        .filter_map(|m| m.decrypted_content)
        .collect();
    assert_eq!(texts, ["one", "two", "three", "four"]);

    let head = bob.messenger.conversation(&conv.id).unwrap();
    let alice_head = alice.messenger.conversation(&conv.id).unwrap();
    assert_eq!(head.head_cid, alice_head.head_cid);
    assert_eq!(head.head_depth, 3);
}

#[tokio::test]
async fn test_second_sync_is_refused_while_one_runs() {
    let net = Net::new();
    let alice = net.peer('a', "alice").await;
    let bob = net.peer('b', "bob").await;
    alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();

    net.directory.set_latency(Some(Duration::from_millis(200)));
    let messenger = alice.messenger.clone();
    let first = tokio::spawn(async move { messenger.sync().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(alice.messenger.sync_coordinator().is_syncing());
    let second = alice.messenger.sync().await;
    assert!(matches!(
        second,
        Err(EngineError::Sync(SyncError::AlreadySyncing))
    ));

    first.await.unwrap().unwrap();
    assert!(!alice.messenger.sync_coordinator().is_syncing());
    net.directory.set_latency(None);
    alice.messenger.sync().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_content_keeps_the_queue_entry() {
    let net = Net::new();
    let alice = net.peer('a', "alice").await;
    let bob = net.peer('b', "bob").await;

    bob.pubsub.set_online(false);
    let conv = alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();
    alice.messenger.send_message(&conv.id, "hello").await.unwrap();
    bob.pubsub.set_online(true);

    net.content.set_failing(true);
    let report = bob.messenger.sync().await.unwrap();
    assert_eq!(report.pulled, 0);
    assert!(report.failed >= 1);
    // the entry stays queued for the next attempt
    net.content.set_failing(false);
    let retry = bob.messenger.sync().await.unwrap();
    assert_eq!(retry.queued, 1);
    assert_eq!(
        bob.messenger.get_decrypted(&conv.id).unwrap()[0]
            .decrypted_content
            .as_deref(),
        Some("hello")
    );
}

#[tokio::test]
async fn test_long_gap_closes_over_successive_syncs() {
    let net = Net::new();
    let config = cairn_core::EngineConfig {
        max_sync_walk: 2,
        ..test_config()
    };
    let alice = net.peer('a', "alice").await;
    let bob = net.peer_with('b', "bob", config).await;

    let conv = alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();
    alice.messenger.send_message(&conv.id, "m0").await.unwrap();
    eventually("bob to receive the first message", || {
        bob.messenger.list_messages(&conv.id).unwrap().len() == 1
    })
    .await;

    // four messages behind, twice the walk bound, and no queue record
    bob.pubsub.set_online(false);
    for text in ["m1", "m2", "m3", "m4"] {
        alice.messenger.send_message(&conv.id, text).await.unwrap();
    }
    net.directory.remove(&format!("offline:{}", bob.wallet()));
    bob.pubsub.set_online(true);

    let first = bob.messenger.sync().await.unwrap();
    assert_eq!(first.pulled, 2);
    assert_eq!(bob.messenger.list_messages(&conv.id).unwrap().len(), 3);

    let second = bob.messenger.sync().await.unwrap();
    assert_eq!(second.pulled, 2);
    assert_eq!(bob.messenger.list_messages(&conv.id).unwrap().len(), 5);

    let third = bob.messenger.sync().await.unwrap();
    assert_eq!(third.pulled, 0);

    let texts: Vec<String> = bob
        .messenger
        .get_decrypted(&conv.id)
        .unwrap()
        .into_iter()
        .filter_map(|m| m.decrypted_content)
        .collect();
    assert_eq!(texts, ["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(
        bob.messenger.conversation(&conv.id).unwrap().head_cid,
        alice.messenger.conversation(&conv.id).unwrap().head_cid
    );
}

#[tokio::test]
async fn test_stalled_transport_does_not_wedge_sync() {
    let net = Net::new();
    let config = cairn_core::EngineConfig {
        network_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let alice = net.peer_with('a', "alice", config).await;
    let bob = net.peer('b', "bob").await;
    alice
        .messenger
        .get_or_create_direct(bob.wallet())
        .await
        .unwrap();

    // resubscribe and the presence broadcast both hang on the transport
    alice.pubsub.set_stalled(true);
    let first = tokio::time::timeout(Duration::from_secs(3), alice.messenger.sync())
        .await
        .expect("sync should give up on the stalled transport");
    first.unwrap();
    assert!(!alice.messenger.sync_coordinator().is_syncing());

    alice.pubsub.set_stalled(false);
    alice.messenger.sync().await.unwrap();
}
