//! # cairn-node
//!
//! Headless Cairn peer.
//!
//! Joins the libp2p network under the local wallet identity, serves its
//! share of the DHT and gossip mesh, catches up on anything sent while it
//! was away, and keeps announcing presence and resending unpinned messages
//! until interrupted.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cairn_core::logging::init_tracing;
use cairn_core::p2p::{spawn_notification_bridge, GossipTransport, KadContentStore, KadDirectory};
use cairn_core::{Capabilities, EngineEvent, KeyStore, Messenger};
use cairn_media::WebRtcBackend;
use cairn_net::{
    derive_keypair, parse_multiaddrs, peer_stats, request_relay_reservation, spawn_swarm,
    SwarmCommand, SwarmConfig,
};
use cairn_shared::identity::PresenceStatus;
use cairn_store::{Database, RecordStore};

use crate::config::NodeConfig;

const DEFAULT_DIRECTIVES: &str = "info,cairn_node=debug,cairn_core=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(DEFAULT_DIRECTIVES);
    info!("Starting cairn node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(
        port = config.listen_port,
        relays = config.relay_addrs.len(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Loaded configuration"
    );

    // Local state and identity
    let data_dir = config.engine.resolve_data_dir()?;
    let db = Arc::new(Database::open_in(&data_dir).context("opening database")?);
    let records: Arc<dyn RecordStore> = db.clone();
    let keystore = Arc::new(KeyStore::new(
        records.clone(),
        config.engine.resolve_key_file()?,
        &config.engine.key_passphrase,
    ));
    let identity = match &config.wallet {
        Some(wallet) => keystore.load_or_generate(wallet.clone(), config.display_name.clone())?,
        None => keystore
            .load_identity()?
            .context("no identity yet, set CAIRN_WALLET to create one")?,
    };
    info!(wallet = %identity.wallet_address, did = %identity.did, "Identity loaded");

    // Network
    let keypair = derive_keypair(&keystore.network_seed()?)?;
    let (cmd_tx, notifications, peer_id) = spawn_swarm(
        keypair,
        SwarmConfig {
            bootstrap_peers_path: config.bootstrap_peers_path.clone(),
            listen_port: config.listen_port,
            extra_dials: Vec::new(),
        },
    )
    .await?;
    info!(peer_id = %peer_id, "Swarm running in background");

    for relay in parse_multiaddrs(&config.relay_addrs) {
        if let Err(e) = request_relay_reservation(&cmd_tx, &relay).await {
            warn!(relay = %relay, error = %e, "Relay reservation request failed");
        }
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let _bridge = spawn_notification_bridge(notifications, inbound_tx);

    let caps = Capabilities {
        records,
        content: Arc::new(KadContentStore::new(db.clone(), cmd_tx.clone())),
        pubsub: Arc::new(GossipTransport::new(cmd_tx.clone())),
        directory: Arc::new(KadDirectory::new(cmd_tx.clone())),
    };
    let rtc = Arc::new(WebRtcBackend::new()?);

    // Engine
    let messenger = Messenger::new(keystore, caps, rtc, config.engine.clone())?;
    let mut events = messenger.subscribe();
    messenger.start(inbound_rx).await?;

    if let Err(e) = messenger.publish_peer_record().await {
        warn!(error = %e, "Could not publish peer record, peers will retry resolution");
    }
    match messenger.sync().await {
        Ok(report) => info!(
            pulled = report.pulled,
            queued = report.queued,
            failed = report.failed,
            conversations = report.conversations.len(),
            "Initial sync finished"
        ),
        Err(e) => warn!(error = %e, "Initial sync failed"),
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = messenger.set_status(PresenceStatus::Online).await {
                    warn!(error = %e, "Presence heartbeat failed");
                }
                match messenger.retry_pending().await {
                    Ok(report) if report.retried > 0 => info!(
                        retried = report.retried,
                        pinned = report.pinned,
                        failed = report.failed,
                        "Resent pending messages"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Resend pass failed"),
                }
                if let Err(e) = messenger.prune_offline() {
                    debug!(error = %e, "Offline queue prune failed");
                }
                match peer_stats(&cmd_tx).await {
                    Ok(stats) => debug!(
                        connected = stats.connected,
                        relayed = stats.relayed,
                        "Swarm peers"
                    ),
                    Err(e) => warn!(error = %e, "Swarm did not report peers"),
                }
            }
            Some(event) = events.recv() => log_event(&event),
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    messenger.shutdown().await;
    let _ = cmd_tx.send(SwarmCommand::Shutdown).await;
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::MessageReceived {
            conversation_id,
            sender,
            ..
        } => info!(conversation = %conversation_id, sender = %sender.short(), "New message"),
        EngineEvent::MessageFailed {
            conversation_id,
            message_id,
            reason,
        } => warn!(conversation = %conversation_id, message = %message_id, reason, "Message failed"),
        EngineEvent::IncomingCall { call_id, from, .. } => {
            info!(call = %call_id, from = %from.short(), "Incoming call")
        }
        EngineEvent::SyncFailed {
            conversation_id,
            error,
        } => warn!(conversation = %conversation_id, error, "Conversation sync failed"),
        other => debug!(event = ?other, "Engine event"),
    }
}
