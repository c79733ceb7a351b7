//! Async helpers wrapping [`SwarmCommand`]s for callers outside the swarm task.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::NetError;
use crate::peers::PeerStats;
use crate::swarm::SwarmCommand;

pub async fn subscribe_topic(cmd_tx: &mpsc::Sender<SwarmCommand>, topic: &str) -> Result<(), NetError> {
    debug!(topic = %topic, "Subscribing to topic");
    cmd_tx
        .send(SwarmCommand::Subscribe(topic.to_string()))
        .await
        .map_err(|_| NetError::ChannelClosed)
}

pub async fn unsubscribe_topic(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    topic: &str,
) -> Result<(), NetError> {
    cmd_tx
        .send(SwarmCommand::Unsubscribe(topic.to_string()))
        .await
        .map_err(|_| NetError::ChannelClosed)
}

pub async fn publish(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    topic: &str,
    data: Vec<u8>,
) -> Result<(), NetError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(SwarmCommand::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })
        .await
        .map_err(|_| NetError::ChannelClosed)?;

    rx.await
        .map_err(|_| NetError::NoReply)?
        .map_err(|reason| NetError::Gossipsub {
            topic: topic.to_string(),
            reason,
        })
}

pub async fn put_record(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    key: &[u8],
    value: Vec<u8>,
) -> Result<(), NetError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(SwarmCommand::PutRecord {
            key: key.to_vec(),
            value,
            reply,
        })
        .await
        .map_err(|_| NetError::ChannelClosed)?;

    rx.await
        .map_err(|_| NetError::NoReply)?
        .map_err(NetError::Kademlia)
}

pub async fn get_record(
    cmd_tx: &mpsc::Sender<SwarmCommand>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, NetError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(SwarmCommand::GetRecord {
            key: key.to_vec(),
            reply,
        })
        .await
        .map_err(|_| NetError::ChannelClosed)?;

    rx.await.map_err(|_| NetError::NoReply)
}

pub async fn peer_stats(cmd_tx: &mpsc::Sender<SwarmCommand>) -> Result<PeerStats, NetError> {
    let (reply, rx) = oneshot::channel();
    cmd_tx
        .send(SwarmCommand::GetPeerStats(reply))
        .await
        .map_err(|_| NetError::ChannelClosed)?;
    rx.await.map_err(|_| NetError::NoReply)
}
