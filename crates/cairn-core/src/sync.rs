//! Reconciliation after being offline.
//!
//! Only one sync runs at a time; a second call while one is in flight
//! returns [`SyncError::AlreadySyncing`]. Each conversation is pulled on its
//! own, so one unreachable chain does not hold back the others.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use cairn_shared::capability::{ContentStore, DirectoryLookup, PubSubTransport};
use cairn_shared::constants::DIR_MANIFEST_PREFIX;
use cairn_shared::error::{ContentError, DirectoryError};
use cairn_shared::identity::PresenceStatus;
use cairn_shared::types::{Cid, ConversationId};

use crate::conversations::{Conversation, ConversationStore, SyncState};
use crate::dag::ConversationManifest;
use crate::error::{Result, SyncError};
use crate::events::{EngineEvent, EventBus};
use crate::messages::{ChatMessage, MessageEngine};
use crate::offline::OfflineMessageQueue;
use crate::presence::PresenceBus;
use crate::Capabilities;

#[derive(Debug, Clone, Default)]
pub struct PullResult {
    pub messages: Vec<ChatMessage>,
    pub failed_cids: Vec<Cid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SyncOutcome {
    Completed { pulled: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSync {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Messages pulled through the offline queue
    pub queued: usize,
    /// Messages pulled in total
    pub pulled: usize,
    /// CIDs that could not be fetched or verified
    pub failed: usize,
    pub conversations: Vec<ConversationSync>,
}

struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncCoordinator {
    conversations: Arc<ConversationStore>,
    messages: Arc<MessageEngine>,
    offline: Arc<OfflineMessageQueue>,
    presence: Arc<PresenceBus>,
    content: Arc<dyn ContentStore>,
    directory: Arc<dyn DirectoryLookup>,
    pubsub: Arc<dyn PubSubTransport>,
    events: EventBus,
    max_walk: usize,
    timeout: Duration,
    running: AtomicBool,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<ConversationStore>,
        messages: Arc<MessageEngine>,
        offline: Arc<OfflineMessageQueue>,
        presence: Arc<PresenceBus>,
        caps: &Capabilities,
        events: EventBus,
        max_walk: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            conversations,
            messages,
            offline,
            presence,
            content: caps.content.clone(),
            directory: caps.directory.clone(),
            pubsub: caps.pubsub.clone(),
            events,
            max_walk,
            timeout,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pull our offline queue, catch up every conversation, resubscribe
    /// their topics and announce ourselves online.
    pub async fn sync_on_coming_online(&self) -> Result<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadySyncing.into());
        }
        let _running = Running(&self.running);
        info!("sync started");

        let mut report = SyncReport::default();

        match self.offline.fetch_own().await {
            Ok(entries) if !entries.is_empty() => {
                let cids: Vec<Cid> = entries.iter().map(|e| e.message_cid.clone()).collect();
                let pulled = self.pull_pinned(&cids).await;
                let failed: HashSet<&Cid> = pulled.failed_cids.iter().collect();
                let processed: Vec<String> = entries
                    .iter()
                    .filter(|e| !failed.contains(&e.message_cid))
                    .map(|e| e.id.clone())
                    .collect();
                if let Err(e) = self.offline.clear_own(&processed).await {
                    warn!(error = %e, "could not clear offline queue");
                }
                report.queued = pulled.messages.len();
                report.pulled += pulled.messages.len();
                report.failed += pulled.failed_cids.len();
            }
            Ok(_) => debug!("offline queue empty"),
            Err(e) => warn!(error = %e, "offline queue unavailable"),
        }

        for conversation in self.conversations.list() {
            let outcome = self.sync_conversation(&conversation).await;
            match &outcome {
                Ok(pulled) => {
                    report.pulled += pulled.messages.len();
                    report.failed += pulled.failed_cids.len();
                }
                Err(_) => report.failed += 1,
            }
            report.conversations.push(ConversationSync {
                conversation_id: conversation.id.clone(),
                outcome: match outcome {
                    Ok(pulled) if pulled.failed_cids.is_empty() => SyncOutcome::Completed {
                        pulled: pulled.messages.len(),
                    },
                    Ok(pulled) => SyncOutcome::Failed {
                        error: format!("{} node(s) unavailable", pulled.failed_cids.len()),
                    },
                    Err(e) => SyncOutcome::Failed {
                        error: e.to_string(),
                    },
                },
            });
        }

        for conversation in self.conversations.list() {
            let topic = conversation.id.to_topic();
            match tokio::time::timeout(self.timeout, self.pubsub.subscribe(&topic)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(conversation = %conversation.id, error = %e, "resubscribe failed")
                }
                Err(_) => warn!(conversation = %conversation.id, "resubscribe timed out"),
            }
        }

        if let Err(e) = self.presence.broadcast(PresenceStatus::Online).await {
            warn!(error = %e, "presence broadcast failed");
        }

        info!(
            pulled = report.pulled,
            queued = report.queued,
            failed = report.failed,
            "sync finished"
        );
        Ok(report)
    }

    /// Import the given CIDs. Failures are reported, not raised.
    pub async fn pull_pinned(&self, cids: &[Cid]) -> PullResult {
        let mut result = PullResult::default();
        for cid in cids {
            match self.messages.import_node(cid).await {
                Ok(imported) if imported.fresh => result.messages.push(imported.message),
                Ok(_) => {}
                Err(e) => {
                    warn!(cid = %cid, error = %e, "pull failed");
                    result.failed_cids.push(cid.clone());
                }
            }
        }
        result
    }

    /// Catch up a single conversation outside a full sync.
    pub async fn pull_conversation(&self, id: &ConversationId) -> Result<PullResult> {
        let conversation = self.conversations.require(id)?;
        self.walk_conversation(&conversation).await
    }

    async fn sync_conversation(&self, conversation: &Conversation) -> Result<PullResult> {
        let id = &conversation.id;
        self.events.publish(EngineEvent::SyncStarted {
            conversation_id: id.clone(),
        });
        self.conversations.set_sync_state(id, SyncState::Syncing)?;

        let result = self.walk_conversation(conversation).await;
        let failure = match &result {
            Ok(pulled) if pulled.failed_cids.is_empty() => None,
            Ok(pulled) => Some(format!("{} node(s) unavailable", pulled.failed_cids.len())),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                let pulled = result.as_ref().map_or(0, |r| r.messages.len());
                self.conversations.set_sync_state(id, SyncState::Synced)?;
                self.events.publish(EngineEvent::SyncCompleted {
                    conversation_id: id.clone(),
                    pulled,
                });
            }
            Some(error) => {
                warn!(conversation = %id, error = %error, "conversation sync failed");
                self.conversations.set_sync_state(id, SyncState::Failed)?;
                self.events.publish(EngineEvent::SyncFailed {
                    conversation_id: id.clone(),
                    error,
                });
            }
        }
        result
    }

    /// Walk back from the remote head (if a newer one is announced) until a
    /// known node, then fill gaps behind our own head.
    ///
    /// Only fetches count against the walk bound. Stepping over nodes we
    /// already hold is a local lookup, so each pass resumes at the oldest
    /// hole and a long gap closes over successive syncs.
    async fn walk_conversation(&self, conversation: &Conversation) -> Result<PullResult> {
        let mut result = PullResult::default();
        let mut budget = self.max_walk;
        let mut visited = HashSet::new();

        match self.remote_head(conversation).await {
            Ok(Some(remote)) if Some(&remote) != conversation.head_cid.as_ref() => {
                self.walk(remote, true, &mut budget, &mut visited, &mut result)
                    .await?;
            }
            Ok(_) => {}
            Err(e) => debug!(conversation = %conversation.id, error = %e, "no remote head"),
        }

        if let Some(local) = &conversation.head_cid {
            self.walk(local.clone(), false, &mut budget, &mut visited, &mut result)
                .await?;
        }
        Ok(result)
    }

    async fn walk(
        &self,
        start: Cid,
        stop_at_known: bool,
        budget: &mut usize,
        visited: &mut HashSet<Cid>,
        result: &mut PullResult,
    ) -> Result<()> {
        let mut next = Some(start);
        while let Some(cid) = next.take() {
            if !visited.insert(cid.clone()) {
                break;
            }

            if let Some(pin) = self.messages.pin_record(&cid)? {
                if stop_at_known {
                    break;
                }
                next = pin.previous;
                continue;
            }

            if *budget == 0 {
                debug!(cid = %cid, "sync walk bound reached");
                break;
            }
            *budget -= 1;
            match self.messages.import_node(&cid).await {
                Ok(imported) => {
                    if imported.fresh {
                        result.messages.push(imported.message);
                    }
                    next = imported.previous;
                }
                Err(e) => {
                    warn!(cid = %cid, error = %e, "could not pull node");
                    result.failed_cids.push(cid);
                }
            }
        }
        Ok(())
    }

    /// The head announced in the conversation manifest, if its signature
    /// checks out against the signer's known key.
    async fn remote_head(&self, conversation: &Conversation) -> Result<Option<Cid>> {
        let key = format!("{DIR_MANIFEST_PREFIX}{}", conversation.id);
        let raw = tokio::time::timeout(self.timeout, self.directory.lookup(&key))
            .await
            .map_err(|_| DirectoryError::Timeout)??;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let cid_text = String::from_utf8(raw).map_err(|e| DirectoryError::Malformed {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let manifest_cid = Cid::parse(cid_text.trim())?;
        let value = tokio::time::timeout(self.timeout, self.content.get(&manifest_cid))
            .await
            .map_err(|_| ContentError::Timeout)??;
        if !manifest_cid.matches(&value) {
            return Err(ContentError::Mismatch(manifest_cid.to_string()).into());
        }
        let manifest: ConversationManifest = serde_json::from_value(value)?;

        if manifest.conversation_id != conversation.id {
            warn!(conversation = %conversation.id, "manifest names another conversation");
            return Ok(None);
        }
        let Some(signer) = conversation
            .participant(&manifest.signer)
            .filter(|p| p.has_keys())
        else {
            debug!(conversation = %conversation.id, "manifest signer unknown");
            return Ok(None);
        };
        if !manifest.verify(&signer.signing_key) {
            warn!(conversation = %conversation.id, "manifest signature invalid");
            return Ok(None);
        }
        Ok(Some(manifest.latest_message_cid))
    }
}
