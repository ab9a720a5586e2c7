use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use workspace_agent_error::WorkspaceError;

use crate::archive::EventArchive;
use crate::events::{ConversationEvent, EventKind};

const BROADCAST_CAPACITY: usize = 256;

/// A live attachment to a conversation's event timeline: events replayed from
/// the archive, then the receiver for everything after them. The receiver is
/// subscribed under the same lock `publish` holds, so the combined sequence
/// has no gap and no duplicate.
#[derive(Debug)]
pub struct Subscription {
    pub initial_events: Vec<ConversationEvent>,
    pub receiver: broadcast::Receiver<ConversationEvent>,
}

/// The single ordered event source for one conversation, feeding two sinks:
/// the durable archive (always, first) and the live broadcast (best-effort,
/// bounded). A subscriber that falls more than the channel capacity behind
/// is disconnected by the broadcast channel; archival is never blocked.
#[derive(Debug)]
pub struct ConversationChannel {
    workspace_id: String,
    conversation_id: String,
    sender: broadcast::Sender<ConversationEvent>,
    inner: Mutex<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    archive: EventArchive,
    next_sequence: u64,
}

impl ConversationChannel {
    /// Open a channel over a conversation's archive, continuing the sequence
    /// where the archive left off.
    pub fn open(
        workspace_id: String,
        conversation_id: String,
        archive: EventArchive,
    ) -> Result<Arc<Self>, WorkspaceError> {
        let next_sequence = archive.last_sequence()? + 1;
        let (sender, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Arc::new(Self {
            workspace_id,
            conversation_id,
            sender,
            inner: Mutex::new(ChannelInner {
                archive,
                next_sequence,
            }),
        }))
    }

    pub async fn publish(
        &self,
        kind: EventKind,
        payload: Value,
    ) -> Result<ConversationEvent, WorkspaceError> {
        let mut inner = self.inner.lock().await;
        let event = ConversationEvent {
            sequence: inner.next_sequence,
            time: Utc::now().to_rfc3339(),
            workspace_id: self.workspace_id.clone(),
            conversation_id: self.conversation_id.clone(),
            kind,
            payload,
        };
        inner.archive.append(&event)?;
        inner.next_sequence += 1;
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// Attach with replay of archived events after `offset`.
    pub async fn subscribe(&self, offset: u64) -> Result<Subscription, WorkspaceError> {
        let inner = self.inner.lock().await;
        let initial_events = inner.archive.read_from(offset, None)?;
        Ok(Subscription {
            initial_events,
            receiver: self.sender.subscribe(),
        })
    }

    /// Attach at the current tail with no replay.
    pub async fn subscribe_live(&self) -> Subscription {
        let _inner = self.inner.lock().await;
        Subscription {
            initial_events: Vec::new(),
            receiver: self.sender.subscribe(),
        }
    }

    pub async fn last_sequence(&self) -> u64 {
        self.inner.lock().await.next_sequence - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(dir: &std::path::Path) -> Arc<ConversationChannel> {
        ConversationChannel::open(
            "w".to_string(),
            "c".to_string(),
            EventArchive::new(dir.join("events.jsonl")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn replay_plus_live_has_no_gap_or_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path());

        for n in 0..3 {
            channel
                .publish(EventKind::AgentAction, json!({"n": n}))
                .await
                .unwrap();
        }

        let mut subscription = channel.subscribe(0).await.unwrap();
        for n in 3..5 {
            channel
                .publish(EventKind::AgentAction, json!({"n": n}))
                .await
                .unwrap();
        }

        let mut sequences: Vec<u64> = subscription
            .initial_events
            .iter()
            .map(|event| event.sequence)
            .collect();
        while let Ok(event) = subscription.receiver.try_recv() {
            sequences.push(event.sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn offset_replay_skips_already_seen_events() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path());

        for n in 0..4 {
            channel
                .publish(EventKind::Observation, json!({"n": n}))
                .await
                .unwrap();
        }

        let subscription = channel.subscribe(2).await.unwrap();
        let sequences: Vec<u64> = subscription
            .initial_events
            .iter()
            .map(|event| event.sequence)
            .collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[tokio::test]
    async fn reopened_channel_continues_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let channel = channel(dir.path());
            channel
                .publish(EventKind::AgentAction, json!({}))
                .await
                .unwrap();
            channel
                .publish(EventKind::AgentAction, json!({}))
                .await
                .unwrap();
        }

        let reopened = channel(dir.path());
        let event = reopened
            .publish(EventKind::AgentAction, json!({}))
            .await
            .unwrap();
        assert_eq!(event.sequence, 3);
    }
}
