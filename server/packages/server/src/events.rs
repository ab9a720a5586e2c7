use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// One entry in a conversation's timeline. Sequence numbers are assigned by
/// the conversation's channel, start at 1, and are gap-free per conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ConversationEvent {
    pub sequence: u64,
    pub time: String,
    pub workspace_id: String,
    pub conversation_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AgentAction,
    Observation,
    Error,
    Lifecycle,
}

/// Lifecycle stage labels, doubling as SSE event names. These match what the
/// browser console listens for.
pub mod stages {
    pub const VSCODE_INFO: &str = "vscode-info";
    pub const CONVERSATION_READY: &str = "conversation-ready";
    pub const CONVERSATION_FINISHED: &str = "conversation-finished";
    pub const CLEANUP_COMPLETE: &str = "cleanup-complete";
}

impl ConversationEvent {
    /// The SSE `event:` name for this event.
    pub fn sse_name(&self) -> &str {
        match self.kind {
            EventKind::UserMessage => "message-queued",
            EventKind::AgentAction | EventKind::Observation => "agent-event",
            EventKind::Error => "error",
            EventKind::Lifecycle => self
                .payload
                .get("stage")
                .and_then(Value::as_str)
                .unwrap_or("lifecycle"),
        }
    }

    /// Whether this event terminates a conversation turn's live stream.
    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::Lifecycle && self.sse_name() == stages::CLEANUP_COMPLETE
    }
}
