use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use workspace_agent_error::WorkspaceError;
use workspace_agent_sandbox_runtime::ExecOutput;

use crate::archive::{ConversationIndex, EventArchive};
use crate::broadcast::{ConversationChannel, Subscription};
use crate::config::ServerConfig;
use crate::events::{stages, ConversationEvent, EventKind};
use crate::registry::{SessionLease, SessionStatus, SessionView, VscodeInfo, WorkspaceRegistry};
use crate::vcs;

const VSCODE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Created,
    Running,
    AwaitingInput,
    Finished,
    Failed,
}

/// Persisted per-conversation state snapshot (`state.json`). Rewritten after
/// every transition; reading it back is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub workspace_id: String,
    pub state: ConversationState,
    pub last_sequence: u64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationParams {
    pub message: String,
    pub workspace_id: Option<String>,
    pub conversation_id: Option<String>,
    pub git_repos: Vec<String>,
    pub git_token: Option<String>,
}

/// A conversation turn that has been accepted and spawned. The subscription
/// is attached before any event of the turn is published.
#[derive(Debug)]
pub struct StartedConversation {
    pub workspace_id: String,
    pub conversation_id: String,
    pub resumed: bool,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOutcome {
    Finished,
    AwaitingInput,
    Failed,
}

impl TurnOutcome {
    fn state(self) -> ConversationState {
        match self {
            Self::Finished => ConversationState::Finished,
            Self::AwaitingInput => ConversationState::AwaitingInput,
            Self::Failed => ConversationState::Failed,
        }
    }
}

/// Orchestrates create-or-resume: resolves ids, leases the workspace's
/// sandbox, runs the turn inside it, and routes every event through the
/// conversation's channel (archive first, then live fan-out).
#[derive(Clone)]
pub struct ConversationService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ServerConfig,
    registry: WorkspaceRegistry,
    index: ConversationIndex,
    channels: StdMutex<HashMap<String, Arc<ConversationChannel>>>,
    http_client: reqwest::Client,
}

impl ConversationService {
    pub fn new(
        config: ServerConfig,
        registry: WorkspaceRegistry,
    ) -> Result<Self, WorkspaceError> {
        fs::create_dir_all(&config.workspace_root).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to create workspace root: {err}"),
        })?;
        let index = ConversationIndex::load(config.index_path())?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                registry,
                index,
                channels: StdMutex::new(HashMap::new()),
                http_client: reqwest::Client::new(),
            }),
        })
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.inner.registry
    }

    pub async fn create_or_resume(
        &self,
        params: ConversationParams,
    ) -> Result<StartedConversation, WorkspaceError> {
        let message = params.message.trim().to_string();
        if message.is_empty() {
            return Err(WorkspaceError::InvalidRequest {
                message: "message is required".to_string(),
            });
        }

        let (workspace_id, conversation_id, resumed) = self.resolve_ids(&params)?;
        let project_dir = self.inner.config.project_dir(&workspace_id);
        fs::create_dir_all(&project_dir).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to create project directory: {err}"),
        })?;

        let lease = self.inner.registry.get_or_create(&workspace_id).await?;

        // Repositories are cloned once, when the conversation is first
        // created. A resume never re-clones.
        if !resumed && !params.git_repos.is_empty() {
            vcs::clone_repos(&project_dir, &params.git_repos, params.git_token.as_deref())
                .await?;
        }

        let mut record = if resumed {
            let record = self
                .load_record(&workspace_id, &conversation_id)?
                .ok_or_else(|| WorkspaceError::ConversationNotFound {
                    conversation_id: conversation_id.clone(),
                })?;
            if matches!(
                record.state,
                ConversationState::Finished | ConversationState::Failed
            ) {
                return Err(WorkspaceError::StateConflict {
                    message: format!(
                        "conversation {conversation_id} has already {}",
                        match record.state {
                            ConversationState::Failed => "failed",
                            _ => "finished",
                        }
                    ),
                });
            }
            record
        } else {
            let now = Utc::now().to_rfc3339();
            let record = ConversationRecord {
                conversation_id: conversation_id.clone(),
                workspace_id: workspace_id.clone(),
                state: ConversationState::Created,
                last_sequence: 0,
                created_at: now.clone(),
                updated_at: now,
            };
            self.inner.index.insert(&conversation_id, &workspace_id)?;
            self.store_record(&record)?;
            record
        };

        let channel = self.channel(&workspace_id, &conversation_id)?;
        let subscription = channel.subscribe_live().await;

        if let Some((vscode, source)) = self.ensure_vscode_info(&workspace_id).await {
            let view = self.inner.registry.view(&workspace_id);
            let _ = channel
                .publish(
                    EventKind::Lifecycle,
                    self.vscode_event_payload(&workspace_id, &vscode, view.as_ref(), source),
                )
                .await;
        }
        channel
            .publish(
                EventKind::Lifecycle,
                json!({
                    "stage": stages::CONVERSATION_READY,
                    "conversation_id": conversation_id,
                    "workspace_id": workspace_id,
                    "is_resume": resumed,
                }),
            )
            .await?;
        channel
            .publish(EventKind::UserMessage, json!({ "message": message }))
            .await?;

        record.state = ConversationState::Running;
        record.updated_at = Utc::now().to_rfc3339();
        self.store_record(&record)?;

        let service = self.clone();
        let turn_channel = channel.clone();
        tokio::spawn(async move {
            service.run_turn(lease, turn_channel, record, message).await;
        });

        Ok(StartedConversation {
            workspace_id,
            conversation_id,
            resumed,
            subscription,
        })
    }

    /// Execute one turn inside the sandbox. Owns the session lease for the
    /// whole turn: a client dropping its event stream does not cancel this.
    async fn run_turn(
        &self,
        lease: SessionLease,
        channel: Arc<ConversationChannel>,
        mut record: ConversationRecord,
        message: String,
    ) {
        let runtime = self.inner.registry.runtime();
        let command = self
            .inner
            .config
            .runner_command(&record.conversation_id, &message);

        let mut outcome = TurnOutcome::Finished;
        match runtime.exec_stream(lease.container(), command).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    match item {
                        ExecOutput::Line(line) => {
                            self.handle_agent_line(&channel, &line, &mut outcome).await;
                        }
                        ExecOutput::Exited { code } => {
                            if code != Some(0) {
                                self.publish_or_warn(
                                    &channel,
                                    EventKind::Error,
                                    json!({
                                        "message": "agent process exited abnormally",
                                        "exit_code": code,
                                    }),
                                )
                                .await;
                                outcome = TurnOutcome::Failed;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                self.publish_or_warn(
                    &channel,
                    EventKind::Error,
                    json!({ "message": err.to_string() }),
                )
                .await;
                outcome = TurnOutcome::Failed;
            }
        }

        record.state = outcome.state();
        self.publish_or_warn(
            &channel,
            EventKind::Lifecycle,
            json!({
                "stage": stages::CONVERSATION_FINISHED,
                "conversation_id": record.conversation_id,
                "workspace_id": record.workspace_id,
                "state": record.state,
            }),
        )
        .await;

        // Settle everything before the stream-end marker goes out: a client
        // that acts the moment its stream closes must see the persisted state
        // and a released session reference.
        record.last_sequence = channel.last_sequence().await;
        record.updated_at = Utc::now().to_rfc3339();
        if let Err(err) = self.store_record(&record) {
            warn!(
                conversation = %record.conversation_id,
                error = %err,
                "failed to persist conversation state"
            );
        }
        self.inner.registry.touch(&record.workspace_id);
        info!(
            conversation = %record.conversation_id,
            workspace = %record.workspace_id,
            state = ?record.state,
            "turn completed"
        );
        drop(lease);

        self.publish_or_warn(
            &channel,
            EventKind::Lifecycle,
            json!({
                "stage": stages::CLEANUP_COMPLETE,
                "conversation_id": record.conversation_id,
                "workspace_id": record.workspace_id,
            }),
        )
        .await;
    }

    async fn handle_agent_line(
        &self,
        channel: &ConversationChannel,
        line: &str,
        outcome: &mut TurnOutcome,
    ) {
        let parsed: Option<Value> = serde_json::from_str(line).ok();
        let Some(value) = parsed else {
            // Not part of the event protocol; keep it in the timeline raw.
            self.publish_or_warn(channel, EventKind::Observation, json!({ "raw": line }))
                .await;
            return;
        };

        let kind = match value.get("kind").and_then(Value::as_str) {
            Some("user_message") => EventKind::UserMessage,
            Some("agent_action") => EventKind::AgentAction,
            Some("observation") => EventKind::Observation,
            Some("error") => EventKind::Error,
            Some("lifecycle") => EventKind::Lifecycle,
            _ => {
                self.publish_or_warn(channel, EventKind::Observation, json!({ "raw": line }))
                    .await;
                return;
            }
        };
        let payload = value.get("payload").cloned().unwrap_or(Value::Null);

        if kind == EventKind::Lifecycle {
            match payload.get("status").and_then(Value::as_str) {
                Some("awaiting_input") => *outcome = TurnOutcome::AwaitingInput,
                Some("finished") => *outcome = TurnOutcome::Finished,
                Some("failed") => *outcome = TurnOutcome::Failed,
                _ => {}
            }
        }

        self.publish_or_warn(channel, kind, payload).await;
    }

    async fn publish_or_warn(
        &self,
        channel: &ConversationChannel,
        kind: EventKind,
        payload: Value,
    ) {
        if let Err(err) = channel.publish(kind, payload).await {
            warn!(error = %err, "failed to publish event");
        }
    }

    /// Archived event sequence, without a live subscription.
    pub fn archived_events(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<ConversationEvent>, WorkspaceError> {
        self.check_conversation(workspace_id, conversation_id)?;
        let archive = EventArchive::new(
            self.inner
                .config
                .events_path(workspace_id, conversation_id),
        );
        let events = archive.read_from(offset, limit)?;
        self.inner.registry.touch(workspace_id);
        Ok(events)
    }

    pub fn state_snapshot(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationRecord, WorkspaceError> {
        self.check_conversation(workspace_id, conversation_id)?;
        let record = self
            .load_record(workspace_id, conversation_id)?
            .ok_or_else(|| WorkspaceError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })?;
        self.inner.registry.touch(workspace_id);
        Ok(record)
    }

    pub fn project_file(
        &self,
        workspace_id: &str,
        file_path: &str,
    ) -> Result<crate::filesystem::ProjectFile, WorkspaceError> {
        validate_id("workspace_id", workspace_id)?;
        let workspace_dir = self.inner.config.workspace_dir(workspace_id);
        if !workspace_dir.is_dir() {
            return Err(WorkspaceError::WorkspaceNotFound {
                workspace_id: workspace_id.to_string(),
            });
        }
        let file = crate::filesystem::read_project_file(
            &self.inner.config.project_dir(workspace_id),
            file_path,
        )?;
        self.inner.registry.touch(workspace_id);
        Ok(file)
    }

    /// Editor connection metadata for a live session, refreshing the idle TTL.
    pub async fn editor_info(
        &self,
        workspace_id: &str,
    ) -> Result<(VscodeInfo, SessionView, &'static str), WorkspaceError> {
        validate_id("workspace_id", workspace_id)?;
        let view = self.live_view(workspace_id)?;
        let (info, source) =
            self.ensure_vscode_info(workspace_id)
                .await
                .ok_or_else(|| WorkspaceError::SandboxUnavailable {
                    message: "editor url is not available yet, retry shortly".to_string(),
                })?;
        self.inner.registry.touch(workspace_id);
        Ok((info, view, source))
    }

    /// Force-evict the workspace's sandbox, bypassing the idle TTL.
    pub async fn evict_workspace(&self, workspace_id: &str) -> Result<(), WorkspaceError> {
        validate_id("workspace_id", workspace_id)?;
        self.inner.registry.evict(workspace_id).await
    }

    pub fn vscode_event_payload(
        &self,
        workspace_id: &str,
        info: &VscodeInfo,
        view: Option<&SessionView>,
        source: &str,
    ) -> Value {
        let ttl_seconds = self.inner.config.idle_ttl.as_secs();
        let last_active = view
            .map(|view| view.last_used_ms / 1000)
            .unwrap_or_else(|| Utc::now().timestamp());
        let expires_at = last_active + ttl_seconds as i64;
        let remaining = (expires_at - Utc::now().timestamp()).max(0);
        json!({
            "stage": stages::VSCODE_INFO,
            "workspace_id": workspace_id,
            "url": info.url,
            "ttl_seconds": ttl_seconds,
            "last_active": last_active,
            "expires_at": expires_at,
            "remaining_seconds": remaining,
            "source": source,
        })
    }

    fn resolve_ids(
        &self,
        params: &ConversationParams,
    ) -> Result<(String, String, bool), WorkspaceError> {
        if let Some(conversation_id) = &params.conversation_id {
            validate_id("conversation_id", conversation_id)?;
            let mapped = self
                .inner
                .index
                .workspace_for(conversation_id)
                .ok_or_else(|| WorkspaceError::ConversationNotFound {
                    conversation_id: conversation_id.clone(),
                })?;
            if let Some(workspace_id) = &params.workspace_id {
                validate_id("workspace_id", workspace_id)?;
                if *workspace_id != mapped {
                    return Err(WorkspaceError::InvalidRequest {
                        message: format!(
                            "workspace_id {workspace_id} does not match the conversation's workspace {mapped}"
                        ),
                    });
                }
            }
            if !self.inner.config.workspace_dir(&mapped).is_dir() {
                return Err(WorkspaceError::WorkspaceNotFound {
                    workspace_id: mapped,
                });
            }
            return Ok((mapped, conversation_id.clone(), true));
        }

        // A caller-supplied id that the server has never seen is a request to
        // create that workspace; its directory is made on demand.
        let workspace_id = match &params.workspace_id {
            Some(workspace_id) => {
                validate_id("workspace_id", workspace_id)?;
                workspace_id.clone()
            }
            None => {
                let workspace_id = Uuid::new_v4().simple().to_string();
                info!(workspace = %workspace_id, "generated new workspace");
                workspace_id
            }
        };
        let conversation_id = Uuid::new_v4().simple().to_string();
        Ok((workspace_id, conversation_id, false))
    }

    fn check_conversation(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<(), WorkspaceError> {
        validate_id("workspace_id", workspace_id)?;
        validate_id("conversation_id", conversation_id)?;
        match self.inner.index.workspace_for(conversation_id) {
            Some(mapped) if mapped == workspace_id => Ok(()),
            _ => Err(WorkspaceError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            }),
        }
    }

    fn live_view(&self, workspace_id: &str) -> Result<SessionView, WorkspaceError> {
        match self.inner.registry.view(workspace_id) {
            Some(view)
                if matches!(view.status, SessionStatus::Active | SessionStatus::Idle) =>
            {
                Ok(view)
            }
            _ => Err(WorkspaceError::WorkspaceNotFound {
                workspace_id: workspace_id.to_string(),
            }),
        }
    }

    async fn ensure_vscode_info(
        &self,
        workspace_id: &str,
    ) -> Option<(VscodeInfo, &'static str)> {
        let view = self.inner.registry.view(workspace_id)?;
        if let Some(info) = view.vscode {
            return Some((info, "cache"));
        }
        let base_url = view.base_url?;
        let info = self.fetch_vscode(&base_url).await?;
        self.inner
            .registry
            .set_vscode(workspace_id, Some(info.clone()));
        Some((info, "fetch"))
    }

    async fn fetch_vscode(&self, base_url: &str) -> Option<VscodeInfo> {
        let request_url = format!("{base_url}/api/vscode/url");
        let response = self
            .inner
            .http_client
            .get(&request_url)
            .query(&[("base_url", base_url)])
            .timeout(VSCODE_FETCH_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "vscode url fetch failed");
            return None;
        }
        let body: Value = response.json().await.ok()?;
        let url = body.get("url").and_then(Value::as_str)?;
        Some(VscodeInfo {
            url: url.to_string(),
            fetched_at_ms: Utc::now().timestamp_millis(),
        })
    }

    fn channel(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Arc<ConversationChannel>, WorkspaceError> {
        let mut channels = self.inner.channels.lock().expect("channel table poisoned");
        if let Some(channel) = channels.get(conversation_id) {
            return Ok(channel.clone());
        }
        let archive = EventArchive::new(
            self.inner
                .config
                .events_path(workspace_id, conversation_id),
        );
        let channel = ConversationChannel::open(
            workspace_id.to_string(),
            conversation_id.to_string(),
            archive,
        )?;
        channels.insert(conversation_id.to_string(), channel.clone());
        Ok(channel)
    }

    fn load_record(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, WorkspaceError> {
        let path = self.inner.config.state_path(workspace_id, conversation_id);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to read conversation state: {err}"),
        })?;
        let record = serde_json::from_str(&raw).map_err(|err| WorkspaceError::Internal {
            message: format!("corrupt conversation state: {err}"),
        })?;
        Ok(Some(record))
    }

    fn store_record(&self, record: &ConversationRecord) -> Result<(), WorkspaceError> {
        let path = self
            .inner
            .config
            .state_path(&record.workspace_id, &record.conversation_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| WorkspaceError::Internal {
                message: format!("failed to create conversation directory: {err}"),
            })?;
        }
        let raw =
            serde_json::to_string_pretty(record).map_err(|err| WorkspaceError::Internal {
                message: format!("failed to encode conversation state: {err}"),
            })?;
        fs::write(&path, raw).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to write conversation state: {err}"),
        })
    }
}

fn validate_id(field: &str, id: &str) -> Result<(), WorkspaceError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(WorkspaceError::InvalidRequest {
            message: format!("{field} contains invalid characters"),
        });
    }
    Ok(())
}
