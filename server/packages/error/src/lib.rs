use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    WorkspaceNotFound,
    ConversationNotFound,
    FileNotFound,
    StateConflict,
    SandboxStart,
    SandboxUnavailable,
    CloneFailed,
    StreamError,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:workspace-agent:error:invalid_request",
            Self::WorkspaceNotFound => "urn:workspace-agent:error:workspace_not_found",
            Self::ConversationNotFound => "urn:workspace-agent:error:conversation_not_found",
            Self::FileNotFound => "urn:workspace-agent:error:file_not_found",
            Self::StateConflict => "urn:workspace-agent:error:state_conflict",
            Self::SandboxStart => "urn:workspace-agent:error:sandbox_start",
            Self::SandboxUnavailable => "urn:workspace-agent:error:sandbox_unavailable",
            Self::CloneFailed => "urn:workspace-agent:error:clone_failed",
            Self::StreamError => "urn:workspace-agent:error:stream_error",
            Self::Internal => "urn:workspace-agent:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::WorkspaceNotFound => "Workspace Not Found",
            Self::ConversationNotFound => "Conversation Not Found",
            Self::FileNotFound => "File Not Found",
            Self::StateConflict => "State Conflict",
            Self::SandboxStart => "Sandbox Start Failed",
            Self::SandboxUnavailable => "Sandbox Unavailable",
            Self::CloneFailed => "Clone Failed",
            Self::StreamError => "Stream Error",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::WorkspaceNotFound => 404,
            Self::ConversationNotFound => 404,
            Self::FileNotFound => 404,
            Self::StateConflict => 409,
            Self::SandboxStart => 503,
            Self::SandboxUnavailable => 503,
            Self::CloneFailed => 400,
            Self::StreamError => 502,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("workspace not found: {workspace_id}")]
    WorkspaceNotFound { workspace_id: String },
    #[error("conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: String },
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("state conflict: {message}")]
    StateConflict { message: String },
    #[error("sandbox start failed: {message}")]
    SandboxStart { message: String },
    #[error("sandbox unavailable: {message}")]
    SandboxUnavailable { message: String },
    #[error("clone failed: {repo}")]
    CloneFailed {
        repo: String,
        stderr: Option<String>,
    },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl WorkspaceError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::WorkspaceNotFound { .. } => ErrorType::WorkspaceNotFound,
            Self::ConversationNotFound { .. } => ErrorType::ConversationNotFound,
            Self::FileNotFound { .. } => ErrorType::FileNotFound,
            Self::StateConflict { .. } => ErrorType::StateConflict,
            Self::SandboxStart { .. } => ErrorType::SandboxStart,
            Self::SandboxUnavailable { .. } => ErrorType::SandboxUnavailable,
            Self::CloneFailed { .. } => ErrorType::CloneFailed,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::WorkspaceNotFound { workspace_id } => {
                extensions.insert(
                    "workspaceId".to_string(),
                    Value::String(workspace_id.clone()),
                );
            }
            Self::ConversationNotFound { conversation_id } => {
                extensions.insert(
                    "conversationId".to_string(),
                    Value::String(conversation_id.clone()),
                );
            }
            Self::FileNotFound { path } => {
                extensions.insert("path".to_string(), Value::String(path.clone()));
            }
            Self::CloneFailed { repo, stderr } => {
                extensions.insert("repo".to_string(), Value::String(repo.clone()));
                if let Some(stderr) = stderr {
                    extensions.insert("stderr".to_string(), Value::String(stderr.clone()));
                }
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<WorkspaceError> for ProblemDetails {
    fn from(value: WorkspaceError) -> Self {
        value.to_problem_details()
    }
}

impl From<&WorkspaceError> for ProblemDetails {
    fn from(value: &WorkspaceError) -> Self {
        value.to_problem_details()
    }
}
