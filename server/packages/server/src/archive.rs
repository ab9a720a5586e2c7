use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;

use workspace_agent_error::WorkspaceError;

use crate::events::ConversationEvent;

/// Append-only event log for one conversation: one JSON object per line,
/// ordered by sequence number. Durable across restarts; events are immutable
/// once written.
#[derive(Debug, Clone)]
pub struct EventArchive {
    path: PathBuf,
}

impl EventArchive {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn append(&self, event: &ConversationEvent) -> Result<(), WorkspaceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| WorkspaceError::Internal {
                message: format!("failed to create archive directory: {err}"),
            })?;
        }
        let line = serde_json::to_string(event).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to encode event: {err}"),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| WorkspaceError::Internal {
                message: format!("failed to open archive: {err}"),
            })?;
        writeln!(file, "{line}").map_err(|err| WorkspaceError::Internal {
            message: format!("failed to append event: {err}"),
        })
    }

    /// Events with sequence greater than `offset`, in order. A conversation
    /// that has not produced events yet reads as empty.
    pub fn read_from(
        &self,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Vec<ConversationEvent>, WorkspaceError> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to open archive: {err}"),
        })?;

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| WorkspaceError::Internal {
                message: format!("failed to read archive: {err}"),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: ConversationEvent =
                serde_json::from_str(&line).map_err(|err| WorkspaceError::Internal {
                    message: format!("corrupt archive entry: {err}"),
                })?;
            if event.sequence <= offset {
                continue;
            }
            events.push(event);
            if let Some(limit) = limit {
                if events.len() as u64 >= limit {
                    break;
                }
            }
        }
        Ok(events)
    }

    pub fn last_sequence(&self) -> Result<u64, WorkspaceError> {
        Ok(self
            .read_from(0, None)?
            .last()
            .map(|event| event.sequence)
            .unwrap_or(0))
    }
}

/// Persistent conversation-id → workspace-id mapping, shared across all
/// workspaces. A conversation stays bound to its workspace for its lifetime.
#[derive(Debug)]
pub struct ConversationIndex {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl ConversationIndex {
    pub fn load(path: PathBuf) -> Result<Self, WorkspaceError> {
        let entries = if path.is_file() {
            let raw = fs::read_to_string(&path).map_err(|err| WorkspaceError::Internal {
                message: format!("failed to read conversation index: {err}"),
            })?;
            serde_json::from_str(&raw).map_err(|err| WorkspaceError::Internal {
                message: format!("corrupt conversation index: {err}"),
            })?
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), "conversation index loaded");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn workspace_for(&self, conversation_id: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("conversation index lock")
            .get(conversation_id)
            .cloned()
    }

    pub fn insert(
        &self,
        conversation_id: &str,
        workspace_id: &str,
    ) -> Result<(), WorkspaceError> {
        let snapshot = {
            let mut entries = self.entries.lock().expect("conversation index lock");
            entries.insert(conversation_id.to_string(), workspace_id.to_string());
            entries.clone()
        };
        self.persist(&snapshot)
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), WorkspaceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| WorkspaceError::Internal {
                message: format!("failed to create index directory: {err}"),
            })?;
        }
        let raw =
            serde_json::to_string_pretty(entries).map_err(|err| WorkspaceError::Internal {
                message: format!("failed to encode conversation index: {err}"),
            })?;
        fs::write(&self.path, raw).map_err(|err| WorkspaceError::Internal {
            message: format!("failed to write conversation index: {err}"),
        })
    }
}
