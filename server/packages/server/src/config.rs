use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use workspace_agent_sandbox_runtime::ContainerSpec;

const DEFAULT_IDLE_TTL_SECS: u64 = 1800;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/workspace-agent/agent-sandbox:latest";
const DEFAULT_RUNNER_BIN: &str = "workspace-agent-runner";
const CONTAINER_NAME_PREFIX: &str = "ws-sandbox";
const MOUNT_TARGET: &str = "/workspace";
const AGENT_PORT: u16 = 8000;
const WORKSPACE_SUBDIR: &str = "workspace";

/// Server configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host directory under which every workspace mount lives.
    pub workspace_root: PathBuf,
    /// Idle duration after which a session becomes eligible for reclamation.
    pub idle_ttl: Duration,
    /// Interval between idle-reaper sweeps.
    pub sweep_interval: Duration,
    /// Image the sandbox containers run.
    pub sandbox_image: String,
    /// Binary inside the sandbox that executes conversation turns.
    pub runner_bin: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let workspace_root = match env::var("HOST_WORKSPACE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir).join(WORKSPACE_SUBDIR),
            _ => env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(WORKSPACE_SUBDIR),
        };

        Self {
            workspace_root,
            idle_ttl: env_duration_secs("WORKSPACE_AGENT_IDLE_TTL", DEFAULT_IDLE_TTL_SECS),
            sweep_interval: env_duration_secs(
                "WORKSPACE_AGENT_SWEEP_INTERVAL",
                DEFAULT_SWEEP_INTERVAL_SECS,
            ),
            sandbox_image: env::var("WORKSPACE_AGENT_SANDBOX_IMAGE")
                .unwrap_or_else(|_| DEFAULT_SANDBOX_IMAGE.to_string()),
            runner_bin: env::var("WORKSPACE_AGENT_RUNNER_BIN")
                .unwrap_or_else(|_| DEFAULT_RUNNER_BIN.to_string()),
        }
    }

    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.workspace_root.join(workspace_id)
    }

    pub fn project_dir(&self, workspace_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id).join("project")
    }

    pub fn conversation_dir(&self, workspace_id: &str, conversation_id: &str) -> PathBuf {
        self.workspace_dir(workspace_id)
            .join("conversations")
            .join(conversation_id)
    }

    pub fn events_path(&self, workspace_id: &str, conversation_id: &str) -> PathBuf {
        self.conversation_dir(workspace_id, conversation_id)
            .join("events.jsonl")
    }

    pub fn state_path(&self, workspace_id: &str, conversation_id: &str) -> PathBuf {
        self.conversation_dir(workspace_id, conversation_id)
            .join("state.json")
    }

    /// The conversation-id → workspace-id index, shared by all workspaces.
    pub fn index_path(&self) -> PathBuf {
        self.workspace_root.join("conversations.json")
    }

    pub fn container_spec(&self, mount_dir: &Path) -> ContainerSpec {
        ContainerSpec {
            image: self.sandbox_image.clone(),
            name_prefix: CONTAINER_NAME_PREFIX.to_string(),
            mount_dir: mount_dir.to_path_buf(),
            mount_target: MOUNT_TARGET.to_string(),
            agent_port: AGENT_PORT,
            env: Vec::new(),
        }
    }

    /// Command line that runs one conversation turn inside the sandbox.
    pub fn runner_command(&self, conversation_id: &str, message: &str) -> Vec<String> {
        vec![
            self.runner_bin.clone(),
            "run".to_string(),
            "--workdir".to_string(),
            format!("{MOUNT_TARGET}/project"),
            "--conversation-id".to_string(),
            conversation_id.to_string(),
            "--message".to_string(),
            message.to_string(),
        ]
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_workspace_root() {
        let config = ServerConfig {
            workspace_root: PathBuf::from("/srv/workspace"),
            idle_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            sandbox_image: "img".to_string(),
            runner_bin: "runner".to_string(),
        };
        assert_eq!(
            config.events_path("w1", "c1"),
            PathBuf::from("/srv/workspace/w1/conversations/c1/events.jsonl")
        );
        assert_eq!(
            config.project_dir("w1"),
            PathBuf::from("/srv/workspace/w1/project")
        );
        assert_eq!(
            config.index_path(),
            PathBuf::from("/srv/workspace/conversations.json")
        );
    }
}
