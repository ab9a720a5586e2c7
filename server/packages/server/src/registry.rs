use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use workspace_agent_error::WorkspaceError;
use workspace_agent_sandbox_runtime::{ContainerHandle, ContainerRuntime};

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Active,
    Idle,
    Terminating,
    Terminated,
}

/// Cached connection metadata for the sandbox's embedded editor.
#[derive(Debug, Clone)]
pub struct VscodeInfo {
    pub url: String,
    pub fetched_at_ms: i64,
}

#[derive(Debug)]
struct SessionEntry {
    mount_dir: PathBuf,
    container: Option<ContainerHandle>,
    status: SessionStatus,
    created_at_ms: i64,
    last_used_ms: i64,
    ref_count: u32,
    vscode: Option<VscodeInfo>,
}

/// Read-only snapshot of a session for handlers.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub workspace_id: String,
    pub status: SessionStatus,
    pub base_url: Option<String>,
    pub created_at_ms: i64,
    pub last_used_ms: i64,
    pub ref_count: u32,
    pub vscode: Option<VscodeInfo>,
}

/// Owns every sandbox session, one per workspace id. Concurrent callers for
/// the same workspace are serialized through a per-workspace creation lock
/// held across the whole check-then-create sequence, so a container is never
/// started twice for one workspace.
#[derive(Clone)]
pub struct WorkspaceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for WorkspaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRegistry").finish_non_exhaustive()
    }
}

struct RegistryInner {
    runtime: Arc<dyn ContainerRuntime>,
    config: ServerConfig,
    sessions: StdMutex<HashMap<String, SessionEntry>>,
    creation_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

enum Plan {
    Reuse(ContainerHandle, PathBuf),
    FinishTeardown(ContainerHandle),
    Fresh,
}

impl WorkspaceRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                runtime,
                config,
                sessions: StdMutex::new(HashMap::new()),
                creation_locks: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.inner.runtime.clone()
    }

    /// Reuse the workspace's live session or start a fresh sandbox for it.
    /// The returned lease pins the session: it cannot be evicted until every
    /// lease is dropped.
    pub async fn get_or_create(
        &self,
        workspace_id: &str,
    ) -> Result<SessionLease, WorkspaceError> {
        let creation_lock = self.creation_lock(workspace_id);
        let _guard = creation_lock.lock().await;

        let plan = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(workspace_id) {
                Some(entry) => match entry.status {
                    SessionStatus::Active | SessionStatus::Idle => {
                        let handle =
                            entry.container.clone().ok_or_else(|| WorkspaceError::Internal {
                                message: format!(
                                    "session {workspace_id} is live without a container"
                                ),
                            })?;
                        entry.status = SessionStatus::Active;
                        entry.ref_count += 1;
                        entry.last_used_ms = now_ms();
                        Plan::Reuse(handle, entry.mount_dir.clone())
                    }
                    SessionStatus::Terminating => {
                        match entry.container.clone() {
                            Some(handle) => Plan::FinishTeardown(handle),
                            None => Plan::Fresh,
                        }
                    }
                    SessionStatus::Starting | SessionStatus::Terminated => {
                        return Err(WorkspaceError::SandboxUnavailable {
                            message: format!(
                                "session for {workspace_id} is in transition, retry shortly"
                            ),
                        });
                    }
                },
                None => Plan::Fresh,
            }
        };

        match plan {
            Plan::Reuse(handle, mount_dir) => {
                debug!(workspace = %workspace_id, "reusing sandbox session");
                Ok(self.lease(workspace_id, handle, mount_dir))
            }
            Plan::FinishTeardown(handle) => {
                // A previous teardown crashed partway; finish it, then start
                // clean.
                info!(workspace = %workspace_id, "retrying leftover teardown before restart");
                self.inner
                    .runtime
                    .stop(&handle)
                    .await
                    .map_err(|err| WorkspaceError::SandboxUnavailable {
                        message: format!("previous sandbox is still terminating: {err}"),
                    })?;
                self.lock_sessions().remove(workspace_id);
                self.start_session(workspace_id).await
            }
            Plan::Fresh => self.start_session(workspace_id).await,
        }
    }

    async fn start_session(&self, workspace_id: &str) -> Result<SessionLease, WorkspaceError> {
        let mount_dir = self.inner.config.workspace_dir(workspace_id);
        let now = now_ms();
        {
            let mut sessions = self.lock_sessions();
            sessions.insert(
                workspace_id.to_string(),
                SessionEntry {
                    mount_dir: mount_dir.clone(),
                    container: None,
                    status: SessionStatus::Starting,
                    created_at_ms: now,
                    last_used_ms: now,
                    ref_count: 0,
                    vscode: None,
                },
            );
        }

        let spec = self.inner.config.container_spec(&mount_dir);
        match self.inner.runtime.start(&spec).await {
            Ok(handle) => {
                let mut sessions = self.lock_sessions();
                let entry = sessions.get_mut(workspace_id).ok_or_else(|| {
                    WorkspaceError::Internal {
                        message: format!("session {workspace_id} vanished during start"),
                    }
                })?;
                entry.container = Some(handle.clone());
                entry.status = SessionStatus::Active;
                entry.ref_count = 1;
                entry.last_used_ms = now_ms();
                info!(workspace = %workspace_id, container = %handle.name, "sandbox session started");
                Ok(self.lease(workspace_id, handle, mount_dir))
            }
            Err(err) => {
                // No orphaned state: a failed start leaves no registry entry.
                self.lock_sessions().remove(workspace_id);
                Err(WorkspaceError::SandboxStart {
                    message: err.to_string(),
                })
            }
        }
    }

    /// Stop the workspace's sandbox now, bypassing the idle TTL. Refuses
    /// while leases are outstanding. A teardown failure leaves the entry in
    /// Terminating so the reaper can retry it.
    pub async fn evict(&self, workspace_id: &str) -> Result<(), WorkspaceError> {
        self.evict_inner(workspace_id, None).await
    }

    async fn evict_inner(
        &self,
        workspace_id: &str,
        only_if_idle_for: Option<Duration>,
    ) -> Result<(), WorkspaceError> {
        let creation_lock = self.creation_lock(workspace_id);
        let _guard = creation_lock.lock().await;

        let handle = {
            let mut sessions = self.lock_sessions();
            let entry = sessions.get_mut(workspace_id).ok_or_else(|| {
                WorkspaceError::WorkspaceNotFound {
                    workspace_id: workspace_id.to_string(),
                }
            })?;
            if entry.ref_count > 0 {
                return Err(WorkspaceError::StateConflict {
                    message: format!(
                        "session for {workspace_id} has {} operation(s) in flight",
                        entry.ref_count
                    ),
                });
            }
            if entry.status == SessionStatus::Starting {
                return Err(WorkspaceError::StateConflict {
                    message: format!("session for {workspace_id} is still starting"),
                });
            }
            if let Some(ttl) = only_if_idle_for {
                let expired = entry.status == SessionStatus::Terminating
                    || now_ms() - entry.last_used_ms > ttl.as_millis() as i64;
                if !expired {
                    return Err(WorkspaceError::StateConflict {
                        message: format!("session for {workspace_id} is no longer expired"),
                    });
                }
            }
            entry.status = SessionStatus::Terminating;
            entry.container.clone()
        };

        let Some(handle) = handle else {
            self.lock_sessions().remove(workspace_id);
            return Ok(());
        };

        match self.inner.runtime.stop(&handle).await {
            Ok(()) => {
                let mut sessions = self.lock_sessions();
                if sessions
                    .get(workspace_id)
                    .map(|entry| entry.status == SessionStatus::Terminating)
                    .unwrap_or(false)
                {
                    sessions.remove(workspace_id);
                }
                info!(workspace = %workspace_id, container = %handle.name, "sandbox session evicted");
                Ok(())
            }
            Err(err) => {
                warn!(
                    workspace = %workspace_id,
                    error = %err,
                    "teardown failed, session left terminating for retry"
                );
                Err(WorkspaceError::Internal {
                    message: format!("sandbox teardown failed: {err}"),
                })
            }
        }
    }

    /// One reaper pass: evict idle-expired sessions and retry crashed
    /// teardowns. Sessions with leases outstanding are never touched.
    pub async fn sweep(&self, ttl: Duration) -> Vec<String> {
        let ttl_ms = ttl.as_millis() as i64;
        let now = now_ms();
        let candidates: Vec<String> = {
            let sessions = self.lock_sessions();
            sessions
                .iter()
                .filter(|(_, entry)| {
                    entry.ref_count == 0
                        && match entry.status {
                            SessionStatus::Idle => now - entry.last_used_ms > ttl_ms,
                            SessionStatus::Terminating => true,
                            _ => false,
                        }
                })
                .map(|(workspace_id, _)| workspace_id.clone())
                .collect()
        };

        let mut evicted = Vec::new();
        for workspace_id in candidates {
            match self.evict_inner(&workspace_id, Some(ttl)).await {
                Ok(()) => evicted.push(workspace_id),
                Err(WorkspaceError::StateConflict { .. }) => {
                    // The session was picked up again between the scan and the
                    // eviction; leave it alone.
                }
                Err(err) => {
                    warn!(workspace = %workspace_id, error = %err, "sweep eviction failed");
                }
            }
        }
        evicted
    }

    /// Refresh the session's last-used time, re-arming the idle TTL.
    pub fn touch(&self, workspace_id: &str) -> bool {
        let mut sessions = self.lock_sessions();
        match sessions.get_mut(workspace_id) {
            Some(entry) => {
                entry.last_used_ms = now_ms();
                true
            }
            None => false,
        }
    }

    pub fn view(&self, workspace_id: &str) -> Option<SessionView> {
        let sessions = self.lock_sessions();
        sessions.get(workspace_id).map(|entry| SessionView {
            workspace_id: workspace_id.to_string(),
            status: entry.status,
            base_url: entry
                .container
                .as_ref()
                .map(|handle| handle.base_url.clone()),
            created_at_ms: entry.created_at_ms,
            last_used_ms: entry.last_used_ms,
            ref_count: entry.ref_count,
            vscode: entry.vscode.clone(),
        })
    }

    pub fn set_vscode(&self, workspace_id: &str, info: Option<VscodeInfo>) {
        let mut sessions = self.lock_sessions();
        if let Some(entry) = sessions.get_mut(workspace_id) {
            entry.vscode = info;
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Documented teardown: wait briefly for in-flight leases to drain, then
    /// evict every remaining session.
    pub async fn shutdown(&self) {
        for _ in 0..50 {
            let busy = self
                .lock_sessions()
                .values()
                .any(|entry| entry.ref_count > 0);
            if !busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        for workspace_id in ids {
            if let Err(err) = self.evict(&workspace_id).await {
                warn!(workspace = %workspace_id, error = %err, "shutdown eviction failed");
            }
        }
    }

    fn lease(
        &self,
        workspace_id: &str,
        container: ContainerHandle,
        mount_dir: PathBuf,
    ) -> SessionLease {
        SessionLease {
            registry: self.clone(),
            workspace_id: workspace_id.to_string(),
            container,
            mount_dir,
        }
    }

    fn release(&self, workspace_id: &str) {
        let mut sessions = self.lock_sessions();
        if let Some(entry) = sessions.get_mut(workspace_id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used_ms = now_ms();
            if entry.ref_count == 0 && entry.status == SessionStatus::Active {
                entry.status = SessionStatus::Idle;
            }
        }
    }

    fn creation_lock(&self, workspace_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .inner
            .creation_locks
            .lock()
            .expect("creation locks poisoned");
        locks
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.inner.sessions.lock().expect("session table poisoned")
    }
}

/// An in-flight reference to a live session. Dropping it decrements the
/// session's reference count; the session turns Idle when the count reaches
/// zero.
#[derive(Debug)]
pub struct SessionLease {
    registry: WorkspaceRegistry,
    workspace_id: String,
    container: ContainerHandle,
    mount_dir: PathBuf,
}

impl SessionLease {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(&self.workspace_id);
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
