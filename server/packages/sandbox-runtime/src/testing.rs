//! In-memory [`ContainerRuntime`] for tests. Records starts and stops, plays
//! back scripted agent output, and can hold turns open behind a gate so tests
//! can observe in-flight state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;

use crate::{ContainerHandle, ContainerRuntime, ContainerSpec, ExecOutput, ExecStream, RuntimeError};

fn default_turn_lines() -> Vec<String> {
    vec![
        r#"{"kind":"agent_action","payload":{"summary":"ran a step"}}"#.to_string(),
        r#"{"kind":"observation","payload":{"output":"ok"}}"#.to_string(),
        r#"{"kind":"lifecycle","payload":{"status":"finished"}}"#.to_string(),
    ]
}

#[derive(Debug)]
struct FakeInner {
    started: AtomicUsize,
    stopped: AtomicUsize,
    fail_next_start: AtomicBool,
    start_delay: Mutex<Duration>,
    turn_lines: Mutex<Vec<String>>,
    exit_code: Mutex<Option<i32>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FakeRuntime {
    inner: Arc<FakeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeInner {
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                fail_next_start: AtomicBool::new(false),
                start_delay: Mutex::new(Duration::ZERO),
                turn_lines: Mutex::new(default_turn_lines()),
                exit_code: Mutex::new(Some(0)),
                gate: Mutex::new(None),
            }),
        }
    }

    /// Replace the scripted agent output for subsequent turns.
    pub fn set_turn_lines(&self, lines: Vec<String>) {
        *self.inner.turn_lines.lock().unwrap() = lines;
    }

    /// Exit code reported after the scripted lines (default 0).
    pub fn set_exit_code(&self, code: Option<i32>) {
        *self.inner.exit_code.lock().unwrap() = code;
    }

    /// Simulated container start latency, for racing concurrent creators.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.inner.start_delay.lock().unwrap() = delay;
    }

    /// The next `start` call fails with a start error.
    pub fn fail_next_start(&self) {
        self.inner.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Hold turns open: each exec waits for one permit before finishing.
    /// Returns the semaphore to release held turns with `add_permits`.
    pub fn gate_turns(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.inner.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let delay = *self.inner.start_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.inner.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::StartFailed {
                message: "scripted start failure".to_string(),
                stderr: None,
            });
        }
        let ordinal = self.inner.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ContainerHandle {
            container_id: format!("fake-{ordinal}"),
            name: format!("{}-{ordinal}", spec.name_prefix),
            base_url: format!("http://127.0.0.1:0/fake-{ordinal}"),
        })
    }

    async fn exec_stream(
        &self,
        _handle: &ContainerHandle,
        _command: Vec<String>,
    ) -> Result<ExecStream, RuntimeError> {
        let lines = self.inner.turn_lines.lock().unwrap().clone();
        let exit_code = *self.inner.exit_code.lock().unwrap();
        let gate = self.inner.gate.lock().unwrap().clone();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for line in lines {
                if tx.send(ExecOutput::Line(line)).await.is_err() {
                    return;
                }
            }
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let _ = tx.send(ExecOutput::Exited { code: exit_code }).await;
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn copy_out(
        &self,
        _handle: &ContainerHandle,
        _container_path: &str,
        _host_path: &Path,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.inner.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_lines_end_with_exit() {
        let runtime = FakeRuntime::new();
        let spec = ContainerSpec {
            image: "img".into(),
            name_prefix: "test".into(),
            mount_dir: std::env::temp_dir(),
            mount_target: "/workspace".into(),
            agent_port: 8000,
            env: Vec::new(),
        };
        let handle = runtime.start(&spec).await.unwrap();
        let mut stream = runtime.exec_stream(&handle, vec![]).await.unwrap();

        let mut lines = 0;
        let mut exited = false;
        while let Some(item) = stream.next().await {
            match item {
                ExecOutput::Line(_) => lines += 1,
                ExecOutput::Exited { code } => {
                    assert_eq!(code, Some(0));
                    exited = true;
                }
            }
        }
        assert_eq!(lines, 3);
        assert!(exited);
        assert_eq!(runtime.started(), 1);
    }

    #[tokio::test]
    async fn gated_turn_waits_for_release() {
        let runtime = FakeRuntime::new();
        let gate = runtime.gate_turns();
        let spec = ContainerSpec {
            image: "img".into(),
            name_prefix: "test".into(),
            mount_dir: std::env::temp_dir(),
            mount_target: "/workspace".into(),
            agent_port: 8000,
            env: Vec::new(),
        };
        let handle = runtime.start(&spec).await.unwrap();
        let mut stream = runtime.exec_stream(&handle, vec![]).await.unwrap();

        // Scripted lines arrive, but the exit is held behind the gate.
        for _ in 0..3 {
            assert!(matches!(
                stream.next().await,
                Some(ExecOutput::Line(_))
            ));
        }
        let pending =
            tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err());

        gate.add_permits(1);
        assert!(matches!(
            stream.next().await,
            Some(ExecOutput::Exited { code: Some(0) })
        ));
    }
}
