use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ContainerHandle, ContainerRuntime, ContainerSpec, ExecOutput, ExecStream, RuntimeError};

const HEALTH_ATTEMPTS: usize = 40;
const HEALTH_DELAY_MS: u64 = 250;
const STOP_TIMEOUT_SECS: u64 = 10;

/// Drives sandbox containers through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    docker_bin: String,
    http_client: reqwest::Client,
}

impl DockerCliRuntime {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            http_client: reqwest::Client::new(),
        }
    }

    async fn run_docker(&self, args: &[String]) -> Result<std::process::Output, RuntimeError> {
        Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|err| RuntimeError::Unavailable {
                message: format!("failed to invoke {}: {err}", self.docker_bin),
            })
    }

    async fn wait_for_agent(&self, base_url: &str) -> Result<(), RuntimeError> {
        let health_url = format!("{base_url}/health");
        for _ in 0..HEALTH_ATTEMPTS {
            let probe = self
                .http_client
                .get(&health_url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
            if probe.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(HEALTH_DELAY_MS)).await;
        }
        Err(RuntimeError::StartFailed {
            message: format!("agent server at {base_url} never became healthy"),
            stderr: None,
        })
    }
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let status = Command::new(&self.docker_bin)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|err| RuntimeError::Unavailable {
                message: format!("failed to invoke {}: {err}", self.docker_bin),
            })?;
        if !status.success() {
            return Err(RuntimeError::Unavailable {
                message: "docker daemon is not running".to_string(),
            });
        }
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let host_port = free_host_port()?;
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", spec.name_prefix, &suffix[..12]);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.clone(),
            "-v".into(),
            format!("{}:{}", spec.mount_dir.display(), spec.mount_target),
            "-p".into(),
            format!("{host_port}:{}", spec.agent_port),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let output = self.run_docker(&args).await?;
        if !output.status.success() {
            return Err(RuntimeError::StartFailed {
                message: format!("docker run exited with {}", output.status),
                stderr: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            });
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let base_url = format!("http://127.0.0.1:{host_port}");
        info!(container = %name, id = %container_id, url = %base_url, "sandbox container started");

        if let Err(err) = self.wait_for_agent(&base_url).await {
            warn!(container = %name, "agent server never answered, stopping container");
            let handle = ContainerHandle {
                container_id: container_id.clone(),
                name,
                base_url,
            };
            let _ = self.stop(&handle).await;
            return Err(err);
        }

        Ok(ContainerHandle {
            container_id,
            name,
            base_url,
        })
    }

    async fn exec_stream(
        &self,
        handle: &ContainerHandle,
        command: Vec<String>,
    ) -> Result<ExecStream, RuntimeError> {
        let mut args: Vec<String> = vec!["exec".into(), handle.container_id.clone()];
        args.extend(command);

        let mut child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| RuntimeError::ExecFailed {
                message: format!("failed to spawn docker exec: {err}"),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| RuntimeError::ExecFailed {
            message: "docker exec produced no stdout pipe".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            let container = handle.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(container = %container, line = %line, "sandbox exec stderr");
                }
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(ExecOutput::Line(line)).await.is_err() {
                    break;
                }
            }
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(error = %err, "failed to reap docker exec child");
                    None
                }
            };
            let _ = tx.send(ExecOutput::Exited { code }).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), RuntimeError> {
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", handle.container_id, container_path),
            host_path.display().to_string(),
        ];
        let output = self.run_docker(&args).await?;
        if !output.status.success() {
            return Err(RuntimeError::CopyFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            STOP_TIMEOUT_SECS.to_string(),
            handle.container_id.clone(),
        ];
        let output = self.run_docker(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            debug!(container = %handle.name, "container already gone on stop");
            return Ok(());
        }
        Err(RuntimeError::StopFailed {
            message: stderr.trim().to_string(),
        })
    }
}

fn free_host_port() -> Result<u16, RuntimeError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| RuntimeError::Unavailable {
        message: format!("failed to reserve host port: {err}"),
    })?;
    let port = listener
        .local_addr()
        .map_err(|err| RuntimeError::Unavailable {
            message: format!("failed to read reserved port: {err}"),
        })?
        .port();
    Ok(port)
}
