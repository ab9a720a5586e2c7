//! Container runtime capability for workspace sandboxes.
//!
//! The serving process never talks to a container runtime directly; it goes
//! through the [`ContainerRuntime`] trait so the Docker CLI implementation can
//! be swapped for [`testing::FakeRuntime`] in tests.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

mod docker;
pub mod testing;

pub use docker::DockerCliRuntime;

/// What to start: image, host mount, and the in-container agent port that
/// gets published on a free host port.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name_prefix: String,
    pub mount_dir: PathBuf,
    pub mount_target: String,
    pub agent_port: u16,
    pub env: Vec<(String, String)>,
}

/// A running sandbox container. `base_url` points at the published agent
/// server port on the host.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub container_id: String,
    pub name: String,
    pub base_url: String,
}

/// One unit of output from an exec'd command inside the sandbox.
#[derive(Debug, Clone)]
pub enum ExecOutput {
    Line(String),
    Exited { code: Option<i32> },
}

pub type ExecStream = Pin<Box<dyn Stream<Item = ExecOutput> + Send>>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {message}")]
    Unavailable { message: String },
    #[error("container start failed: {message}")]
    StartFailed {
        message: String,
        stderr: Option<String>,
    },
    #[error("container exec failed: {message}")]
    ExecFailed { message: String },
    #[error("container copy failed: {message}")]
    CopyFailed { message: String },
    #[error("container stop failed: {message}")]
    StopFailed { message: String },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Probe the runtime daemon. Cheap; used by health checks.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Start a sandbox container and wait until its agent server answers.
    async fn start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Run a command inside the sandbox, streaming stdout lines followed by a
    /// terminal [`ExecOutput::Exited`] item.
    async fn exec_stream(
        &self,
        handle: &ContainerHandle,
        command: Vec<String>,
    ) -> Result<ExecStream, RuntimeError>;

    /// Copy a file out of the container onto the host.
    async fn copy_out(
        &self,
        handle: &ContainerHandle,
        container_path: &str,
        host_path: &Path,
    ) -> Result<(), RuntimeError>;

    /// Stop and remove the container. Stopping a container that is already
    /// gone is not an error.
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
