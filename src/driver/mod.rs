mod docker;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
pub use docker::DockerEngine;

use crate::container_spec::ContainerSpec;

/// Label marking containers created by this tool.
pub const MANAGED_LABEL: &str = "fc-local.managed";
pub const SERVICE_LABEL: &str = "fc-local.service";
pub const FUNCTION_LABEL: &str = "fc-local.function";

/// How the container engine sees the host filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineFlavor {
    /// Engine runs directly on the host; host paths are used as is.
    #[default]
    Native,
    /// Engine runs inside a helper VM (docker toolbox); host paths must be
    /// translated to the VM's shared folder layout.
    CompatibilityVm,
}

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine-assigned id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
}

/// Collected output of an attached run or an exec call.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code when the engine reported one.
    pub exit_code: Option<i64>,
    pub stdout: Bytes,
    pub stderr: Bytes,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }
}

/// Container engine boundary.
///
/// Implementations return `anyhow` errors with context; the lifecycle wraps
/// them into [`crate::error::Error::ContainerEngine`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Detect whether the engine runs natively or inside a helper VM.
    async fn flavor(&self) -> Result<EngineFlavor>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but don't start) a container from a spec.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn start_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Attach to a created container, start it, feed `stdin` and collect its
    /// output until it exits.
    async fn run_attached(&self, handle: &ContainerHandle, stdin: Bytes) -> Result<ExecOutput>;

    /// Run a command inside a running container with `stdin` as its input.
    async fn exec_in_container(
        &self,
        handle: &ContainerHandle,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
        stdin: Bytes,
    ) -> Result<ExecOutput>;

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// Forcefully remove a container. Removing a container that no longer
    /// exists succeeds.
    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()>;

    /// List all containers (running or not) carrying `label` (`key=value`).
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        assert!(ExecOutput::default().success());
        assert!(
            ExecOutput {
                exit_code: Some(0),
                ..Default::default()
            }
            .success()
        );
        assert!(
            !ExecOutput {
                exit_code: Some(137),
                ..Default::default()
            }
            .success()
        );
    }
}
