use std::{collections::HashMap, time::Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    container::LogOutput,
    exec::StartExecResults,
    models::{
        ContainerCreateBody,
        ExecConfig,
        HostConfig,
        Mount,
        MountTypeEnum,
        PortBinding,
    },
    query_parameters::{
        AttachContainerOptionsBuilder,
        CreateContainerOptions,
        CreateImageOptions,
        KillContainerOptions,
        ListContainersOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        StopContainerOptions,
        WaitContainerOptionsBuilder,
    },
    Docker,
};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{ContainerEngine, ContainerHandle, EngineFlavor, ExecOutput};
use crate::container_spec::ContainerSpec;

/// Seconds a standing runner gets to exit before it's killed.
const STOP_TIMEOUT_SECS: i32 = 3;

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the default Docker socket.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Connect to a specific Docker address.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    /// - HTTPS: `https://localhost:2376` (picks up `DOCKER_CERT_PATH`)
    pub fn with_address(address: &str) -> Result<Self> {
        let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
            let addr = address
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(
                &format!("http://{}", addr),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon via HTTP")?
        } else if address.starts_with("https://") {
            Docker::connect_with_defaults()
                .context("Failed to connect to Docker daemon via HTTPS")?
        } else {
            let socket_path = address.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker daemon via Unix socket")?
        };
        Ok(Self { docker })
    }

    pub fn from_config(address: Option<&str>) -> Result<Self> {
        match address {
            Some(address) => Self::with_address(address),
            None => Self::new(),
        }
    }
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.container_target.clone()),
            source: Some(m.host_source.clone()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let port_bindings = spec.debug_port.map(|port| {
        let mut bindings = HashMap::new();
        bindings.insert(
            format!("{port}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some(String::new()),
                host_port: Some(port.to_string()),
            }]),
        );
        bindings
    });

    HostConfig {
        mounts: Some(mounts),
        auto_remove: Some(spec.auto_remove),
        port_bindings,
        ..Default::default()
    }
}

fn build_create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let labels: HashMap<String, String> = spec
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let exposed_ports = spec.debug_port.map(|port| {
        let mut ports = HashMap::new();
        ports.insert(format!("{port}/tcp"), HashMap::new());
        ports
    });

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        entrypoint: spec.entrypoint.clone(),
        cmd: Some(spec.cmd.clone()),
        env: Some(env),
        labels: Some(labels),
        user: spec.user.clone(),
        open_stdin: Some(spec.stdin.open_stdin),
        stdin_once: Some(spec.stdin.stdin_once),
        attach_stdin: Some(spec.stdin.attach_stdin),
        attach_stdout: Some(spec.stdin.attach_stdout),
        attach_stderr: Some(spec.stdin.attach_stderr),
        tty: Some(false),
        exposed_ports,
        host_config: Some(build_host_config(spec)),
        ..Default::default()
    }
}

async fn collect_output<S>(mut output: S) -> Result<(Bytes, Bytes)>
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Unpin,
{
    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();
    while let Some(chunk) = output.next().await {
        match chunk.context("Failed to read container output")? {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                stdout.extend_from_slice(&message)
            }
            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
            LogOutput::StdIn { .. } => {}
        }
    }
    Ok((stdout.freeze(), stderr.freeze()))
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn flavor(&self) -> Result<EngineFlavor> {
        let info = self
            .docker
            .info()
            .await
            .context("Failed to query Docker daemon info")?;
        let os = info.operating_system.unwrap_or_default();
        if os.contains("Boot2Docker") {
            return Ok(EngineFlavor::CompatibilityVm);
        }
        Ok(EngineFlavor::Native)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).context("Failed to inspect image"),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, event = "image_pull_started", "Pulling Docker image");
        let start = Instant::now();

        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        image = %image,
                        duration_ms = %start.elapsed().as_millis(),
                        error = %e,
                        event = "image_pull_failed",
                        "Failed to pull Docker image"
                    );
                    return Err(e).context(format!("Failed to pull image {}", image));
                }
            }
        }

        info!(
            image = %image,
            duration_ms = %start.elapsed().as_millis(),
            event = "image_pull_completed",
            "Docker image pull completed"
        );
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let create_options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };
        let response = self
            .docker
            .create_container(Some(create_options), build_create_body(spec))
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        for warning in response.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker warning on create");
        }
        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn start_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", handle.name))?;
        info!(container = %handle.name, event = "container_started", "Container started");
        Ok(())
    }

    async fn run_attached(&self, handle: &ContainerHandle, stdin: Bytes) -> Result<ExecOutput> {
        let attach_options = AttachContainerOptionsBuilder::default()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .build();
        let mut attached = self
            .docker
            .attach_container(&handle.id, Some(attach_options))
            .await
            .with_context(|| format!("Failed to attach to container {}", handle.name))?;

        // Register for the exit before starting; auto-removed containers
        // are gone once they exit.
        let docker = self.docker.clone();
        let container_id = handle.id.clone();
        let waiter = tokio::spawn(async move {
            let options = WaitContainerOptionsBuilder::default()
                .condition("next-exit")
                .build();
            let mut exits = std::pin::pin!(docker.wait_container(&container_id, Some(options)));
            match exits.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Some(code)
                }
                _ => None,
            }
        });

        self.start_container(handle).await?;

        attached
            .input
            .write_all(&stdin)
            .await
            .context("Failed to write container stdin")?;
        attached
            .input
            .shutdown()
            .await
            .context("Failed to close container stdin")?;

        let (stdout, stderr) = collect_output(attached.output).await?;
        let exit_code = waiter.await.ok().flatten();

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn exec_in_container(
        &self,
        handle: &ContainerHandle,
        cmd: Vec<String>,
        env: Vec<(String, String)>,
        stdin: Bytes,
    ) -> Result<ExecOutput> {
        let config = ExecConfig {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(cmd),
            env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&handle.id, config)
            .await
            .with_context(|| format!("Failed to create exec in container {}", handle.name))?;

        let (stdout, stderr) = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start exec")?
        {
            StartExecResults::Attached { mut input, output } => {
                input
                    .write_all(&stdin)
                    .await
                    .context("Failed to write exec stdin")?;
                input.shutdown().await.context("Failed to close exec stdin")?;
                collect_output(output).await?
            }
            StartExecResults::Detached => {
                anyhow::bail!("exec in container {} started detached", handle.name)
            }
        };

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            stdout,
            stderr,
        })
    }

    async fn stop_container(&self, handle: &ContainerHandle) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(STOP_TIMEOUT_SECS),
            ..Default::default()
        };
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            }) => Ok(()),
            Err(e) => Err(e).context(format!("Failed to stop container {}", handle.name)),
        }
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()> {
        let _ = self
            .docker
            .kill_container(
                &handle.id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await;

        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(container = %handle.name, event = "container_removed", "Container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).context(format!("Failed to remove container {}", handle.name)),
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerHandle>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .and_then(|names| names.first().cloned())
                    .map(|name| name.trim_start_matches('/').to_string())?;
                Some(ContainerHandle {
                    id: c.id.unwrap_or_else(|| name.clone()),
                    name,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        container_spec::{InvokeMode, StdinWiring},
        mounts::MountSpec,
    };

    fn spec(debug_port: Option<u16>) -> ContainerSpec {
        ContainerSpec {
            name: "fun_local_test".to_string(),
            image: "aliyunfc/runtime-nodejs8:1.5.6".to_string(),
            env: vec![("FC_HANDLER".to_string(), "index.handler".to_string())],
            mounts: vec![MountSpec {
                host_source: "/tmp/code".to_string(),
                container_target: "/code".to_string(),
                read_only: true,
            }],
            entrypoint: None,
            cmd: vec!["-h".to_string(), "index.handler".to_string()],
            mode: InvokeMode::Interactive,
            stdin: StdinWiring::interactive(),
            auto_remove: true,
            debug_port,
            user: Some("10003:10003".to_string()),
            labels: BTreeMap::from([("fc-local.managed".to_string(), "true".to_string())]),
        }
    }

    #[test]
    fn test_create_body_carries_spec() {
        let body = build_create_body(&spec(None));
        assert_eq!(body.env.unwrap(), vec!["FC_HANDLER=index.handler"]);
        assert_eq!(body.user.as_deref(), Some("10003:10003"));
        assert_eq!(body.open_stdin, Some(true));
        assert_eq!(body.stdin_once, Some(true));
        assert!(body.exposed_ports.is_none());

        let host_config = body.host_config.unwrap();
        assert_eq!(host_config.auto_remove, Some(true));
        let mounts = host_config.mounts.unwrap();
        assert_eq!(mounts[0].target.as_deref(), Some("/code"));
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[0].read_only, Some(true));
    }

    #[test]
    fn test_debug_port_is_published_on_same_host_port() {
        let body = build_create_body(&spec(Some(9229)));
        assert!(body.exposed_ports.unwrap().contains_key("9229/tcp"));
        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["9229/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("9229"));
    }
}
