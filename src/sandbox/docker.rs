use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{EnvironmentSpec, ExitStatus, OutputChunk, OutputStream, Sandbox, SandboxProcess};
use crate::error::LaunchError;

const TASK_LABEL: &str = "codebox.task";

/// Runs each task in a fresh, locked-down Docker container
#[derive(Debug, Clone)]
pub(crate) struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon
    pub fn connect() -> Result<Self, LaunchError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            LaunchError::runtime_unavailable(format!("{e}. Is Docker running?"))
        })?;
        Ok(Self { docker })
    }

    /// Check the daemon answers before any task is accepted
    pub async fn ping(&self) -> Result<(), LaunchError> {
        self.docker.ping().await.map_err(|e| {
            LaunchError::runtime_unavailable(format!(
                "cannot ping daemon ({e}). Is Docker running?"
            ))
        })?;
        Ok(())
    }

    /// The underlying client, for image management
    pub fn client(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn launch(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<Box<dyn SandboxProcess>, LaunchError> {
        debug!("Creating container: {}", spec.name);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| create_error(e, &spec.image))?;

        let mut process = DockerProcess {
            docker: self.docker.clone(),
            name: spec.name.clone(),
            output: None,
            removed: false,
        };

        // Attach before starting so nothing written early is lost
        let attached = self
            .docker
            .attach_container(
                &spec.name,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await;

        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                let _ = process.terminate().await;
                return Err(LaunchError::rejected(format!(
                    "Failed to attach to container: {e}"
                )));
            }
        };

        process.output = Some(
            attached
                .output
                .filter_map(|item| async move {
                    match item {
                        Ok(LogOutput::StdOut { message }) => {
                            Some(Ok(OutputChunk::Stdout(message)))
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            Some(Ok(OutputChunk::Stderr(message)))
                        }
                        Ok(_) => None,
                        Err(e) => Some(Err(
                            anyhow::Error::new(e).context("Error reading container output")
                        )),
                    }
                })
                .boxed(),
        );

        debug!("Starting container: {}", spec.name);
        if let Err(e) = self.docker.start_container::<String>(&spec.name, None).await {
            let _ = process.terminate().await;
            return Err(start_error(e));
        }

        info!("Started container {} ({})", spec.name, spec.image);
        Ok(Box::new(process))
    }
}

/// A started container. Force-removed on terminate, or on drop as a fallback.
struct DockerProcess {
    docker: Docker,
    name: String,
    output: Option<OutputStream>,
    removed: bool,
}

#[async_trait]
impl SandboxProcess for DockerProcess {
    fn id(&self) -> &str {
        &self.name
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        let code = {
            let mut stream = std::pin::pin!(self.docker.wait_container(
                &self.name,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            ));

            match stream.next().await {
                Some(Ok(response)) => response.status_code,
                // bollard reports non-zero exits as an error carrying the code
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(e).context("Failed to wait for container"),
                None => anyhow::bail!("Container wait stream ended without a status"),
            }
        };

        let oom_killed = match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => details
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!("Failed to inspect container {}: {}", self.name, e);
                false
            }
        };

        debug!(
            "Container {} exited with code {} (oom_killed={})",
            self.name, code, oom_killed
        );
        Ok(ExitStatus { code, oom_killed })
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }

        // The container may already have exited; only removal must succeed
        if let Err(e) = self
            .docker
            .kill_container(
                &self.name,
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await
        {
            debug!("Kill of {} skipped: {}", self.name, e);
        }

        match self
            .docker
            .remove_container(
                &self.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) | Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!("Removed container {}", self.name);
                self.removed = true;
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove container {}", self.name)),
        }
    }
}

impl Drop for DockerProcess {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Container {} left behind: no runtime to remove it", self.name);
            return;
        };
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            let _ = docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
        });
    }
}

/// Container settings enforcing the sandbox constraints
fn container_config(spec: &EnvironmentSpec) -> ContainerConfig<String> {
    let network_mode = if spec.network_disabled() {
        "none"
    } else {
        "bridge"
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        working_dir: Some(spec.working_dir.clone()),
        network_disabled: Some(spec.network_disabled()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        open_stdin: Some(false),
        labels: Some(HashMap::from([(TASK_LABEL.to_string(), spec.name.clone())])),
        host_config: Some(HostConfig {
            binds: Some(vec![spec.mount.bind()]),
            memory: Some(spec.memory_bytes),
            // Equal to memory: no swap to fall back on
            memory_swap: Some(spec.memory_bytes),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(network_mode.to_string()),
            readonly_rootfs: Some(spec.read_only_root()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn create_error(err: BollardError, image: &str) -> LaunchError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => LaunchError::image_not_found(image),
        BollardError::DockerResponseServerError { message, .. } => LaunchError::rejected(message),
        other => LaunchError::runtime_unavailable(other.to_string()),
    }
}

fn start_error(err: BollardError) -> LaunchError {
    match err {
        BollardError::DockerResponseServerError { message, .. } => LaunchError::rejected(message),
        other => LaunchError::runtime_unavailable(other.to_string()),
    }
}
