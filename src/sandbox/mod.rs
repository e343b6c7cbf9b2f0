//! Isolation runtimes for executing untrusted code.
//!
//! A [`Sandbox`] turns an [`EnvironmentSpec`] into a running, isolated
//! process and hands back a [`SandboxProcess`] the supervisor owns from then
//! on. The production runtime is Docker; tests use a scripted mock.

mod docker;
#[cfg(test)]
pub(crate) mod mock;

pub(crate) use docker::DockerSandbox;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::path::PathBuf;

use crate::error::LaunchError;

/// A read-only bind mount from the host into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mount {
    pub host: PathBuf,
    pub container: String,
}

impl Mount {
    /// Docker bind string, always read-only.
    pub fn bind(&self) -> String {
        format!("{}:{}:ro", self.host.display(), self.container)
    }
}

/// Everything the runtime needs to start one sandbox.
///
/// Derived from a task by the launcher; never shared between tasks.
#[derive(Debug, Clone)]
pub(crate) struct EnvironmentSpec {
    /// Unique name for the sandbox instance.
    pub name: String,
    /// Runtime image for the task's language.
    pub image: String,
    /// Working directory inside the sandbox (the mount point).
    pub working_dir: String,
    /// The staging directory mount.
    pub mount: Mount,
    /// `<interpreter> <file>`.
    pub command: Vec<String>,
    /// Hard memory ceiling in bytes.
    pub memory_bytes: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
}

impl EnvironmentSpec {
    /// Sandboxes never get a network.
    pub fn network_disabled(&self) -> bool {
        true
    }

    /// Root filesystem is always mounted read-only.
    pub fn read_only_root(&self) -> bool {
        true
    }
}

/// One chunk of output from the sandboxed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Output of a sandboxed process, in the order it was produced.
pub(crate) type OutputStream = BoxStream<'static, Result<OutputChunk>>;

/// How a sandboxed process ended, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitStatus {
    /// Process exit code (128 + signal for signal deaths).
    pub code: i64,
    /// The runtime's own memory enforcement killed the process.
    pub oom_killed: bool,
}

/// Trait for isolation runtimes.
#[async_trait]
pub(crate) trait Sandbox: Send + Sync {
    /// Returns the runtime name for display.
    fn name(&self) -> &'static str;

    /// Starts the sandbox without waiting for it to finish.
    async fn launch(&self, spec: &EnvironmentSpec) -> Result<Box<dyn SandboxProcess>, LaunchError>;
}

/// A started sandbox, owned by the supervisor.
#[async_trait]
pub(crate) trait SandboxProcess: Send {
    /// Runtime identifier of the sandbox instance.
    fn id(&self) -> &str;

    /// Takes the output stream. Returns `None` after the first call.
    fn take_output(&mut self) -> Option<OutputStream>;

    /// Waits for the process to exit on its own.
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Kills every process in the sandbox and releases its runtime
    /// resources. Safe to call more than once.
    async fn terminate(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_bind_is_read_only() {
        let mount = Mount {
            host: PathBuf::from("/tmp/codebox-abc"),
            container: "/app".to_string(),
        };
        assert_eq!(mount.bind(), "/tmp/codebox-abc:/app:ro");
    }

    #[test]
    fn test_sandbox_traits_are_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn Sandbox>();
        assert_send_sync::<DockerSandbox>();
    }
}
