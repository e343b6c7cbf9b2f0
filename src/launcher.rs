//! Sandbox launcher.
//!
//! Maps a validated task onto a concrete [`EnvironmentSpec`] (image,
//! mount, command, resource flags) and starts it on the isolation runtime.
//! Inline code is first written to its own single-file staging directory so
//! inline and archive submissions share the same mounting path.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, LanguagesConfig};
use crate::error::LaunchError;
use crate::sandbox::{EnvironmentSpec, Mount, Sandbox, SandboxProcess};
use crate::staging::StagingDir;
use crate::task::{Language, TaskDescriptor, TaskSource};

/// Builds and starts one sandbox per task.
#[derive(Clone)]
pub(crate) struct Launcher {
    sandbox: Arc<dyn Sandbox>,
    languages: LanguagesConfig,
    mount_point: String,
    pids_limit: i64,
}

impl Launcher {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &Config) -> Self {
        Self {
            sandbox,
            languages: config.languages.clone(),
            mount_point: config.sandbox.mount_point.clone(),
            pids_limit: config.limits.pids_limit,
        }
    }

    /// Runtime name, for logs.
    pub fn runtime_name(&self) -> &'static str {
        self.sandbox.name()
    }

    /// Write an inline task's code into a fresh staging directory.
    pub fn stage_inline(&self, task: &TaskDescriptor) -> Result<StagingDir, LaunchError> {
        let TaskSource::Inline(code) = task.source() else {
            return Err(LaunchError::rejected(format!(
                "task {} has no inline source to stage",
                task.id()
            )));
        };
        let staging = StagingDir::with_file(task.language().inline_file_name(), code)?;
        debug!(
            "Staged inline code for task {} in {}",
            task.id(),
            staging.path().display()
        );
        Ok(staging)
    }

    /// Derive the environment spec for `task` running out of `staging`.
    pub fn environment(
        &self,
        task: &TaskDescriptor,
        staging: &StagingDir,
    ) -> Result<EnvironmentSpec, LaunchError> {
        let runtime = self.runtime_for(task.language())?;

        let file = match task.source() {
            TaskSource::Inline(_) => task.language().inline_file_name().to_string(),
            TaskSource::Project { entry } => entry.to_container_path(),
        };

        Ok(EnvironmentSpec {
            name: format!("codebox-{}-{}", sanitize(task.id()), short_suffix()),
            image: runtime.image.clone(),
            working_dir: self.mount_point.clone(),
            mount: Mount {
                host: staging.path().to_path_buf(),
                container: self.mount_point.clone(),
            },
            command: vec![runtime.interpreter.clone(), file],
            memory_bytes: task.limits().memory_bytes,
            pids_limit: self.pids_limit,
        })
    }

    /// Start the sandbox. Ownership of the process passes to the caller.
    pub async fn launch(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<Box<dyn SandboxProcess>, LaunchError> {
        debug!("Launch command: {:?}", spec.command);
        match self.sandbox.launch(spec).await {
            Ok(process) => {
                info!("Launched sandbox {} on {}", process.id(), self.sandbox.name());
                Ok(process)
            }
            Err(e) => {
                warn!("Failed to launch sandbox {}: {}", spec.name, e);
                Err(e)
            }
        }
    }

    /// Image and interpreter for a language; fails closed if unconfigured.
    fn runtime_for(
        &self,
        language: Language,
    ) -> Result<&crate::config::RuntimeConfig, LaunchError> {
        let runtime = self.languages.runtime(language);
        if runtime.image.trim().is_empty() || runtime.interpreter.trim().is_empty() {
            return Err(LaunchError::unsupported_language(language.to_string()));
        }
        Ok(runtime)
    }
}

/// Keep only characters Docker accepts in container names.
fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

/// Random suffix so resubmitted ids never collide with a live container.
fn short_suffix() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..8].to_string()
}
