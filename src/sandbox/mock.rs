//! Scripted sandbox for testing.
//!
//! Reads the staged source file and picks a behavior from it, so tests can
//! drive the whole pipeline (staging, launch, supervision, cleanup) without
//! Docker. Tracks launches, terminations and peak concurrency for
//! assertions.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{EnvironmentSpec, ExitStatus, OutputChunk, OutputStream, Sandbox, SandboxProcess};
use crate::error::LaunchError;

/// What a mock process does once launched.
#[derive(Debug, Clone)]
pub(crate) enum MockBehavior {
    /// Write output, then exit with `code` after `delay`.
    Exit {
        stdout: String,
        stderr: String,
        code: i64,
        delay: Duration,
    },
    /// Write `stdout`, then never exit.
    Hang { stdout: String },
    /// Write `stdout` and exit 0, but leave the output stream open.
    Linger { stdout: String },
    /// Get killed by the runtime's memory enforcement.
    OomKill,
    /// Exit by SIGKILL (137) without the runtime flagging OOM.
    Sigkill,
    /// Fail to start.
    LaunchFail(String),
    /// Lose track of the process while waiting.
    WaitError(String),
}

impl MockBehavior {
    /// Interpret a tiny subset of Python-ish test programs.
    ///
    /// - `print(X)` lines: each prints `X`, exit 0
    /// - `while True: pass`: hangs
    /// - `sleep N`: prints nothing, exits 0 after N ms
    /// - `exit N`: exits with code N, writes to stderr
    /// - `linger`: exits 0 with its output stream left open
    /// - `alloc`: OOM kill; `sigkill`: exit 137 without OOM
    /// - `launch-fail`: launch error; `wait-error`: supervision fault
    pub fn from_source(source: &str) -> Self {
        let source = source.trim();
        if source.starts_with("while True") {
            return Self::Hang {
                stdout: "started\n".to_string(),
            };
        }
        if source == "linger" {
            return Self::Linger {
                stdout: "still here\n".to_string(),
            };
        }
        if source == "alloc" {
            return Self::OomKill;
        }
        if source == "sigkill" {
            return Self::Sigkill;
        }
        if source == "launch-fail" {
            return Self::LaunchFail("image missing".to_string());
        }
        if source == "wait-error" {
            return Self::WaitError("daemon went away".to_string());
        }
        if let Some(ms) = source.strip_prefix("sleep ") {
            return Self::Exit {
                stdout: String::new(),
                stderr: String::new(),
                code: 0,
                delay: Duration::from_millis(ms.trim().parse().unwrap_or(0)),
            };
        }
        if let Some(code) = source.strip_prefix("exit ") {
            return Self::Exit {
                stdout: String::new(),
                stderr: "Traceback: boom\n".to_string(),
                code: code.trim().parse().unwrap_or(1),
                delay: Duration::ZERO,
            };
        }

        let stdout: String = source
            .lines()
            .filter_map(|line| {
                line.trim()
                    .strip_prefix("print(")
                    .and_then(|rest| rest.strip_suffix(')'))
            })
            .map(|arg| format!("{}\n", arg.trim_matches(|c| c == '\'' || c == '"')))
            .collect();

        Self::Exit {
            stdout,
            stderr: String::new(),
            code: 0,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicUsize,
    terminations: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// A mock isolation runtime.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSandbox {
    counters: Arc<Counters>,
    seen: Arc<Mutex<Vec<EnvironmentSpec>>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of launch attempts, including failed ones.
    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Number of `terminate` calls that did work.
    pub fn terminations(&self) -> usize {
        self.counters.terminations.load(Ordering::SeqCst)
    }

    /// Processes currently alive.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of processes alive at once.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Specs of every launch, in launch order.
    pub fn specs(&self) -> Vec<EnvironmentSpec> {
        self.seen.lock().unwrap().clone()
    }

    /// Host staging directories of every launch.
    pub fn staging_dirs(&self) -> Vec<PathBuf> {
        self.specs().into_iter().map(|s| s.mount.host).collect()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn launch(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<Box<dyn SandboxProcess>, LaunchError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(spec.clone());

        let file = spec.command.last().cloned().unwrap_or_default();
        let source = std::fs::read_to_string(spec.mount.host.join(&file))?;
        let behavior = MockBehavior::from_source(&source);

        if let MockBehavior::LaunchFail(message) = behavior {
            return Err(LaunchError::image_not_found(message));
        }

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);

        let (stdout, stderr) = match &behavior {
            MockBehavior::Exit { stdout, stderr, .. } => (stdout.clone(), stderr.clone()),
            MockBehavior::Hang { stdout } | MockBehavior::Linger { stdout } => {
                (stdout.clone(), String::new())
            }
            MockBehavior::OomKill | MockBehavior::Sigkill => {
                (String::new(), "Killed\n".to_string())
            }
            _ => (String::new(), String::new()),
        };

        let mut chunks = Vec::new();
        if !stdout.is_empty() {
            chunks.push(Ok(OutputChunk::Stdout(Bytes::from(stdout))));
        }
        if !stderr.is_empty() {
            chunks.push(Ok(OutputChunk::Stderr(Bytes::from(stderr))));
        }

        let output = if matches!(behavior, MockBehavior::Linger { .. }) {
            stream::iter(chunks).chain(stream::pending()).boxed()
        } else {
            stream::iter(chunks).boxed()
        };

        Ok(Box::new(MockProcess {
            id: spec.name.clone(),
            behavior,
            output: Some(output),
            counters: Arc::clone(&self.counters),
            alive: true,
        }))
    }
}

struct MockProcess {
    id: String,
    behavior: MockBehavior,
    output: Option<OutputStream>,
    counters: Arc<Counters>,
    alive: bool,
}

impl MockProcess {
    fn exit(&mut self) {
        if self.alive {
            self.alive = false;
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SandboxProcess for MockProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        let status = match self.behavior.clone() {
            MockBehavior::Exit { code, delay, .. } => {
                tokio::time::sleep(delay).await;
                ExitStatus {
                    code,
                    oom_killed: false,
                }
            }
            MockBehavior::Hang { .. } => std::future::pending().await,
            MockBehavior::Linger { .. } => ExitStatus {
                code: 0,
                oom_killed: false,
            },
            MockBehavior::OomKill => ExitStatus {
                code: 137,
                oom_killed: true,
            },
            MockBehavior::Sigkill => ExitStatus {
                code: 137,
                oom_killed: false,
            },
            MockBehavior::WaitError(message) => anyhow::bail!("{message}"),
            MockBehavior::LaunchFail(_) => unreachable!("launch failures never produce a process"),
        };
        self.exit();
        Ok(status)
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.alive {
            self.counters.terminations.fetch_add(1, Ordering::SeqCst);
        }
        self.exit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_prints() {
        match MockBehavior::from_source("print(1)\nprint('two')") {
            MockBehavior::Exit { stdout, code, .. } => {
                assert_eq!(stdout, "1\ntwo\n");
                assert_eq!(code, 0);
            }
            other => panic!("unexpected behavior: {other:?}"),
        }
    }

    #[test]
    fn test_behavior_keywords() {
        assert!(matches!(
            MockBehavior::from_source("while True: pass"),
            MockBehavior::Hang { .. }
        ));
        assert!(matches!(MockBehavior::from_source("alloc"), MockBehavior::OomKill));
        assert!(matches!(
            MockBehavior::from_source("launch-fail"),
            MockBehavior::LaunchFail(_)
        ));
        assert!(matches!(
            MockBehavior::from_source("exit 3"),
            MockBehavior::Exit { code: 3, .. }
        ));
    }

    #[test]
    fn test_mock_sandbox_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MockSandbox>();
    }
}
