//! Spawning server processes.
//!
//! The manager never builds a process itself; it asks a [`ServerLauncher`]
//! for one. [`CommandLauncher`] is the stock stdio launcher; embeddings
//! with socket-based or in-process servers provide their own impl.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::process::{Child, Command};

use langmux_proto::Transport;

/// A freshly spawned, not-yet-initialized server.
#[derive(Debug)]
pub struct SpawnedServer {
    pub process: ServerProcess,
    pub transport: Transport,
}

/// The embedding's "spawn a server for this root" callback.
pub trait ServerLauncher: Send + Sync {
    fn launch(&self, root: &Path) -> BoxFuture<'static, Result<SpawnedServer>>;
}

/// Handle to the server's OS process, if there is one. Socket-backed and
/// in-process servers have nothing to kill.
#[derive(Debug)]
pub enum ServerProcess {
    Child(Child),
    Detached,
}

impl ServerProcess {
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Child(child) => child.id(),
            Self::Detached => None,
        }
    }

    /// Give the process `grace` to exit on its own, then kill it. Errors
    /// are swallowed: by this point the session is gone either way.
    pub async fn wait_or_kill(&mut self, grace: Duration) {
        let Self::Child(child) = self else { return };
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::debug!(pid = ?child.id(), "server did not exit in time, killing");
            let _ = child.kill().await;
        }
    }

    /// Synchronous best-effort kill, for host-process exit.
    pub fn start_kill(&mut self) {
        if let Self::Child(child) = self {
            let _ = child.start_kill();
        }
    }
}

/// Launches a server binary over stdio pipes.
pub struct CommandLauncher {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandLauncher {
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
        }
    }

    /// Extra environment variables for the spawned server.
    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

impl ServerLauncher for CommandLauncher {
    fn launch(&self, root: &Path) -> BoxFuture<'static, Result<SpawnedServer>> {
        let command = self.command.clone();
        let args = self.args.clone();
        let env = self.env.clone();
        let root: PathBuf = root.to_path_buf();

        async move {
            let resolved =
                which::which(&command).with_context(|| format!("{command} not found in PATH"))?;

            let mut child = Command::new(&resolved)
                .args(&args)
                .envs(env)
                .current_dir(&root)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("spawning {command}"))?;

            let stdin = child.stdin.take().context("no stdin from child")?;
            let stdout = child.stdout.take().context("no stdout from child")?;

            tracing::info!(command = %command, pid = ?child.id(), root = %root.display(), "spawned server");

            Ok(SpawnedServer {
                process: ServerProcess::Child(child),
                transport: Transport::stdio(stdin, stdout),
            })
        }
        .boxed()
    }
}
