//! One running server bound to one workspace root.
//!
//! A [`Session`] is the bag of resources the manager refcounts: the OS
//! process (if any), the protocol connection, the capabilities negotiated
//! at startup, and the per-document sync state. Sessions are built by the
//! manager after a successful handshake and torn down through
//! [`Session::shutdown`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use langmux_proto::{Connection, ServerCapabilities};

use crate::launch::ServerProcess;
use crate::sync::DocumentSync;

#[derive(Debug)]
pub struct Session {
    root: PathBuf,
    connection: Arc<Connection>,
    capabilities: ServerCapabilities,
    process: Mutex<ServerProcess>,
    sync: Mutex<DocumentSync>,
    /// Set before a deliberate stop so the close watcher can tell an
    /// ordered shutdown from a crash.
    stopping: AtomicBool,
}

impl Session {
    #[must_use]
    pub fn new(
        root: PathBuf,
        connection: Arc<Connection>,
        capabilities: ServerCapabilities,
        process: ServerProcess,
        sync: DocumentSync,
    ) -> Self {
        Self {
            root,
            connection,
            capabilities,
            process: Mutex::new(process),
            sync: Mutex::new(sync),
            stopping: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The typed connection, for feature requests (completion, hover, ...)
    /// the embedding issues directly.
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Capabilities negotiated at startup. Immutable for the session's
    /// lifetime; a restart renegotiates from scratch.
    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub async fn sync(&self) -> MutexGuard<'_, DocumentSync> {
        self.sync.lock().await
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Graceful teardown: shutdown request, exit notification, then give
    /// the process `deadline` to die before killing it. Always succeeds;
    /// a server that won't answer shutdown is killed anyway.
    pub async fn shutdown(&self, deadline: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        self.sync.lock().await.dispose();

        if let Err(e) = self.connection.shutdown(deadline).await {
            tracing::debug!(root = %self.root.display(), "shutdown request failed: {e}");
        }
        if let Err(e) = self.connection.exit().await {
            tracing::debug!(root = %self.root.display(), "exit notification failed: {e}");
        }
        self.process.lock().await.wait_or_kill(deadline).await;
        tracing::info!(root = %self.root.display(), "session stopped");
    }

    /// Immediate synchronous kill, for host-process exit paths where no
    /// executor is available to wait on.
    pub fn kill_now(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Ok(mut process) = self.process.try_lock() {
            process.start_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{DocumentSync, SaveBehavior, SyncMode};
    use langmux_proto::Transport;
    use serde_json::{Value, json};

    fn session_with_fake_server() -> (Arc<Session>, Transport) {
        let (client, server) = Transport::pair();
        let connection = Arc::new(Connection::new(client));
        let sync = DocumentSync::new(
            Arc::clone(&connection),
            SyncMode::Full,
            SaveBehavior::default(),
            Duration::from_millis(100),
            false,
        );
        let session = Session::new(
            PathBuf::from("/work"),
            connection,
            serde_json::from_value(json!({ "textDocumentSync": 1 })).unwrap(),
            ServerProcess::Detached,
            sync,
        );
        (Arc::new(session), server)
    }

    #[tokio::test]
    async fn shutdown_sends_shutdown_then_exit() {
        let (session, mut server) = session_with_fake_server();

        let server_task = tokio::spawn(async move {
            let frame = server.recv().await.expect("shutdown request");
            assert_eq!(frame["method"], "shutdown");
            server
                .send(json!({ "jsonrpc": "2.0", "id": frame["id"], "result": Value::Null }))
                .await
                .unwrap();
            let frame = server.recv().await.expect("exit notification");
            assert_eq!(frame["method"], "exit");
            assert!(frame.get("id").is_none());
        });

        session.shutdown(Duration::from_secs(1)).await;
        assert!(session.is_stopping());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_survives_unresponsive_server() {
        let (session, _server) = session_with_fake_server();
        // The fake never answers; the bounded shutdown still completes.
        session.shutdown(Duration::from_millis(50)).await;
        assert!(session.is_stopping());
    }

    #[tokio::test]
    async fn stopping_flag_starts_clear() {
        let (session, _server) = session_with_fake_server();
        assert!(!session.is_stopping());
        assert!(session.is_connected());
        session.kill_now();
        assert!(session.is_stopping());
    }
}
