//! Session lifecycle and document routing.
//!
//! The [`SessionManager`] owns every running session, keyed by normalized
//! workspace root. Documents resolve to the longest configured root that
//! prefix-matches their saved path; concurrent starts for one root are
//! deduplicated through a shared in-flight future that is published into
//! the session map before the first await, so no interleaving can spawn
//! the same server twice.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use langmux_proto::types::path_to_uri;
use langmux_proto::{Connection, RequestError, TextEdit};

use crate::config::RuntimeConfig;
use crate::document::{BufferId, DocumentHandle, EditBatch, ViewId};
use crate::launch::ServerLauncher;
use crate::session::Session;
use crate::sync::{DocumentSync, save_behavior, sync_mode};
use crate::watch::{FsChange, WatchFilter, events_for_root};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session start failure. Cloneable because every awaiter of a shared
/// in-flight start receives the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StartError {
    #[error("workspace root {root} is not a valid file path: {message}")]
    InvalidRoot { root: PathBuf, message: String },
    #[error("failed to spawn server for {root}: {message}")]
    Spawn { root: PathBuf, message: String },
    #[error("initialize handshake failed for {root}: {message}")]
    Initialize { root: PathBuf, message: String },
    #[error("server for {root} declares no usable document sync mode")]
    UnsupportedSync { root: PathBuf },
}

/// Lifecycle transitions surfaced to the embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started { root: PathBuf },
    Stopped { root: PathBuf, reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ordered through `stop_session` or reference-count collection.
    Explicit,
    /// The connection closed on its own; the embedding decides whether to
    /// restart, gated by [`SessionManager::has_reached_restart_limit`].
    Unexpected,
}

/// Long-running-work hook. The default just logs.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: &str);
}

struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, message: &str) {
        tracing::info!("{message}");
    }
}

/// Embedding callbacks. Every hook has a permissive default.
pub struct ManagerHooks {
    /// Should this document start (or keep) a session.
    pub start_predicate: Box<dyn Fn(&DocumentHandle) -> bool + Send + Sync>,
    /// Should this changed path be forwarded to servers, on top of the
    /// configured ignore globs.
    pub watch_predicate: Box<dyn Fn(&Path) -> bool + Send + Sync>,
    pub progress: Box<dyn ProgressReporter>,
}

impl Default for ManagerHooks {
    fn default() -> Self {
        Self {
            start_predicate: Box::new(|_| true),
            watch_predicate: Box::new(|_| true),
            progress: Box::new(LogReporter),
        }
    }
}

type SharedStart = Shared<BoxFuture<'static, Result<Arc<Session>, StartError>>>;

struct RestartWindow {
    count: u32,
    first_at: Instant,
}

#[derive(Default)]
struct State {
    /// Root → resolved session or in-flight start. The entry is inserted
    /// before the start future is first polled.
    sessions: HashMap<PathBuf, SharedStart>,
    /// View → root it is currently bound to.
    bindings: HashMap<ViewId, PathBuf>,
    restarts: HashMap<PathBuf, RestartWindow>,
}

struct Inner {
    config: RuntimeConfig,
    launcher: Arc<dyn ServerLauncher>,
    filter: WatchFilter,
    hooks: ManagerHooks,
    state: Mutex<State>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        if self.events_tx.try_send(event).is_err() {
            tracing::warn!("session event channel full, dropping event");
        }
    }
}

pub struct SessionManager {
    inner: Arc<Inner>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl SessionManager {
    pub fn new(config: RuntimeConfig, launcher: Arc<dyn ServerLauncher>) -> anyhow::Result<Self> {
        Self::with_hooks(config, launcher, ManagerHooks::default())
    }

    pub fn with_hooks(
        config: RuntimeConfig,
        launcher: Arc<dyn ServerLauncher>,
        hooks: ManagerHooks,
    ) -> anyhow::Result<Self> {
        let filter = WatchFilter::new(&config.watch_ignore)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                filter,
                hooks,
                state: Mutex::new(State::default()),
                events_tx,
            }),
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// The lifecycle event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    // ── Root resolution ────────────────────────────────────────────────

    /// The longest configured workspace root that prefix-matches `path`.
    #[must_use]
    pub fn root_for(&self, path: &Path) -> Option<PathBuf> {
        self.inner
            .config
            .workspace_roots
            .iter()
            .map(|root| normalize_root(root))
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
    }

    // ── Session lifecycle ──────────────────────────────────────────────

    /// Resolve the session responsible for `doc`, optionally starting one.
    /// Documents without a saved path, or outside every configured root,
    /// never resolve.
    pub async fn resolve_session(
        &self,
        doc: &DocumentHandle,
        should_start: bool,
    ) -> Result<Option<Arc<Session>>, StartError> {
        let Some(path) = doc.path.as_deref() else {
            return Ok(None);
        };
        let Some(root) = self.root_for(path) else {
            return Ok(None);
        };

        if should_start && (self.inner.hooks.start_predicate)(doc) {
            return self.start_session(&root).await.map(Some);
        }

        // No start wanted: return the existing (or in-flight) session only.
        let existing = {
            let state = self.inner.state.lock().await;
            state.sessions.get(&root).cloned()
        };
        match existing {
            Some(shared) => self.await_start(&root, shared).await.map(Some),
            None => Ok(None),
        }
    }

    /// Start (or join the in-flight start of) the session for `root`.
    pub async fn start_session(&self, root: &Path) -> Result<Arc<Session>, StartError> {
        let root = normalize_root(root);
        let shared = {
            let mut state = self.inner.state.lock().await;
            if let Some(existing) = state.sessions.get(&root) {
                existing.clone()
            } else {
                let fut = start_and_handshake(Arc::clone(&self.inner), root.clone())
                    .boxed()
                    .shared();
                // Published before the first await: concurrent callers join
                // this future instead of spawning a second process.
                state.sessions.insert(root.clone(), fut.clone());
                fut
            }
        };
        self.await_start(&root, shared).await
    }

    async fn await_start(
        &self,
        root: &Path,
        shared: SharedStart,
    ) -> Result<Arc<Session>, StartError> {
        match shared.await {
            Ok(session) => Ok(session),
            Err(e) => {
                // Clear the failed guard so a later attempt can retry.
                let mut state = self.inner.state.lock().await;
                if let Some(existing) = state.sessions.get(root)
                    && matches!(existing.peek(), Some(Err(_)))
                {
                    state.sessions.remove(root);
                }
                Err(e)
            }
        }
    }

    /// Idempotent graceful stop. The session leaves the routable set before
    /// any shutdown I/O is awaited, so no new work reaches it; the process
    /// is killed even if the shutdown exchange fails.
    pub async fn stop_session(&self, root: &Path) {
        let root = normalize_root(root);
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.bindings.retain(|_, bound| *bound != root);
            state.sessions.remove(&root)
        };
        let Some(shared) = removed else { return };
        if let Ok(session) = shared.await {
            session.shutdown(self.inner.config.shutdown_timeout()).await;
            self.inner.emit(SessionEvent::Stopped {
                root,
                reason: StopReason::Explicit,
            });
        }
    }

    /// Stop every session no live document binding references.
    pub async fn stop_unused_sessions(&self) {
        let unused: Vec<PathBuf> = {
            let state = self.inner.state.lock().await;
            let referenced: HashSet<&PathBuf> = state.bindings.values().collect();
            state
                .sessions
                .keys()
                .filter(|root| !referenced.contains(root))
                .cloned()
                .collect()
        };
        for root in unused {
            self.stop_session(&root).await;
        }
    }

    /// Increment the per-root restart counter and report whether the budget
    /// is exhausted. The window is measured from the first restart of a
    /// streak; when it lapses the streak starts over.
    pub async fn has_reached_restart_limit(&self, root: &Path) -> bool {
        let root = normalize_root(root);
        let window = self.inner.config.restart_window();
        let limit = self.inner.config.restart_limit;
        let now = Instant::now();

        let mut state = self.inner.state.lock().await;
        let in_window = state
            .restarts
            .get(&root)
            .is_some_and(|entry| now.duration_since(entry.first_at) < window);
        if !in_window {
            // Fresh streak (or the previous one expired).
            state
                .restarts
                .insert(root, RestartWindow { count: 1, first_at: now });
            return false;
        }

        let Some(entry) = state.restarts.get_mut(&root) else {
            return false;
        };
        entry.count += 1;
        let exhausted = entry.count > limit;
        if exhausted {
            tracing::warn!(
                root = %root.display(),
                count = entry.count,
                "restart budget exhausted"
            );
        }
        exhausted
    }

    /// Best-effort synchronous kill of everything still running. For host
    /// process exit only.
    pub fn terminate(&self) {
        let Ok(state) = self.inner.state.try_lock() else {
            return;
        };
        for shared in state.sessions.values() {
            if let Some(Ok(session)) = shared.peek() {
                session.kill_now();
            }
        }
    }

    /// The resolved session for `root`, if one is active. Collaborators use
    /// this to issue feature requests against [`Session::connection`].
    pub async fn session_for_root(&self, root: &Path) -> Option<Arc<Session>> {
        let root = normalize_root(root);
        let state = self.inner.state.lock().await;
        match state.sessions.get(&root)?.peek() {
            Some(Ok(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Roots with a fully started session.
    pub async fn active_roots(&self) -> Vec<PathBuf> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .iter()
            .filter(|(_, shared)| matches!(shared.peek(), Some(Ok(_))))
            .map(|(root, _)| root.clone())
            .collect()
    }

    // ── Document handling ──────────────────────────────────────────────

    /// Report an opened (or language-changed) document. Binds the view to
    /// the resolved session and opens the document on the server.
    pub async fn open_document(
        &self,
        doc: &DocumentHandle,
    ) -> Result<Option<Arc<Session>>, StartError> {
        let Some(session) = self.resolve_session(doc, true).await? else {
            return Ok(None);
        };
        {
            let mut state = self.inner.state.lock().await;
            state
                .bindings
                .insert(doc.view, session.root().to_path_buf());
        }
        if let Err(e) = session.sync().await.attach(doc).await {
            tracing::warn!(path = ?doc.path, "didOpen failed: {e}");
        }
        Ok(Some(session))
    }

    /// Deliver one edit batch from a view.
    pub async fn document_edited(
        &self,
        view: ViewId,
        buffer: BufferId,
        batch: &EditBatch,
    ) -> Result<(), RequestError> {
        let Some(session) = self.session_for_view(view).await else {
            return Ok(());
        };
        session.sync().await.edited(view, buffer, batch).await?;
        Ok(())
    }

    /// Pre-save hook: returns edits to apply to the buffer before the
    /// physical save.
    pub async fn document_will_save(
        &self,
        view: ViewId,
        buffer: BufferId,
    ) -> Result<Vec<TextEdit>, RequestError> {
        let Some(session) = self.session_for_view(view).await else {
            return Ok(Vec::new());
        };
        let edits = session.sync().await.will_save(view, buffer).await?;
        Ok(edits)
    }

    /// Post-save hook. Synthesized file events (when native watching is
    /// off) are fanned out to every affected session.
    pub async fn document_saved(
        &self,
        view: ViewId,
        buffer: BufferId,
        text: &str,
    ) -> Result<(), RequestError> {
        let Some(session) = self.session_for_view(view).await else {
            return Ok(());
        };
        let synthesized = session.sync().await.saved(view, buffer, text).await?;
        self.watched_files_changed(&synthesized).await;
        Ok(())
    }

    /// The document moved to a new path. The server sees a close of the old
    /// URI and a reopen of the new one; the version sequence continues.
    pub async fn document_renamed(
        &self,
        view: ViewId,
        buffer: BufferId,
        new_path: &Path,
        text: &str,
    ) -> Result<(), RequestError> {
        let Some(session) = self.session_for_view(view).await else {
            return Ok(());
        };
        let synthesized = session
            .sync()
            .await
            .renamed(view, buffer, new_path, text)
            .await?;
        self.watched_files_changed(&synthesized).await;
        Ok(())
    }

    /// A view went away. Closes the document on the server when this was
    /// the buffer's last view, then collects sessions with no remaining
    /// bindings.
    pub async fn close_document(&self, view: ViewId, buffer: BufferId) {
        let session = self.session_for_view(view).await;
        {
            let mut state = self.inner.state.lock().await;
            state.bindings.remove(&view);
        }
        if let Some(session) = session
            && let Err(e) = session.sync().await.detach(view, buffer).await
        {
            tracing::warn!("didClose failed: {e}");
        }
        self.stop_unused_sessions().await;
    }

    async fn session_for_view(&self, view: ViewId) -> Option<Arc<Session>> {
        let root = {
            let state = self.inner.state.lock().await;
            state.bindings.get(&view).cloned()?
        };
        self.session_for_root(&root).await
    }

    // ── Workspace fan-out ──────────────────────────────────────────────

    /// Forward one batch of filesystem changes: each active session gets at
    /// most one notification, carrying only the events under its root that
    /// pass the ignore globs and the embedding's predicate. Renames are
    /// split into their delete/create halves first so the predicate judges
    /// each path on its own.
    pub async fn watched_files_changed(&self, changes: &[FsChange]) {
        if changes.is_empty() {
            return;
        }
        let changes: Vec<FsChange> = changes
            .iter()
            .flat_map(|change| match change {
                FsChange::Renamed { old, new } => {
                    vec![FsChange::Deleted(old.clone()), FsChange::Created(new.clone())]
                }
                other => vec![other.clone()],
            })
            .filter(|change| (self.inner.hooks.watch_predicate)(change_path(change)))
            .collect();
        if changes.is_empty() {
            return;
        }

        for session in self.ready_sessions().await {
            let events = events_for_root(&changes, session.root(), &self.inner.filter);
            if events.is_empty() {
                continue;
            }
            if let Err(e) = session.connection().did_change_watched_files(&events).await {
                tracing::warn!(root = %session.root().display(), "watched-files fan-out failed: {e}");
            }
        }
    }

    /// Push new settings to every active session.
    pub async fn notify_configuration(&self, settings: &Value) {
        for session in self.ready_sessions().await {
            if let Err(e) = session
                .connection()
                .did_change_configuration(settings.clone())
                .await
            {
                tracing::warn!(root = %session.root().display(), "configuration push failed: {e}");
            }
        }
    }

    async fn ready_sessions(&self) -> Vec<Arc<Session>> {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .values()
            .filter_map(|shared| match shared.peek() {
                Some(Ok(session)) => Some(Arc::clone(session)),
                _ => None,
            })
            .collect()
    }
}

fn change_path(change: &FsChange) -> &Path {
    match change {
        FsChange::Created(path) | FsChange::Changed(path) | FsChange::Deleted(path) => path,
        FsChange::Renamed { new, .. } => new,
    }
}

/// Strip redundant path components so prefix matching is unambiguous.
fn normalize_root(root: &Path) -> PathBuf {
    root.components().collect()
}

/// Spawn, hand-shake, and register the close watcher. Runs once per root
/// under the single-flight guard.
async fn start_and_handshake(inner: Arc<Inner>, root: PathBuf) -> Result<Arc<Session>, StartError> {
    inner
        .hooks
        .progress
        .report(&format!("starting language server for {}", root.display()));

    let mut spawned =
        inner
            .launcher
            .launch(&root)
            .await
            .map_err(|e| StartError::Spawn {
                root: root.clone(),
                message: format!("{e:#}"),
            })?;

    let root_uri = path_to_uri(&root).map_err(|e| {
        spawned.process.start_kill();
        StartError::InvalidRoot {
            root: root.clone(),
            message: e.to_string(),
        }
    })?;

    let connection = Arc::new(Connection::new(spawned.transport));
    let init = match connection
        .initialize(&root_uri, inner.config.initialize_timeout())
        .await
    {
        Ok(init) => init,
        Err(e) => {
            spawned.process.start_kill();
            return Err(StartError::Initialize {
                root: root.clone(),
                message: e.to_string(),
            });
        }
    };

    let capabilities = init.capabilities;
    let Some(mode) = sync_mode(&capabilities) else {
        spawned.process.start_kill();
        return Err(StartError::UnsupportedSync { root });
    };

    if let Err(e) = connection.initialized().await {
        spawned.process.start_kill();
        return Err(StartError::Initialize {
            root,
            message: e.to_string(),
        });
    }

    let sync = DocumentSync::new(
        Arc::clone(&connection),
        mode,
        save_behavior(&capabilities),
        inner.config.will_save_timeout(),
        !inner.config.native_file_watching,
    );
    let session = Arc::new(Session::new(
        root.clone(),
        Arc::clone(&connection),
        capabilities,
        spawned.process,
        sync,
    ));

    spawn_close_watcher(Arc::clone(&inner), Arc::clone(&session), root.clone()).await;

    tracing::info!(root = %root.display(), ?mode, "session started");
    inner.emit(SessionEvent::Started { root });
    Ok(session)
}

/// Watches for the connection closing underneath us. An explicit stop sets
/// the session's stopping flag first, so anything else is a crash: the
/// session leaves the routable set and the embedding is told, leaving the
/// restart decision (and its budget) to the restart callback.
async fn spawn_close_watcher(inner: Arc<Inner>, session: Arc<Session>, root: PathBuf) {
    let closed = session.connection().on_close().await;
    tokio::spawn(async move {
        let _ = closed.await;
        if session.is_stopping() {
            return;
        }
        tracing::warn!(root = %root.display(), "server connection closed unexpectedly");
        {
            let mut state = inner.state.lock().await;
            if let Some(existing) = state.sessions.get(&root)
                && let Some(Ok(current)) = existing.peek()
                && Arc::ptr_eq(current, &session)
            {
                state.sessions.remove(&root);
                // Bindings into the dead session are stale; views rebind on
                // their next open, exactly as after an explicit stop.
                state.bindings.retain(|_, bound| *bound != root);
            }
        }
        inner.emit(SessionEvent::Stopped {
            root,
            reason: StopReason::Unexpected,
        });
    });
}
