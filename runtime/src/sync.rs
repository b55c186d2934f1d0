//! Keeps one server's view of open documents in step with the editor.
//!
//! One [`DocumentSync`] exists per session. It tracks, per buffer, the set
//! of views showing it; the lowest view id is the buffer's primary and is
//! the only view whose events turn into protocol notifications, so a
//! document split across panes never produces duplicate didOpen/didChange
//! traffic. Versions are keyed by path and survive renames, giving every
//! didChange a strictly increasing version.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use langmux_proto::types::path_to_uri;
use langmux_proto::{
    Connection, ContentChange, RequestError, ServerCapabilities, TextDocumentSync, TextEdit,
};

use crate::document::{BufferId, DocumentHandle, EditBatch, ViewId};
use crate::watch::FsChange;

/// How document content is shipped to the server. Decided once from the
/// negotiated capabilities when the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Resend the whole document on every change batch.
    Full,
    /// Send ranged edits, bottom-to-top, one version bump per batch.
    Incremental,
}

/// Which save-related traffic the server asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveBehavior {
    pub will_save: bool,
    pub will_save_wait_until: bool,
    pub did_save: bool,
    pub include_text: bool,
}

/// Probe the negotiated capabilities for a usable sync mode. `None` means
/// the server cannot synchronize documents at all.
#[must_use]
pub fn sync_mode(capabilities: &ServerCapabilities) -> Option<SyncMode> {
    use langmux_proto::types::{SYNC_KIND_FULL, SYNC_KIND_INCREMENTAL};

    let kind = match capabilities.text_document_sync.as_ref()? {
        TextDocumentSync::Kind(kind) => *kind,
        TextDocumentSync::Options(options) => options.change?,
    };
    match kind {
        SYNC_KIND_FULL => Some(SyncMode::Full),
        SYNC_KIND_INCREMENTAL => Some(SyncMode::Incremental),
        _ => None,
    }
}

/// Extract the server's save preferences. Servers that declare only a bare
/// sync kind still receive didSave; only an explicit `save: false` turns
/// it off.
#[must_use]
pub fn save_behavior(capabilities: &ServerCapabilities) -> SaveBehavior {
    match capabilities.text_document_sync.as_ref() {
        Some(TextDocumentSync::Options(options)) => SaveBehavior {
            will_save: options.will_save,
            will_save_wait_until: options.will_save_wait_until,
            did_save: options.save.as_ref().is_none_or(|s| s.enabled()),
            include_text: options.save.as_ref().is_some_and(|s| s.include_text()),
        },
        _ => SaveBehavior {
            did_save: true,
            ..SaveBehavior::default()
        },
    }
}

/// `TextDocumentSaveReason.Manual`.
const SAVE_REASON_MANUAL: u8 = 1;

#[derive(Debug)]
struct BufferState {
    views: BTreeSet<ViewId>,
    path: PathBuf,
    language_id: String,
    open: bool,
}

impl BufferState {
    fn primary(&self) -> Option<ViewId> {
        self.views.first().copied()
    }
}

/// Per-session document synchronizer. Owned by the session's resource bag
/// and driven by the manager.
#[derive(Debug)]
pub struct DocumentSync {
    connection: Arc<Connection>,
    mode: SyncMode,
    save: SaveBehavior,
    will_save_timeout: Duration,
    /// When the embedding has no native file watching, saves and renames
    /// synthesize watched-file events for the manager to fan out.
    synthesize_fs_events: bool,
    versions: HashMap<PathBuf, i32>,
    buffers: HashMap<BufferId, BufferState>,
}

impl DocumentSync {
    #[must_use]
    pub fn new(
        connection: Arc<Connection>,
        mode: SyncMode,
        save: SaveBehavior,
        will_save_timeout: Duration,
        synthesize_fs_events: bool,
    ) -> Self {
        Self {
            connection,
            mode,
            save,
            will_save_timeout,
            synthesize_fs_events,
            versions: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Current version for a path, if one has ever been assigned.
    #[must_use]
    pub fn version(&self, path: &Path) -> Option<i32> {
        self.versions.get(path).copied()
    }

    /// Attach one view. The first view of a buffer opens the document on
    /// the server; further views of the same buffer are bookkeeping only.
    pub async fn attach(&mut self, doc: &DocumentHandle) -> Result<(), RequestError> {
        let Some(path) = doc.path.as_deref() else {
            // No saved path, no URI: nothing a server could identify.
            return Ok(());
        };

        let state = self.buffers.entry(doc.buffer).or_insert_with(|| BufferState {
            views: BTreeSet::new(),
            path: path.to_path_buf(),
            language_id: doc.language_id.clone(),
            open: false,
        });
        state.views.insert(doc.view);

        if state.open {
            return Ok(());
        }

        let uri = uri_for(path)?;
        let version = *self.versions.entry(path.to_path_buf()).or_insert(1);
        self.connection
            .did_open(&uri, &doc.language_id, version, &doc.text)
            .await?;
        if let Some(state) = self.buffers.get_mut(&doc.buffer) {
            state.open = true;
        }
        Ok(())
    }

    /// Deliver one edit batch. Returns whether a notification was sent;
    /// non-primary views never send.
    pub async fn edited(
        &mut self,
        view: ViewId,
        buffer: BufferId,
        batch: &EditBatch,
    ) -> Result<bool, RequestError> {
        let Some(state) = self.buffers.get(&buffer) else {
            return Ok(false);
        };
        if !state.open || state.primary() != Some(view) {
            return Ok(false);
        }
        let path = state.path.clone();

        let uri = uri_for(&path)?;
        let version = self.bump_version(&path);

        let changes: Vec<ContentChange> = match self.mode {
            SyncMode::Full => vec![ContentChange::full(batch.text.clone())],
            // Bottom-to-top, so earlier edits' coordinates stay valid no
            // matter how later edits shifted the document.
            SyncMode::Incremental => batch.changes.iter().rev().cloned().collect(),
        };

        self.connection.did_change(&uri, version, &changes).await?;
        Ok(true)
    }

    /// Pre-save hook. Sends willSave if requested and, if the server asked
    /// for it, blocks (bounded) on willSaveWaitUntil; the returned edits
    /// must be applied to the buffer before the physical save.
    pub async fn will_save(
        &mut self,
        view: ViewId,
        buffer: BufferId,
    ) -> Result<Vec<TextEdit>, RequestError> {
        let Some(state) = self.buffers.get(&buffer) else {
            return Ok(Vec::new());
        };
        if !state.open || state.primary() != Some(view) {
            return Ok(Vec::new());
        }
        let uri = uri_for(&state.path)?;

        if self.save.will_save {
            self.connection.will_save(&uri, SAVE_REASON_MANUAL).await?;
        }

        if !self.save.will_save_wait_until {
            return Ok(Vec::new());
        }
        match self
            .connection
            .will_save_wait_until(&uri, SAVE_REASON_MANUAL, self.will_save_timeout)
            .await
        {
            Ok(edits) => Ok(edits),
            Err(e) => {
                // The save must never hang or fail on a misbehaving server.
                tracing::warn!(uri = %uri, "willSaveWaitUntil failed: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Post-save hook. Returns synthesized filesystem events when native
    /// watching is unavailable.
    pub async fn saved(
        &mut self,
        view: ViewId,
        buffer: BufferId,
        text: &str,
    ) -> Result<Vec<FsChange>, RequestError> {
        let Some(state) = self.buffers.get(&buffer) else {
            return Ok(Vec::new());
        };
        if !state.open || state.primary() != Some(view) {
            return Ok(Vec::new());
        }
        let path = state.path.clone();
        let uri = uri_for(&path)?;

        if self.save.did_save {
            let text = self.save.include_text.then_some(text);
            self.connection.did_save(&uri, text).await?;
        }

        if self.synthesize_fs_events {
            Ok(vec![FsChange::Changed(path)])
        } else {
            Ok(Vec::new())
        }
    }

    /// The protocol has no rename primitive: close the old URI, reopen the
    /// new one with the current text and version.
    pub async fn renamed(
        &mut self,
        view: ViewId,
        buffer: BufferId,
        new_path: &Path,
        text: &str,
    ) -> Result<Vec<FsChange>, RequestError> {
        let Some(state) = self.buffers.get(&buffer) else {
            return Ok(Vec::new());
        };
        if !state.open || state.primary() != Some(view) {
            return Ok(Vec::new());
        }
        let old_path = state.path.clone();
        if old_path == new_path {
            return Ok(Vec::new());
        }
        let language_id = state.language_id.clone();

        let old_uri = uri_for(&old_path)?;
        let new_uri = uri_for(new_path)?;

        self.connection.did_close(&old_uri).await?;

        // The version follows the document, not the adapter: the sequence
        // keeps climbing across the rename.
        let version = self.versions.remove(&old_path).unwrap_or(1);
        self.versions.insert(new_path.to_path_buf(), version);
        self.connection
            .did_open(&new_uri, &language_id, version, text)
            .await?;

        if let Some(state) = self.buffers.get_mut(&buffer) {
            state.path = new_path.to_path_buf();
        }

        if self.synthesize_fs_events {
            Ok(vec![
                FsChange::Deleted(old_path),
                FsChange::Created(new_path.to_path_buf()),
            ])
        } else {
            Ok(Vec::new())
        }
    }

    /// Detach one view. The buffer is closed on the server only when its
    /// last view goes; otherwise the close is a no-op. Returns whether
    /// didClose was sent.
    pub async fn detach(&mut self, view: ViewId, buffer: BufferId) -> Result<bool, RequestError> {
        let Some(state) = self.buffers.get_mut(&buffer) else {
            return Ok(false);
        };
        state.views.remove(&view);
        if !state.views.is_empty() {
            return Ok(false);
        }

        let Some(state) = self.buffers.remove(&buffer) else {
            return Ok(false);
        };
        if !state.open {
            return Ok(false);
        }
        let uri = uri_for(&state.path)?;
        self.connection.did_close(&uri).await?;
        Ok(true)
    }

    /// Drop all tracked state without notifying the server (it is going
    /// away with the session).
    pub fn dispose(&mut self) {
        self.buffers.clear();
        self.versions.clear();
    }

    /// Whether any buffer is still tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn bump_version(&mut self, path: &Path) -> i32 {
        let version = self.versions.entry(path.to_path_buf()).or_insert(0);
        *version += 1;
        *version
    }
}

fn uri_for(path: &Path) -> Result<String, RequestError> {
    path_to_uri(path).map_err(|e| {
        tracing::warn!("dropping document event: {e}");
        RequestError::Closed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use langmux_proto::Transport;
    use langmux_proto::types::{Position, Range};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn caps(value: Value) -> ServerCapabilities {
        serde_json::from_value(value).unwrap()
    }

    // ── Capability probe ───────────────────────────────────────────────

    #[test]
    fn probe_accepts_bare_kinds() {
        assert_eq!(
            sync_mode(&caps(serde_json::json!({ "textDocumentSync": 1 }))),
            Some(SyncMode::Full)
        );
        assert_eq!(
            sync_mode(&caps(serde_json::json!({ "textDocumentSync": 2 }))),
            Some(SyncMode::Incremental)
        );
    }

    #[test]
    fn probe_accepts_options_change_field() {
        let capabilities = caps(serde_json::json!({
            "textDocumentSync": { "openClose": true, "change": 2 }
        }));
        assert_eq!(sync_mode(&capabilities), Some(SyncMode::Incremental));
    }

    #[test]
    fn probe_rejects_none_and_absent() {
        assert_eq!(sync_mode(&caps(serde_json::json!({ "textDocumentSync": 0 }))), None);
        assert_eq!(sync_mode(&caps(serde_json::json!({}))), None);
        assert_eq!(
            sync_mode(&caps(serde_json::json!({ "textDocumentSync": { "openClose": true } }))),
            None
        );
    }

    #[test]
    fn save_behavior_defaults_to_did_save() {
        let behavior = save_behavior(&caps(serde_json::json!({ "textDocumentSync": 2 })));
        assert!(behavior.did_save);
        assert!(!behavior.will_save);
        assert!(!behavior.include_text);
    }

    #[test]
    fn save_behavior_honors_options() {
        let behavior = save_behavior(&caps(serde_json::json!({
            "textDocumentSync": {
                "change": 2,
                "willSave": true,
                "willSaveWaitUntil": true,
                "save": { "includeText": true }
            }
        })));
        assert!(behavior.will_save);
        assert!(behavior.will_save_wait_until);
        assert!(behavior.did_save);
        assert!(behavior.include_text);
    }

    #[test]
    fn save_behavior_explicit_false_disables_did_save() {
        let behavior = save_behavior(&caps(serde_json::json!({
            "textDocumentSync": { "change": 1, "save": false }
        })));
        assert!(!behavior.did_save);
    }

    // ── Adapter state machine ──────────────────────────────────────────
    //
    // A fake server that answers nothing: notifications are captured from
    // the far transport end for assertion.

    struct Harness {
        sync: DocumentSync,
        seen: mpsc::Receiver<Value>,
    }

    fn harness(mode: SyncMode, save: SaveBehavior) -> Harness {
        let (client, mut server) = Transport::pair();
        let (tx, seen) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(frame) = server.recv().await {
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Harness {
            sync: DocumentSync::new(
                Arc::new(Connection::new(client)),
                mode,
                save,
                Duration::from_millis(100),
                false,
            ),
            seen,
        }
    }

    fn doc(view: u64, buffer: u64, path: &str, text: &str) -> DocumentHandle {
        DocumentHandle::new(
            ViewId(view),
            BufferId(buffer),
            Some(PathBuf::from(path)),
            "rust",
            text,
        )
    }

    async fn next(seen: &mut mpsc::Receiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(1), seen.recv())
            .await
            .expect("expected a notification")
            .expect("transport closed")
    }

    async fn assert_silent(seen: &mut mpsc::Receiver<Value>) {
        tokio::task::yield_now().await;
        assert!(
            seen.try_recv().is_err(),
            "expected no notification on the wire"
        );
    }

    #[tokio::test]
    async fn first_attach_opens_with_version_one() {
        let mut h = harness(SyncMode::Incremental, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/a.rs", "hello\n")).await.unwrap();

        let frame = next(&mut h.seen).await;
        assert_eq!(frame["method"], "textDocument/didOpen");
        assert_eq!(frame["params"]["textDocument"]["version"], 1);
        assert_eq!(frame["params"]["textDocument"]["text"], "hello\n");

        // Second view of the same buffer: no second didOpen.
        h.sync.attach(&doc(2, 10, "/p/a.rs", "hello\n")).await.unwrap();
        assert_silent(&mut h.seen).await;
    }

    #[tokio::test]
    async fn pathless_document_never_opens() {
        let mut h = harness(SyncMode::Full, SaveBehavior::default());
        let handle = DocumentHandle::new(ViewId(1), BufferId(1), None, "rust", "x");
        h.sync.attach(&handle).await.unwrap();
        assert_silent(&mut h.seen).await;
        assert!(h.sync.is_empty());
    }

    #[tokio::test]
    async fn full_mode_resends_whole_text() {
        let mut h = harness(SyncMode::Full, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/a.rs", "v1")).await.unwrap();
        next(&mut h.seen).await; // didOpen

        let batch = EditBatch::new(vec![], "v2");
        assert!(h.sync.edited(ViewId(1), BufferId(10), &batch).await.unwrap());

        let frame = next(&mut h.seen).await;
        assert_eq!(frame["method"], "textDocument/didChange");
        assert_eq!(frame["params"]["textDocument"]["version"], 2);
        assert_eq!(frame["params"]["contentChanges"][0]["text"], "v2");
        assert!(frame["params"]["contentChanges"][0].get("range").is_none());
    }

    #[tokio::test]
    async fn incremental_mode_reverses_batch_order() {
        let mut h = harness(SyncMode::Incremental, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/a.rs", "abc\ndef\nghi\n")).await.unwrap();
        next(&mut h.seen).await;

        let edit = |line: u32, text: &str| {
            ContentChange::incremental(
                Range::new(Position::new(line, 0), Position::new(line, 1)),
                text,
            )
        };
        // Three edits in top-to-bottom document order.
        let batch = EditBatch::new(vec![edit(0, "A"), edit(1, "B"), edit(2, "C")], "whatever");
        h.sync.edited(ViewId(1), BufferId(10), &batch).await.unwrap();

        let frame = next(&mut h.seen).await;
        let changes = frame["params"]["contentChanges"].as_array().unwrap();
        assert_eq!(changes.len(), 3);
        // Sent bottom-to-top.
        assert_eq!(changes[0]["range"]["start"]["line"], 2);
        assert_eq!(changes[1]["range"]["start"]["line"], 1);
        assert_eq!(changes[2]["range"]["start"]["line"], 0);
        assert_eq!(frame["params"]["textDocument"]["version"], 2);
    }

    #[tokio::test]
    async fn non_primary_view_emits_nothing() {
        let mut h = harness(SyncMode::Full, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/a.rs", "x")).await.unwrap();
        h.sync.attach(&doc(2, 10, "/p/a.rs", "x")).await.unwrap();
        next(&mut h.seen).await; // the single didOpen

        let batch = EditBatch::new(vec![], "y");
        assert!(!h.sync.edited(ViewId(2), BufferId(10), &batch).await.unwrap());
        assert_silent(&mut h.seen).await;

        // After the primary view detaches, the survivor takes over.
        assert!(!h.sync.detach(ViewId(1), BufferId(10)).await.unwrap());
        assert!(h.sync.edited(ViewId(2), BufferId(10), &batch).await.unwrap());
        let frame = next(&mut h.seen).await;
        assert_eq!(frame["method"], "textDocument/didChange");
    }

    #[tokio::test]
    async fn close_waits_for_last_view() {
        let mut h = harness(SyncMode::Full, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/a.rs", "x")).await.unwrap();
        h.sync.attach(&doc(2, 10, "/p/a.rs", "x")).await.unwrap();
        next(&mut h.seen).await;

        assert!(!h.sync.detach(ViewId(2), BufferId(10)).await.unwrap());
        assert_silent(&mut h.seen).await;

        assert!(h.sync.detach(ViewId(1), BufferId(10)).await.unwrap());
        let frame = next(&mut h.seen).await;
        assert_eq!(frame["method"], "textDocument/didClose");
        assert!(h.sync.is_empty());
    }

    #[tokio::test]
    async fn rename_closes_old_and_reopens_with_carried_version() {
        let mut h = harness(SyncMode::Full, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/old.rs", "one")).await.unwrap();
        next(&mut h.seen).await;

        // Bump to version 2 before the rename.
        h.sync
            .edited(ViewId(1), BufferId(10), &EditBatch::new(vec![], "two"))
            .await
            .unwrap();
        next(&mut h.seen).await;

        h.sync
            .renamed(ViewId(1), BufferId(10), Path::new("/p/new.rs"), "two")
            .await
            .unwrap();

        let close = next(&mut h.seen).await;
        assert_eq!(close["method"], "textDocument/didClose");
        assert!(
            close["params"]["textDocument"]["uri"]
                .as_str()
                .unwrap()
                .ends_with("old.rs")
        );

        let open = next(&mut h.seen).await;
        assert_eq!(open["method"], "textDocument/didOpen");
        assert!(
            open["params"]["textDocument"]["uri"]
                .as_str()
                .unwrap()
                .ends_with("new.rs")
        );
        assert_eq!(open["params"]["textDocument"]["version"], 2);

        // The next change continues the sequence with no gap.
        h.sync
            .edited(ViewId(1), BufferId(10), &EditBatch::new(vec![], "three"))
            .await
            .unwrap();
        let change = next(&mut h.seen).await;
        assert_eq!(change["params"]["textDocument"]["version"], 3);
    }

    #[tokio::test]
    async fn save_sends_will_save_then_did_save() {
        let behavior = SaveBehavior {
            will_save: true,
            did_save: true,
            ..SaveBehavior::default()
        };
        let mut h = harness(SyncMode::Full, behavior);
        h.sync.attach(&doc(1, 10, "/p/a.rs", "x")).await.unwrap();
        next(&mut h.seen).await;

        let edits = h.sync.will_save(ViewId(1), BufferId(10)).await.unwrap();
        assert!(edits.is_empty());
        let frame = next(&mut h.seen).await;
        assert_eq!(frame["method"], "textDocument/willSave");
        assert_eq!(frame["params"]["reason"], 1);

        h.sync.saved(ViewId(1), BufferId(10), "x").await.unwrap();
        let frame = next(&mut h.seen).await;
        assert_eq!(frame["method"], "textDocument/didSave");
        // includeText not requested: no text on the wire.
        assert!(frame["params"].get("text").is_none());
    }

    #[tokio::test]
    async fn will_save_wait_until_timeout_does_not_block_save() {
        let behavior = SaveBehavior {
            will_save_wait_until: true,
            did_save: true,
            ..SaveBehavior::default()
        };
        let mut h = harness(SyncMode::Full, behavior);
        h.sync.attach(&doc(1, 10, "/p/a.rs", "x")).await.unwrap();
        next(&mut h.seen).await;

        // The fake server never answers the request; the bounded wait must
        // give up and let the save continue with no edits.
        let edits = h.sync.will_save(ViewId(1), BufferId(10)).await.unwrap();
        assert!(edits.is_empty());
    }

    #[tokio::test]
    async fn synthesized_fs_events_when_watching_unavailable() {
        let (client, _server) = Transport::pair();
        let mut sync = DocumentSync::new(
            Arc::new(Connection::new(client)),
            SyncMode::Full,
            SaveBehavior {
                did_save: true,
                ..SaveBehavior::default()
            },
            Duration::from_millis(50),
            true,
        );
        sync.attach(&doc(1, 10, "/p/a.rs", "x")).await.unwrap();

        let events = sync.saved(ViewId(1), BufferId(10), "x").await.unwrap();
        assert!(matches!(&events[..], [FsChange::Changed(p)] if p == Path::new("/p/a.rs")));

        let events = sync
            .renamed(ViewId(1), BufferId(10), Path::new("/p/b.rs"), "x")
            .await
            .unwrap();
        assert!(matches!(
            &events[..],
            [FsChange::Deleted(old), FsChange::Created(new)]
                if old == Path::new("/p/a.rs") && new == Path::new("/p/b.rs")
        ));
    }

    #[tokio::test]
    async fn dispose_clears_everything_silently() {
        let mut h = harness(SyncMode::Full, SaveBehavior::default());
        h.sync.attach(&doc(1, 10, "/p/a.rs", "x")).await.unwrap();
        next(&mut h.seen).await;

        h.sync.dispose();
        assert!(h.sync.is_empty());
        assert_eq!(h.sync.version(Path::new("/p/a.rs")), None);
        assert_silent(&mut h.seen).await;
    }
}
