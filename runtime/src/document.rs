//! Editor-facing document identities.
//!
//! The embedding reports editor state in terms of these types. A buffer is
//! the underlying text; a view is one editor pane showing it. Several views
//! may share one buffer (splits), and the view with the lowest id is the
//! buffer's primary: the only view whose events produce protocol traffic.

use std::path::PathBuf;

use langmux_proto::ContentChange;

/// Stable identifier for one editor view. Ordering decides primacy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(pub u64);

/// Stable identifier for one underlying text buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A snapshot of one editor view at the moment an event is reported.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    pub view: ViewId,
    pub buffer: BufferId,
    /// Saved path, if the document has ever been saved. Documents without
    /// a path can never bind to a session.
    pub path: Option<PathBuf>,
    pub language_id: String,
    /// Full text at the time of the event.
    pub text: String,
}

impl DocumentHandle {
    #[must_use]
    pub fn new(
        view: ViewId,
        buffer: BufferId,
        path: Option<PathBuf>,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            view,
            buffer,
            path,
            language_id: language_id.into(),
            text: text.into(),
        }
    }
}

/// One "stopped changing" batch from the editor: the buffered edits in the
/// order they occurred, plus the buffer text after all of them applied.
#[derive(Debug, Clone)]
pub struct EditBatch {
    /// Edits in occurrence order (as the user made them, top of the batch
    /// first). The sync adapter reverses these for incremental delivery.
    pub changes: Vec<ContentChange>,
    /// Full text after the batch. Used for full-document sync and for
    /// reopening on rename.
    pub text: String,
}

impl EditBatch {
    #[must_use]
    pub fn new(changes: Vec<ContentChange>, text: impl Into<String>) -> Self {
        Self {
            changes,
            text: text.into(),
        }
    }
}
