//! Wire-level message types.
//!
//! Only the shapes this runtime actually constructs or inspects are typed;
//! open-ended results (completion lists, workspace edits, symbol trees) stay
//! as `serde_json::Value` and are interpreted by the consumer issuing the
//! request. Field shapes follow the published Language Server Protocol.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ── JSON-RPC envelopes ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// The `error` member of a response frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

// ── Text coordinates and edits ─────────────────────────────────────────

/// Zero-based line/character position (UTF-16 code units per the protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open range: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

/// One entry of a `didChange` batch. A `range` of `None` means the text
/// replaces the whole document (full sync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    pub text: String,
}

impl ContentChange {
    #[must_use]
    pub fn full(text: impl Into<String>) -> Self {
        Self {
            range: None,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn incremental(range: Range, text: impl Into<String>) -> Self {
        Self {
            range: Some(range),
            text: text.into(),
        }
    }
}

// ── Watched-file events ────────────────────────────────────────────────

/// `FileChangeType` numeric values from the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FileChangeType {
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

impl From<FileChangeType> for u8 {
    fn from(value: FileChangeType) -> Self {
        value as Self
    }
}

impl TryFrom<u8> for FileChangeType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Created),
            2 => Ok(Self::Changed),
            3 => Ok(Self::Deleted),
            other => Err(format!("invalid FileChangeType: {other}")),
        }
    }
}

/// One entry of a `workspace/didChangeWatchedFiles` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub uri: String,
    #[serde(rename = "type")]
    pub change_type: FileChangeType,
}

// ── Negotiated capabilities ────────────────────────────────────────────

/// Numeric `TextDocumentSyncKind`.
pub const SYNC_KIND_NONE: u8 = 0;
pub const SYNC_KIND_FULL: u8 = 1;
pub const SYNC_KIND_INCREMENTAL: u8 = 2;

/// `textDocumentSync` is either a bare kind number or an options object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TextDocumentSync {
    Kind(u8),
    Options(TextDocumentSyncOptions),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentSyncOptions {
    #[serde(default)]
    pub open_close: bool,
    pub change: Option<u8>,
    #[serde(default)]
    pub will_save: bool,
    #[serde(default)]
    pub will_save_wait_until: bool,
    pub save: Option<SaveSupport>,
}

/// `save` is either a bare flag or a `SaveOptions` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SaveSupport {
    Flag(bool),
    Options(SaveOptions),
}

impl SaveSupport {
    /// Whether `didSave` should carry the document text.
    #[must_use]
    pub fn include_text(&self) -> bool {
        match self {
            Self::Flag(_) => false,
            Self::Options(options) => options.include_text,
        }
    }

    /// Whether the server wants `didSave` at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        match self {
            Self::Flag(enabled) => *enabled,
            Self::Options(_) => true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    #[serde(default)]
    pub include_text: bool,
}

/// The server's negotiated capability set. Received once at handshake and
/// immutable for the life of the session. Capabilities this runtime does
/// not interpret are preserved in `rest` for consumers to inspect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    pub text_document_sync: Option<TextDocumentSync>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: ServerCapabilities,
}

// ── URI conversion ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("cannot express path as a file URI: {}", path.display())]
pub struct UriError {
    path: PathBuf,
}

/// Convert an absolute filesystem path to a `file://` URI string.
pub fn path_to_uri(path: &Path) -> Result<String, UriError> {
    url::Url::from_file_path(path)
        .map(String::from)
        .map_err(|()| UriError {
            path: path.to_path_buf(),
        })
}

/// Convert a `file://` URI back to a filesystem path. Non-file schemes and
/// unparsable URIs yield `None`.
#[must_use]
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}

// ── Outgoing parameter builders ────────────────────────────────────────

#[must_use]
pub fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": true,
                    "willSaveWaitUntil": true,
                    "didSave": true
                }
            },
            "workspace": {
                "didChangeWatchedFiles": { "dynamicRegistration": false },
                "didChangeConfiguration": { "dynamicRegistration": false }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

#[must_use]
pub fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

#[must_use]
pub fn did_change_params(uri: &str, version: i32, changes: &[ContentChange]) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": changes
    })
}

#[must_use]
pub fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri } })
}

/// `reason` follows `TextDocumentSaveReason` (1 = manual).
#[must_use]
pub fn will_save_params(uri: &str, reason: u8) -> serde_json::Value {
    serde_json::json!({ "textDocument": { "uri": uri }, "reason": reason })
}

#[must_use]
pub fn did_save_params(uri: &str, text: Option<&str>) -> serde_json::Value {
    match text {
        Some(text) => serde_json::json!({ "textDocument": { "uri": uri }, "text": text }),
        None => serde_json::json!({ "textDocument": { "uri": uri } }),
    }
}

#[must_use]
pub fn did_change_watched_files_params(changes: &[FileEvent]) -> serde_json::Value {
    serde_json::json!({ "changes": changes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_absent_params() {
        let frame = serde_json::to_value(Request::new(3, "shutdown", None)).unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 3);
        assert!(frame.get("params").is_none(), "params must be omitted, not null");
    }

    #[test]
    fn notification_has_no_id() {
        let frame = serde_json::to_value(Notification::new("exit", None)).unwrap();
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], "exit");
    }

    #[test]
    fn content_change_full_omits_range() {
        let json = serde_json::to_value(ContentChange::full("abc")).unwrap();
        assert!(json.get("range").is_none());
        assert_eq!(json["text"], "abc");
    }

    #[test]
    fn content_change_incremental_keeps_range() {
        let range = Range::new(Position::new(1, 0), Position::new(1, 4));
        let json = serde_json::to_value(ContentChange::incremental(range, "x")).unwrap();
        assert_eq!(json["range"]["start"]["line"], 1);
        assert_eq!(json["range"]["end"]["character"], 4);
    }

    #[test]
    fn file_event_serializes_numeric_type() {
        let event = FileEvent {
            uri: "file:///a.rs".to_string(),
            change_type: FileChangeType::Deleted,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], 3);

        let back: FileEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.change_type, FileChangeType::Deleted);
    }

    #[test]
    fn capabilities_accept_bare_sync_kind() {
        let caps: ServerCapabilities =
            serde_json::from_value(serde_json::json!({ "textDocumentSync": 2 })).unwrap();
        assert!(matches!(
            caps.text_document_sync,
            Some(TextDocumentSync::Kind(SYNC_KIND_INCREMENTAL))
        ));
    }

    #[test]
    fn capabilities_accept_sync_options() {
        let caps: ServerCapabilities = serde_json::from_value(serde_json::json!({
            "textDocumentSync": {
                "openClose": true,
                "change": 1,
                "willSaveWaitUntil": true,
                "save": { "includeText": true }
            }
        }))
        .unwrap();
        let Some(TextDocumentSync::Options(options)) = caps.text_document_sync else {
            panic!("expected options form");
        };
        assert!(options.open_close);
        assert_eq!(options.change, Some(SYNC_KIND_FULL));
        assert!(options.will_save_wait_until);
        assert!(options.save.as_ref().unwrap().include_text());
    }

    #[test]
    fn capabilities_preserve_unknown_fields() {
        let caps: ServerCapabilities = serde_json::from_value(serde_json::json!({
            "textDocumentSync": 1,
            "hoverProvider": true,
            "completionProvider": { "triggerCharacters": ["."] }
        }))
        .unwrap();
        assert_eq!(caps.rest["hoverProvider"], true);
        assert!(caps.rest["completionProvider"]["triggerCharacters"].is_array());
    }

    #[test]
    fn save_flag_vs_options() {
        assert!(SaveSupport::Flag(true).enabled());
        assert!(!SaveSupport::Flag(true).include_text());
        assert!(!SaveSupport::Flag(false).enabled());
        assert!(
            SaveSupport::Options(SaveOptions { include_text: true }).include_text()
        );
    }

    #[test]
    fn uri_round_trip() {
        let path = PathBuf::from("/work/src/main.rs");
        let uri = path_to_uri(&path).unwrap();
        assert_eq!(uri, "file:///work/src/main.rs");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn uri_rejects_non_file_schemes() {
        assert!(uri_to_path("https://example.com/a.rs").is_none());
        assert!(uri_to_path("gibberish").is_none());
    }

    #[test]
    fn initialize_params_shape() {
        let params = initialize_params("file:///work");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///work");
        assert_eq!(params["workspaceFolders"][0]["uri"], "file:///work");
        assert_eq!(
            params["capabilities"]["textDocument"]["synchronization"]["willSaveWaitUntil"],
            true
        );
    }

    #[test]
    fn did_save_params_text_is_optional() {
        let bare = did_save_params("file:///a.rs", None);
        assert!(bare.get("text").is_none());
        let with_text = did_save_params("file:///a.rs", Some("body"));
        assert_eq!(with_text["text"], "body");
    }
}
