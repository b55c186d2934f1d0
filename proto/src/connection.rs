//! Typed connection to one language-server process.
//!
//! [`Connection`] turns a [`Transport`] into request/notification calls:
//! requests allocate an id, park a oneshot sender in the pending map, and
//! await the response; notifications are fire-and-forget. A dispatch task
//! owns the inbound half and routes responses to pending requests,
//! notifications to subscribers, and answers unsolicited server→client
//! requests with "method not found" so servers that block on them keep
//! running.
//!
//! When the transport closes, `connected` flips false, every pending
//! request fails, and the "closed" observers fire exactly once. Nothing
//! here reconnects; that is the session manager's decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;
use crate::types::{
    self, ContentChange, FileEvent, InitializeResult, Notification, Request, ResponseError,
    TextEdit,
};

/// Queue depth for each notification subscription.
const SUBSCRIPTION_CAPACITY: usize = 64;

/// How a request can fail. Cancellation is an expected outcome and is
/// logged at debug severity; everything else is logged as an error at the
/// point of failure.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("connection closed")]
    Closed,
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl RequestError {
    /// True when the failure was a deliberate cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;
type SubscriptionMap = Arc<Mutex<HashMap<String, mpsc::Sender<Value>>>>;

enum Inbound {
    Response { id: u64, body: Value },
    ServerRequest { id: Value, method: String },
    Notification { method: String, params: Value },
}

fn classify(frame: &Value) -> Option<Inbound> {
    let id = frame.get("id");
    let method = frame.get("method").and_then(Value::as_str);
    let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, is_reply) {
        (Some(id), None, true) => Some(Inbound::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method), _) => Some(Inbound::ServerRequest {
            id: id.clone(),
            method: method.to_string(),
        }),
        (None, Some(method), _) => Some(Inbound::Notification {
            method: method.to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

/// A live protocol connection. Created when a session starts, disposed when
/// it stops; never reused across sessions.
#[derive(Debug)]
pub struct Connection {
    outgoing: mpsc::Sender<Value>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
    close_observers: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
}

impl Connection {
    /// Wrap a transport and immediately begin listening.
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        let (incoming, outgoing) = transport.into_parts();

        let connected = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));
        let close_observers: Arc<Mutex<Vec<oneshot::Sender<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(Self::dispatch_loop(
            incoming,
            outgoing.clone(),
            connected.clone(),
            pending.clone(),
            subscriptions.clone(),
            close_observers.clone(),
        ));

        Self {
            outgoing,
            next_id: AtomicU64::new(1),
            connected,
            pending,
            subscriptions,
            close_observers,
        }
    }

    async fn dispatch_loop(
        mut incoming: mpsc::Receiver<Value>,
        outgoing: mpsc::Sender<Value>,
        connected: Arc<AtomicBool>,
        pending: PendingMap,
        subscriptions: SubscriptionMap,
        close_observers: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
    ) {
        while let Some(frame) = incoming.recv().await {
            let Some(inbound) = classify(&frame) else {
                tracing::warn!("discarding malformed JSON-RPC frame");
                continue;
            };

            match inbound {
                Inbound::Response { id, body } => {
                    let sender = pending.lock().await.remove(&id);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(body);
                        }
                        None => {
                            // Already cancelled or timed out; the late reply
                            // is expected noise.
                            tracing::debug!(id, "response for request no longer pending");
                        }
                    }
                }
                Inbound::ServerRequest { id, method } => {
                    tracing::debug!(%method, "replying method-not-found to server request");
                    let reply = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": -32601,
                            "message": format!("Method not found: {method}")
                        }
                    });
                    let _ = outgoing.send(reply).await;
                }
                Inbound::Notification { method, params } => {
                    // The guard must not outlive this lookup: dispatch keeps
                    // running no matter how slow a subscriber is, so response
                    // routing never stalls behind a full subscriber queue.
                    let tx = subscriptions.lock().await.get(&method).cloned();
                    match tx {
                        Some(tx) => match tx.try_send(params) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(%method, "subscriber queue full, dropping notification");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                // Subscriber dropped its receiver.
                                subscriptions.lock().await.remove(&method);
                                tracing::warn!(%method, "unhandled notification from server");
                            }
                        },
                        None => {
                            tracing::warn!(%method, "unhandled notification from server");
                        }
                    }
                }
            }
        }

        // Transport closed. Flip the flag before failing pending requests
        // so no new request can slip in and park forever.
        connected.store(false, Ordering::SeqCst);
        pending.lock().await.clear();
        for observer in close_observers.lock().await.drain(..) {
            let _ = observer.send(());
        }
        tracing::info!("connection closed");
    }

    /// Whether the underlying transport is still open. Once false, no
    /// further requests may be issued.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Observe the single "closed" lifecycle event. Fires immediately if
    /// the connection is already closed.
    pub async fn on_close(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.is_connected() {
            self.close_observers.lock().await.push(tx);
        } else {
            let _ = tx.send(());
        }
        rx
    }

    /// Receive inbound notifications for one method. A later call for the
    /// same method replaces the earlier subscriber. A subscriber that falls
    /// behind loses notifications past its queue capacity rather than
    /// back-pressuring dispatch.
    pub async fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.subscriptions
            .lock()
            .await
            .insert(method.to_string(), tx);
        rx
    }

    // ── Request plumbing ───────────────────────────────────────────────

    /// Issue one request and await its result. With a cancellation token,
    /// a fired token abandons the request, tells the server via
    /// `$/cancelRequest`, and resolves to [`RequestError::Cancelled`].
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        if !self.is_connected() {
            tracing::error!(method, "request on closed connection");
            return Err(RequestError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(method, id, params = ?params, "sending request");
        let started = Instant::now();

        let (tx, rx) = oneshot::channel();
        {
            // Same lock the close path takes before clearing the map, and
            // the flag flips before that clear: either we observe the flip
            // here, or our entry lands before the clear and fails with it.
            // An entry parked after the clear would never resolve.
            let mut pending = self.pending.lock().await;
            if !self.is_connected() {
                tracing::error!(method, id, "connection closed while issuing request");
                return Err(RequestError::Closed);
            }
            pending.insert(id, tx);
        }

        let frame = serde_json::to_value(Request::new(id, method, params))?;
        if self.outgoing.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            tracing::error!(method, id, "transport rejected request");
            return Err(RequestError::Closed);
        }

        let body = match cancel {
            Some(token) => {
                tokio::select! {
                    () = token.cancelled() => {
                        self.pending.lock().await.remove(&id);
                        let _ = self.notify_raw(
                            "$/cancelRequest",
                            Some(serde_json::json!({ "id": id })),
                        ).await;
                        tracing::debug!(method, id, "request cancelled");
                        return Err(RequestError::Cancelled);
                    }
                    reply = rx => reply,
                }
            }
            None => rx.await,
        };

        let Ok(body) = body else {
            tracing::error!(method, id, "connection closed before response");
            return Err(RequestError::Closed);
        };

        if let Some(error) = body.get("error") {
            let error: ResponseError = serde_json::from_value(error.clone())?;
            tracing::error!(
                method,
                id,
                code = error.code,
                message = %error.message,
                "request failed"
            );
            return Err(RequestError::Server {
                code: error.code,
                message: error.message,
            });
        }

        tracing::debug!(method, id, elapsed = ?started.elapsed(), "request completed");
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// [`Self::request`] bounded by a deadline. Implemented as a timed
    /// cancellation so the request deregisters itself and the server is
    /// told, exactly as for a caller-driven cancel.
    pub async fn request_with_timeout(
        &self,
        method: &'static str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, RequestError> {
        let token = CancellationToken::new();
        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            timer_token.cancel();
        });

        let result = self.request(method, params, Some(&token)).await;
        timer.abort();

        match result {
            Err(RequestError::Cancelled) => {
                tracing::warn!(method, ?deadline, "request timed out");
                Err(RequestError::Timeout(deadline))
            }
            other => other,
        }
    }

    /// Send one notification. Fails only if the transport is gone.
    pub async fn notify(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<(), RequestError> {
        if !self.is_connected() {
            return Err(RequestError::Closed);
        }
        tracing::debug!(method, "sending notification");
        self.notify_raw(method, params).await
    }

    async fn notify_raw(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<(), RequestError> {
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| RequestError::Closed)
    }

    // ── Handshake and lifecycle ────────────────────────────────────────

    pub async fn initialize(
        &self,
        root_uri: &str,
        deadline: Duration,
    ) -> Result<InitializeResult, RequestError> {
        let result = self
            .request_with_timeout("initialize", Some(types::initialize_params(root_uri)), deadline)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn initialized(&self) -> Result<(), RequestError> {
        self.notify("initialized", Some(serde_json::json!({}))).await
    }

    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RequestError> {
        self.request_with_timeout("shutdown", None, deadline).await?;
        Ok(())
    }

    pub async fn exit(&self) -> Result<(), RequestError> {
        self.notify("exit", None).await
    }

    // ── Document synchronization ───────────────────────────────────────

    pub async fn did_open(
        &self,
        uri: &str,
        language_id: &str,
        version: i32,
        text: &str,
    ) -> Result<(), RequestError> {
        self.notify(
            "textDocument/didOpen",
            Some(types::did_open_params(uri, language_id, version, text)),
        )
        .await
    }

    pub async fn did_change(
        &self,
        uri: &str,
        version: i32,
        changes: &[ContentChange],
    ) -> Result<(), RequestError> {
        self.notify(
            "textDocument/didChange",
            Some(types::did_change_params(uri, version, changes)),
        )
        .await
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), RequestError> {
        self.notify("textDocument/didClose", Some(types::did_close_params(uri)))
            .await
    }

    pub async fn will_save(&self, uri: &str, reason: u8) -> Result<(), RequestError> {
        self.notify(
            "textDocument/willSave",
            Some(types::will_save_params(uri, reason)),
        )
        .await
    }

    /// Blocking pre-save request; resolves to the edits the server wants
    /// applied before the physical save. A `null` result means none.
    pub async fn will_save_wait_until(
        &self,
        uri: &str,
        reason: u8,
        deadline: Duration,
    ) -> Result<Vec<TextEdit>, RequestError> {
        let result = self
            .request_with_timeout(
                "textDocument/willSaveWaitUntil",
                Some(types::will_save_params(uri, reason)),
                deadline,
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(result)?)
    }

    pub async fn did_save(&self, uri: &str, text: Option<&str>) -> Result<(), RequestError> {
        self.notify(
            "textDocument/didSave",
            Some(types::did_save_params(uri, text)),
        )
        .await
    }

    // ── Workspace notifications ────────────────────────────────────────

    pub async fn did_change_watched_files(
        &self,
        changes: &[FileEvent],
    ) -> Result<(), RequestError> {
        self.notify(
            "workspace/didChangeWatchedFiles",
            Some(types::did_change_watched_files_params(changes)),
        )
        .await
    }

    pub async fn did_change_configuration(&self, settings: Value) -> Result<(), RequestError> {
        self.notify(
            "workspace/didChangeConfiguration",
            Some(serde_json::json!({ "settings": settings })),
        )
        .await
    }

    // ── Feature requests ───────────────────────────────────────────────
    //
    // Results are protocol-shaped `Value`s; interpreting them is the
    // consumer's concern.

    pub async fn completion(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request("textDocument/completion", Some(params), cancel)
            .await
    }

    pub async fn hover(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request("textDocument/hover", Some(params), cancel).await
    }

    pub async fn document_symbol(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request("textDocument/documentSymbol", Some(params), cancel)
            .await
    }

    pub async fn formatting(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<TextEdit>, RequestError> {
        let result = self
            .request("textDocument/formatting", Some(params), cancel)
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_value(result)?)
    }

    pub async fn rename(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request("textDocument/rename", Some(params), cancel).await
    }

    pub async fn execute_command(
        &self,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, RequestError> {
        self.request("workspace/executeCommand", Some(params), cancel)
            .await
    }
}

/// Cancel-then-replace holder for one logical operation's in-flight
/// request: taking a fresh token cancels whatever request the previous
/// token guarded.
#[derive(Default)]
pub struct TokenHolder {
    current: std::sync::Mutex<Option<CancellationToken>>,
}

impl TokenHolder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the previous request (if any) and return the token to guard
    /// the next one.
    pub fn replace(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    /// Cancel the in-flight request without starting a new one.
    pub fn cancel(&self) {
        let taken = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(token) = taken {
            token.cancel();
        }
    }
}
