//! Browser control-protocol client.
//!
//! Drives an already-running Chromium-family browser over its JSON-over-
//! WebSocket debugging protocol so that pages are rendered with the
//! user's real session (cookies, paywall access) before extraction.
//!
//! # Architecture
//!
//! ```text
//!   send(method) ──► pending[id] = oneshot ──► writer task ──► socket
//!                                                                  │
//!   await reply ◄── oneshot ◄── reader task (route by id) ◄────────┘
//!                               events without id are ignored
//! ```
//!
//! One connection is shared by every command of a run. Each command gets a
//! fresh integer id; replies may arrive in any order and are routed back
//! to their caller by id. A command that sees no reply within the command
//! timeout fails with [`ProtocolError::Timeout`] and its pending entry is
//! removed, so a late reply is dropped. When the socket closes, every
//! outstanding command fails with [`ProtocolError::Closed`].
//!
//! A page target is closed even when the render future is dropped
//! part-way (item timeout, interrupt): the close command is queued on the
//! writer without waiting for its reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::BrowserConfig;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("browser connection failed: {0}")]
    Connection(String),
    #[error("browser discovery failed at {url}: {reason}")]
    Discovery { url: String, reason: String },
    #[error("browser command {method} timed out")]
    Timeout { method: String },
    #[error("browser returned error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("page script raised an exception: {0}")]
    Evaluation(String),
    #[error("browser connection closed")]
    Closed,
    #[error("malformed browser reply: {0}")]
    Malformed(String),
}

type Reply = Result<Value, ProtocolError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Something that can turn a URL into fully rendered HTML.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Serialized DOM of `url` after client-side rendering settled.
    async fn render(&self, url: &str) -> Result<String, ProtocolError>;

    /// Release the underlying session. Safe to call more than once.
    async fn close(&self);
}

// ═══════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════

pub struct BrowserClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    command_timeout: Duration,
    settle: Duration,
    reader: JoinHandle<()>,
}

impl BrowserClient {
    /// Discover the browser's debugger endpoint and open the control channel.
    pub async fn connect(config: &BrowserConfig) -> Result<Self, ProtocolError> {
        let ws_url = discover(&config.discovery_url(), config.connect_timeout()).await?;
        tracing::debug!(endpoint = %ws_url, "Discovered browser endpoint");
        Self::connect_to(&ws_url, config).await
    }

    /// Open the control channel on a known WebSocket endpoint.
    pub async fn connect_to(ws_url: &str, config: &BrowserConfig) -> Result<Self, ProtocolError> {
        let connect = tokio_tungstenite::connect_async(ws_url);
        let (stream, _) = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                ProtocolError::Connection(format!("timed out connecting to {}", ws_url))
            })?
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "Browser socket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => route_reply(&reader_pending, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Browser socket read failed");
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            fail_all(&reader_pending);
        });

        tracing::info!(endpoint = %ws_url, "Connected to browser");

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            command_timeout: config.command_timeout(),
            settle: config.settle(),
            reader,
        })
    }

    /// Send one command and wait for its correlated reply.
    ///
    /// `session_id` scopes the command to an attached page target.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut command = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            command["sessionId"] = json!(session);
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self.outgoing.send(Message::Text(command.to_string())).is_err() {
            lock(&self.pending).remove(&id);
            return Err(ProtocolError::Closed);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(ProtocolError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    /// Render `url` in a fresh page target and return its serialized DOM.
    ///
    /// The target is closed afterwards whether or not rendering succeeded.
    pub async fn fetch_rendered_page(&self, url: &str) -> Result<String, ProtocolError> {
        let created = self
            .send("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = created["targetId"]
            .as_str()
            .ok_or_else(|| ProtocolError::Malformed("createTarget reply without targetId".into()))?
            .to_string();

        // Closes the target even if this future is dropped mid-render.
        let mut guard = TargetGuard {
            client: self,
            target_id: &target_id,
            armed: true,
        };
        let result = self.render_in_target(&target_id, url).await;
        guard.armed = false;

        if let Err(e) = self
            .send("Target.closeTarget", json!({ "targetId": target_id }), None)
            .await
        {
            tracing::debug!(target = %target_id, error = %e, "Failed to close page target");
        }

        result
    }

    /// Queue a command without waiting for (or routing) its reply.
    fn send_detached(&self, method: &str, params: Value) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let command = json!({ "id": id, "method": method, "params": params });
        let _ = self.outgoing.send(Message::Text(command.to_string()));
    }

    async fn render_in_target(&self, target_id: &str, url: &str) -> Result<String, ProtocolError> {
        let attached = self
            .send(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session = attached["sessionId"]
            .as_str()
            .ok_or_else(|| {
                ProtocolError::Malformed("attachToTarget reply without sessionId".into())
            })?
            .to_string();

        self.send("Page.enable", json!({}), Some(&session)).await?;

        let navigated = self
            .send("Page.navigate", json!({ "url": url }), Some(&session))
            .await?;
        if let Some(reason) = navigated["errorText"].as_str().filter(|s| !s.is_empty()) {
            return Err(ProtocolError::Navigation {
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }

        tokio::time::sleep(self.settle).await;

        let evaluated = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": "document.documentElement.outerHTML",
                    "returnByValue": true,
                }),
                Some(&session),
            )
            .await?;
        if let Some(details) = evaluated.get("exceptionDetails") {
            let text = details["text"].as_str().unwrap_or("unknown exception");
            return Err(ProtocolError::Evaluation(text.to_string()));
        }

        evaluated["result"]["value"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::Malformed("evaluate reply without string value".into()))
    }

    /// Close the control channel. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outgoing.send(Message::Close(None));
        fail_all(&self.pending);
        tracing::debug!("Browser connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for BrowserClient {
    fn drop(&mut self) {
        self.shutdown();
        // The writer is left to flush the close frame and exit on its own.
        self.reader.abort();
    }
}

/// Closes a page target when a render is abandoned before its own teardown.
struct TargetGuard<'a> {
    client: &'a BrowserClient,
    target_id: &'a str,
    armed: bool,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(target = %self.target_id, "Render cancelled; closing page target");
            self.client
                .send_detached("Target.closeTarget", json!({ "targetId": self.target_id }));
        }
    }
}

#[async_trait]
impl PageRenderer for BrowserClient {
    async fn render(&self, url: &str) -> Result<String, ProtocolError> {
        self.fetch_rendered_page(url).await
    }

    async fn close(&self) {
        self.shutdown();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Ask the browser's HTTP endpoint for its WebSocket debugger URL.
pub async fn discover(discovery_url: &str, timeout: Duration) -> Result<String, ProtocolError> {
    let err = |reason: String| ProtocolError::Discovery {
        url: discovery_url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| err(e.to_string()))?;
    let response = client
        .get(discovery_url)
        .send()
        .await
        .map_err(|e| err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(err(format!("HTTP {}", response.status())));
    }
    let body: Value = response.json().await.map_err(|e| err(e.to_string()))?;

    body["webSocketDebuggerUrl"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| err("response has no webSocketDebuggerUrl".into()))
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn route_reply(pending: &PendingMap, text: &str) {
    let message: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable browser message");
            return;
        }
    };

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        tracing::trace!(method = ?message.get("method"), "Browser event");
        return;
    };

    let Some(waiter) = lock(pending).remove(&id) else {
        tracing::debug!(id, "Reply for unknown or expired command");
        return;
    };

    let reply = match message.get("error") {
        Some(error) => Err(ProtocolError::Remote {
            code: error["code"].as_i64().unwrap_or_default(),
            message: error["message"].as_str().unwrap_or_default().to_string(),
        }),
        None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = waiter.send(reply);
}

fn fail_all(pending: &PendingMap) {
    for (_, waiter) in lock(pending).drain() {
        let _ = waiter.send(Err(ProtocolError::Closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> (PendingMap, oneshot::Receiver<Reply>) {
        let map: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        lock(&map).insert(7, tx);
        (map, rx)
    }

    #[tokio::test]
    async fn test_route_result_by_id() {
        let (map, rx) = pending();
        route_reply(&map, r#"{"method":"Page.loadEventFired","params":{}}"#);
        route_reply(&map, r#"{"id":7,"result":{"targetId":"T1"}}"#);
        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply["targetId"], "T1");
        assert!(lock(&map).is_empty());
    }

    #[tokio::test]
    async fn test_route_error_reply() {
        let (map, rx) = pending();
        route_reply(&map, r#"{"id":7,"error":{"code":-32000,"message":"No target"}}"#);
        match rx.await.unwrap() {
            Err(ProtocolError::Remote { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "No target");
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let (map, _rx) = pending();
        route_reply(&map, r#"{"id":99,"result":{}}"#);
        route_reply(&map, "not json");
        assert_eq!(lock(&map).len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_on_close() {
        let (map, rx) = pending();
        fail_all(&map);
        assert!(matches!(rx.await.unwrap(), Err(ProtocolError::Closed)));
    }
}
