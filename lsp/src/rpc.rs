//! JSON-RPC connection to one backend.
//!
//! A writer task owns the backend's stdin and drains a queue of frames; a
//! reader task owns its stdout and routes every frame. Responses are matched
//! to callers through the pending map (`id → oneshot`). Requests may be
//! pipelined; each caller only ever sees the response carrying its own id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::protocol::{self, Notification, Outgoing, PublishDiagnosticsParams, Request, Response};

const WRITER_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Value>>>;

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum WriterCommand {
    Send(Outgoing),
    Close,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: Value,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

fn classify(mut frame: Value) -> Option<IncomingFrame> {
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let has_outcome = frame.get("result").is_some() || frame.get("error").is_some();
    let params = frame.get_mut("params").map(Value::take);
    let id = frame.get("id").cloned();

    match (id, method) {
        (Some(id), None) if has_outcome => Some(IncomingFrame::Response {
            id: id.as_u64()?,
            body: frame,
        }),
        (Some(id), Some(method)) => Some(IncomingFrame::ServerRequest { id, method, params }),
        (None, Some(method)) => Some(IncomingFrame::Notification { method, params }),
        _ => None,
    }
}

/// Answers for requests servers commonly send to their client.
fn answer_server_request(method: &str, params: Option<&Value>) -> Result<Value, (i64, String)> {
    match method {
        "workspace/configuration" => {
            let count = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Ok(Value::Array(vec![Value::Null; count]))
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => Ok(Value::Null),
        _ => Err((
            protocol::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )),
    }
}

/// Published diagnostics of one document.
#[derive(Default)]
struct DocumentDiagnostics {
    /// Latest publish for the current content; `None` until one arrives.
    items: Option<Vec<Value>>,
    /// Version of the content last sent to the server.
    version: Option<i32>,
}

/// Latest `publishDiagnostics` payload per document, for servers without pull diagnostics.
#[derive(Default)]
struct PublishedDiagnostics {
    by_uri: Mutex<HashMap<String, DocumentDiagnostics>>,
    updated: Notify,
}

impl PublishedDiagnostics {
    /// Store a publish. A publish tagged with a version older than the
    /// content last sent is stale and dropped.
    fn publish(&self, uri: &str, version: Option<i32>, items: Vec<Value>) {
        {
            let mut by_uri = lock(&self.by_uri);
            let doc = by_uri.entry(protocol::normalize_uri(uri)).or_default();
            if let (Some(published), Some(current)) = (version, doc.version)
                && published < current
            {
                tracing::trace!("Dropping diagnostics for {uri} v{published}, current is v{current}");
                return;
            }
            doc.items = Some(items);
        }
        self.updated.notify_waiters();
    }

    /// Forget what was published for `uri`; new content at `version` was sent.
    fn invalidate(&self, uri: &str, version: i32) {
        let mut by_uri = lock(&self.by_uri);
        let doc = by_uri.entry(protocol::normalize_uri(uri)).or_default();
        doc.items = None;
        doc.version = Some(version);
    }

    fn get(&self, uri: &str) -> Option<Vec<Value>> {
        lock(&self.by_uri).get(uri).and_then(|doc| doc.items.clone())
    }

    async fn wait_for(&self, uri: &str, wait: Duration) -> Option<Vec<Value>> {
        let uri = protocol::normalize_uri(uri);
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.updated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(items) = self.get(&uri) {
                return Some(items);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(&uri);
            }
        }
    }
}

/// Removes the pending entry when the request future completes or is dropped,
/// so a late response finds nobody waiting and is discarded.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

pub(crate) struct Connection {
    name: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    published: Arc<PublishedDiagnostics>,
    request_timeout: Duration,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    /// Start the reader and writer tasks. Must be called within a tokio runtime.
    pub fn start<R, W>(name: String, reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Arc<PendingMap> = Arc::default();
        let published: Arc<PublishedDiagnostics> = Arc::default();

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_name = name.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(server = %writer_name, "LSP write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Close => {
                        if let Err(e) = writer.close().await {
                            tracing::debug!(server = %writer_name, "Closing LSP stdin: {e:#}");
                        }
                        return;
                    }
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_published = Arc::clone(&published);
        let reader_writer_tx = writer_tx.clone();
        let reader_name = name.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_body().await {
                    Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                        Ok(frame) => {
                            Self::dispatch_frame(
                                frame,
                                &reader_pending,
                                &reader_published,
                                &reader_writer_tx,
                                &reader_name,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!(server = %reader_name, "Discarding unparsable frame: {e}");
                        }
                    },
                    Ok(None) => {
                        tracing::info!(server = %reader_name, "Language server closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %reader_name, "LSP reader error: {e:#}");
                        break;
                    }
                }
            }
            // Nobody will answer now; fail waiting callers fast.
            lock(&reader_pending).clear();
        });

        Self {
            name,
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            published,
            request_timeout,
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch_frame(
        frame: Value,
        pending: &PendingMap,
        published: &PublishedDiagnostics,
        writer_tx: &mpsc::Sender<WriterCommand>,
        server_name: &str,
    ) {
        let Some(incoming) = classify(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame from '{server_name}'");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = lock(pending).remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => {
                        tracing::debug!("Discarding response {id} from '{server_name}': no caller waiting");
                    }
                }
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                tracing::debug!("LSP '{server_name}' sent request: {method}");
                let outcome = answer_server_request(&method, params.as_ref());
                let reply = Outgoing::Response(Response::new(id, outcome));
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            IncomingFrame::Notification { method, params } => {
                Self::handle_notification(server_name, &method, params, published);
            }
        }
    }

    fn handle_notification(
        server_name: &str,
        method: &str,
        params: Option<Value>,
        published: &PublishedDiagnostics,
    ) {
        match method {
            protocol::PUBLISH_DIAGNOSTICS => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(p) => {
                        tracing::debug!(
                            server = %server_name,
                            uri = %p.uri,
                            count = p.diagnostics.len(),
                            "Diagnostics published"
                        );
                        published.publish(&p.uri, p.version, p.diagnostics);
                    }
                    Err(e) => {
                        tracing::debug!("Failed to parse publishDiagnostics from '{server_name}': {e}");
                    }
                }
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                tracing::debug!(server = %server_name, "{message}");
            }
            _ => {
                tracing::trace!("Ignoring notification from '{server_name}': {method}");
            }
        }
    }

    /// Send a request and return its `result`, or the server's error.
    pub async fn request(
        &self,
        method: &'static str,
        params: Option<Value>,
    ) -> Result<Value, LspError> {
        let body = self.call(method, params).await?;
        protocol::response_result(method, body)
    }

    /// Send a request and return the raw response body.
    async fn call(&self, method: &'static str, params: Option<Value>) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        tracing::trace!(server = %self.name, "Sending {method} (id: {id})");
        self.writer_tx
            .send(WriterCommand::Send(Outgoing::Request(Request::new(
                id, method, params,
            ))))
            .await
            .map_err(|_| LspError::ConnectionClosed)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(LspError::Cancelled { method }),
            Err(_) => {
                tracing::debug!(server = %self.name, "{method} (id: {id}) timed out");
                Err(LspError::Timeout {
                    method,
                    timeout: self.request_timeout,
                })
            }
        }
    }

    pub async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), LspError> {
        self.writer_tx
            .send(WriterCommand::Send(Outgoing::Notification(
                Notification::new(method, params),
            )))
            .await
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Drop every pending request; their callers see [`LspError::Cancelled`].
    pub fn cancel_all(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.len();
        pending.clear();
        count
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Flush queued frames and close the backend's stdin.
    pub async fn close(&self) {
        let _ = self.writer_tx.send(WriterCommand::Close).await;
    }

    /// Mark what the server published for `uri` as outdated. Call before
    /// sending content at `version`.
    pub fn invalidate_published(&self, uri: &str, version: i32) {
        self.published.invalidate(uri, version);
    }

    /// Diagnostics the server pushed for `uri`, waiting up to `wait` for a
    /// publish of the current content.
    pub async fn published_diagnostics(&self, uri: &str, wait: Duration) -> Option<Vec<Value>> {
        self.published.wait_for(uri, wait).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
