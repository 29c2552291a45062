use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use lsphub_core::Error;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const CODE_PARSE_ERROR: i64 = -32700;
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn method_not_found() -> Self {
        RpcError {
            code: CODE_METHOD_NOT_FOUND,
            message: "Method not found".to_string(),
        }
    }
}

/// Receives server-initiated traffic from the reader task.
///
/// For requests the returned value (or error) is written back as the reply.
/// Notifications never get a reply: answering one can break strict servers.
pub trait ServerHandler: Send + Sync + 'static {
    fn handle_request(&self, method: &str, params: Option<&Value>) -> Result<Value, RpcError>;
    fn handle_notification(&self, method: &str, params: Option<&Value>);
}

/// Length-prefixed JSON-RPC 2.0 over an opaque byte stream: the LSP framing
/// (`Content-Length` header block terminated by CRLF CRLF).
///
/// One instance owns exactly one carrier. Writes are serialized through a
/// mutex; all reads happen on a single reader task. Request ids are
/// monotonically increasing and unique per transport; the pending map holds
/// each id only until its reply, deadline, or the transport's death.
pub struct FramedTransport {
    writer: Mutex<BoxWriter>,
    pending: StdMutex<HashMap<i64, oneshot::Sender<Result<Value, Error>>>>,
    next_id: AtomicI64,
    closed_tx: watch::Sender<bool>,
}

impl FramedTransport {
    /// Starts the reader task and returns the shared transport handle.
    pub fn start(
        reader: BoxReader,
        writer: BoxWriter,
        handler: Arc<dyn ServerHandler>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        let transport = Arc::new(Self {
            writer: Mutex::new(writer),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            closed_tx,
        });

        let t = transport.clone();
        tokio::spawn(async move {
            t.read_loop(reader, handler).await;
        });

        transport
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// A receiver that flips to `true` when the carrier disconnects.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Number of in-flight requests. Bounded by construction: every entry is
    /// removed on reply, deadline, write failure, or disconnect.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, Error> {
        if self.is_closed() {
            return Err(Error::Transport(format!(
                "connection is closed: {method}"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_value(&request).await {
            self.remove_pending(id);
            return Err(err);
        }

        match timeout(deadline, rx).await {
            Err(_) => {
                self.remove_pending(id);
                Err(Error::Timeout(method.to_string()))
            }
            Ok(Err(_)) => {
                // Sender dropped: the reader loop died before replying.
                self.remove_pending(id);
                Err(Error::Transport(format!(
                    "connection is closed: {method}"
                )))
            }
            Ok(Ok(outcome)) => outcome,
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), Error> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_value(&message).await
    }

    async fn write_value(&self, value: &Value) -> Result<(), Error> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::Transport(format!("failed to encode message: {e}")))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
            writer.flush().await
        };
        write
            .await
            .map_err(|e| Error::Transport(format!("write failed: {e}")))
    }

    fn remove_pending(&self, id: i64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
    }

    async fn read_loop(&self, reader: BoxReader, handler: Arc<dyn ServerHandler>) {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(message)) => self.dispatch(message, handler.as_ref()).await,
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read LSP message: {err}");
                    break;
                }
            }
        }

        let _ = self.closed_tx.send(true);
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::Transport("connection is closed".to_string())));
        }
    }

    async fn dispatch(&self, message: Value, handler: &dyn ServerHandler) {
        let method = message.get("method").and_then(|m| m.as_str());
        let id = message.get("id");

        if let Some(method) = method {
            let params = message.get("params");
            match id {
                Some(id) => {
                    // Server-initiated request: a reply is mandatory.
                    let response = match handler.handle_request(method, params) {
                        Ok(result) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": result,
                        }),
                        Err(rpc_err) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": rpc_err.code, "message": rpc_err.message },
                        }),
                    };
                    if let Err(err) = self.write_value(&response).await {
                        warn!("failed to reply to server request {method}: {err}");
                    }
                }
                None => handler.handle_notification(method, params),
            }
            return;
        }

        // Reply: correlate by id; late replies for abandoned waiters are
        // dropped silently.
        let id = match id {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        };
        let Some(id) = id else {
            debug!("ignoring message without method or usable id");
            return;
        };

        let tx = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        let Some(tx) = tx else {
            debug!("dropping late reply for id {id}");
            return;
        };

        let outcome = match message.get("error") {
            Some(err) if !err.is_null() => {
                let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                let msg = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown server error")
                    .to_string();
                Err(Error::Server { code, message: msg })
            }
            _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }
}

/// Reads one framed message. Tolerates and ignores headers other than
/// `Content-Length` (e.g. `Content-Type`). `Ok(None)` means clean EOF.
async fn read_frame(reader: &mut BufReader<BoxReader>) -> Result<Option<Value>, Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Transport(format!("read failed: {e}")))?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let Some(len) = content_length else {
        return Err(Error::Transport("missing Content-Length header".into()));
    };

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| Error::Transport(format!("read failed: {e}")))?;
    let value: Value = serde_json::from_slice(&buf)
        .map_err(|e| Error::Transport(format!("invalid JSON frame: {e}")))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        notifications: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                notifications: Mutex::new(Vec::new()),
            })
        }
    }

    impl ServerHandler for RecordingHandler {
        fn handle_request(&self, method: &str, _params: Option<&Value>) -> Result<Value, RpcError> {
            match method {
                "window/workDoneProgress/create" => Ok(json!({})),
                _ => Err(RpcError::method_not_found()),
            }
        }

        fn handle_notification(&self, method: &str, _params: Option<&Value>) {
            self.notifications.lock().unwrap().push(method.to_string());
        }
    }

    fn frame(value: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(value).unwrap();
        let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        out.extend_from_slice(&body);
        out
    }

    #[tokio::test]
    async fn request_gets_matching_reply() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, mut server_write) = tokio::io::split(server_side);

        let transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            RecordingHandler::new(),
        );

        // Fake server: read the request, reply with a result for its id.
        tokio::spawn(async move {
            let mut reader = BufReader::new(Box::new(server_read) as BoxReader);
            let request = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(request["method"], "textDocument/hover");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": { "contents": "doc" },
            });
            server_write.write_all(&frame(&reply)).await.unwrap();
        });

        let result = transport
            .request(
                "textDocument/hover",
                json!({"position": {"line": 0, "character": 0}}),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(result["contents"], "doc");
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn timeout_leaves_pending_map_empty() {
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);

        let transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            RecordingHandler::new(),
        );

        let started = std::time::Instant::now();
        let err = transport
            .request("textDocument/hover", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn server_error_reply_surfaces_code_and_message() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, mut server_write) = tokio::io::split(server_side);

        let transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            RecordingHandler::new(),
        );

        tokio::spawn(async move {
            let mut reader = BufReader::new(Box::new(server_read) as BoxReader);
            let request = read_frame(&mut reader).await.unwrap().unwrap();
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": { "code": -32803, "message": "content modified" },
            });
            server_write.write_all(&frame(&reply)).await.unwrap();
        });

        let err = transport
            .request("textDocument/references", json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            Error::Server { code, message } => {
                assert_eq!(code, -32803);
                assert_eq!(message, "content modified");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_server_request_is_answered_with_method_not_found() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, mut server_write) = tokio::io::split(server_side);

        let _transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            RecordingHandler::new(),
        );

        let request = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "custom/unknownThing",
            "params": {},
        });
        server_write.write_all(&frame(&request)).await.unwrap();

        let mut reader = BufReader::new(Box::new(server_read) as BoxReader);
        let reply = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], CODE_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_are_dispatched_and_never_replied() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (_server_read, mut server_write) = tokio::io::split(server_side);

        let handler = RecordingHandler::new();
        let _transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            handler.clone(),
        );

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "$/somethingCustom",
            "params": { "x": 1 },
        });
        server_write.write_all(&frame(&notification)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handler.notifications.lock().unwrap().as_slice(),
            ["$/somethingCustom"]
        );
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending_requests() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);

        let transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            RecordingHandler::new(),
        );

        let t = transport.clone();
        let pending = tokio::spawn(async move {
            t.request("workspace/symbol", json!({"query": ""}), Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(server_side);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(transport.is_closed());
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, mut server_write) = tokio::io::split(server_side);

        let transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            RecordingHandler::new(),
        );

        let err = transport
            .request("textDocument/definition", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Reply to the abandoned id; the transport must stay usable.
        tokio::spawn(async move {
            let mut reader = BufReader::new(Box::new(server_read) as BoxReader);
            let request = read_frame(&mut reader).await.unwrap().unwrap();
            let late = json!({ "jsonrpc": "2.0", "id": request["id"], "result": null });
            server_write.write_all(&frame(&late)).await.unwrap();
            // Answer the next request normally.
            let request = read_frame(&mut reader).await.unwrap().unwrap();
            let reply = json!({ "jsonrpc": "2.0", "id": request["id"], "result": "ok" });
            server_write.write_all(&frame(&reply)).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let value = transport
            .request("shutdown", Value::Null, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn extra_headers_are_tolerated() {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": { "type": 3, "message": "hello" },
        }))
        .unwrap();
        let mut raw = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let (client_side, server_side) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (_server_read, mut server_write) = tokio::io::split(server_side);

        let handler = RecordingHandler::new();
        let _transport = FramedTransport::start(
            Box::new(client_read),
            Box::new(client_write),
            handler.clone(),
        );

        server_write.write_all(&raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            handler.notifications.lock().unwrap().as_slice(),
            ["window/logMessage"]
        );
    }
}
