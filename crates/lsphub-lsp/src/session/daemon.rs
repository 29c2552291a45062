use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;

use lsphub_core::Error;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::handler::ClientHandler;
use crate::progress::ProgressTracker;
use crate::session::indexing::IndexingTracker;
use crate::transport::{
    CODE_INTERNAL_ERROR, CODE_METHOD_NOT_FOUND, CODE_PARSE_ERROR, FramedTransport, RpcError,
};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(60);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(90);

/// Requests the daemon API forwards verbatim to the managed LSP session.
const PASSTHROUGH_METHODS: &[&str] = &[
    "textDocument/hover",
    "textDocument/definition",
    "textDocument/references",
    "textDocument/documentSymbol",
    "textDocument/diagnostic",
    "textDocument/implementation",
    "textDocument/codeAction",
    "textDocument/formatting",
    "textDocument/rename",
    "textDocument/prepareRename",
    "textDocument/prepareCallHierarchy",
    "callHierarchy/incomingCalls",
    "callHierarchy/outgoingCalls",
    "workspace/symbol",
    "workspace/diagnostic",
];

#[derive(Debug, Clone)]
pub struct SessionManagerOptions {
    pub command: String,
    pub args: Vec<String>,
    pub workspace_dir: String,
}

/// The persistent-session daemon: owns one LSP child for the lifetime of the
/// process, performs the `initialize` handshake once, and multiplexes agent
/// requests onto that session over a newline-delimited JSON-RPC TCP API.
///
/// This amortizes server startup and initial indexing across many
/// short-lived agent invocations.
pub struct SessionManager {
    options: SessionManagerOptions,
    transport: Arc<FramedTransport>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    initialized: StdRwLock<bool>,
    init_result: StdRwLock<Option<Value>>,
    capabilities: StdRwLock<Option<Value>>,
    open_docs: StdMutex<HashSet<String>>,
    progress: Arc<ProgressTracker>,
    indexing: Arc<IndexingTracker>,
}

impl SessionManager {
    /// Spawns the configured LSP server and completes the handshake.
    pub async fn start(options: SessionManagerOptions) -> Result<Arc<Self>, Error> {
        if options.command.trim().is_empty() {
            return Err(Error::Config("session manager requires a command".into()));
        }

        let mut child = Command::new(&options.command)
            .args(&options.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Transport(format!("failed to start LSP server {}: {e}", options.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to capture LSP stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to capture LSP stdout".into()))?;
        let pid = child.id();
        info!("LSP server started with pid {pid:?}");

        let progress = Arc::new(ProgressTracker::new());
        let indexing = Arc::new(IndexingTracker::new());
        let handler = ClientHandler::with_indexing(progress.clone(), indexing.clone());
        let transport = FramedTransport::start(Box::new(stdout), Box::new(stdin), handler);

        let manager = Self::from_transport(options, transport, progress, indexing, Some(child), pid);
        manager.initialize_session().await?;
        Ok(manager)
    }

    /// Assembles a manager around an existing transport. Used by `start`
    /// and by tests that drive the daemon against an in-memory carrier.
    pub(crate) fn from_transport(
        options: SessionManagerOptions,
        transport: Arc<FramedTransport>,
        progress: Arc<ProgressTracker>,
        indexing: Arc<IndexingTracker>,
        child: Option<Child>,
        pid: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            transport,
            child: Mutex::new(child),
            pid,
            initialized: StdRwLock::new(false),
            init_result: StdRwLock::new(None),
            capabilities: StdRwLock::new(None),
            open_docs: StdMutex::new(HashSet::new()),
            progress,
            indexing,
        })
    }

    async fn initialize_session(&self) -> Result<(), Error> {
        info!("initializing LSP session for {}", self.options.workspace_dir);
        let root_uri = format!("file://{}", self.options.workspace_dir);
        let params = crate::client::initialize_params(&root_uri, None);

        let result = self
            .transport
            .request("initialize", params, INITIALIZE_TIMEOUT)
            .await?;

        if let Some(caps) = result.get("capabilities") {
            *self.capabilities.write().expect("capabilities lock poisoned") = Some(caps.clone());
        }
        *self.init_result.write().expect("init lock poisoned") = Some(result);
        *self.initialized.write().expect("initialized lock poisoned") = true;

        self.transport.notify("initialized", json!({})).await?;
        info!("LSP session initialized");
        Ok(())
    }

    /// Accept loop for the daemon API.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| Error::Transport(format!("accept failed: {e}")))?;
            debug!("API client connected: {peer}");
            let manager = self.clone();
            tokio::spawn(async move {
                manager.handle_client(stream).await;
                debug!("API client disconnected: {peer}");
            });
        }
    }

    /// Serves one API connection: one JSON object per line, `\n` framing,
    /// trailing whitespace ignored. Each connection brings its own id
    /// space; ids are echoed back verbatim.
    pub async fn handle_client<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("API client read error: {err}");
                    break;
                }
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<ApiRequest>(trimmed) {
                Err(err) => {
                    warn!("API parse error: {err}");
                    error_response(Value::Null, CODE_PARSE_ERROR, "Parse error")
                }
                Ok(request) => {
                    debug!("handling API method {}", request.method);
                    match self.handle_api_request(&request.method, request.params).await {
                        Ok(result) => json!({
                            "jsonrpc": "2.0",
                            "id": request.id,
                            "result": result,
                        }),
                        Err(rpc_err) => error_response(request.id, rpc_err.code, &rpc_err.message),
                    }
                }
            };

            let mut payload = response.to_string().into_bytes();
            payload.push(b'\n');
            if let Err(err) = write_half.write_all(&payload).await {
                warn!("API client write error: {err}");
                break;
            }
        }
    }

    pub async fn handle_api_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "session/status" => Ok(self.status_value().await),
            "session/capabilities" => Ok(self
                .capabilities
                .read()
                .expect("capabilities lock poisoned")
                .clone()
                .unwrap_or(Value::Null)),
            "textDocument/didOpen" => self.handle_did_open(params).await,
            "textDocument/didClose" => self.handle_did_close(params).await,
            m if PASSTHROUGH_METHODS.contains(&m) => self
                .transport
                .request(m, params, FORWARD_TIMEOUT)
                .await
                .map_err(internal_error),
            other => Err(RpcError {
                code: CODE_METHOD_NOT_FOUND,
                message: format!("unknown method: {other}"),
            }),
        }
    }

    pub async fn status_value(&self) -> Value {
        let initialized = *self.initialized.read().expect("initialized lock poisoned");
        let open_documents = self.open_docs.lock().expect("open docs lock poisoned").len();

        json!({
            "initialized": initialized,
            "openDocuments": open_documents,
            "pid": self.pid,
            "indexing": self.indexing.status(),
        })
    }

    /// Reopening a URI already in the open set returns `already_open`
    /// without re-sending: the LSP session keeps one open copy per
    /// document across all agent connections.
    async fn handle_did_open(&self, params: Value) -> Result<Value, RpcError> {
        let uri = text_document_uri(&params)
            .ok_or_else(|| internal_error_msg("didOpen params missing textDocument.uri"))?;

        let already_open = {
            let mut docs = self.open_docs.lock().expect("open docs lock poisoned");
            !docs.insert(uri)
        };

        if already_open {
            return Ok(json!({ "status": "already_open" }));
        }

        self.transport
            .notify("textDocument/didOpen", params)
            .await
            .map_err(internal_error)?;
        Ok(Value::Null)
    }

    async fn handle_did_close(&self, params: Value) -> Result<Value, RpcError> {
        let uri = text_document_uri(&params)
            .ok_or_else(|| internal_error_msg("didClose params missing textDocument.uri"))?;

        self.open_docs
            .lock()
            .expect("open docs lock poisoned")
            .remove(&uri);

        self.transport
            .notify("textDocument/didClose", params)
            .await
            .map_err(internal_error)?;
        Ok(Value::Null)
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn indexing(&self) -> &IndexingTracker {
        &self.indexing
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.read().expect("initialized lock poisoned")
    }

    /// Graceful shutdown: tell the server to exit, then make sure the child
    /// does not linger.
    pub async fn stop(&self) {
        let _ = self.transport.notify("exit", Value::Null).await;
        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

fn text_document_uri(params: &Value) -> Option<String> {
    params
        .get("textDocument")
        .and_then(|td| td.get("uri"))
        .and_then(|u| u.as_str())
        .map(String::from)
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn internal_error(err: Error) -> RpcError {
    RpcError {
        code: CODE_INTERNAL_ERROR,
        message: err.to_string(),
    }
}

fn internal_error_msg(message: &str) -> RpcError {
    RpcError {
        code: CODE_INTERNAL_ERROR,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxReader;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Builds a manager whose "child" is the far side of an in-memory pipe,
    /// plus a raw handle to that far side.
    fn manager_with_fake_child() -> (Arc<SessionManager>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(near);
        let progress = Arc::new(ProgressTracker::new());
        let indexing = Arc::new(IndexingTracker::new());
        let handler = ClientHandler::with_indexing(progress.clone(), indexing.clone());
        let transport = FramedTransport::start(Box::new(read), Box::new(write), handler);

        let manager = SessionManager::from_transport(
            SessionManagerOptions {
                command: "fake-ls".into(),
                args: Vec::new(),
                workspace_dir: "/projects".into(),
            },
            transport,
            progress,
            indexing,
            None,
            Some(4242),
        );
        (manager, far)
    }

    async fn read_child_frame(reader: &mut BufReader<BoxReader>) -> Value {
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if let Some(v) = trimmed.strip_prefix("Content-Length:") {
                content_length = v.trim().parse().unwrap();
            }
        }
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }

    #[tokio::test]
    async fn did_open_is_idempotent_and_forwards_once() {
        let (manager, far) = manager_with_fake_child();
        let (far_read, _far_write) = tokio::io::split(far);

        let params = json!({
            "textDocument": {
                "uri": "file:///projects/src/module.bsl",
                "languageId": "bsl",
                "version": 1,
                "text": "Процедура Тест() КонецПроцедуры",
            }
        });

        let first = manager
            .handle_api_request("textDocument/didOpen", params.clone())
            .await
            .unwrap();
        assert_eq!(first, Value::Null);

        let second = manager
            .handle_api_request("textDocument/didOpen", params.clone())
            .await
            .unwrap();
        assert_eq!(second, json!({ "status": "already_open" }));

        // Exactly one didOpen reached the child.
        let mut reader = BufReader::new(Box::new(far_read) as BoxReader);
        let frame = read_child_frame(&mut reader).await;
        assert_eq!(frame["method"], "textDocument/didOpen");

        // After didClose the document can be reopened (and forwards again).
        manager
            .handle_api_request(
                "textDocument/didClose",
                json!({ "textDocument": { "uri": "file:///projects/src/module.bsl" } }),
            )
            .await
            .unwrap();
        let reopened = manager
            .handle_api_request("textDocument/didOpen", params)
            .await
            .unwrap();
        assert_eq!(reopened, Value::Null);

        let frame = read_child_frame(&mut reader).await;
        assert_eq!(frame["method"], "textDocument/didClose");
        let frame = read_child_frame(&mut reader).await;
        assert_eq!(frame["method"], "textDocument/didOpen");
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (manager, _far) = manager_with_fake_child();
        let err = manager
            .handle_api_request("session/selfDestruct", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, CODE_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn status_payload_has_documented_keys() {
        let (manager, _far) = manager_with_fake_child();
        let status = manager.status_value().await;
        assert_eq!(status["initialized"], false);
        assert_eq!(status["openDocuments"], 0);
        assert_eq!(status["pid"], 4242);
        assert_eq!(status["indexing"]["state"], "idle");
    }

    #[tokio::test]
    async fn passthrough_forwards_and_returns_raw_result() {
        let (manager, far) = manager_with_fake_child();
        let (far_read, mut far_write) = tokio::io::split(far);

        // Fake child answers the forwarded hover request.
        tokio::spawn(async move {
            let mut reader = BufReader::new(Box::new(far_read) as BoxReader);
            let request = read_child_frame(&mut reader).await;
            assert_eq!(request["method"], "textDocument/hover");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": { "contents": { "kind": "markdown", "value": "doc" } },
            });
            let body = serde_json::to_vec(&reply).unwrap();
            let head = format!("Content-Length: {}\r\n\r\n", body.len());
            far_write.write_all(head.as_bytes()).await.unwrap();
            far_write.write_all(&body).await.unwrap();
        });

        let result = manager
            .handle_api_request(
                "textDocument/hover",
                json!({
                    "textDocument": { "uri": "file:///projects/m.bsl" },
                    "position": { "line": 0, "character": 0 },
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["contents"]["value"], "doc");
    }

    #[tokio::test]
    async fn handle_client_speaks_newline_delimited_json_rpc() {
        let (manager, _far) = manager_with_fake_child();
        let (api_near, api_far) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            manager.handle_client(api_near).await;
        });

        let (api_read, mut api_write) = tokio::io::split(api_far);
        api_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":42,\"method\":\"session/status\"}\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(api_read);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["id"], 42);
        assert_eq!(response["result"]["initialized"], false);

        // Garbage line produces a parse error, and the connection survives.
        api_write.write_all(b"this is not json\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["error"]["code"], CODE_PARSE_ERROR);

        api_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":43,\"method\":\"session/capabilities\"}\n")
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        let response: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response["id"], 43);
        assert!(response["result"].is_null());
    }
}
