use std::fmt;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use lsphub_core::Error;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, info, warn};

use crate::handler::ClientHandler;
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::transport::FramedTransport;
use crate::ws::WsByteStream;

/// Connection lifecycle of one language client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
    Restarting,
    Error,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::Uninitialized => "uninitialized",
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Restarting => "restarting",
            ClientStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Value-copied counters and state for status tooling.
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    pub command: String,
    pub status: ClientStatus,
    pub connected: bool,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
    pub last_error: Option<String>,
    pub last_error_time: Option<SystemTime>,
    pub last_initialized: Option<SystemTime>,
    pub process_id: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub max_attempts: u32,
    pub restart_delay: Duration,
    pub dial_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            restart_delay: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct MutableState {
    status: Option<ClientStatus>,
    last_error: Option<String>,
    last_error_time: Option<SystemTime>,
    last_initialized: Option<SystemTime>,
}

/// One connection to one language server, over stdio, TCP or WebSocket.
///
/// The client exclusively owns its transport, its correlation map (inside
/// the transport), its progress tracker and, for stdio, the child process.
/// Per-request failures increment counters but never move the client out of
/// Connected; only connection-level failures do.
pub struct LanguageClient {
    transport: Arc<FramedTransport>,
    progress: Arc<ProgressTracker>,
    command: String,
    state: StdMutex<MutableState>,
    total_requests: AtomicI64,
    successful_requests: AtomicI64,
    failed_requests: AtomicI64,
    child: Mutex<Option<Child>>,
    process_id: Option<u32>,
    server_capabilities: StdMutex<Option<Value>>,
}

impl LanguageClient {
    /// Spawns the server process and wires its stdio into the framed
    /// transport. The child is owned: its exit surfaces as a disconnect.
    pub async fn spawn_stdio(command: &str, args: &[String]) -> Result<Arc<Self>, Error> {
        if command.trim().is_empty() {
            return Err(Error::Config("stdio mode requires a command".into()));
        }

        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("failed to capture LSP stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("failed to capture LSP stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(stderr);
        }

        let process_id = child.id();
        info!("spawned LSP server {command} pid={process_id:?}");

        let progress = Arc::new(ProgressTracker::new());
        let handler = ClientHandler::new(progress.clone());
        let transport = FramedTransport::start(Box::new(stdout), Box::new(stdin), handler);

        Ok(Self::assemble(
            transport,
            progress,
            command.to_string(),
            Some(child),
            process_id,
        ))
    }

    /// Dials `host:port` with linear backoff (`restart_delay * attempt`) and
    /// wraps the socket in the framed codec. `TCP_NODELAY` is set so small
    /// JSON-RPC frames are not batched.
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<Arc<Self>, Error> {
        let addr = tcp_address(host, port);
        let stream = dial_with_retry(&addr, &options, |addr| async move {
            TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| Error::Transport(format!("tcp connect failed: {e}")))
        })
        .await?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(format!("failed to set TCP_NODELAY: {e}")))?;

        info!("TCP connection established to {addr}");
        let (read_half, write_half) = stream.into_split();

        let progress = Arc::new(ProgressTracker::new());
        let handler = ClientHandler::new(progress.clone());
        let transport =
            FramedTransport::start(Box::new(read_half), Box::new(write_half), handler);

        Ok(Self::assemble(
            transport,
            progress,
            format!("tcp://{addr}"),
            None,
            None,
        ))
    }

    /// Dials `ws://host:port/lsp` and adapts the message stream into the
    /// byte-stream codec.
    pub async fn connect_websocket(
        host: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<Arc<Self>, Error> {
        let addr = tcp_address(host, port);
        let url = format!("ws://{addr}/lsp");

        let socket = dial_with_retry(&url, &options, |url| async move {
            tokio_tungstenite::connect_async(url.as_str())
                .await
                .map(|(socket, _resp)| socket)
                .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))
        })
        .await?;

        info!("WebSocket connection established to {url}");
        let (read_half, write_half) = tokio::io::split(WsByteStream::new(socket));

        let progress = Arc::new(ProgressTracker::new());
        let handler = ClientHandler::new(progress.clone());
        let transport =
            FramedTransport::start(Box::new(read_half), Box::new(write_half), handler);

        Ok(Self::assemble(transport, progress, url, None, None))
    }

    /// Wraps an already-connected byte stream (an in-process server, a
    /// test harness, or a custom carrier) in a fully wired client.
    pub fn from_stream(
        reader: crate::transport::BoxReader,
        writer: crate::transport::BoxWriter,
        command: &str,
    ) -> Arc<Self> {
        let progress = Arc::new(ProgressTracker::new());
        let handler = ClientHandler::new(progress.clone());
        let transport = FramedTransport::start(reader, writer, handler);
        Self::assemble(transport, progress, command.to_string(), None, None)
    }

    fn assemble(
        transport: Arc<FramedTransport>,
        progress: Arc<ProgressTracker>,
        command: String,
        child: Option<Child>,
        process_id: Option<u32>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            transport,
            progress,
            command,
            state: StdMutex::new(MutableState {
                status: Some(ClientStatus::Connected),
                ..MutableState::default()
            }),
            total_requests: AtomicI64::new(0),
            successful_requests: AtomicI64::new(0),
            failed_requests: AtomicI64::new(0),
            child: Mutex::new(child),
            process_id,
            server_capabilities: StdMutex::new(None),
        });

        // Disconnect watcher: covers both idle disconnects and child exit
        // (a dead child closes its stdout, which ends the reader loop).
        let watched = Arc::downgrade(&client);
        let mut closed = client.transport.closed();
        tokio::spawn(async move {
            while closed.changed().await.is_ok() {
                if !*closed.borrow() {
                    continue;
                }
                if let Some(client) = watched.upgrade() {
                    warn!("LSP transport disconnected: {}", client.command);
                    client.set_status(ClientStatus::Disconnected);
                }
                break;
            }
        });

        client
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn status(&self) -> ClientStatus {
        self.state
            .lock()
            .expect("state lock poisoned")
            .status
            .unwrap_or(ClientStatus::Uninitialized)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected && !self.transport.is_closed()
    }

    pub fn set_status(&self, status: ClientStatus) {
        self.state.lock().expect("state lock poisoned").status = Some(status);
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn has_active_progress(&self) -> bool {
        self.progress.has_active()
    }

    pub fn server_capabilities(&self) -> Option<Value> {
        self.server_capabilities
            .lock()
            .expect("capabilities lock poisoned")
            .clone()
    }

    pub fn metrics(&self) -> ClientMetrics {
        let state = self.state.lock().expect("state lock poisoned");
        ClientMetrics {
            command: self.command.clone(),
            status: state.status.unwrap_or(ClientStatus::Uninitialized),
            connected: state.status == Some(ClientStatus::Connected)
                && !self.transport.is_closed(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
            last_error_time: state.last_error_time,
            last_initialized: state.last_initialized,
            process_id: self.process_id,
        }
    }

    pub(crate) fn mark_initialized(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.last_initialized = Some(SystemTime::now());
        state.status = Some(ClientStatus::Connected);
    }

    pub(crate) fn transport(&self) -> &FramedTransport {
        &self.transport
    }

    /// Sends a request through the transport, maintaining counters and the
    /// status machine. Timeouts and server-side errors stay local to the
    /// caller; transport failures and connection-level server messages
    /// advance the status.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, Error> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match self.transport.request(method, params, deadline).await {
            Ok(value) => {
                self.successful_requests.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                let message = err.to_string();
                {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    state.last_error = Some(message.clone());
                    state.last_error_time = Some(SystemTime::now());
                }
                match &err {
                    Error::Transport(_) => self.set_status(ClientStatus::Disconnected),
                    Error::Server { .. } if Error::is_connection_message(&message) => {
                        self.set_status(ClientStatus::Error)
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), Error> {
        match self.transport.notify(method, params).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    state.last_error = Some(message);
                    state.last_error_time = Some(SystemTime::now());
                }
                self.set_status(ClientStatus::Disconnected);
                Err(err)
            }
        }
    }

    /// Best-effort graceful shutdown: `shutdown` request, `exit`
    /// notification, then kill the owned child so it cannot linger.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let _ = self
            .request("shutdown", Value::Null, Duration::from_secs(5))
            .await;
        let _ = self.notify("exit", Value::Null).await;

        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.set_status(ClientStatus::Disconnected);
        Ok(())
    }

    pub(crate) fn cache_capabilities(&self, init_result: &Value) {
        if let Some(caps) = init_result.get("capabilities") {
            *self
                .server_capabilities
                .lock()
                .expect("capabilities lock poisoned") = Some(caps.clone());
        }
    }
}

fn tcp_address(host: &str, port: u16) -> String {
    let host = if host.is_empty() { "localhost" } else { host };
    // Avoid DNS lookups for localhost inside containers.
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{host}:{port}")
}

async fn dial_with_retry<T, F, Fut>(
    addr: &str,
    options: &ConnectOptions,
    dial: F,
) -> Result<T, Error>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut last_err = None;
    for attempt in 1..=options.max_attempts.max(1) {
        match timeout(options.dial_timeout, dial(addr.to_string())).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => last_err = Some(err),
            Err(_) => last_err = Some(Error::Timeout(format!("dial {addr}"))),
        }
        warn!(
            "connection attempt {attempt}/{} to {addr} failed",
            options.max_attempts
        );
        if attempt < options.max_attempts {
            sleep(options.restart_delay * attempt).await;
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Transport(format!("failed to connect to {addr}"))
    }))
}

fn spawn_stderr_logger(stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => debug!(target: "lsp.stderr", "{}", line.trim_end()),
            }
        }
    });
}

/// Builds the `initialize` params for a directly-owned server.
pub(crate) fn initialize_params(root_uri: &str, initialization_options: Option<&Value>) -> Value {
    let mut params = json!({
        "processId": null,
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "definition": { "linkSupport": true },
                "references": {},
                "callHierarchy": {},
                "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                "diagnostic": {}
            },
            "workspace": { "workspaceFolders": true },
            "window": { "workDoneProgress": true }
        },
        "workspaceFolders": [
            { "uri": root_uri, "name": "workspace" }
        ]
    });
    if let Some(options) = initialization_options
        && let Some(obj) = params.as_object_mut()
    {
        obj.insert("initializationOptions".to_string(), options.clone());
    }
    params
}
