use std::collections::HashMap;
use std::sync::Arc;

use lsphub_core::Error;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_DELAY: Duration = Duration::from_secs(1);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_ATTEMPTS: u32 = 5;

/// Reconnecting newline-delimited JSON-RPC client for the session daemon.
///
/// A failed write drops the transport so the next call reconnects; a failed
/// read fails every pending call with a deterministic "connection lost"
/// error and retries the connection in the background unless the client was
/// explicitly closed.
pub struct SessionClient {
    host: String,
    port: u16,
    state: Arc<Mutex<State>>,
}

struct State {
    writer: Option<OwnedWriteHalf>,
    next_id: i64,
    pending: HashMap<i64, oneshot::Sender<Result<Value, Error>>>,
    closed: bool,
}

impl SessionClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            state: Arc::new(Mutex::new(State {
                writer: None,
                next_id: 0,
                pending: HashMap::new(),
                closed: false,
            })),
        }
    }

    fn address(&self) -> String {
        let host = if self.host.is_empty() || self.host == "localhost" {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        format!("{host}:{}", self.port)
    }

    /// Dials the daemon with retry and starts the reader task.
    pub async fn connect(&self) -> Result<(), Error> {
        let addr = self.address();
        info!("connecting to session manager at {addr}");

        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.connect_once().await {
                Ok(()) => {
                    info!("connected to session manager");
                    return Ok(());
                }
                Err(err) => {
                    debug!("connection attempt {attempt} failed: {err}");
                    last_err = Some(err);
                }
            }
            if attempt < CONNECT_ATTEMPTS {
                sleep(CONNECT_DELAY).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::Transport(format!("failed to connect to session manager at {addr}"))
        }))
    }

    fn connect_once(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(async move {
            let addr = self.address();
            let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr.as_str()))
                .await
                .map_err(|_| Error::Timeout(format!("dial {addr}")))?
                .map_err(|e| Error::Transport(format!("failed to connect to {addr}: {e}")))?;

            let (read_half, write_half) = stream.into_split();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(Error::Transport("session client is closed".into()));
                }
                state.writer = Some(write_half);
            }

            let client = self.clone_handle();
            tokio::spawn(async move {
                client.read_responses(read_half).await;
            });
            Ok(())
        })
    }

    fn clone_handle(&self) -> SessionClient {
        SessionClient {
            host: self.host.clone(),
            port: self.port,
            state: self.state.clone(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.writer.is_some() && !state.closed
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.writer = None;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(Error::Transport("session client is closed".into())));
        }
    }

    /// One JSON-RPC call. On deadline the caller's waiter is abandoned and
    /// the pending entry is reaped by the reply or the next disconnect.
    pub async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value, Error> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::Transport("session client is closed".into()));
            }

            if state.writer.is_none() {
                // One reconnect attempt before failing the call.
                drop(state);
                self.connect_once().await.map_err(|e| {
                    Error::Transport(format!("not connected to session manager: {e}"))
                })?;
                state = self.state.lock().await;
                if state.writer.is_none() {
                    return Err(Error::Transport("not connected to session manager".into()));
                }
            }

            state.next_id += 1;
            let id = state.next_id;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);

            let request = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            });
            let mut payload = request.to_string().into_bytes();
            payload.push(b'\n');

            let writer = state.writer.as_mut().expect("writer checked above");
            if let Err(err) = writer.write_all(&payload).await {
                // Next call triggers a reconnect.
                state.writer = None;
                state.pending.remove(&id);
                return Err(Error::Transport(format!("failed to send request: {err}")));
            }
            rx
        };

        match timeout(deadline, rx).await {
            Err(_) => Err(Error::Timeout(method.to_string())),
            Ok(Err(_)) => Err(Error::Transport("connection lost".into())),
            Ok(Ok(outcome)) => outcome,
        }
    }

    async fn read_responses(&self, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("session manager read error: {err}");
                    break;
                }
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(err) => {
                    warn!("failed to parse session manager response: {err}");
                    continue;
                }
            };

            let Some(id) = response.get("id").and_then(|i| i.as_i64()) else {
                continue;
            };

            let outcome = match response.get("error") {
                Some(err) if !err.is_null() => {
                    let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                    let message = err
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("session manager error")
                        .to_string();
                    Err(Error::Server { code, message })
                }
                _ => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            };

            let tx = {
                let mut state = self.state.lock().await;
                state.pending.remove(&id)
            };
            if let Some(tx) = tx {
                let _ = tx.send(outcome);
            } else {
                debug!("no pending request for session reply id={id}");
            }
        }

        // Reader died: fail in-flight calls deterministically, then try to
        // re-establish the connection unless explicitly closed.
        let should_reconnect = {
            let mut state = self.state.lock().await;
            state.writer = None;
            for (_, tx) in state.pending.drain() {
                let _ = tx.send(Err(Error::Transport("connection lost".into())));
            }
            !state.closed
        };

        if !should_reconnect {
            return;
        }

        for attempt in 0..RECONNECT_ATTEMPTS {
            sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
            if self.state.lock().await.closed {
                return;
            }
            match self.connect_once().await {
                Ok(()) => {
                    info!("reconnected to session manager");
                    return;
                }
                Err(err) => debug!(
                    "reconnect attempt {}/{RECONNECT_ATTEMPTS} failed: {err}",
                    attempt + 1
                ),
            }
        }
        warn!("giving up reconnecting to session manager");
    }
}
