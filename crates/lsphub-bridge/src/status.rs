use lsphub_core::Error;
use lsphub_lsp::{IndexingState, IndexingStatus};
use serde::Serialize;
use tokio::time::{Duration, Instant, sleep};

use crate::Bridge;

const GATE_POLL_DEADLINE: Duration = Duration::from_secs(2);
const GATE_POLL_TICK: Duration = Duration::from_millis(200);
const RETRY_AFTER_MS: u32 = 2000;

/// One active progress stream on one server.
#[derive(Debug, Clone, Serialize)]
pub struct LspActivity {
    pub server: String,
    pub token: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellable: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatusView {
    pub server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub command: String,
    pub connected: bool,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub active_progress: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgress {
    pub state: IndexingState,
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<IndexingStatus> for IndexingProgress {
    fn from(status: IndexingStatus) -> Self {
        Self {
            state: status.state,
            current: status.current,
            total: status.total,
            eta_seconds: status.eta_seconds,
            elapsed_seconds: status.elapsed_seconds,
            message: status.message,
        }
    }
}

/// Aggregated readiness view over all connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct LspStatus {
    pub ready: bool,
    /// starting | warming | busy | error | ready
    pub state: String,
    pub activity: Vec<LspActivity>,
    pub clients: Vec<ClientStatusView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexing: Option<IndexingProgress>,
}

/// The payload handed back to a gated tool call.
#[derive(Debug, Clone, Serialize)]
pub struct LspStatusResponse {
    #[serde(flatten)]
    pub status: LspStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u32>,
}

/// Derives the readiness state from per-client status, progress snapshots
/// and (in session mode) daemon indexing.
///
/// A client status of "error" can mean "last request failed" — e.g. the
/// server was busy indexing — which must not block every tool. Only
/// connection-level problems count against readiness; "busy" does not
/// block it either.
pub async fn build_status(bridge: &Bridge) -> LspStatus {
    let clients = bridge.list_clients().await;

    let mut status = LspStatus {
        ready: false,
        state: "starting".to_string(),
        activity: Vec::new(),
        clients: Vec::new(),
        indexing: None,
    };
    if clients.is_empty() {
        return status;
    }

    let mut servers: Vec<&String> = clients.keys().collect();
    servers.sort();

    let mut connected_count = 0usize;
    let mut any_conn_error = false;
    let mut any_starting = false;
    let mut any_busy = false;

    for server in servers {
        let client = &clients[server];
        let metrics = client.metrics().await;
        let status_str = metrics.status.to_string();
        let last_error = metrics.last_error.clone().unwrap_or_default();

        if metrics.connected {
            connected_count += 1;
        }

        let is_starting = matches!(
            status_str.as_str(),
            "connecting" | "uninitialized" | "restarting"
        );
        if is_starting {
            any_starting = true;
        }
        // A client mid-startup is starting, not broken; anything else that
        // is not connected counts as a connection-level problem.
        let is_conn_error = !is_starting
            && (status_str == "disconnected"
                || !metrics.connected
                || Error::is_connection_message(&last_error));
        if is_conn_error {
            any_conn_error = true;
        }

        let snapshot = client.progress_snapshot();
        let active_count = snapshot.active.len();
        if active_count > 0 {
            any_busy = true;
            for event in snapshot.active {
                status.activity.push(LspActivity {
                    server: server.clone(),
                    token: event.token_key,
                    kind: event.kind,
                    title: event.title,
                    message: event.message,
                    percentage: event.percentage,
                    cancellable: event.cancellable,
                });
            }
        }

        status.clients.push(ClientStatusView {
            server: server.clone(),
            command: metrics.command,
            connected: metrics.connected,
            status: status_str,
            last_error,
            active_progress: active_count,
        });

        if status.indexing.is_none()
            && let Some(indexing) = client.indexing_status().await
        {
            if indexing.state == IndexingState::Indexing {
                any_busy = true;
            }
            status.indexing = Some(indexing.into());
        }
    }

    status.state = if any_conn_error {
        "error"
    } else if any_busy {
        "busy"
    } else if any_starting || connected_count == 0 {
        "starting"
    } else {
        "ready"
    }
    .to_string();

    // Busy (indexing/progress) does not block tool usage: ready as soon as
    // at least one client is connected and nothing is connection-broken.
    status.ready = connected_count > 0 && !any_conn_error;
    status
}

/// The gate every tool entry point consults. `None` means pass; otherwise
/// the returned payload tells the agent when to retry.
///
/// Auto-connect is triggered here when nothing is connected yet, and the
/// gate gives the background connect a short head start so the very first
/// tool call does not immediately bounce with "starting".
pub async fn check_ready(bridge: &Bridge) -> Option<LspStatusResponse> {
    let status = build_status(bridge).await;
    if !status.ready {
        let connected = status.clients.iter().filter(|c| c.connected).count();
        if connected == 0 && matches!(status.state.as_str(), "starting" | "error") {
            bridge.start_auto_connect();
        }
    }

    let deadline = Instant::now() + GATE_POLL_DEADLINE;
    loop {
        let status = build_status(bridge).await;
        if status.ready {
            // In session mode the daemon owns warm-up; skip the gate.
            if bridge.all_clients_in_session_mode().await {
                return None;
            }

            let warmup = bridge.warmup_status();
            if warmup.done && warmup.error.is_none() {
                return None;
            }
            if !warmup.running && !warmup.done {
                bridge.start_warmup();
            }

            let mut status = status;
            status.state = "warming".to_string();
            return Some(LspStatusResponse {
                status,
                retry_after_ms: Some(RETRY_AFTER_MS),
            });
        }

        if Instant::now() >= deadline {
            let retry = matches!(status.state.as_str(), "starting" | "busy" | "error")
                .then_some(RETRY_AFTER_MS);
            return Some(LspStatusResponse {
                status,
                retry_after_ms: retry,
            });
        }
        sleep(GATE_POLL_TICK).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bridge, BridgeClient};
    use lsphub_core::config::HubConfig;
    use lsphub_lsp::{LanguageClient, SessionAdapter};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn empty_bridge() -> Arc<Bridge> {
        Bridge::new(HubConfig::default(), vec!["/projects".into()]).unwrap()
    }

    /// A live direct client over an in-memory pipe. The far end is returned
    /// so the test can push server frames or kill the connection.
    fn staged_direct_client() -> (
        BridgeClient,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
    ) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);
        let client =
            LanguageClient::from_stream(Box::new(near_read), Box::new(near_write), "fake-ls");
        (BridgeClient::Direct(client), far_write, far_read)
    }

    async fn push_frame(
        writer: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>,
        value: &serde_json::Value,
    ) {
        let body = serde_json::to_vec(value).unwrap();
        let head = format!("Content-Length: {}\r\n\r\n", body.len());
        writer.write_all(head.as_bytes()).await.unwrap();
        writer.write_all(&body).await.unwrap();
    }

    #[tokio::test]
    async fn no_clients_means_starting_and_not_ready() {
        let bridge = empty_bridge().await;
        let status = build_status(&bridge).await;
        assert!(!status.ready);
        assert_eq!(status.state, "starting");
        assert!(status.clients.is_empty());
    }

    #[tokio::test]
    async fn disconnected_session_client_is_a_connection_error() {
        let bridge = empty_bridge().await;
        // Adapter that never connected: reports disconnected.
        let adapter = Arc::new(SessionAdapter::new("127.0.0.1", 1));
        bridge
            .insert_client("session-bsl", BridgeClient::Session(adapter))
            .await;

        let status = build_status(&bridge).await;
        assert!(!status.ready);
        assert_eq!(status.state, "error");
        assert_eq!(status.clients.len(), 1);
        assert!(!status.clients[0].connected);
    }

    #[tokio::test]
    async fn gate_returns_retry_payload_when_not_ready() {
        let bridge = empty_bridge().await;
        let adapter = Arc::new(SessionAdapter::new("127.0.0.1", 1));
        bridge
            .insert_client("session-bsl", BridgeClient::Session(adapter))
            .await;

        let started = std::time::Instant::now();
        let response = check_ready(&bridge).await.expect("gate must block");
        // Polls for up to 2 s in 200 ms ticks before giving up.
        assert!(started.elapsed() >= GATE_POLL_DEADLINE);
        assert_eq!(response.retry_after_ms, Some(2000));
        assert!(!response.status.ready);
    }

    #[tokio::test]
    async fn busy_progress_does_not_block_readiness() {
        let bridge = empty_bridge().await;
        let (client, mut far_write, _far_read) = staged_direct_client();
        bridge.insert_client("bsl-language-server", client).await;

        let status = build_status(&bridge).await;
        assert!(status.ready);
        assert_eq!(status.state, "ready");

        // Server starts reporting indexing progress: busy, but still ready.
        push_frame(
            &mut far_write,
            &json!({
                "jsonrpc": "2.0",
                "method": "$/progress",
                "params": {
                    "token": "index-1",
                    "value": { "kind": "begin", "title": "Indexing", "percentage": 10 }
                }
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = build_status(&bridge).await;
        assert_eq!(status.state, "busy");
        assert!(status.ready);
        assert_eq!(status.activity.len(), 1);
        assert_eq!(status.activity[0].percentage, Some(10));
    }

    #[tokio::test]
    async fn one_connected_one_broken_client_is_not_ready() {
        let bridge = empty_bridge().await;
        let (healthy, _keep_write, _keep_read) = staged_direct_client();
        bridge.insert_client("bsl-language-server", healthy).await;

        let (broken, far_write, far_read) = staged_direct_client();
        bridge.insert_client("gopls", broken).await;
        // Kill the second client's carrier.
        drop(far_write);
        drop(far_read);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = build_status(&bridge).await;
        let connected = status.clients.iter().filter(|c| c.connected).count();
        assert_eq!(connected, 1);
        assert_eq!(status.state, "error");
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn gate_passes_once_warmup_is_done() {
        let bridge = empty_bridge().await;
        let (client, _far_write, _far_read) = staged_direct_client();
        bridge.insert_client("bsl-language-server", client).await;

        {
            let mut warmup = bridge.warmup.lock().unwrap();
            warmup.done = true;
        }
        assert!(check_ready(&bridge).await.is_none());
    }

    #[tokio::test]
    async fn gate_reports_warming_until_warmup_finishes() {
        let bridge = empty_bridge().await;
        let (client, _far_write, _far_read) = staged_direct_client();
        bridge.insert_client("bsl-language-server", client).await;

        {
            // Freeze warm-up in the running state so the gate cannot pass.
            let mut warmup = bridge.warmup.lock().unwrap();
            warmup.running = true;
        }
        let response = check_ready(&bridge).await.expect("gate must block");
        assert_eq!(response.status.state, "warming");
        assert_eq!(response.retry_after_ms, Some(2000));
    }

    #[tokio::test]
    async fn gate_skips_warmup_in_session_mode() {
        // Fake daemon that reports an initialized session.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let request: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": { "initialized": true, "openDocuments": 0, "pid": 1 },
                });
                let mut payload = reply.to_string().into_bytes();
                payload.push(b'\n');
                write_half.write_all(&payload).await.unwrap();
            }
        });

        let bridge = empty_bridge().await;
        let adapter = Arc::new(SessionAdapter::new("127.0.0.1", port));
        adapter.connect().await.unwrap();
        bridge
            .insert_client("session-bsl", BridgeClient::Session(adapter))
            .await;

        // Warm-up never ran; the daemon owns it, so the gate passes anyway.
        assert!(!bridge.warmup_status().done);
        assert!(check_ready(&bridge).await.is_none());
    }

    #[tokio::test]
    async fn readiness_payload_serializes_with_documented_keys() {
        let bridge = empty_bridge().await;
        let response = LspStatusResponse {
            status: build_status(&bridge).await,
            retry_after_ms: Some(2000),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["ready"], false);
        assert_eq!(value["state"], "starting");
        assert!(value["activity"].is_array());
        assert_eq!(value["retry_after_ms"], 2000);
    }
}
