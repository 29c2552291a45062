use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::progress::ProgressTracker;
use crate::session::indexing::IndexingTracker;
use crate::transport::{RpcError, ServerHandler};
use crate::unhandled::log_unhandled_notification;

/// Default handling of server→client traffic for a language server
/// connection.
///
/// The core implements no LSP-side logic: capability registration and
/// configuration pulls are acknowledged with empty values, observability
/// notifications are logged, progress feeds the tracker, and everything
/// unknown gets method-not-found (requests) or a rate-limited log entry
/// (notifications).
pub struct ClientHandler {
    progress: Arc<ProgressTracker>,
    indexing: Option<Arc<IndexingTracker>>,
}

impl ClientHandler {
    pub fn new(progress: Arc<ProgressTracker>) -> Arc<Self> {
        Arc::new(Self {
            progress,
            indexing: None,
        })
    }

    /// Handler variant for the session daemon: progress events additionally
    /// drive the indexing state machine.
    pub fn with_indexing(
        progress: Arc<ProgressTracker>,
        indexing: Arc<IndexingTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            progress,
            indexing: Some(indexing),
        })
    }
}

impl ServerHandler for ClientHandler {
    fn handle_request(&self, method: &str, params: Option<&Value>) -> Result<Value, RpcError> {
        match method {
            "window/workDoneProgress/create" => {
                // The server provides the token; it shows up in later
                // $/progress notifications.
                if let Some(token) = params.and_then(|p| p.get("token")) {
                    self.progress.register_token(token);
                }
                Ok(json!({}))
            }
            "client/registerCapability" | "client/unregisterCapability" => {
                // Acknowledged without implementing dynamic registration.
                Ok(json!({}))
            }
            "workspace/configuration" => {
                // One empty settings slot per requested item.
                let count = params
                    .and_then(|p| p.get("items"))
                    .and_then(|v| v.as_array())
                    .map(|items| items.len())
                    .unwrap_or(0);
                Ok(Value::Array(vec![Value::Null; count]))
            }
            "window/showMessageRequest" => Ok(Value::Null),
            other => {
                if let Some(p) = params {
                    warn!("unhandled server request: {other} params={p}");
                } else {
                    warn!("unhandled server request: {other} (no params)");
                }
                Err(RpcError::method_not_found())
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<&Value>) {
        match method {
            "$/progress" => {
                let Some(params) = params else { return };
                self.progress.update(params);
                if let Some(indexing) = &self.indexing {
                    indexing.observe(params);
                }
            }
            "textDocument/publishDiagnostics" => {
                if let Some(p) = params {
                    debug!(
                        "diagnostics for {}",
                        p.get("uri").and_then(|u| u.as_str()).unwrap_or("<unknown>")
                    );
                }
            }
            "window/showMessage" => {
                if let Some(p) = params {
                    debug!("server message: {p}");
                }
            }
            "window/logMessage" => {
                if let Some(p) = params {
                    info!(
                        "server log: {}",
                        p.get("message").and_then(|m| m.as_str()).unwrap_or("")
                    );
                }
            }
            other => log_unhandled_notification(other, params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler() -> Arc<ClientHandler> {
        ClientHandler::new(Arc::new(ProgressTracker::new()))
    }

    #[test]
    fn work_done_progress_create_is_acknowledged() {
        let h = handler();
        let out = h
            .handle_request(
                "window/workDoneProgress/create",
                Some(&json!({"token": "t1"})),
            )
            .unwrap();
        assert_eq!(out, json!({}));
    }

    #[test]
    fn workspace_configuration_returns_one_null_per_item() {
        let h = handler();
        let out = h
            .handle_request(
                "workspace/configuration",
                Some(&json!({"items": [{"section": "a"}, {"section": "b"}]})),
            )
            .unwrap();
        assert_eq!(out, json!([null, null]));

        let out = h.handle_request("workspace/configuration", None).unwrap();
        assert_eq!(out, json!([]));
    }

    #[test]
    fn register_capability_is_acknowledged_empty() {
        let h = handler();
        assert_eq!(
            h.handle_request("client/registerCapability", Some(&json!({}))).unwrap(),
            json!({})
        );
    }

    #[test]
    fn unknown_request_yields_method_not_found() {
        let h = handler();
        let err = h.handle_request("custom/doThing", None).unwrap_err();
        assert_eq!(err.code, crate::transport::CODE_METHOD_NOT_FOUND);
    }

    #[test]
    fn progress_notifications_feed_the_tracker() {
        let progress = Arc::new(ProgressTracker::new());
        let h = ClientHandler::new(progress.clone());
        h.handle_notification(
            "$/progress",
            Some(&json!({
                "token": "t",
                "value": { "kind": "begin", "title": "Indexing" }
            })),
        );
        assert!(progress.has_active());
    }
}
