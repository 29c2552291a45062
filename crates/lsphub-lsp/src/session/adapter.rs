use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use lsphub_core::Error;
use serde_json::{Value, json};
use tokio::time::Duration;

use crate::client::{ClientMetrics, ClientStatus};
use crate::methods::{decode_document_symbols, decode_locations_or_links};
use crate::session::client::SessionClient;
use crate::session::indexing::IndexingStatus;
use crate::types::{
    CallHierarchyIncomingCall, CallHierarchyItem, CallHierarchyOutgoingCall, DocumentSymbol,
    Location, LocationOrLink, Range,
};

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const POSITION_TIMEOUT: Duration = Duration::from_secs(30);
const SYMBOL_TIMEOUT: Duration = Duration::from_secs(60);
const CALL_HIERARCHY_TIMEOUT: Duration = Duration::from_secs(120);
const FORMATTING_TIMEOUT: Duration = Duration::from_secs(90);
// Large workspaces can legitimately take minutes to produce diagnostics.
const DOCUMENT_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const WORKSPACE_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn position_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
    })
}

/// Adapts the session daemon to the language-client surface the bridge
/// expects. The daemon owns initialization and document lifetime; methods
/// outside its API return `NotSupported` with a stable message.
pub struct SessionAdapter {
    client: SessionClient,
    address: String,
    connected: AtomicBool,
    last_error: StdMutex<Option<String>>,
}

impl SessionAdapter {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            client: SessionClient::new(host, port),
            address: format!("session://{host}:{port}"),
            connected: AtomicBool::new(false),
            last_error: StdMutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<(), Error> {
        match self.client.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                *self.last_error.lock().expect("last_error lock poisoned") =
                    Some(err.to_string());
                Err(err)
            }
        }
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.client.close().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_connected().await
    }

    pub fn command(&self) -> &str {
        &self.address
    }

    pub async fn metrics(&self) -> ClientMetrics {
        let connected = self.is_connected().await;
        ClientMetrics {
            command: self.address.clone(),
            status: if connected {
                ClientStatus::Connected
            } else {
                ClientStatus::Disconnected
            },
            connected,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_error: self
                .last_error
                .lock()
                .expect("last_error lock poisoned")
                .clone(),
            last_error_time: None,
            last_initialized: None,
            process_id: None,
        }
    }

    async fn call(&self, method: &str, params: Value, deadline: Duration) -> Result<Value, Error> {
        match self.client.call(method, params, deadline).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if matches!(err, Error::Transport(_)) {
                    *self.last_error.lock().expect("last_error lock poisoned") =
                        Some(err.to_string());
                }
                Err(err)
            }
        }
    }

    /// The daemon initialized the session long before this process started;
    /// this only verifies that fact.
    pub async fn initialize(&self) -> Result<Value, Error> {
        let status = self.status().await?;
        let initialized = status
            .get("initialized")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !initialized {
            return Err(Error::Transport("session manager not initialized".into()));
        }
        Ok(status)
    }

    pub async fn status(&self) -> Result<Value, Error> {
        self.call("session/status", Value::Null, STATUS_TIMEOUT).await
    }

    pub async fn capabilities(&self) -> Result<Value, Error> {
        self.call("session/capabilities", Value::Null, STATUS_TIMEOUT)
            .await
    }

    /// Indexing progress as observed by the daemon; `None` when the daemon
    /// is unreachable or predates the field.
    pub async fn indexing_status(&self) -> Option<IndexingStatus> {
        let status = self.status().await.ok()?;
        let indexing = status.get("indexing")?.clone();
        serde_json::from_value(indexing).ok()
    }

    pub async fn did_open(&self, uri: &str, language_id: &str, text: &str) -> Result<Value, Error> {
        let params = json!({
            "textDocument": {
                "uri": uri,
                "languageId": language_id,
                "version": 1,
                "text": text,
            }
        });
        self.call("textDocument/didOpen", params, NOTIFY_TIMEOUT).await
    }

    pub async fn did_close(&self, uri: &str) -> Result<Value, Error> {
        self.call(
            "textDocument/didClose",
            json!({ "textDocument": { "uri": uri } }),
            NOTIFY_TIMEOUT,
        )
        .await
    }

    pub async fn hover(&self, uri: &str, line: u32, character: u32) -> Result<Option<Value>, Error> {
        let result = self
            .call(
                "textDocument/hover",
                position_params(uri, line, character),
                POSITION_TIMEOUT,
            )
            .await?;
        Ok((!result.is_null()).then_some(result))
    }

    pub async fn definition(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<LocationOrLink>, Error> {
        let result = self
            .call(
                "textDocument/definition",
                position_params(uri, line, character),
                POSITION_TIMEOUT,
            )
            .await?;
        decode_locations_or_links(result)
    }

    pub async fn references(
        &self,
        uri: &str,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Vec<Location>, Error> {
        let mut params = position_params(uri, line, character);
        if let Some(obj) = params.as_object_mut() {
            obj.insert(
                "context".to_string(),
                json!({ "includeDeclaration": include_declaration }),
            );
        }
        let result = self
            .call("textDocument/references", params, SYMBOL_TIMEOUT)
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode references: {e}")))
    }

    /// BSL has no interface dispatch; the daemon serves implementation as a
    /// plain location query.
    pub async fn implementation(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, Error> {
        let result = self
            .call(
                "textDocument/implementation",
                position_params(uri, line, character),
                POSITION_TIMEOUT,
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode implementation: {e}")))
    }

    pub async fn document_symbols(&self, uri: &str) -> Result<Vec<DocumentSymbol>, Error> {
        let result = self
            .call(
                "textDocument/documentSymbol",
                json!({ "textDocument": { "uri": uri } }),
                SYMBOL_TIMEOUT,
            )
            .await?;
        decode_document_symbols(result)
    }

    pub async fn workspace_symbols(&self, query: &str) -> Result<Value, Error> {
        self.call("workspace/symbol", json!({ "query": query }), SYMBOL_TIMEOUT)
            .await
    }

    pub async fn code_actions(&self, uri: &str, range: Range) -> Result<Value, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "range": range,
            "context": {},
        });
        self.call("textDocument/codeAction", params, POSITION_TIMEOUT)
            .await
    }

    pub async fn formatting(
        &self,
        uri: &str,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<Value, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "options": { "tabSize": tab_size, "insertSpaces": insert_spaces },
        });
        self.call("textDocument/formatting", params, FORMATTING_TIMEOUT)
            .await
    }

    pub async fn rename(
        &self,
        uri: &str,
        line: u32,
        character: u32,
        new_name: &str,
    ) -> Result<Value, Error> {
        let mut params = position_params(uri, line, character);
        if let Some(obj) = params.as_object_mut() {
            obj.insert("newName".to_string(), json!(new_name));
        }
        self.call("textDocument/rename", params, SYMBOL_TIMEOUT).await
    }

    pub async fn prepare_call_hierarchy(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<CallHierarchyItem>, Error> {
        let result = self
            .call(
                "textDocument/prepareCallHierarchy",
                position_params(uri, line, character),
                CALL_HIERARCHY_TIMEOUT,
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode call hierarchy items: {e}")))
    }

    pub async fn incoming_calls(
        &self,
        item: &CallHierarchyItem,
    ) -> Result<Vec<CallHierarchyIncomingCall>, Error> {
        let result = self
            .call(
                "callHierarchy/incomingCalls",
                json!({ "item": item }),
                CALL_HIERARCHY_TIMEOUT,
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode incoming calls: {e}")))
    }

    pub async fn outgoing_calls(
        &self,
        item: &CallHierarchyItem,
    ) -> Result<Vec<CallHierarchyOutgoingCall>, Error> {
        let result = self
            .call(
                "callHierarchy/outgoingCalls",
                json!({ "item": item }),
                CALL_HIERARCHY_TIMEOUT,
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode outgoing calls: {e}")))
    }

    pub async fn document_diagnostic(&self, uri: &str) -> Result<Value, Error> {
        self.call(
            "textDocument/diagnostic",
            json!({ "textDocument": { "uri": uri } }),
            DOCUMENT_DIAGNOSTIC_TIMEOUT,
        )
        .await
    }

    pub async fn workspace_diagnostic(&self) -> Result<Value, Error> {
        self.call(
            "workspace/diagnostic",
            json!({ "identifier": null, "previousResultIds": [] }),
            WORKSPACE_DIAGNOSTIC_TIMEOUT,
        )
        .await
    }

    // Methods outside the daemon's surface. A typed error keeps the failure
    // distinguishable from a server-side one, so tools can degrade cleanly.

    pub fn prepare_rename(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("prepareRename"))
    }

    pub fn range_formatting(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("rangeFormatting"))
    }

    pub fn semantic_tokens(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("semanticTokens"))
    }

    pub fn semantic_tokens_range(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("semanticTokens/range"))
    }

    pub fn execute_command(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("executeCommand"))
    }

    pub fn signature_help(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("signatureHelp"))
    }

    pub fn folding_range(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("foldingRange"))
    }

    pub fn selection_range(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("selectionRange"))
    }

    pub fn document_link(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("documentLink"))
    }

    pub fn document_color(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("documentColor"))
    }

    pub fn color_presentation(&self) -> Result<Value, Error> {
        Err(Error::not_supported_in_session("colorPresentation"))
    }
}
