use lsphub_core::Error;
use serde_json::{Value, json};
use tokio::time::Duration;

use crate::client::{LanguageClient, initialize_params};
use crate::types::{
    CallHierarchyIncomingCall, CallHierarchyItem, CallHierarchyOutgoingCall, DocumentSymbol,
    Location, LocationOrLink, Position, Range, SymbolInformation,
};

// Per-method deadlines. Heavy symbol/reference queries get generous limits
// because servers may still be filling their indexes; workspace diagnostics
// on large projects legitimately run minutes.
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const HOVER_TIMEOUT: Duration = Duration::from_secs(10);
const SIGNATURE_HELP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFINITION_TIMEOUT: Duration = Duration::from_secs(30);
const REFERENCES_TIMEOUT: Duration = Duration::from_secs(60);
const DOCUMENT_SYMBOL_TIMEOUT: Duration = Duration::from_secs(60);
const WORKSPACE_SYMBOL_TIMEOUT: Duration = Duration::from_secs(60);
const IMPLEMENTATION_TIMEOUT: Duration = Duration::from_secs(30);
const CODE_ACTION_TIMEOUT: Duration = Duration::from_secs(15);
const RENAME_TIMEOUT: Duration = Duration::from_secs(60);
const PREPARE_RENAME_TIMEOUT: Duration = Duration::from_secs(30);
const RANGE_METHOD_TIMEOUT: Duration = Duration::from_secs(30);
const FORMATTING_TIMEOUT: Duration = Duration::from_secs(90);
const WORKSPACE_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(120);
const DOCUMENT_DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(90);
const CALL_HIERARCHY_TIMEOUT: Duration = Duration::from_secs(60);
const EXECUTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const SEMANTIC_TOKENS_TIMEOUT: Duration = Duration::from_secs(5);

fn text_document_position(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
    })
}

fn is_absent(value: &Value) -> bool {
    value.is_null()
}

impl LanguageClient {
    /// One-shot `initialize` handshake. Checks for disconnect before
    /// sending: a dead transport must fail fast, not wait out the deadline.
    pub async fn initialize(
        &self,
        root_uri: &str,
        initialization_options: Option<&Value>,
    ) -> Result<Value, Error> {
        if self.transport().is_closed() {
            return Err(Error::Transport("connection already disconnected".into()));
        }

        let params = initialize_params(root_uri, initialization_options);
        let result = self
            .request("initialize", params, INITIALIZE_TIMEOUT)
            .await?;
        self.cache_capabilities(&result);
        self.initialized().await?;
        self.mark_initialized();
        Ok(result)
    }

    pub async fn initialized(&self) -> Result<(), Error> {
        self.notify("initialized", json!({})).await
    }

    pub async fn shutdown_request(&self) -> Result<(), Error> {
        self.request("shutdown", Value::Null, SHUTDOWN_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn exit(&self) -> Result<(), Error> {
        self.notify("exit", Value::Null).await
    }

    pub async fn did_open(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
        version: i32,
    ) -> Result<(), Error> {
        let params = json!({
            "textDocument": {
                "uri": uri,
                "languageId": language_id,
                "version": version,
                "text": text,
            }
        });
        self.notify("textDocument/didOpen", params).await
    }

    pub async fn did_change(&self, uri: &str, version: i32, text: &str) -> Result<(), Error> {
        let params = json!({
            "textDocument": { "uri": uri, "version": version },
            "contentChanges": [ { "text": text } ],
        });
        self.notify("textDocument/didChange", params).await
    }

    pub async fn did_save(&self, uri: &str, text: Option<&str>) -> Result<(), Error> {
        let mut params = json!({ "textDocument": { "uri": uri } });
        if let Some(text) = text
            && let Some(obj) = params.as_object_mut()
        {
            obj.insert("text".to_string(), json!(text));
        }
        self.notify("textDocument/didSave", params).await
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), Error> {
        self.notify("textDocument/didClose", json!({ "textDocument": { "uri": uri } }))
            .await
    }

    pub async fn did_change_watched_files(&self, changes: Value) -> Result<(), Error> {
        self.notify("workspace/didChangeWatchedFiles", json!({ "changes": changes }))
            .await
    }

    pub async fn did_change_configuration(&self, settings: Value) -> Result<(), Error> {
        self.notify("workspace/didChangeConfiguration", json!({ "settings": settings }))
            .await
    }

    /// `null` means the server has no hover information; that is absence,
    /// not an error.
    pub async fn hover(&self, uri: &str, line: u32, character: u32) -> Result<Option<Value>, Error> {
        let result = self
            .request(
                "textDocument/hover",
                text_document_position(uri, line, character),
                HOVER_TIMEOUT,
            )
            .await?;
        Ok((!is_absent(&result)).then_some(result))
    }

    pub async fn signature_help(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>, Error> {
        let result = self
            .request(
                "textDocument/signatureHelp",
                text_document_position(uri, line, character),
                SIGNATURE_HELP_TIMEOUT,
            )
            .await?;
        Ok((!is_absent(&result)).then_some(result))
    }

    /// Decodes the polymorphic definition result (`Location`, `Location[]`
    /// or `LocationLink[]`) into the sum type without coercing shapes.
    pub async fn definition(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<LocationOrLink>, Error> {
        let result = self
            .request(
                "textDocument/definition",
                text_document_position(uri, line, character),
                DEFINITION_TIMEOUT,
            )
            .await?;
        decode_locations_or_links(result)
    }

    pub async fn type_definition(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<LocationOrLink>, Error> {
        let result = self
            .request(
                "textDocument/typeDefinition",
                text_document_position(uri, line, character),
                DEFINITION_TIMEOUT,
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
        let mut params = text_document_position(uri, line, character);
        if let Some(obj) = params.as_object_mut() {
            obj.insert(
                "context".to_string(),
                json!({ "includeDeclaration": include_declaration }),
            );
        }
        let result = self
            .request("textDocument/references", params, REFERENCES_TIMEOUT)
            .await?;
        if is_absent(&result) {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode references: {e}")))
    }

    pub async fn implementation(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, Error> {
        let result = self
            .request(
                "textDocument/implementation",
                text_document_position(uri, line, character),
                IMPLEMENTATION_TIMEOUT,
            )
            .await?;
        if is_absent(&result) {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode implementation: {e}")))
    }

    /// Tries `DocumentSymbol[]` first; on empty or mismatching shape falls
    /// back to `SymbolInformation[]` lifted with `range = selectionRange`.
    pub async fn document_symbols(&self, uri: &str) -> Result<Vec<DocumentSymbol>, Error> {
        let params = json!({ "textDocument": { "uri": uri } });
        let result = self
            .request(
                "textDocument/documentSymbol",
                params,
                DOCUMENT_SYMBOL_TIMEOUT,
            )
            .await?;
        decode_document_symbols(result)
    }

    pub async fn workspace_symbols(&self, query: &str) -> Result<Value, Error> {
        self.request(
            "workspace/symbol",
            json!({ "query": query }),
            WORKSPACE_SYMBOL_TIMEOUT,
        )
        .await
    }

    pub async fn code_actions(&self, uri: &str, range: Range) -> Result<Value, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "range": range,
            "context": {},
        });
        self.request("textDocument/codeAction", params, CODE_ACTION_TIMEOUT)
            .await
    }

    pub async fn rename(
        &self,
        uri: &str,
        line: u32,
        character: u32,
        new_name: &str,
    ) -> Result<Value, Error> {
        let mut params = text_document_position(uri, line, character);
        if let Some(obj) = params.as_object_mut() {
            obj.insert("newName".to_string(), json!(new_name));
        }
        self.request("textDocument/rename", params, RENAME_TIMEOUT)
            .await
    }

    pub async fn prepare_rename(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>, Error> {
        let result = self
            .request(
                "textDocument/prepareRename",
                text_document_position(uri, line, character),
                PREPARE_RENAME_TIMEOUT,
            )
            .await?;
        Ok((!is_absent(&result)).then_some(result))
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
        self.request("textDocument/formatting", params, FORMATTING_TIMEOUT)
            .await
    }

    pub async fn range_formatting(
        &self,
        uri: &str,
        range: Range,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<Value, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "range": range,
            "options": { "tabSize": tab_size, "insertSpaces": insert_spaces },
        });
        self.request("textDocument/rangeFormatting", params, RANGE_METHOD_TIMEOUT)
            .await
    }

    pub async fn folding_range(&self, uri: &str) -> Result<Value, Error> {
        self.request(
            "textDocument/foldingRange",
            json!({ "textDocument": { "uri": uri } }),
            RANGE_METHOD_TIMEOUT,
        )
        .await
    }

    pub async fn selection_range(&self, uri: &str, positions: Vec<Position>) -> Result<Value, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "positions": positions,
        });
        self.request("textDocument/selectionRange", params, RANGE_METHOD_TIMEOUT)
            .await
    }

    pub async fn document_link(&self, uri: &str) -> Result<Value, Error> {
        self.request(
            "textDocument/documentLink",
            json!({ "textDocument": { "uri": uri } }),
            RANGE_METHOD_TIMEOUT,
        )
        .await
    }

    pub async fn document_color(&self, uri: &str) -> Result<Value, Error> {
        self.request(
            "textDocument/documentColor",
            json!({ "textDocument": { "uri": uri } }),
            RANGE_METHOD_TIMEOUT,
        )
        .await
    }

    pub async fn color_presentation(
        &self,
        uri: &str,
        color: Value,
        range: Range,
    ) -> Result<Value, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "color": color,
            "range": range,
        });
        self.request(
            "textDocument/colorPresentation",
            params,
            RANGE_METHOD_TIMEOUT,
        )
        .await
    }

    pub async fn execute_command(&self, command: &str, arguments: Value) -> Result<Value, Error> {
        let params = json!({ "command": command, "arguments": arguments });
        self.request("workspace/executeCommand", params, EXECUTE_COMMAND_TIMEOUT)
            .await
    }

    /// Pull diagnostics for one document (LSP 3.17 `textDocument/diagnostic`).
    pub async fn document_diagnostic(
        &self,
        uri: &str,
        identifier: Option<&str>,
        previous_result_id: Option<&str>,
    ) -> Result<Value, Error> {
        let mut params = json!({ "textDocument": { "uri": uri } });
        if let Some(obj) = params.as_object_mut() {
            if let Some(identifier) = identifier {
                obj.insert("identifier".to_string(), json!(identifier));
            }
            if let Some(prev) = previous_result_id {
                obj.insert("previousResultId".to_string(), json!(prev));
            }
        }
        self.request(
            "textDocument/diagnostic",
            params,
            DOCUMENT_DIAGNOSTIC_TIMEOUT,
        )
        .await
    }

    pub async fn workspace_diagnostic(&self, identifier: Option<&str>) -> Result<Value, Error> {
        let params = json!({
            "identifier": identifier,
            "previousResultIds": [],
        });
        self.request(
            "workspace/diagnostic",
            params,
            WORKSPACE_DIAGNOSTIC_TIMEOUT,
        )
        .await
    }

    pub async fn prepare_call_hierarchy(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<CallHierarchyItem>, Error> {
        let result = self
            .request(
                "textDocument/prepareCallHierarchy",
                text_document_position(uri, line, character),
                CALL_HIERARCHY_TIMEOUT,
            )
            .await?;
        if is_absent(&result) {
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
            .request(
                "callHierarchy/incomingCalls",
                json!({ "item": item }),
                CALL_HIERARCHY_TIMEOUT,
            )
            .await?;
        if is_absent(&result) {
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
            .request(
                "callHierarchy/outgoingCalls",
                json!({ "item": item }),
                CALL_HIERARCHY_TIMEOUT,
            )
            .await?;
        if is_absent(&result) {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| Error::Transport(format!("failed to decode outgoing calls: {e}")))
    }

    /// `null` means "no tokens for this document"; not an error.
    pub async fn semantic_tokens(&self, uri: &str) -> Result<Option<Value>, Error> {
        let result = self
            .request(
                "textDocument/semanticTokens",
                json!({ "textDocument": { "uri": uri } }),
                SEMANTIC_TOKENS_TIMEOUT,
            )
            .await?;
        Ok((!is_absent(&result)).then_some(result))
    }

    pub async fn semantic_tokens_range(
        &self,
        uri: &str,
        range: Range,
    ) -> Result<Option<Value>, Error> {
        let params = json!({
            "textDocument": { "uri": uri },
            "range": range,
        });
        let result = self
            .request(
                "textDocument/semanticTokens/range",
                params,
                SEMANTIC_TOKENS_TIMEOUT,
            )
            .await?;
        Ok((!is_absent(&result)).then_some(result))
    }
}

pub(crate) fn decode_locations_or_links(result: Value) -> Result<Vec<LocationOrLink>, Error> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    // A bare Location object is also legal.
    let array = match result {
        Value::Array(items) => items,
        other => vec![other],
    };
    serde_json::from_value(Value::Array(array))
        .map_err(|e| Error::Transport(format!("failed to decode definition response: {e}")))
}

pub(crate) fn decode_document_symbols(result: Value) -> Result<Vec<DocumentSymbol>, Error> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    let Value::Array(items) = result else {
        return Err(Error::Transport(
            "documentSymbol response is not an array".into(),
        ));
    };
    if items.is_empty() {
        return Ok(Vec::new());
    }

    // DocumentSymbol is detected by the presence of selectionRange.
    let hierarchical = items[0].get("selectionRange").is_some();
    if hierarchical {
        return serde_json::from_value(Value::Array(items))
            .map_err(|e| Error::Transport(format!("failed to decode DocumentSymbol[]: {e}")));
    }

    let infos: Vec<SymbolInformation> = serde_json::from_value(Value::Array(items))
        .map_err(|e| Error::Transport(format!("failed to decode SymbolInformation[]: {e}")))?;
    Ok(infos
        .into_iter()
        .map(|info| DocumentSymbol {
            name: info.name,
            kind: info.kind,
            range: info.location.range.clone(),
            // SymbolInformation is flat; the location range is the best
            // selection range available.
            selection_range: info.location.range,
            children: Vec::new(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_definition_accepts_single_location_object() {
        let raw = json!({
            "uri": "file:///m.bsl",
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 5 } }
        });
        let out = decode_locations_or_links(raw).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], LocationOrLink::Location(_)));
    }

    #[test]
    fn decode_definition_null_is_empty() {
        assert!(decode_locations_or_links(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn decode_document_symbols_hierarchical() {
        let raw = json!([{
            "name": "Module",
            "kind": 2,
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 100, "character": 0 } },
            "selectionRange": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 6 } },
            "children": [{
                "name": "DoWork",
                "kind": 12,
                "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 10, "character": 0 } },
                "selectionRange": { "start": { "line": 2, "character": 10 }, "end": { "line": 2, "character": 16 } }
            }]
        }]);
        let out = decode_document_symbols(raw).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].children.len(), 1);
        assert_eq!(out[0].children[0].name, "DoWork");
    }

    #[test]
    fn decode_document_symbols_lifts_symbol_information() {
        let raw = json!([{
            "name": "DoWork",
            "kind": 12,
            "location": {
                "uri": "file:///m.bsl",
                "range": { "start": { "line": 2, "character": 0 }, "end": { "line": 10, "character": 0 } }
            }
        }]);
        let out = decode_document_symbols(raw).unwrap();
        assert_eq!(out.len(), 1);
        // Lifted with range = selectionRange.
        assert_eq!(out[0].range, out[0].selection_range);
        assert!(out[0].children.is_empty());
    }

    #[test]
    fn decode_document_symbols_rejects_non_array() {
        assert!(decode_document_symbols(json!({"not": "an array"})).is_err());
    }
}
