mod auto_connect;
mod call_graph;
mod status;
mod warmup;

pub use call_graph::{
    CallGraphNode, CallGraphOptions, CallGraphResult, CallHierarchyProvider, EntryPoints,
    build_call_graph,
};
pub use status::{
    ClientStatusView, IndexingProgress, LspActivity, LspStatus, LspStatusResponse, build_status,
    check_ready,
};
pub use warmup::WarmupStatus;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use lsphub_core::config::{HubConfig, TransportMode};
use lsphub_core::uri::{normalize_uri, uri_to_file_path};
use lsphub_core::{Error, PathMapper, is_within_allowed_directory};
use lsphub_lsp::{
    CallHierarchyIncomingCall, CallHierarchyItem, CallHierarchyOutgoingCall, ClientMetrics,
    ConnectOptions, DocumentSymbol, LanguageClient, Location, LocationOrLink, ProgressSnapshot,
    Range, SessionAdapter,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::auto_connect::AutoConnectState;
use crate::warmup::WarmupState;

/// One connected language server, behind either a directly-owned transport
/// or the session daemon.
#[derive(Clone)]
pub enum BridgeClient {
    Direct(Arc<LanguageClient>),
    Session(Arc<SessionAdapter>),
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeClient::Direct(_) => f.write_str("BridgeClient::Direct"),
            BridgeClient::Session(_) => f.write_str("BridgeClient::Session"),
        }
    }
}

impl BridgeClient {
    pub fn is_session(&self) -> bool {
        matches!(self, BridgeClient::Session(_))
    }

    pub async fn is_connected(&self) -> bool {
        match self {
            BridgeClient::Direct(c) => c.is_connected(),
            BridgeClient::Session(s) => s.is_connected().await,
        }
    }

    pub async fn metrics(&self) -> ClientMetrics {
        match self {
            BridgeClient::Direct(c) => c.metrics(),
            BridgeClient::Session(s) => s.metrics().await,
        }
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        match self {
            BridgeClient::Direct(c) => c.progress_snapshot(),
            // The daemon tracks progress on its side of the session.
            BridgeClient::Session(_) => ProgressSnapshot::default(),
        }
    }

    pub fn has_active_progress(&self) -> bool {
        match self {
            BridgeClient::Direct(c) => c.has_active_progress(),
            BridgeClient::Session(_) => false,
        }
    }

    pub async fn indexing_status(&self) -> Option<lsphub_lsp::IndexingStatus> {
        match self {
            BridgeClient::Direct(_) => None,
            BridgeClient::Session(s) => s.indexing_status().await,
        }
    }

    pub async fn document_symbols(&self, uri: &str) -> Result<Vec<DocumentSymbol>, Error> {
        match self {
            BridgeClient::Direct(c) => c.document_symbols(uri).await,
            BridgeClient::Session(s) => s.document_symbols(uri).await,
        }
    }

    pub async fn workspace_symbols(&self, query: &str) -> Result<Value, Error> {
        match self {
            BridgeClient::Direct(c) => c.workspace_symbols(query).await,
            BridgeClient::Session(s) => s.workspace_symbols(query).await,
        }
    }

    pub async fn hover(&self, uri: &str, line: u32, character: u32) -> Result<Option<Value>, Error> {
        match self {
            BridgeClient::Direct(c) => c.hover(uri, line, character).await,
            BridgeClient::Session(s) => s.hover(uri, line, character).await,
        }
    }

    pub async fn definition(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<LocationOrLink>, Error> {
        match self {
            BridgeClient::Direct(c) => c.definition(uri, line, character).await,
            BridgeClient::Session(s) => s.definition(uri, line, character).await,
        }
    }

    pub async fn references(
        &self,
        uri: &str,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Vec<Location>, Error> {
        match self {
            BridgeClient::Direct(c) => {
                c.references(uri, line, character, include_declaration).await
            }
            BridgeClient::Session(s) => {
                s.references(uri, line, character, include_declaration).await
            }
        }
    }

    pub async fn rename(
        &self,
        uri: &str,
        line: u32,
        character: u32,
        new_name: &str,
    ) -> Result<Value, Error> {
        match self {
            BridgeClient::Direct(c) => c.rename(uri, line, character, new_name).await,
            BridgeClient::Session(s) => s.rename(uri, line, character, new_name).await,
        }
    }

    pub async fn did_open(&self, uri: &str, language_id: &str, text: &str) -> Result<(), Error> {
        match self {
            BridgeClient::Direct(c) => c.did_open(uri, language_id, text, 1).await,
            BridgeClient::Session(s) => s.did_open(uri, language_id, text).await.map(|_| ()),
        }
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), Error> {
        match self {
            BridgeClient::Direct(c) => c.did_close(uri).await,
            BridgeClient::Session(s) => s.did_close(uri).await.map(|_| ()),
        }
    }

    pub async fn implementation(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, Error> {
        match self {
            BridgeClient::Direct(c) => c.implementation(uri, line, character).await,
            BridgeClient::Session(s) => s.implementation(uri, line, character).await,
        }
    }

    pub async fn code_actions(&self, uri: &str, range: Range) -> Result<Value, Error> {
        match self {
            BridgeClient::Direct(c) => c.code_actions(uri, range).await,
            BridgeClient::Session(s) => s.code_actions(uri, range).await,
        }
    }

    pub async fn formatting(
        &self,
        uri: &str,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<Value, Error> {
        match self {
            BridgeClient::Direct(c) => c.formatting(uri, tab_size, insert_spaces).await,
            BridgeClient::Session(s) => s.formatting(uri, tab_size, insert_spaces).await,
        }
    }

    pub async fn prepare_rename(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>, Error> {
        match self {
            BridgeClient::Direct(c) => c.prepare_rename(uri, line, character).await,
            BridgeClient::Session(s) => s.prepare_rename().map(Some),
        }
    }

    pub async fn document_diagnostic(&self, uri: &str) -> Result<Value, Error> {
        match self {
            BridgeClient::Direct(c) => c.document_diagnostic(uri, None, None).await,
            BridgeClient::Session(s) => s.document_diagnostic(uri).await,
        }
    }

    pub async fn workspace_diagnostic(&self) -> Result<Value, Error> {
        match self {
            BridgeClient::Direct(c) => c.workspace_diagnostic(None).await,
            BridgeClient::Session(s) => s.workspace_diagnostic().await,
        }
    }

    pub async fn prepare_call_hierarchy(
        &self,
        uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<CallHierarchyItem>, Error> {
        match self {
            BridgeClient::Direct(c) => c.prepare_call_hierarchy(uri, line, character).await,
            BridgeClient::Session(s) => s.prepare_call_hierarchy(uri, line, character).await,
        }
    }

    pub async fn incoming_calls(
        &self,
        item: &CallHierarchyItem,
    ) -> Result<Vec<CallHierarchyIncomingCall>, Error> {
        match self {
            BridgeClient::Direct(c) => c.incoming_calls(item).await,
            BridgeClient::Session(s) => s.incoming_calls(item).await,
        }
    }

    pub async fn outgoing_calls(
        &self,
        item: &CallHierarchyItem,
    ) -> Result<Vec<CallHierarchyOutgoingCall>, Error> {
        match self {
            BridgeClient::Direct(c) => c.outgoing_calls(item).await,
            BridgeClient::Session(s) => s.outgoing_calls(item).await,
        }
    }
}

/// The multiplexer between the tool layer and the connected language
/// servers. Every URI passing through is normalized and host/container
/// mapped; every filesystem path is checked against the allowlist.
pub struct Bridge {
    config: HubConfig,
    allowed_directories: Vec<String>,
    path_mapper: PathMapper,
    clients: RwLock<HashMap<String, BridgeClient>>,
    open_docs: StdMutex<HashMap<String, HashSet<String>>>,
    pub(crate) auto_connect: StdMutex<AutoConnectState>,
    pub(crate) warmup: StdMutex<WarmupState>,
    // Handle to ourselves for background tasks spawned from &self methods.
    weak_self: Weak<Bridge>,
}

impl Bridge {
    pub fn new(config: HubConfig, allowed_directories: Vec<String>) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let path_mapper = PathMapper::from_env()?;
        Ok(Self::assemble(config, allowed_directories, path_mapper))
    }

    fn assemble(
        config: HubConfig,
        allowed_directories: Vec<String>,
        path_mapper: PathMapper,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            allowed_directories,
            path_mapper,
            clients: RwLock::new(HashMap::new()),
            open_docs: StdMutex::new(HashMap::new()),
            auto_connect: StdMutex::new(AutoConnectState::default()),
            warmup: StdMutex::new(WarmupState::default()),
            weak_self: weak.clone(),
        })
    }

    pub(crate) fn strong_self(&self) -> Option<Arc<Bridge>> {
        self.weak_self.upgrade()
    }

    #[cfg(test)]
    pub(crate) fn new_with_mapper(
        config: HubConfig,
        allowed_directories: Vec<String>,
        path_mapper: PathMapper,
    ) -> Arc<Self> {
        Self::assemble(config, allowed_directories, path_mapper)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn allowed_directories(&self) -> &[String] {
        &self.allowed_directories
    }

    pub fn path_mapper(&self) -> &PathMapper {
        &self.path_mapper
    }

    /// Normalizes any URI or path into the form the language server expects:
    /// scheme-preserving normalization plus host→container mapping.
    pub fn normalize_uri_for_lsp(&self, uri: &str) -> Result<String, Error> {
        let normalized = normalize_uri(uri);
        if self.path_mapper.is_enabled() {
            return self.path_mapper.normalize_uri(&normalized);
        }
        Ok(normalized)
    }

    /// Rejects paths outside every allowed directory.
    pub fn validate_path(&self, path: &str) -> Result<(), Error> {
        if self.allowed_directories.is_empty() {
            return Ok(());
        }
        if self
            .allowed_directories
            .iter()
            .any(|base| is_within_allowed_directory(path, base))
        {
            return Ok(());
        }
        Err(Error::Path(format!(
            "path is outside allowed directories: {path}"
        )))
    }

    /// Snapshot of connected clients keyed by server name.
    pub async fn list_clients(&self) -> HashMap<String, BridgeClient> {
        self.clients.read().await.clone()
    }

    pub async fn all_clients_in_session_mode(&self) -> bool {
        let clients = self.clients.read().await;
        !clients.is_empty() && clients.values().all(|c| c.is_session())
    }

    /// Inserts a pre-built client; used by tests to stage fakes.
    pub async fn insert_client(&self, server: &str, client: BridgeClient) {
        self.clients.write().await.insert(server.to_string(), client);
    }

    /// Returns the client serving `language`, establishing the connection
    /// on first use.
    pub async fn get_client_for_language(&self, language: &str) -> Result<BridgeClient, Error> {
        let server = self
            .config
            .server_for_language(language)
            .ok_or_else(|| {
                Error::Config(format!("no language server configured for {language}"))
            })?
            .to_string();
        self.get_client_for_server(&server).await
    }

    pub async fn get_client_for_server(&self, server: &str) -> Result<BridgeClient, Error> {
        if let Some(existing) = self.clients.read().await.get(server) {
            return Ok(existing.clone());
        }

        let client = self.connect_server(server).await?;

        let mut clients = self.clients.write().await;
        if let Some(raced) = clients.get(server) {
            // Another caller connected first; prefer theirs and retire ours.
            let raced = raced.clone();
            drop(clients);
            if let BridgeClient::Direct(spare) = client {
                let _ = spare.shutdown().await;
            }
            return Ok(raced);
        }
        clients.insert(server.to_string(), client.clone());
        Ok(client)
    }

    async fn connect_server(&self, server: &str) -> Result<BridgeClient, Error> {
        let server_config = self
            .config
            .language_servers
            .get(server)
            .ok_or_else(|| Error::Config(format!("unknown language server: {server}")))?;

        let connect_options = ConnectOptions {
            max_attempts: self.config.global.max_restart_attempts(),
            restart_delay: std::time::Duration::from_millis(self.config.global.restart_delay_ms()),
            ..ConnectOptions::default()
        };

        info!("connecting language server {server}");
        match server_config.mode()? {
            TransportMode::Stdio => {
                let command = server_config.command.clone().unwrap_or_default();
                let client = LanguageClient::spawn_stdio(&command, &server_config.args).await?;
                client
                    .initialize(
                        &self.workspace_root_uri()?,
                        server_config.initialization_options.as_ref(),
                    )
                    .await?;
                Ok(BridgeClient::Direct(client))
            }
            TransportMode::Tcp => {
                let client = LanguageClient::connect_tcp(
                    server_config.host.as_deref().unwrap_or_default(),
                    server_config.port.unwrap_or_default(),
                    connect_options,
                )
                .await?;
                client
                    .initialize(
                        &self.workspace_root_uri()?,
                        server_config.initialization_options.as_ref(),
                    )
                    .await?;
                Ok(BridgeClient::Direct(client))
            }
            TransportMode::WebSocket => {
                let client = LanguageClient::connect_websocket(
                    server_config.host.as_deref().unwrap_or_default(),
                    server_config.port.unwrap_or_default(),
                    connect_options,
                )
                .await?;
                client
                    .initialize(
                        &self.workspace_root_uri()?,
                        server_config.initialization_options.as_ref(),
                    )
                    .await?;
                Ok(BridgeClient::Direct(client))
            }
            TransportMode::Session => {
                // The daemon already initialized the underlying session.
                let adapter = Arc::new(SessionAdapter::new(
                    server_config.host.as_deref().unwrap_or_default(),
                    server_config.port.unwrap_or_default(),
                ));
                adapter.connect().await?;
                adapter.initialize().await?;
                Ok(BridgeClient::Session(adapter))
            }
        }
    }

    fn workspace_root_uri(&self) -> Result<String, Error> {
        let root = self
            .allowed_directories
            .first()
            .ok_or_else(|| Error::Config("no allowed directories configured".into()))?;
        lsphub_core::uri::path_to_file_uri(root)
    }

    fn server_for_file(&self, path_or_uri: &str) -> Result<String, Error> {
        let path = uri_to_file_path(path_or_uri);
        let ext = Path::new(&path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let language = self
            .config
            .language_for_extension(ext)
            .ok_or_else(|| Error::Config(format!("no language mapped for extension {ext:?}")))?;
        Ok(self
            .config
            .server_for_language(language)
            .ok_or_else(|| {
                Error::Config(format!("no language server configured for {language}"))
            })?
            .to_string())
    }

    fn language_id_for_file(&self, path_or_uri: &str) -> String {
        let path = uri_to_file_path(path_or_uri);
        Path::new(&path)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| self.config.language_for_extension(ext))
            .unwrap_or("plaintext")
            .to_string()
    }

    /// LSP requires `didOpen` to be observed before requests against the
    /// document, and exactly once per open document. The per-server open
    /// set makes repeat opens no-ops; completion of the notify before the
    /// following request gives the required ordering within one call stack.
    async fn ensure_document_open(
        &self,
        server: &str,
        client: &BridgeClient,
        uri: &str,
    ) -> Result<(), Error> {
        {
            let open = self.open_docs.lock().expect("open docs lock poisoned");
            if open.get(server).is_some_and(|set| set.contains(uri)) {
                return Ok(());
            }
        }

        let local_path = uri_to_file_path(uri);
        self.validate_path(&local_path)?;
        let text = tokio::fs::read_to_string(&local_path)
            .await
            .map_err(|e| Error::Path(format!("failed to read {local_path}: {e}")))?;
        let language_id = self.language_id_for_file(uri);

        client.did_open(uri, &language_id, &text).await?;

        self.open_docs
            .lock()
            .expect("open docs lock poisoned")
            .entry(server.to_string())
            .or_default()
            .insert(uri.to_string());
        Ok(())
    }

    async fn client_for_file(&self, path_or_uri: &str) -> Result<(String, BridgeClient), Error> {
        let server = self.server_for_file(path_or_uri)?;
        let client = self.get_client_for_server(&server).await?;
        Ok((server, client))
    }

    /// Opens the file (if needed) and returns its symbols.
    pub async fn get_document_symbols(
        &self,
        path_or_uri: &str,
    ) -> Result<Vec<DocumentSymbol>, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.document_symbols(&uri).await
    }

    pub async fn search_workspace_symbols(
        &self,
        language: &str,
        query: &str,
    ) -> Result<Value, Error> {
        let client = self.get_client_for_language(language).await?;
        client.workspace_symbols(query).await
    }

    pub async fn hover(
        &self,
        path_or_uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.hover(&uri, line, character).await
    }

    pub async fn definition(
        &self,
        path_or_uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<LocationOrLink>, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.definition(&uri, line, character).await
    }

    pub async fn references(
        &self,
        path_or_uri: &str,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<Vec<Location>, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client
            .references(&uri, line, character, include_declaration)
            .await
    }

    pub async fn rename(
        &self,
        path_or_uri: &str,
        line: u32,
        character: u32,
        new_name: &str,
    ) -> Result<Value, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.rename(&uri, line, character, new_name).await
    }

    pub async fn prepare_rename(
        &self,
        path_or_uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Option<Value>, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.prepare_rename(&uri, line, character).await
    }

    pub async fn implementation(
        &self,
        path_or_uri: &str,
        line: u32,
        character: u32,
    ) -> Result<Vec<Location>, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.implementation(&uri, line, character).await
    }

    pub async fn code_actions(&self, path_or_uri: &str, range: Range) -> Result<Value, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.code_actions(&uri, range).await
    }

    pub async fn formatting(
        &self,
        path_or_uri: &str,
        tab_size: u32,
        insert_spaces: bool,
    ) -> Result<Value, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.formatting(&uri, tab_size, insert_spaces).await
    }

    pub async fn document_diagnostic(&self, path_or_uri: &str) -> Result<Value, Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;
        self.ensure_document_open(&server, &client, &uri).await?;
        client.document_diagnostic(&uri).await
    }

    pub async fn workspace_diagnostic(&self, language: &str) -> Result<Value, Error> {
        let client = self.get_client_for_language(language).await?;
        client.workspace_diagnostic().await
    }

    /// Closes the document on the server and forgets it, so a later request
    /// reopens it with fresh content.
    pub async fn close_document(&self, path_or_uri: &str) -> Result<(), Error> {
        let uri = self.normalize_uri_for_lsp(path_or_uri)?;
        let (server, client) = self.client_for_file(&uri).await?;

        let was_open = {
            let mut open = self.open_docs.lock().expect("open docs lock poisoned");
            open.get_mut(&server).is_some_and(|set| set.remove(&uri))
        };
        if !was_open {
            return Ok(());
        }
        client.did_close(&uri).await
    }
}

/// The call-graph engine reaches the LSP through this seam so tests can
/// drive it with a scripted provider.
impl CallHierarchyProvider for Bridge {
    fn prepare(
        &self,
        uri: String,
        line: u32,
        character: u32,
    ) -> BoxFuture<'_, Result<Vec<CallHierarchyItem>, Error>> {
        Box::pin(async move {
            let uri = self.normalize_uri_for_lsp(&uri)?;
            let (server, client) = self.client_for_file(&uri).await?;
            if let Err(err) = self.ensure_document_open(&server, &client, &uri).await {
                warn!("call graph: failed to open {uri}: {err}");
            }
            client.prepare_call_hierarchy(&uri, line, character).await
        })
    }

    fn incoming(
        &self,
        item: CallHierarchyItem,
    ) -> BoxFuture<'_, Result<Vec<CallHierarchyIncomingCall>, Error>> {
        Box::pin(async move {
            let (_, client) = self.client_for_file(&item.uri).await?;
            client.incoming_calls(&item).await
        })
    }

    fn outgoing(
        &self,
        item: CallHierarchyItem,
    ) -> BoxFuture<'_, Result<Vec<CallHierarchyOutgoingCall>, Error>> {
        Box::pin(async move {
            let (_, client) = self.client_for_file(&item.uri).await?;
            client.outgoing_calls(&item).await
        })
    }
}
