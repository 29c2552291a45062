use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use lsphub_lsp::IndexingState;
use tracing::{info, warn};

use crate::Bridge;
use crate::auto_connect::parse_auto_connect_languages;

const WARMUP_THROTTLE: Duration = Duration::from_secs(10);
const MAX_WARMUP_FILES: usize = 5;
const SETTLE_DEADLINE: Duration = Duration::from_secs(2 * 60);
const SETTLE_QUIET: Duration = Duration::from_secs(2);
const SETTLE_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub(crate) struct WarmupState {
    pub running: bool,
    pub done: bool,
    pub error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub last_attempt: Option<Instant>,
}

/// Value-copied warm-up state for the readiness gate.
#[derive(Debug, Clone, Default)]
pub struct WarmupStatus {
    pub running: bool,
    pub done: bool,
    pub error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl Bridge {
    pub fn warmup_status(&self) -> WarmupStatus {
        let state = self.warmup.lock().expect("warmup lock poisoned");
        WarmupStatus {
            running: state.running,
            done: state.done,
            error: state.error.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    /// Triggers best-effort warm-up (pre-touching files so the server
    /// builds its index before the first user-visible call). Non-blocking,
    /// idempotent, throttled.
    pub fn start_warmup(&self) {
        let Some(bridge) = self.strong_self() else {
            return;
        };
        {
            let mut state = self.warmup.lock().expect("warmup lock poisoned");
            let now = Instant::now();
            if state
                .last_attempt
                .is_some_and(|t| now.duration_since(t) < WARMUP_THROTTLE)
            {
                return;
            }
            state.last_attempt = Some(now);

            if state.done || state.running {
                return;
            }
            state.running = true;
            state.started_at.get_or_insert(SystemTime::now());
            state.error = None;
        }

        tokio::spawn(async move {
            bridge.run_warmup().await;
        });
    }

    /// Blocking warm-up for docker-exec style invocations where the process
    /// may not live long enough for a background task.
    pub async fn sync_warmup(&self) {
        {
            let mut state = self.warmup.lock().expect("warmup lock poisoned");
            if state.done || state.running {
                return;
            }
            state.running = true;
            state.last_attempt = Some(Instant::now());
            state.started_at.get_or_insert(SystemTime::now());
            state.error = None;
        }
        self.run_warmup().await;
    }

    fn finish_warmup(&self, error: Option<String>) {
        let mut state = self.warmup.lock().expect("warmup lock poisoned");
        state.running = false;
        state.finished_at = Some(SystemTime::now());
        match error {
            Some(message) => {
                state.error = Some(message);
                state.done = false;
            }
            None => {
                state.error = None;
                state.done = true;
            }
        }
    }

    async fn run_warmup(&self) {
        let languages = parse_auto_connect_languages(self.config());

        let Some(workspace_root) = self.allowed_directories().first().cloned() else {
            self.finish_warmup(Some("warmup: no allowed directories configured".into()));
            return;
        };

        info!("warm-up: starting in {workspace_root} for {languages:?}");

        // Connect clients best-effort so the warm-up work has someone to
        // talk to; a partially failing set still warms the rest.
        let mut extensions = Vec::new();
        for language in &languages {
            match self.get_client_for_language(language).await {
                Ok(_) => {
                    if let Some(server) = self.config().server_for_language(language) {
                        extensions.extend(self.config().extensions_for_server(server));
                    }
                }
                Err(err) => warn!("warm-up: failed to connect client for {language}: {err}"),
            }
        }
        if extensions.is_empty() {
            extensions = self
                .config()
                .extension_language_map
                .keys()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect();
        }

        let files = list_files_by_extension(Path::new(&workspace_root), &extensions, MAX_WARMUP_FILES);
        if files.is_empty() {
            warn!("warm-up: no matching files under {workspace_root}");
            self.finish_warmup(None);
            return;
        }

        // Touch a bounded set of documents to force parse/symbol tables.
        let mut symbol_query = String::from("init");
        for file in &files {
            if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                symbol_query = stem.to_string();
            }
            let path = file.to_string_lossy();
            if let Err(err) = self.get_document_symbols(&path).await {
                warn!("warm-up: documentSymbol failed for {path}: {err}");
            }
        }

        // One cheap workspace-wide query to encourage cross-file indexing.
        for language in &languages {
            let _ = self.search_workspace_symbols(language, &symbol_query).await;
        }

        self.wait_for_progress_settle().await;

        info!("warm-up: finished");
        self.finish_warmup(None);
    }

    /// Waits until server progress has been silent for a short grace window
    /// (or the deadline passes). Indexing may continue afterwards; the
    /// readiness gate treats that as busy, not as unready.
    async fn wait_for_progress_settle(&self) {
        let deadline = Instant::now() + SETTLE_DEADLINE;
        let mut quiet_since: Option<Instant> = None;

        while Instant::now() < deadline {
            let clients = self.list_clients().await;
            if clients.is_empty() {
                break;
            }

            let mut any_active = false;
            for client in clients.values() {
                if client.has_active_progress() {
                    any_active = true;
                    break;
                }
                if let Some(indexing) = client.indexing_status().await
                    && indexing.state == IndexingState::Indexing
                {
                    any_active = true;
                    break;
                }
            }

            if any_active {
                quiet_since = None;
            } else {
                let since = *quiet_since.get_or_insert_with(Instant::now);
                if since.elapsed() > SETTLE_QUIET {
                    break;
                }
            }

            tokio::time::sleep(SETTLE_TICK).await;
        }
    }
}

/// Bounded breadth-first scan for files whose extension matches.
fn list_files_by_extension(root: &Path, extensions: &[String], max_files: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        if found.len() >= max_files {
            break;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                queue.push_back(path);
                continue;
            }
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| {
                    extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
                });
            if matches {
                found.push(path);
                if found.len() >= max_files {
                    break;
                }
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("lsphub-warmup-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn file_scan_is_bounded_and_filtered() {
        let root = temp_root("scan");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        for i in 0..10 {
            std::fs::write(root.join(format!("m{i}.bsl")), "").unwrap();
        }
        std::fs::write(root.join("readme.md"), "").unwrap();
        std::fs::write(root.join("sub/extra.os"), "").unwrap();

        let files = list_files_by_extension(&root, &["bsl".into(), "os".into()], 5);
        assert_eq!(files.len(), 5);
        assert!(files.iter().all(|f| {
            let ext = f.extension().unwrap().to_str().unwrap();
            ext == "bsl" || ext == "os"
        }));
    }

    #[tokio::test]
    async fn warmup_without_allowed_directories_fails_fast() {
        let bridge = crate::Bridge::new(
            lsphub_core::config::HubConfig::default(),
            Vec::new(),
        )
        .unwrap();

        bridge.sync_warmup().await;
        let status = bridge.warmup_status();
        assert!(!status.running);
        assert!(!status.done);
        assert!(status.error.as_deref().unwrap_or("").contains("allowed"));
    }

    #[tokio::test]
    async fn warmup_is_throttled_and_idempotent() {
        let root = temp_root("idempotent");
        let bridge = crate::Bridge::new(
            lsphub_core::config::HubConfig::default(),
            vec![root.to_string_lossy().to_string()],
        )
        .unwrap();

        // No configured languages and no matching files: warm-up completes
        // with nothing to do.
        bridge.sync_warmup().await;
        let status = bridge.warmup_status();
        assert!(status.done);
        assert!(status.error.is_none());

        // A second warm-up is a no-op once done.
        bridge.start_warmup();
        assert!(bridge.warmup_status().done);
    }
}
