use std::time::{Duration, Instant};

use lsphub_core::Error;
use lsphub_core::config::HubConfig;
use tracing::{info, warn};

use crate::Bridge;

const AUTO_CONNECT_THROTTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub(crate) struct AutoConnectState {
    pub started_at: Option<Instant>,
    pub last_attempt: Option<Instant>,
}

/// Languages to connect on startup: `MCP_AUTO_CONNECT_LANGUAGES`
/// (comma-separated) or the first configured language.
pub(crate) fn parse_auto_connect_languages(config: &HubConfig) -> Vec<String> {
    let raw = std::env::var("MCP_AUTO_CONNECT_LANGUAGES").unwrap_or_default();
    let from_env: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if !from_env.is_empty() {
        return from_env;
    }

    let mut configured: Vec<String> = config
        .language_server_map
        .values()
        .flatten()
        .chain(config.language_servers.values().flat_map(|c| &c.languages))
        .cloned()
        .collect();
    configured.sort();
    configured.dedup();
    configured.truncate(1);
    configured
}

impl Bridge {
    /// Best-effort background connection of the default language clients.
    /// Non-blocking, safe to call repeatedly; throttled so failed attempts
    /// can retry without hammering the servers.
    pub fn start_auto_connect(&self) {
        let Some(bridge) = self.strong_self() else {
            return;
        };
        {
            let mut state = self.auto_connect.lock().expect("auto-connect lock poisoned");
            let now = Instant::now();
            if state
                .last_attempt
                .is_some_and(|t| now.duration_since(t) < AUTO_CONNECT_THROTTLE)
            {
                return;
            }
            state.last_attempt = Some(now);
            state.started_at.get_or_insert(now);
        }

        let languages = parse_auto_connect_languages(self.config());
        info!("auto-connect: starting language clients {languages:?}");

        tokio::spawn(async move {
            for language in &languages {
                match bridge.get_client_for_language(language).await {
                    Ok(_) => info!("auto-connect: connected language client {language}"),
                    Err(err) => {
                        warn!("auto-connect: failed to connect language client {language}: {err}")
                    }
                }
            }
            // Warm-up follows best-effort connect.
            bridge.start_warmup();
        });
    }

    /// Blocking variant for environments where stdin closes immediately
    /// after the request is sent (docker exec). Does not trigger warm-up;
    /// the readiness gate starts it in the background.
    pub async fn sync_auto_connect(&self) -> Result<(), Error> {
        {
            let mut state = self.auto_connect.lock().expect("auto-connect lock poisoned");
            let now = Instant::now();
            state.last_attempt = Some(now);
            state.started_at.get_or_insert(now);
        }

        let languages = parse_auto_connect_languages(self.config());
        info!("sync auto-connect: connecting language clients {languages:?}");

        let mut last_err = None;
        for language in &languages {
            if let Err(err) = self.get_client_for_language(language).await {
                warn!("sync auto-connect: failed to connect language client {language}: {err}");
                last_err = Some(err);
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsphub_core::config::ServerConfig;

    #[test]
    fn default_language_comes_from_config() {
        let mut config = HubConfig::default();
        config.language_servers.insert(
            "gopls".into(),
            ServerConfig {
                command: Some("gopls".into()),
                languages: vec!["go".into()],
                ..ServerConfig::default()
            },
        );

        // Only meaningful when the env override is absent; CI may set it.
        if std::env::var("MCP_AUTO_CONNECT_LANGUAGES").is_err() {
            assert_eq!(parse_auto_connect_languages(&config), vec!["go".to_string()]);
        }
    }

    #[test]
    fn no_configured_languages_yields_empty_list() {
        if std::env::var("MCP_AUTO_CONNECT_LANGUAGES").is_err() {
            assert!(parse_auto_connect_languages(&HubConfig::default()).is_empty());
        }
    }
}
