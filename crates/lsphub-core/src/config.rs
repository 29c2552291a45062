use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;

/// Transport used to reach a language server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Tcp,
    WebSocket,
    Session,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Stdio => "stdio",
            TransportMode::Tcp => "tcp",
            TransportMode::WebSocket => "websocket",
            TransportMode::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub max_restart_attempts: Option<u32>,
    #[serde(default)]
    pub restart_delay_ms: Option<u64>,
}

impl GlobalConfig {
    pub fn max_restart_attempts(&self) -> u32 {
        self.max_restart_attempts.unwrap_or(5)
    }

    pub fn restart_delay_ms(&self) -> u64 {
        self.restart_delay_ms.unwrap_or(2000)
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Command to start the server (stdio mode).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Logical languages served, e.g. `["bsl"]`.
    #[serde(default)]
    pub languages: Vec<String>,
    /// File extensions (without the leading dot) routed to this server.
    #[serde(default)]
    pub filetypes: Vec<String>,
    /// Opaque `initializationOptions` for the `initialize` request.
    #[serde(default)]
    pub initialization_options: Option<JsonValue>,
    /// "stdio" (default), "tcp", "websocket" or "session".
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl ServerConfig {
    pub fn mode(&self) -> Result<TransportMode, Error> {
        match self.mode.as_deref().map(str::trim).unwrap_or("") {
            "" | "stdio" => Ok(TransportMode::Stdio),
            "tcp" => Ok(TransportMode::Tcp),
            "websocket" => Ok(TransportMode::WebSocket),
            "session" => Ok(TransportMode::Session),
            other => Err(Error::Config(format!("unknown transport mode: {other}"))),
        }
    }

    pub fn is_session_mode(&self) -> bool {
        matches!(self.mode(), Ok(TransportMode::Session))
    }

    pub fn validate(&self, server: &str) -> Result<(), Error> {
        let mode = self.mode()?;
        match mode {
            TransportMode::Stdio => {
                if self.command.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(Error::Config(format!(
                        "server {server}: stdio mode requires a command"
                    )));
                }
            }
            TransportMode::Tcp | TransportMode::WebSocket | TransportMode::Session => {
                if self.host.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(Error::Config(format!(
                        "server {server}: {} mode requires a host",
                        mode.as_str()
                    )));
                }
                if self.port.unwrap_or(0) < 1 {
                    return Err(Error::Config(format!(
                        "server {server}: {} mode requires port >= 1",
                        mode.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Complete bridge configuration: the server table plus language routing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub language_servers: HashMap<String, ServerConfig>,
    /// ServerKey -> [LanguageKey].
    #[serde(default)]
    pub language_server_map: HashMap<String, Vec<String>>,
    /// File extension -> LanguageKey.
    #[serde(default)]
    pub extension_language_map: HashMap<String, String>,
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("failed to read config {path:?}: {e}")))?;
        let ext = path.extension().and_then(OsStr::to_str).unwrap_or("");

        let config: HubConfig = if ext.eq_ignore_ascii_case("toml") {
            let s = String::from_utf8(bytes)
                .map_err(|_| Error::Config("config file is not valid UTF-8".into()))?;
            toml::from_str(&s).map_err(|e| Error::Config(format!("invalid TOML config: {e}")))?
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Config(format!("invalid JSON config: {e}")))?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (server, cfg) in &self.language_servers {
            cfg.validate(server)?;
        }
        for server in self.language_server_map.keys() {
            if !self.language_servers.contains_key(server) {
                return Err(Error::Config(format!(
                    "language_server_map references unknown server {server}"
                )));
            }
        }
        Ok(())
    }

    /// Reverse lookup: which configured server handles this language.
    /// `language_server_map` wins; per-server `languages` is the fallback.
    pub fn server_for_language(&self, language: &str) -> Option<&str> {
        for (server, langs) in &self.language_server_map {
            if langs.iter().any(|l| l == language) {
                return Some(server.as_str());
            }
        }
        self.language_servers
            .iter()
            .find(|(_, cfg)| cfg.languages.iter().any(|l| l == language))
            .map(|(server, _)| server.as_str())
    }

    pub fn languages_for_server(&self, server: &str) -> Vec<String> {
        if let Some(langs) = self.language_server_map.get(server) {
            return langs.clone();
        }
        self.language_servers
            .get(server)
            .map(|cfg| cfg.languages.clone())
            .unwrap_or_default()
    }

    pub fn language_for_extension(&self, ext: &str) -> Option<&str> {
        let ext = ext.trim_start_matches('.');
        self.extension_language_map
            .iter()
            .find(|(k, _)| k.trim_start_matches('.').eq_ignore_ascii_case(ext))
            .map(|(_, v)| v.as_str())
    }

    /// Extensions (lowercased, dot-free) for all languages a server covers.
    pub fn extensions_for_server(&self, server: &str) -> Vec<String> {
        let Some(cfg) = self.language_servers.get(server) else {
            return Vec::new();
        };
        cfg.filetypes
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

/// Mutates loaded config based on environment variables, so runtime
/// parameters (e.g. Java heap) can be tuned from the MCP host side.
///
/// - `${VAR}` placeholders in args are expanded; unset vars keep the
///   placeholder.
/// - `MCP_LSP_JAVA_XMX` overrides `-Xmx` for any `java` command;
///   `MCP_LSP_BSL_JAVA_XMX` takes precedence for the `bsl-language-server`
///   entry.
pub fn apply_env_overrides(config: &mut HubConfig) {
    let bsl_xmx = std::env::var("MCP_LSP_BSL_JAVA_XMX").unwrap_or_default();
    let global_xmx = std::env::var("MCP_LSP_JAVA_XMX").unwrap_or_default();

    for (server, cfg) in config.language_servers.iter_mut() {
        cfg.args = expand_env_vars_in_args(&cfg.args, |key| std::env::var(key).ok());

        if cfg.command.as_deref() == Some("java") {
            let xmx = if server == "bsl-language-server" && !bsl_xmx.trim().is_empty() {
                bsl_xmx.as_str()
            } else {
                global_xmx.as_str()
            };
            if !xmx.trim().is_empty() {
                cfg.args = set_java_xmx(&cfg.args, xmx);
            }
        }
    }
}

/// Replaces `${VAR}` placeholders using `lookup`; unresolved placeholders
/// are left unchanged.
pub fn expand_env_vars_in_args<F>(args: &[String], lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    args.iter()
        .map(|arg| {
            let mut out = String::with_capacity(arg.len());
            let mut rest = arg.as_str();
            while let Some(start) = rest.find("${") {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                match after.find('}') {
                    Some(end) => {
                        let key = &after[..end];
                        match lookup(key) {
                            Some(v) => out.push_str(&v),
                            None => {
                                out.push_str("${");
                                out.push_str(key);
                                out.push('}');
                            }
                        }
                        rest = &after[end + 1..];
                    }
                    None => {
                        out.push_str(&rest[start..]);
                        rest = "";
                    }
                }
            }
            out.push_str(rest);
            out
        })
        .collect()
}

/// Replaces any existing `-Xmx...` and inserts the override before `-jar`
/// (JVM options must come before `-jar`), otherwise prepends it.
pub fn set_java_xmx(args: &[String], xmx: &str) -> Vec<String> {
    let xmx = xmx.trim();
    if xmx.is_empty() {
        return args.to_vec();
    }
    let xmx = if xmx.starts_with("-Xmx") {
        xmx.to_string()
    } else {
        format!("-Xmx{xmx}")
    };

    let clean: Vec<String> = args
        .iter()
        .filter(|a| !a.starts_with("-Xmx"))
        .cloned()
        .collect();

    if let Some(jar_pos) = clean.iter().position(|a| a == "-jar") {
        let mut out = clean[..jar_pos].to_vec();
        out.push(xmx);
        out.extend_from_slice(&clean[jar_pos..]);
        return out;
    }

    let mut out = vec![xmx];
    out.extend(clean);
    out
}
