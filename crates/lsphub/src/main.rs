use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lsphub_core::PathMapper;
use lsphub_core::config::{HubConfig, apply_env_overrides};
use lsphub_lsp::{SessionManager, SessionManagerOptions};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lsphub")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the persistent LSP session daemon (one long-lived server,
    /// newline-delimited JSON-RPC API over TCP)
    SessionManager {
        /// TCP port to listen on
        #[arg(long, default_value_t = 9999)]
        port: u16,
        /// LSP server command to run
        #[arg(long)]
        command: String,
        /// Workspace directory for the LSP session
        #[arg(long, default_value = "/projects")]
        workspace: String,
        /// Arguments passed to the LSP server
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Print resolved configuration and environment diagnostics
    Doctor {
        /// Path to the lsphub config file (.toml or .json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::SessionManager {
            port,
            command,
            workspace,
            args,
        } => run_session_manager(port, command, workspace, args).await,
        Command::Doctor { config } => run_doctor(config.as_deref()),
    }
}

async fn run_session_manager(
    port: u16,
    command: String,
    workspace: String,
    args: Vec<String>,
) -> Result<()> {
    if command.trim().is_empty() {
        bail!("--command is required");
    }

    info!("starting LSP session manager on port {port}");
    info!("workspace: {workspace}");
    info!("LSP command: {command} {args:?}");

    let manager = SessionManager::start(SessionManagerOptions {
        command,
        args,
        workspace_dir: workspace,
    })
    .await
    .context("failed to start LSP session")?;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to listen on port {port}"))?;
    info!("API listening on port {port}");

    let serving = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.serve(listener).await })
    };

    wait_for_shutdown_signal().await;
    info!("shutting down");
    serving.abort();
    manager.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn run_doctor(config_path: Option<&Path>) -> Result<()> {
    let resolved_path = match config_path {
        Some(p) => Some(p.to_path_buf()),
        None => ["lsphub.toml", "lsphub.json"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists()),
    };

    let mut config = match &resolved_path {
        Some(path) => {
            println!("config_source: {}", path.display());
            HubConfig::load(path)?
        }
        None => {
            println!("config_source: <none>");
            HubConfig::default()
        }
    };
    apply_env_overrides(&mut config);

    println!("servers.count: {}", config.language_servers.len());
    let mut servers: Vec<&String> = config.language_servers.keys().collect();
    servers.sort();
    for name in servers {
        let server = &config.language_servers[name];
        let mode = server
            .mode()
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|e| format!("<invalid: {e}>"));
        println!("server[{name}].mode: {mode}");
        println!("server[{name}].command: {:?}", server.command);
        println!("server[{name}].args: {:?}", server.args);
        println!(
            "server[{name}].languages: {:?}",
            config.languages_for_server(name)
        );
        println!("server[{name}].filetypes: {:?}", server.filetypes);
        if let (Some(host), Some(port)) = (&server.host, server.port) {
            println!("server[{name}].endpoint: {host}:{port}");
        }
        if let Err(err) = server.validate(name) {
            eprintln!("doctor_error: {err}");
        }
    }

    let mapper = PathMapper::from_env()?;
    if mapper.is_enabled() {
        println!(
            "path_mapper: {} -> {}",
            mapper.host_root(),
            mapper.container_root()
        );
    } else {
        println!("path_mapper: <pass-through>");
    }

    println!(
        "auto_connect_languages: {}",
        std::env::var("MCP_AUTO_CONNECT_LANGUAGES").unwrap_or_else(|_| "<default>".into())
    );

    config.validate()?;
    Ok(())
}
