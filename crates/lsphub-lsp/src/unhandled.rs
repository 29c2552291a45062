use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

/// Logging policy for notifications no handler claims. Process-wide, read
/// once from the environment:
///
/// - `MCP_LSP_UNHANDLED_NOTIFICATIONS_LEVEL`: off | debug | info
/// - `MCP_LSP_UNHANDLED_NOTIFICATIONS_WINDOW`: rate window in seconds
/// - `MCP_LSP_UNHANDLED_NOTIFICATIONS_BURST`: messages per method per window
/// - `MCP_LSP_UNHANDLED_NOTIFICATIONS_MAX_PARAM_BYTES`: logged payload cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Level {
    Off,
    Debug,
    Info,
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub level: Level,
    pub window: Duration,
    pub burst_per_key: u32,
    pub max_param_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            level: Level::Debug,
            window: Duration::from_secs(10),
            burst_per_key: 3,
            max_param_bytes: 4096,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    window_start: Option<Instant>,
    emitted: u32,
    suppressed: u64,
    suppress_msg: bool,
}

static CONFIG: OnceLock<Config> = OnceLock::new();
static BUCKETS: OnceLock<Mutex<HashMap<String, Bucket>>> = OnceLock::new();

fn load_config() -> Config {
    let mut cfg = Config::default();

    if let Ok(v) = std::env::var("MCP_LSP_UNHANDLED_NOTIFICATIONS_LEVEL") {
        match v.as_str() {
            "off" => cfg.level = Level::Off,
            "debug" => cfg.level = Level::Debug,
            "info" => cfg.level = Level::Info,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("MCP_LSP_UNHANDLED_NOTIFICATIONS_WINDOW")
        && let Ok(secs) = v.parse::<u64>()
        && secs > 0
    {
        cfg.window = Duration::from_secs(secs);
    }
    if let Ok(v) = std::env::var("MCP_LSP_UNHANDLED_NOTIFICATIONS_BURST")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.burst_per_key = n;
    }
    if let Ok(v) = std::env::var("MCP_LSP_UNHANDLED_NOTIFICATIONS_MAX_PARAM_BYTES")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.max_param_bytes = n;
    }

    cfg
}

/// Logs an unhandled notification, rate-limited per method with a token
/// bucket. Window rollover emits one suppression summary.
pub fn log_unhandled_notification(method: &str, params: Option<&Value>) {
    let cfg = CONFIG.get_or_init(load_config).clone();
    log_with_config(&cfg, method, params, Instant::now());
}

pub(crate) fn log_with_config(cfg: &Config, method: &str, params: Option<&Value>, now: Instant) {
    if cfg.level == Level::Off {
        return;
    }

    let buckets = BUCKETS.get_or_init(|| Mutex::new(HashMap::new()));
    let decision = {
        let mut buckets = buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets.entry(method.to_string()).or_default();
        decide(cfg, bucket, now)
    };

    match decision {
        Decision::Drop => {}
        Decision::SuppressionStarted => emit(
            cfg.level,
            &format!(
                "Unhandled notification flood detected: method={method} burst={} window={:?} (suppressing further)",
                cfg.burst_per_key, cfg.window
            ),
        ),
        Decision::Emit { rollover_summary } => {
            if let Some(suppressed) = rollover_summary {
                emit(
                    cfg.level,
                    &format!(
                        "Unhandled notification suppressed: method={method} suppressed={suppressed} window={:?}",
                        cfg.window
                    ),
                );
            }
            emit(cfg.level, &format_message(cfg, method, params));
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Emit { rollover_summary: Option<u64> },
    SuppressionStarted,
    Drop,
}

fn decide(cfg: &Config, bucket: &mut Bucket, now: Instant) -> Decision {
    let start = *bucket.window_start.get_or_insert(now);
    let mut rollover_summary = None;

    if now.duration_since(start) >= cfg.window {
        if bucket.suppressed > 0 {
            rollover_summary = Some(bucket.suppressed);
        }
        bucket.window_start = Some(now);
        bucket.emitted = 0;
        bucket.suppressed = 0;
        bucket.suppress_msg = false;
    }

    if cfg.burst_per_key == 0 || bucket.emitted >= cfg.burst_per_key {
        bucket.suppressed += 1;
        if !bucket.suppress_msg && cfg.burst_per_key > 0 {
            bucket.suppress_msg = true;
            return Decision::SuppressionStarted;
        }
        return Decision::Drop;
    }

    bucket.emitted += 1;
    Decision::Emit { rollover_summary }
}

fn format_message(cfg: &Config, method: &str, params: Option<&Value>) -> String {
    let mut msg = format!("Unhandled notification: {method}");
    match params {
        Some(p) if cfg.max_param_bytes != 0 => {
            let raw = p.to_string();
            if raw.len() > cfg.max_param_bytes {
                let mut cut = cfg.max_param_bytes;
                while !raw.is_char_boundary(cut) {
                    cut -= 1;
                }
                msg.push_str(&format!(" params={}...(truncated)", &raw[..cut]));
            } else {
                msg.push_str(&format!(" params={raw}"));
            }
        }
        Some(_) => {}
        None => msg.push_str(" (no params)"),
    }
    msg
}

fn emit(level: Level, msg: &str) {
    match level {
        Level::Info => info!("{msg}"),
        _ => debug!("{msg}"),
    }
}
