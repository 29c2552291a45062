use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use serde_json::Value;

/// Normalized view of one `$/progress` payload.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub token_key: String,
    /// begin | report | end | unknown
    pub kind: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub percentage: Option<u32>,
    pub cancellable: Option<bool>,
    pub time: SystemTime,
    pub raw: Value,
}

/// Value-copied view returned to status tooling.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub active: Vec<ProgressEvent>,
    pub last_event: Option<ProgressEvent>,
}

/// Tracks server-initiated workDone progress streams, fed by `$/progress`.
///
/// A token is active from its first begin/report until end. Snapshots take
/// the read lock; updates take the write lock.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: HashMap<String, ProgressEvent>,
    last: Option<ProgressEvent>,
}

/// Canonical string form of a progress token (integer or string).
pub fn progress_token_key(token: &Value) -> String {
    match token {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledges a `window/workDoneProgress/create` token. Existence in
    /// the active set is driven by begin/report/end, so this only returns
    /// the canonical key.
    pub fn register_token(&self, token: &Value) -> String {
        progress_token_key(token)
    }

    /// Consumes the `params` of one `$/progress` notification.
    pub fn update(&self, params: &Value) {
        let now = SystemTime::now();
        let key = params
            .get("token")
            .map(progress_token_key)
            .unwrap_or_default();
        let raw = params.get("value").cloned().unwrap_or(Value::Null);

        // Malformed payloads still leave a marker event without disturbing
        // the active set.
        let Some(obj) = raw.as_object() else {
            let mut inner = self.inner.write().expect("progress lock poisoned");
            inner.last = Some(ProgressEvent {
                token_key: key,
                kind: "unknown".to_string(),
                title: None,
                message: None,
                percentage: None,
                cancellable: None,
                time: now,
                raw,
            });
            return;
        };

        let kind = obj
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or("unknown")
            .to_string();
        let event = ProgressEvent {
            token_key: key.clone(),
            kind: kind.clone(),
            title: obj.get("title").and_then(|v| v.as_str()).map(String::from),
            message: obj
                .get("message")
                .and_then(|v| v.as_str())
                .map(String::from),
            percentage: obj
                .get("percentage")
                .and_then(|v| v.as_u64())
                .map(|v| v.min(100) as u32),
            cancellable: obj.get("cancellable").and_then(|v| v.as_bool()),
            time: now,
            raw: raw.clone(),
        };

        let mut inner = self.inner.write().expect("progress lock poisoned");
        inner.last = Some(event.clone());
        match kind.as_str() {
            "begin" | "report" => {
                inner.active.insert(key, event);
            }
            "end" => {
                inner.active.remove(&key);
            }
            _ => {
                // Keep an unknown kind in active only if the token is known.
                if inner.active.contains_key(&key) {
                    inner.active.insert(key, event);
                }
            }
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.read().expect("progress lock poisoned");
        ProgressSnapshot {
            active: inner.active.values().cloned().collect(),
            last_event: inner.last.clone(),
        }
    }

    pub fn has_active(&self) -> bool {
        !self
            .inner
            .read()
            .expect("progress lock poisoned")
            .active
            .is_empty()
    }
}
