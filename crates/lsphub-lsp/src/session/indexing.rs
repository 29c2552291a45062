use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Titles that mark a progress stream as initial indexing. Matched as
/// lowercase substrings of the `begin` title.
const INDEXING_VOCABULARY: &[&str] = &["index", "индекс", "analy", "анализ", "loading", "scan"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingState {
    Idle,
    Indexing,
    Complete,
}

/// Wire form of the daemon's indexing progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub state: IndexingState,
    pub current: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug)]
struct Inner {
    state: IndexingState,
    current: u64,
    total: u64,
    message: Option<String>,
    started_at: Option<Instant>,
}

/// Passively derives indexing progress from `$/progress` notifications:
/// a `begin` whose title matches the indexing vocabulary enters `indexing`,
/// per-event percentage (or current/total) updates the counters, `end`
/// completes. ETA is extrapolated from wall clock and the last ratio.
#[derive(Debug)]
pub struct IndexingTracker {
    inner: Mutex<Inner>,
}

impl Default for IndexingTracker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: IndexingState::Idle,
                current: 0,
                total: 0,
                message: None,
                started_at: None,
            }),
        }
    }
}

impl IndexingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the `params` of one `$/progress` notification.
    pub fn observe(&self, params: &Value) {
        let Some(value) = params.get("value").and_then(|v| v.as_object()) else {
            return;
        };
        let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("");

        let mut inner = self.inner.lock().expect("indexing lock poisoned");
        match kind {
            "begin" => {
                let title = value
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_lowercase();
                if !INDEXING_VOCABULARY.iter().any(|word| title.contains(word)) {
                    return;
                }
                inner.state = IndexingState::Indexing;
                inner.started_at = Some(Instant::now());
                inner.message = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from);
                apply_counters(&mut inner, value);
            }
            "report" => {
                if inner.state != IndexingState::Indexing {
                    return;
                }
                if let Some(m) = value.get("message").and_then(|m| m.as_str()) {
                    inner.message = Some(m.to_string());
                }
                apply_counters(&mut inner, value);
            }
            "end" => {
                if inner.state != IndexingState::Indexing {
                    return;
                }
                inner.state = IndexingState::Complete;
                if inner.total > 0 {
                    inner.current = inner.total;
                }
            }
            _ => {}
        }
    }

    pub fn status(&self) -> IndexingStatus {
        let inner = self.inner.lock().expect("indexing lock poisoned");
        let elapsed = inner.started_at.map(|t| t.elapsed().as_secs());

        let eta = if inner.state == IndexingState::Indexing
            && inner.current > 0
            && inner.total > inner.current
        {
            elapsed.map(|e| e * (inner.total - inner.current) / inner.current)
        } else {
            None
        };

        IndexingStatus {
            state: inner.state,
            current: inner.current,
            total: inner.total,
            eta_seconds: eta,
            elapsed_seconds: elapsed,
            message: inner.message.clone(),
        }
    }
}

fn apply_counters(inner: &mut Inner, value: &serde_json::Map<String, Value>) {
    if let Some(pct) = value.get("percentage").and_then(|p| p.as_u64()) {
        inner.current = pct.min(100);
        inner.total = 100;
    }
    // Some servers report discrete counters instead of a percentage.
    if let Some(current) = value.get("current").and_then(|c| c.as_u64()) {
        inner.current = current;
    }
    if let Some(total) = value.get("total").and_then(|t| t.as_u64()) {
        inner.total = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn indexing_begin_transitions_only_on_vocabulary_match() {
        let tracker = IndexingTracker::new();
        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "begin", "title": "Formatting file" }
        }));
        assert_eq!(tracker.status().state, IndexingState::Idle);

        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "begin", "title": "Indexing project", "percentage": 0 }
        }));
        assert_eq!(tracker.status().state, IndexingState::Indexing);
    }

    #[test]
    fn russian_titles_match_too() {
        let tracker = IndexingTracker::new();
        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "begin", "title": "Индексация конфигурации" }
        }));
        assert_eq!(tracker.status().state, IndexingState::Indexing);
    }

    #[test]
    fn report_updates_percentage_and_end_completes() {
        let tracker = IndexingTracker::new();
        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "begin", "title": "Indexing" }
        }));
        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "report", "percentage": 40, "message": "400/1000" }
        }));

        let status = tracker.status();
        assert_eq!(status.current, 40);
        assert_eq!(status.total, 100);
        assert_eq!(status.message.as_deref(), Some("400/1000"));

        tracker.observe(&json!({ "token": "t", "value": { "kind": "end" } }));
        let status = tracker.status();
        assert_eq!(status.state, IndexingState::Complete);
        assert_eq!(status.current, status.total);
    }

    #[test]
    fn discrete_counters_override_percentage() {
        let tracker = IndexingTracker::new();
        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "begin", "title": "Indexing", "current": 5, "total": 250 }
        }));
        let status = tracker.status();
        assert_eq!(status.current, 5);
        assert_eq!(status.total, 250);
    }

    #[test]
    fn reports_before_begin_are_ignored() {
        let tracker = IndexingTracker::new();
        tracker.observe(&json!({
            "token": "t",
            "value": { "kind": "report", "percentage": 50 }
        }));
        assert_eq!(tracker.status().state, IndexingState::Idle);
        assert_eq!(tracker.status().current, 0);
    }
}
