use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::types::RequestId;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

struct TrackedRequest {
    token: CancellationToken,
    started_at: Instant,
    #[allow(dead_code)]
    meta: Value,
}

/// Registry of in-flight requests and their cancellation handles
/// (spec.md §4.8). Any component that starts work on behalf of a request
/// registers here first; cancelling by id cancels the same token the
/// worker is selecting on.
pub struct RequestTracker {
    requests: DashMap<RequestId, TrackedRequest>,
    max_age: Duration,
}

impl RequestTracker {
    pub fn new() -> Arc<Self> {
        Self::with_max_age(DEFAULT_MAX_AGE)
    }

    pub fn with_max_age(max_age: Duration) -> Arc<Self> {
        Arc::new(Self { requests: DashMap::new(), max_age })
    }

    pub fn register(&self, request_id: RequestId, meta: Value) -> CancellationToken {
        let token = CancellationToken::new();
        self.requests
            .insert(request_id, TrackedRequest { token: token.clone(), started_at: Instant::now(), meta });
        token
    }

    pub fn unregister(&self, request_id: &RequestId) {
        self.requests.remove(request_id);
    }

    pub fn cancel(&self, request_id: &RequestId) -> bool {
        if let Some(entry) = self.requests.get(request_id) {
            entry.token.cancel();
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.requests.iter() {
            entry.token.cancel();
        }
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn list(&self) -> Vec<RequestId> {
        self.requests.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove entries older than `max_age`. Returns how many were swept.
    pub fn sweep(&self) -> usize {
        let cutoff = Instant::now().checked_sub(self.max_age).unwrap_or_else(Instant::now);
        let stale: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|e| e.started_at < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            self.requests.remove(id);
        }
        stale.len()
    }

    /// Periodic sweeper. Self-destructs once the table is empty and a sweep
    /// finds nothing stale, rather than polling an idle tracker forever.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = tracker.sweep();
                if removed > 0 {
                    debug!(removed, "request tracker sweep removed stale entries");
                }
                if tracker.count() == 0 {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_then_cancel_cancels_token() {
        let tracker = RequestTracker::new();
        let id = RequestId::new();
        let token = tracker.register(id.clone(), json!({}));
        assert!(!token.is_cancelled());
        assert!(tracker.cancel(&id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_id_returns_false() {
        let tracker = RequestTracker::new();
        assert!(!tracker.cancel(&RequestId::new()));
    }

    #[test]
    fn unregister_removes_entry() {
        let tracker = RequestTracker::new();
        let id = RequestId::new();
        tracker.register(id.clone(), json!({}));
        assert_eq!(tracker.count(), 1);
        tracker.unregister(&id);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn cancel_all_cancels_every_tracked_token() {
        let tracker = RequestTracker::new();
        let ids: Vec<_> = (0..3).map(|_| RequestId::new()).collect();
        let tokens: Vec<_> = ids.iter().map(|id| tracker.register(id.clone(), json!({}))).collect();
        tracker.cancel_all();
        assert!(tokens.iter().all(|t| t.is_cancelled()));
    }

    #[test]
    fn sweep_removes_entries_older_than_max_age() {
        let tracker = RequestTracker::with_max_age(Duration::from_millis(1));
        tracker.register(RequestId::new(), json!({}));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(tracker.sweep(), 1);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn list_returns_all_tracked_ids() {
        let tracker = RequestTracker::new();
        let id = RequestId::new();
        tracker.register(id.clone(), json!({}));
        assert_eq!(tracker.list(), vec![id]);
    }
}
