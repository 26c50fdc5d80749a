//! Per-node admission control — rolling RPM window, daily token bucket,
//! concurrent-stream counter.
//!
//! The rolling-window idiom (timestamps in a `VecDeque`, pruned against a
//! cutoff on every touch) mirrors the teacher's provider health tracker;
//! here it gates admission instead of deriving a health status.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;

use crate::types::{CompletionOptions, Decision, DenyCode, QuotaConfig, RequestOptions};

const RPM_WINDOW: Duration = Duration::from_secs(60);

struct NodeState {
    config: QuotaConfig,
    /// Timestamps of requests admitted within the current rolling minute.
    request_window: VecDeque<Instant>,
    /// UTC calendar day the token bucket currently applies to.
    token_bucket_day: Option<NaiveDate>,
    tokens_used_today: u64,
    active_streams: u32,
}

impl NodeState {
    fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            request_window: VecDeque::new(),
            token_bucket_day: None,
            tokens_used_today: 0,
            active_streams: 0,
        }
    }

    fn prune_window(&mut self, now: Instant) {
        let cutoff = now - RPM_WINDOW;
        while self.request_window.front().is_some_and(|t| *t < cutoff) {
            self.request_window.pop_front();
        }
    }

    fn roll_day_bucket(&mut self, today: NaiveDate) {
        if self.token_bucket_day != Some(today) {
            self.token_bucket_day = Some(today);
            self.tokens_used_today = 0;
        }
    }
}

/// Admission controller for LLM requests, serialized per node so traffic
/// to one node never contends with another (spec.md §4.2).
pub struct QuotaController {
    nodes: DashMap<String, NodeState>,
    default_config: QuotaConfig,
}

impl QuotaController {
    pub fn new(default_config: QuotaConfig) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            default_config,
        })
    }

    /// Atomically check all applicable limits for `node_id` and, if
    /// allowed, record the admission (minute window + stream counter).
    /// The daily token bucket is checked against `tokens_used_today + 0`
    /// since pre-request token cost is unknown — it remains advisory until
    /// `complete_request` reports the real usage.
    pub fn consume_request(&self, node_id: &str, opts: RequestOptions) -> Decision {
        let now = Instant::now();
        let today = Utc::now().date_naive();

        let mut entry = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(self.default_config.clone()));

        entry.prune_window(now);
        entry.roll_day_bucket(today);

        if let Some(limit) = entry.config.requests_per_minute {
            if entry.request_window.len() as u32 >= limit {
                return Decision::Denied(DenyCode::RequestsPerMinuteExceeded);
            }
        }

        if let Some(limit) = entry.config.tokens_per_day {
            if entry.tokens_used_today >= limit {
                return Decision::Denied(DenyCode::TokenQuotaExceeded);
            }
        }

        if opts.stream {
            if let Some(limit) = entry.config.concurrent_streams {
                if entry.active_streams >= limit {
                    return Decision::Denied(DenyCode::StreamConcurrencyExceeded);
                }
            }
        }

        entry.request_window.push_back(now);
        if opts.stream {
            entry.active_streams += 1;
        }

        Decision::Allowed
    }

    /// Record the outcome of a request that was previously admitted:
    /// releases the stream slot (if any) and tallies tokens toward the
    /// daily bucket.
    pub fn complete_request(&self, node_id: &str, opts: CompletionOptions) {
        let today = Utc::now().date_naive();
        let mut entry = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(self.default_config.clone()));

        entry.roll_day_bucket(today);

        if opts.stream && entry.active_streams > 0 {
            entry.active_streams -= 1;
        }
        entry.tokens_used_today += opts.tokens;
    }

    /// Replace the limits for `node_id`. In-flight counters (window,
    /// active streams, today's token usage) are preserved.
    pub fn update_config(&self, node_id: &str, config: QuotaConfig) {
        let mut entry = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(self.default_config.clone()));
        entry.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_limit_denies_third_request_within_window() {
        let controller = QuotaController::new(QuotaConfig {
            requests_per_minute: Some(2),
            ..Default::default()
        });

        assert_eq!(
            controller.consume_request("n1", RequestOptions::default()),
            Decision::Allowed
        );
        assert_eq!(
            controller.consume_request("n1", RequestOptions::default()),
            Decision::Allowed
        );
        assert_eq!(
            controller.consume_request("n1", RequestOptions::default()),
            Decision::Denied(DenyCode::RequestsPerMinuteExceeded)
        );
    }

    #[test]
    fn distinct_nodes_have_independent_windows() {
        let controller = QuotaController::new(QuotaConfig {
            requests_per_minute: Some(1),
            ..Default::default()
        });
        assert!(controller
            .consume_request("n1", RequestOptions::default())
            .is_allowed());
        assert!(controller
            .consume_request("n2", RequestOptions::default())
            .is_allowed());
    }

    #[test]
    fn stream_concurrency_limit_enforced() {
        let controller = QuotaController::new(QuotaConfig {
            concurrent_streams: Some(1),
            ..Default::default()
        });
        let opts = RequestOptions { stream: true };
        assert!(controller.consume_request("n1", opts).is_allowed());
        assert_eq!(
            controller.consume_request("n1", opts),
            Decision::Denied(DenyCode::StreamConcurrencyExceeded)
        );

        controller.complete_request(
            "n1",
            CompletionOptions {
                stream: true,
                tokens: 0,
            },
        );
        assert!(controller.consume_request("n1", opts).is_allowed());
    }

    #[test]
    fn token_bucket_denies_once_daily_limit_reached() {
        let controller = QuotaController::new(QuotaConfig {
            tokens_per_day: Some(100),
            ..Default::default()
        });
        assert!(controller
            .consume_request("n1", RequestOptions::default())
            .is_allowed());
        controller.complete_request(
            "n1",
            CompletionOptions {
                stream: false,
                tokens: 100,
            },
        );
        assert_eq!(
            controller.consume_request("n1", RequestOptions::default()),
            Decision::Denied(DenyCode::TokenQuotaExceeded)
        );
    }

    #[test]
    fn unlimited_config_never_denies() {
        let controller = QuotaController::new(QuotaConfig::default());
        for _ in 0..100 {
            assert!(controller
                .consume_request("n1", RequestOptions::default())
                .is_allowed());
        }
    }

    #[test]
    fn update_config_preserves_in_flight_counters() {
        let controller = QuotaController::new(QuotaConfig {
            concurrent_streams: Some(5),
            ..Default::default()
        });
        let opts = RequestOptions { stream: true };
        controller.consume_request("n1", opts);
        controller.update_config(
            "n1",
            QuotaConfig {
                concurrent_streams: Some(1),
                ..Default::default()
            },
        );
        // The one active stream from before the update still counts.
        assert_eq!(
            controller.consume_request("n1", opts),
            Decision::Denied(DenyCode::StreamConcurrencyExceeded)
        );
    }
}
