use serde::{Deserialize, Serialize};

/// Per-node admission limits. Any field left `None` is unlimited — callers
/// configure only the caps they care about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_day: Option<u64>,
    pub concurrent_streams: Option<u32>,
}

/// Why a `consume_request` call was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    RequestsPerMinuteExceeded,
    TokenQuotaExceeded,
    StreamConcurrencyExceeded,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyCode::RequestsPerMinuteExceeded => "requests_per_minute_exceeded",
            DenyCode::TokenQuotaExceeded => "token_quota_exceeded",
            DenyCode::StreamConcurrencyExceeded => "stream_concurrency_exceeded",
        }
    }
}

/// Outcome of `consume_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(DenyCode),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Options accompanying a `consume_request`/`complete_request` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionOptions {
    pub stream: bool,
    pub tokens: u64,
}
