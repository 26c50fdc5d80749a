use thiserror::Error;

/// Error taxonomy shared by every orchestration subsystem.
///
/// Variants are grouped by how a caller should react, mirroring the
/// five-way split the runtime distinguishes: validation (never retried),
/// admission (quota/rate denial, surfaced immediately), liveness (no node
/// available), timeout, and fatal (store corruption, lock unavailable).
/// Transient I/O failures are retried internally with backoff by the
/// component that sees them and only escalate here once retries are
/// exhausted.
#[derive(Debug, Error)]
pub enum ConduitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("admission denied ({code}): {message}")]
    Admission { code: AdmissionCode, message: String },

    #[error("no available node: {reason}")]
    Liveness { reason: String },

    #[error("operation timed out after {ms}ms: {what}")]
    Timeout { what: String, ms: u64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("lock unavailable: {key}")]
    LockUnavailable { key: String },

    #[error("store corrupted, quarantined as {backup_path}")]
    StoreCorrupted { backup_path: String },

    #[error("llm request failed: {0}")]
    LlmRequestFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// NodeFleetManager admission/denial codes, enumerated in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionCode {
    NodeNotFound,
    InvalidPayload,
    LlmUnavailable,
    RateLimitExceeded,
    QuotaExceeded,
    StreamLimitExceeded,
    NoAvailableNode,
}

impl AdmissionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionCode::NodeNotFound => "node_not_found",
            AdmissionCode::InvalidPayload => "invalid_payload",
            AdmissionCode::LlmUnavailable => "llm_unavailable",
            AdmissionCode::RateLimitExceeded => "rate_limit_exceeded",
            AdmissionCode::QuotaExceeded => "quota_exceeded",
            AdmissionCode::StreamLimitExceeded => "stream_limit_exceeded",
            AdmissionCode::NoAvailableNode => "no_available_node",
        }
    }
}

impl std::fmt::Display for AdmissionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConduitError {
    pub fn admission(code: AdmissionCode, message: impl Into<String>) -> Self {
        ConduitError::Admission {
            code,
            message: message.into(),
        }
    }

    /// Stable short code attached to error events published on the
    /// EventBus and surfaced to external callers.
    pub fn code(&self) -> &'static str {
        match self {
            ConduitError::Validation(_) => "validation_failed",
            ConduitError::Admission { code, .. } => code.as_str(),
            ConduitError::Liveness { .. } => "no_available_node",
            ConduitError::Timeout { .. } => "timeout",
            ConduitError::Database(_) => "database_error",
            ConduitError::LockUnavailable { .. } => "lock_unavailable",
            ConduitError::StoreCorrupted { .. } => "store_corrupted",
            ConduitError::LlmRequestFailed(_) => "llm_request_failed",
            ConduitError::Serialization(_) => "serialization_error",
            ConduitError::Io(_) => "io_error",
            ConduitError::Config(_) => "config_error",
            ConduitError::Internal(_) => "internal_error",
        }
    }

    /// Whether a caller should retry the same operation. Validation and
    /// admission errors never are; liveness/timeout/transient I/O may be.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConduitError::Liveness { .. }
                | ConduitError::Timeout { .. }
                | ConduitError::LlmRequestFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_code_round_trips_through_display() {
        let err = ConduitError::admission(AdmissionCode::QuotaExceeded, "rpm limit hit");
        assert_eq!(err.code(), "quota_exceeded");
        assert!(!err.is_retryable());
    }

    #[test]
    fn liveness_is_retryable() {
        let err = ConduitError::Liveness {
            reason: "no node registered".into(),
        };
        assert!(err.is_retryable());
    }
}
