//! Typed error hierarchy for the build orchestrator.
//!
//! Four top-level enums cover the subsystem boundaries:
//! - `AdmissionError`: capacity, credential and ownership refusals at admission
//! - `ProviderError`: failures talking to the AI completion provider
//! - `QueueError`: job queue bookkeeping failures
//! - `AuditError`: the best-effort audit side channel, never part of a build result

use thiserror::Error;

use crate::capacity::DenyReason;

/// Errors returned while admitting a build request.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Build request denied: {reason}")]
    Denied { reason: DenyReason, upgrade: bool },

    #[error("No usable credential for provider {provider}")]
    CredentialExhausted { provider: String },

    #[error("Build {build_id} is already owned by another producer")]
    BuildAlreadyRunning { build_id: String },

    #[error("Build {build_id} belongs to a different user")]
    NotOwner { build_id: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Admission store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from a single provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Provider rate limited the credential (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider call exceeded its {secs}s budget")]
    Timeout { secs: u64 },

    #[error("Network error talking to provider: {0}")]
    Network(String),

    #[error("Provider call cancelled by caller")]
    Cancelled,

    #[error("Malformed provider stream: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether the async path may retry a build that failed with this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout { .. }
            | ProviderError::Network(_)
            | ProviderError::RateLimited { .. } => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::Cancelled | ProviderError::Malformed(_) => false,
        }
    }

    /// Stable short name used in `error` events and build records.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Http { .. } => "provider_error",
            ProviderError::RateLimited { .. } => "provider_rate_limited",
            ProviderError::Timeout { .. } => "provider_timeout",
            ProviderError::Network(_) => "provider_timeout",
            ProviderError::Cancelled => "cancelled",
            ProviderError::Malformed(_) => "provider_error",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            ProviderError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

/// Errors from the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Lease on job {job_id} was lost")]
    LeaseLost { job_id: String },

    #[error("Queue store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Failure of the fire-and-forget audit channel.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit channel is full, entry dropped")]
    ChannelFull,

    #[error("Audit channel is closed")]
    ChannelClosed,

    #[error("Failed to write audit entry: {0}")]
    Write(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_timeout_is_retryable() {
        let err = ProviderError::Timeout { secs: 120 };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "provider_timeout");
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn provider_error_client_status_is_not_retryable() {
        let err = ProviderError::Http {
            status: 400,
            body: "bad model".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn provider_error_server_status_is_retryable() {
        let err = ProviderError::Http {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn provider_error_cancelled_is_terminal() {
        assert!(!ProviderError::Cancelled.is_retryable());
        assert_eq!(ProviderError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn admission_error_denied_carries_reason() {
        let err = AdmissionError::Denied {
            reason: DenyReason::ConcurrencyLimit { active: 3, limit: 3 },
            upgrade: true,
        };
        match &err {
            AdmissionError::Denied { upgrade, .. } => assert!(*upgrade),
            _ => panic!("Expected Denied"),
        }
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AdmissionError::BadRequest("x".into()));
        assert_std_error(&ProviderError::Cancelled);
        assert_std_error(&QueueError::JobNotFound { job_id: "j".into() });
        assert_std_error(&AuditError::ChannelFull);
    }
}
