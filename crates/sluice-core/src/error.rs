//! Error taxonomy for pipeline stages.
//!
//! Batch- and partition-level failures are [`EtlError`] values; whether the
//! orchestrator retries them is decided by [`EtlError::is_retryable`].
//! Per-record transform failures are not errors at all: they are
//! [`TransformRejected`] values attached to the rejected record.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised by readers, loaders and state stores.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    /// The source could not be reached. Retried with backoff.
    #[error("source {source_id} unavailable: {message}")]
    SourceUnavailable {
        source_id: String,
        message: String,
        /// Delay requested by the source (e.g. an HTTP `Retry-After`).
        retry_after: Option<Duration>,
    },

    /// The source returned a payload that cannot be staged.
    #[error("source {source_id} returned corrupt data: {message}")]
    SourceCorrupt { source_id: String, message: String },

    /// The warehouse refused the batch (constraint or data violation).
    /// The batch goes to quarantine and the partition fails.
    #[error("warehouse rejected batch: {message}")]
    LoadRejected { message: String },

    /// The warehouse could not be reached. Retried with backoff.
    #[error("warehouse unavailable: {message}")]
    LoadUnavailable { message: String },

    /// A checkpoint advance did not strictly succeed the stored value.
    #[error("stale checkpoint for {source_id}/{partition_id}: stored {stored}, attempted {attempted}")]
    StaleCheckpoint {
        source_id: String,
        partition_id: String,
        stored: u64,
        attempted: u64,
    },

    /// Checkpoint or quarantine storage could not be reached. Retried.
    #[error("state store unavailable: {message}")]
    StateUnavailable { message: String },

    /// Anything else: configuration, programming and infrastructure errors.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EtlError {
    pub fn source_unavailable(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            message: message.to_string(),
            retry_after: None,
        }
    }

    pub fn source_corrupt(source_id: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::SourceCorrupt {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    pub fn load_rejected(message: impl fmt::Display) -> Self {
        Self::LoadRejected {
            message: message.to_string(),
        }
    }

    pub fn load_unavailable(message: impl fmt::Display) -> Self {
        Self::LoadUnavailable {
            message: message.to_string(),
        }
    }

    pub fn state_unavailable(message: impl fmt::Display) -> Self {
        Self::StateUnavailable {
            message: message.to_string(),
        }
    }

    /// Returns `true` for connectivity failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::LoadUnavailable { .. } | Self::StateUnavailable { .. }
        )
    }

    /// Delay hint supplied by the failing component, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::SourceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable name used in logs and run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::SourceCorrupt { .. } => "source_corrupt",
            Self::LoadRejected { .. } => "load_rejected",
            Self::LoadUnavailable { .. } => "load_unavailable",
            Self::StaleCheckpoint { .. } => "stale_checkpoint",
            Self::StateUnavailable { .. } => "state_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EtlError>;

/// Reason code attached to a rejected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    /// Payload is not a UTF-8 JSON object.
    Malformed,
    MissingField,
    TypeMismatch,
    ConstraintViolated,
    InvalidExpression,
    LookupMiss,
    LookupFailed,
    MissingKey,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::MissingField => "missing_field",
            Self::TypeMismatch => "type_mismatch",
            Self::ConstraintViolated => "constraint_violated",
            Self::InvalidExpression => "invalid_expression",
            Self::LookupMiss => "lookup_miss",
            Self::LookupFailed => "lookup_failed",
            Self::MissingKey => "missing_key",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single record was routed to `rejected` by the transform engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code} at step {step}: {detail}")]
pub struct TransformRejected {
    pub code: RejectCode,
    /// Name of the step that rejected the record.
    pub step: String,
    pub detail: String,
}

impl TransformRejected {
    pub fn new(code: RejectCode, step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code,
            step: step.into(),
            detail: detail.into(),
        }
    }
}
