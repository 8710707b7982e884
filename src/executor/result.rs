//! Execution result types returned by the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Why an invocation did not produce output.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("Capability not found: {name}")]
    NotFound { name: String },

    #[error("Circuit open for '{name}', retry in {retry_after_ms}ms")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    #[error("Rate limit of {limit_per_minute}/min exceeded for '{name}', retry in {retry_after_ms}ms")]
    RateLimited {
        name: String,
        limit_per_minute: u32,
        retry_after_ms: u64,
    },

    #[error("Capability '{name}' requires an authenticated caller")]
    AuthRequired { name: String },

    #[error("Input validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Secondary validation rejected the input for '{name}'")]
    SecondaryValidationFailed { name: String },

    #[error("Execution timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("{message}")]
    Capability { message: String },

    #[error("Execution failed after {attempts} attempt(s): {cause}")]
    ExecutionFailed {
        attempts: u32,
        cause: Box<ExecutionError>,
    },
}

impl ExecutionError {
    /// Stable snake_case tag, same as the serialized `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthRequired { .. } => "auth_required",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::SecondaryValidationFailed { .. } => "secondary_validation_failed",
            Self::Timeout { .. } => "timeout",
            Self::Capability { .. } => "capability",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }

    /// The error of the last attempt, looking through `ExecutionFailed`.
    pub fn root_cause(&self) -> &ExecutionError {
        match self {
            Self::ExecutionFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Bookkeeping attached to a completed invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMetadata {
    pub execution_time_ms: u64,
    pub capability_version: String,
    pub timestamp: DateTime<Utc>,
    /// Attempts made; 0 for a cache hit
    pub attempts: u32,
    #[serde(default)]
    pub cached: bool,
    pub request_id: Option<String>,
}

/// Uniform outcome of [`CapabilityExecutor::execute`](super::CapabilityExecutor::execute).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
}

impl ExecutionResult {
    pub fn success(data: Value, metadata: ExecutionMetadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: Some(metadata),
        }
    }

    pub fn failure(error: ExecutionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata: None,
        }
    }

    pub fn failure_with_metadata(error: ExecutionError, metadata: ExecutionMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::failure(error)
        }
    }

    pub fn is_cached(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.cached)
    }

    pub fn into_result(self) -> Result<Value, ExecutionError> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (true, None, _) => Ok(Value::Null),
            (false, _, Some(error)) => Err(error),
            (false, _, None) => Err(ExecutionError::Capability {
                message: "unknown failure".into(),
            }),
        }
    }
}
