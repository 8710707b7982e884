//! Capability and registry errors.

use thiserror::Error;

/// Error returned by capability code from `execute` or a lifecycle hook.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// Business logic failed with a message meant for the caller.
    #[error("{0}")]
    Failed(String),

    /// Input passed schema parsing but is unusable for this capability.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A dependency of the capability (remote API, file, model) is unavailable.
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    /// Any other error bubbled up from capability internals.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CapabilityError {
    /// Shorthand for [`CapabilityError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Raw input rejected by a capability's input schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors raised by [`CapabilityRegistry`](super::CapabilityRegistry) operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Neither a canonical name nor an alias matched.
    #[error("Capability not found: {0}")]
    NotFound(String),

    /// The descriptor failed structural validation.
    #[error("Invalid descriptor for '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    /// A name or legacy alias would resolve to more than one capability.
    #[error("Alias '{alias}' conflicts with capability '{existing}'")]
    AliasConflict { alias: String, existing: String },

    /// Two canonical names sanitize to the same function-calling tool name.
    #[error("Tool name '{tool}' is already exported by capability '{existing}'")]
    ToolNameConflict { tool: String, existing: String },

    /// `on_load` failed; the registration was rolled back.
    #[error("on_load hook failed for '{name}': {source}")]
    LoadHookFailed {
        name: String,
        #[source]
        source: CapabilityError,
    },

    /// `on_unload` failed. Logged by the registry, removal still happens.
    #[error("on_unload hook failed for '{name}': {source}")]
    UnloadHookFailed {
        name: String,
        #[source]
        source: CapabilityError,
    },
}
