//! Built-in diagnostic capabilities registered by the server at startup.

pub mod echo;

use crate::capabilities::{into_dyn, BatchReport, CapabilityRegistry};

pub use echo::EchoCapability;

/// Register every built-in capability.
pub async fn register_builtins(registry: &CapabilityRegistry) -> BatchReport {
    registry
        .register_batch([into_dyn(EchoCapability::new())])
        .await
}
