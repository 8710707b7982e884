//! # capability-runtime
//!
//! In-process runtime for named, versioned, schema-validated operations
//! ("capabilities") and an executor that invokes them behind a resilience
//! layer: input validation, result caching, per-caller rate limiting,
//! circuit breaking, timeouts, retry with exponential backoff and metrics.
//!
//! ```ignore
//! use capability_runtime::prelude::*;
//!
//! let runtime = RuntimeContext::new(RuntimeConfig::default());
//! runtime.registry().register(into_dyn(EchoCapability::new())).await?;
//! let result = runtime
//!     .execute("echo.v1", serde_json::json!({"message": "hi"}), ExecuteOptions::new())
//!     .await;
//! assert!(result.success);
//! ```

pub mod builtin;
pub mod capabilities;
pub mod config;
pub mod executor;
pub mod runtime;
pub mod server;

pub use capabilities::{
    into_dyn, CallerClass, Capability, CapabilityDescriptor, CapabilityError, CapabilityRegistry,
    Category, DynCapability, ExecutionContext, FnCapability, RegistryError,
};
pub use config::{ConfigError, RuntimeConfig};
pub use executor::{CapabilityExecutor, ExecuteOptions, ExecutionError, ExecutionResult};
pub use runtime::RuntimeContext;

/// Commonly used items.
pub mod prelude {
    pub use crate::builtin::EchoCapability;
    pub use crate::capabilities::{
        into_dyn, CallerClass, Capability, CapabilityDescriptor, CapabilityError,
        CapabilityRegistry, Category, DynCapability, ExecutionContext, FnCapability, ListFilter,
    };
    pub use crate::config::RuntimeConfig;
    pub use crate::executor::{ExecuteOptions, ExecutionError, ExecutionResult};
    pub use crate::runtime::RuntimeContext;
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
