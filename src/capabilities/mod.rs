//! # Capabilities
//!
//! A capability is a named, versioned, schema-validated operation that the
//! executor can invoke on behalf of an assistant, an HTTP client or a CLI.
//!
//! ```text
//! Capability (typed) --into_dyn--> DynCapability --register--> CapabilityRegistry
//!                                                                    |
//!                                  ToolDescriptor <--tool_descriptors-+
//! ```
//!
//! Implementers write a [`Capability`] with a `JsonSchema` input type, or
//! wrap a closure in a [`FnCapability`]. The registry stores the erased form
//! and resolves canonical names and legacy aliases.

pub mod capability;
pub mod error;
pub mod registry;
pub mod tool_descriptor;

pub use capability::{
    into_dyn, CallerClass, Capability, CapabilityDescriptor, Category, DynCapability,
    ExecutionContext, FnCapability, ValidatedInput,
};
pub use error::{CapabilityError, RegistryError, ValidationError};
pub use registry::{BatchReport, CapabilityRegistry, ListFilter, Registration, RegistryStatistics};
pub use tool_descriptor::{sanitize_tool_name, ToolDescriptor};
