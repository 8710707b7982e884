//! HTTP admin surface for the capability runtime.
//!
//! A thin axum router over one [`RuntimeContext`](crate::runtime::RuntimeContext):
//! registry introspection, execution, hot-reload, metrics and tool export.
//! See [`routes`] for the endpoint list.

pub mod routes;

pub use routes::{app_router, AppState, ExecuteRequest};
