//! # nodeflow-prebuilt - Ready-made operator executors
//!
//! The scheduler core consumes operators through the
//! [`Executor`](nodeflow_core::Executor) capability and ships none of its
//! own. This crate provides the small built-in set the standard node
//! types need:
//!
//! - [`LogicExecutor`] (`logic`) - `If` partitioning/booleans and
//!   `Switch` case selection
//! - [`TransformExecutor`] (`transform`) - `Edit Fields` (including
//!   persistent counters) and `Math`
//! - [`HttpExecutor`] (`http`) - `HttpRequest` over reqwest, with
//!   credentials drawn from the
//!   [`CredentialStore`](nodeflow_runstore::CredentialStore) capability
//!
//! ```rust
//! use nodeflow_core::ExecutorRegistry;
//!
//! let mut registry = ExecutorRegistry::new();
//! nodeflow_prebuilt::register_defaults(&mut registry);
//! assert!(registry.get("logic").is_some());
//! ```

pub mod http;
pub mod logic;
pub mod transform;

pub use http::HttpExecutor;
pub use logic::LogicExecutor;
pub use transform::TransformExecutor;

use nodeflow_core::ExecutorRegistry;
use std::sync::Arc;

/// Register every built-in executor on `registry`. The HTTP executor is
/// registered without a credential store; use
/// [`HttpExecutor::with_credentials`] directly when credentials are
/// needed.
pub fn register_defaults(registry: &mut ExecutorRegistry) {
    registry.register(Arc::new(LogicExecutor::new()));
    registry.register(Arc::new(TransformExecutor::new()));
    registry.register(Arc::new(HttpExecutor::new()));
}
