//! Error types for workflow execution
//!
//! [`EngineError`] covers everything the scheduler can surface: graph
//! validation failures, missing executors, node failures, loop iteration
//! failures, and cancellation. [`ExecutorError`] is the narrower error an
//! operator executor returns through the capability interface; the engine
//! converts it into the run-level taxonomy (and, inside a loop body, into
//! an error record on the loop's feedback buffer).
//!
//! Scheduler invariant violations (refcount underflow, batch slicing past
//! the end of the item list) are programming errors, not run failures;
//! those panic rather than appearing here.

use thiserror::Error;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Workflow structure validation failed
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    /// A work item referenced a node id not present in the graph
    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    /// No executor is registered for the node's category
    #[error("No executor registered for category '{category}' (node '{node}')")]
    UnsupportedCategory {
        /// Node whose dispatch failed
        node: String,
        /// Category that had no registered executor
        category: String,
    },

    /// Executor rejected the node's resolved input
    #[error("Invalid parameter for node '{node}': {message}")]
    InvalidParameter {
        /// Node whose input was rejected
        node: String,
        /// Executor-provided description
        message: String,
    },

    /// Executor raised an error while running the node
    #[error("Node '{node}' execution failed: {message}")]
    ExecutorFailure {
        /// Node that failed
        node: String,
        /// Executor-provided description
        message: String,
    },

    /// A loop iteration received an error arrival and the loop is not in
    /// continue-on-error mode
    #[error("Loop '{loop_id}' iteration {iteration} failed: {message}")]
    LoopIteration {
        /// Loop node
        loop_id: String,
        /// Iteration (batch index) that failed
        iteration: usize,
        /// Message from the error arrival
        message: String,
    },

    /// Run received a cancel signal between ticks
    #[error("Run cancelled")]
    Cancelled,

    /// Run exceeded the engine's tick limit
    #[error("Run exceeded the tick limit of {0}")]
    TickLimitExceeded(u64),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage capability error
    #[error("Run store error: {0}")]
    RunStore(#[from] nodeflow_runstore::RunStoreError),
}

impl EngineError {
    /// Create an [`EngineError::UnsupportedCategory`].
    pub fn unsupported_category(node: impl Into<String>, category: impl Into<String>) -> Self {
        Self::UnsupportedCategory {
            node: node.into(),
            category: category.into(),
        }
    }

    /// Create an [`EngineError::ExecutorFailure`].
    pub fn executor_failure(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutorFailure {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create an [`EngineError::LoopIteration`].
    pub fn loop_iteration(
        loop_id: impl Into<String>,
        iteration: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::LoopIteration {
            loop_id: loop_id.into(),
            iteration,
            message: message.into(),
        }
    }
}

/// Error returned by an operator executor through the capability
/// interface.
///
/// `InvalidParameter` marks input the executor refuses to work with;
/// `Failure` marks an operation that was attempted and failed. The engine
/// maps them onto [`EngineError::InvalidParameter`] and
/// [`EngineError::ExecutorFailure`] respectively.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Resolved input failed the executor's validation
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The operation was attempted and failed
    #[error("{0}")]
    Failure(String),
}

impl ExecutorError {
    /// Create an [`ExecutorError::InvalidParameter`].
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Create an [`ExecutorError::Failure`].
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

impl EngineError {
    /// Map an executor error onto the run-level taxonomy for `node`.
    pub fn from_executor(node: impl Into<String>, err: ExecutorError) -> Self {
        match err {
            ExecutorError::InvalidParameter(message) => Self::InvalidParameter {
                node: node.into(),
                message,
            },
            ExecutorError::Failure(message) => Self::ExecutorFailure {
                node: node.into(),
                message,
            },
        }
    }
}
