//! Error types for graph building and cycle execution.

use thiserror::Error;

use crate::exec::CycleState;
use crate::resolve::ResolutionFailure;

/// Graph building failed.
#[derive(Debug, Clone, Error)]
pub enum GraphBuildError {
    /// At least one terminal requirement could not be resolved.
    ///
    /// `failures` holds one causal chain per unresolved requirement.
    #[error("unsatisfiable dependency graph for `{configuration}`: {} requirement(s) could not be resolved", failures.len())]
    Unsatisfiable {
        /// Calculation configuration name.
        configuration: String,
        /// Failure chains.
        failures: Vec<ResolutionFailure>,
    },
}

/// Scheduler-level execution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    /// The scheduler itself failed; the whole cycle is aborted.
    #[error("graph executor fault: {0}")]
    Fault(String),
}

/// Computation cycle errors.
#[derive(Debug, Error)]
pub enum CycleError {
    /// An operation was attempted in the wrong state.
    #[error("cannot {operation} a cycle in state {state:?}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the cycle was in.
        state: CycleState,
    },

    /// The previous cycle handed to delta reuse had not finished executing.
    #[error("previous cycle is in state {0:?}, expected Executed")]
    PreviousCycleNotExecuted(CycleState),

    /// No calculation configuration with this name.
    #[error("unknown calculation configuration `{0}`")]
    UnknownConfiguration(String),

    /// Execution of a configuration failed at the scheduler level.
    #[error("execution of configuration `{configuration}` failed")]
    ExecutionFailed {
        /// Calculation configuration name.
        configuration: String,
        /// Scheduler error.
        #[source]
        source: ExecutionError,
    },

    /// The cycle was interrupted. Not a data error.
    #[error("cycle execution interrupted")]
    Interrupted,

    /// The result-streaming thread could not be started.
    #[error("failed to start result-streaming thread: {0}")]
    ResultStreamer(#[source] std::io::Error),

    /// Writing a cache dump failed.
    #[error("failed to dump computation cache: {0}")]
    CacheDump(#[from] std::io::Error),
}

/// Engine construction errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
