//! Error types for the orchestration engine

use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing a dependency graph.
///
/// All of these are fatal before any step runs: a graph that fails to
/// build schedules nothing.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two steps share the same id
    #[error("duplicate step id: {0}")]
    DuplicateId(String),

    /// A step depends on an id that does not exist in the graph
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency edges form a cycle
    #[error("cycle detected: {0}")]
    Cycle(String),
}

/// Errors raised by the secret vault.
///
/// Vault errors are fatal to the step that triggered them and abort the
/// run before dependents are dispatched.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A secret with this name was already generated this run
    #[error("secret name collision: '{0}' already exists")]
    NameCollision(String),

    /// No secret with this name has been generated
    #[error("secret not found: '{0}'")]
    NotFound(String),

    /// The OS entropy source failed; the vault never falls back to a
    /// weaker generator
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    /// The requested policy cannot produce a secret
    #[error("invalid secret policy: {0}")]
    Policy(String),
}

/// Classified failure of a single step, as recorded in execution state.
///
/// Step authors return plain `anyhow` errors from action/verify; the
/// scheduler worker classifies them into this taxonomy so reports can
/// distinguish a failed mutation from a silent partial success from a
/// timeout. A failing probe never lands here - it is treated as
/// `Indeterminate` and the step re-runs.
#[derive(Debug, Error)]
pub enum StepError {
    /// The mutating operation failed
    #[error("action failed: {0}")]
    Action(String),

    /// The action reported success but the postcondition does not hold
    #[error("verification failed: {0}")]
    Verify(String),

    /// A check/action/verify exceeded the step's time budget
    #[error("timed out after {0:?} during {1}")]
    Timeout(Duration, &'static str),
}

/// Violation of the execution-state append-only contract.
#[derive(Debug, Error)]
pub enum StateError {
    /// Attempted to transition a step that already reached a terminal
    /// status
    #[error("step {0} already reached a terminal status")]
    AlreadyTerminal(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_names_the_cycle() {
        let err = GraphError::Cycle("a -> b -> a".to_string());
        assert!(err.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn step_error_distinguishes_timeout() {
        let err = StepError::Timeout(Duration::from_secs(30), "action");
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("action"));
    }
}
