//! Step trait - the unit of provisioning work
//!
//! A step declares an idempotency probe (`check`), a mutating operation
//! (`action`), and an optional postcondition (`verify`). The scheduler
//! runs the probe first and only mutates when the probe reports work to
//! do, which is what makes a whole run safe to repeat.

use crate::remote::{ExecError, ExecOutput, RemoteExecutor, Target};
use crate::vault::SecretVault;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Result of an idempotency probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOutcome {
    /// The step's effect is already present; the action must not run
    AlreadyApplied,
    /// The step's effect is absent; the action must run
    NotApplied,
    /// The probe could not decide. Treated as `NotApplied` - the engine
    /// never silently skips when uncertain.
    Indeterminate,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyApplied => "already-applied",
            Self::NotApplied => "not-applied",
            Self::Indeterminate => "indeterminate",
        };
        write!(f, "{s}")
    }
}

/// Context passed to a step's check/action/verify.
///
/// Carries the remote execution capability, the secret vault, and the
/// step's time budget. All remote helpers are bounded by the remaining
/// budget, so check + action + verify share one deadline.
pub struct StepContext<'a> {
    remote: &'a dyn RemoteExecutor,
    vault: &'a SecretVault,
    target: Target,
    deadline: Instant,
    budget: Duration,
}

impl<'a> StepContext<'a> {
    /// Create a context for one step execution
    pub fn new(
        remote: &'a dyn RemoteExecutor,
        vault: &'a SecretVault,
        target: Target,
        budget: Duration,
    ) -> Self {
        Self {
            remote,
            vault,
            target,
            deadline: Instant::now() + budget,
            budget,
        }
    }

    /// The secret vault for this run
    pub fn vault(&self) -> &SecretVault {
        self.vault
    }

    /// The step's own target
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Time left in the step's budget (zero once expired)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the step's budget is exhausted
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    fn timeout(&self) -> Result<Duration, ExecError> {
        let left = self.remaining();
        if left.is_zero() {
            return Err(ExecError::Timeout(self.budget));
        }
        Ok(left)
    }

    /// Run a command on the step's own target
    pub fn run(&self, command: &str) -> Result<ExecOutput> {
        let timeout = self.timeout()?;
        Ok(self.remote.execute(&self.target, command, timeout)?)
    }

    /// Run a command on an explicit target (e.g. a container step that
    /// must manipulate host-level incus state)
    pub fn run_on(&self, target: &Target, command: &str) -> Result<ExecOutput> {
        let timeout = self.timeout()?;
        Ok(self.remote.execute(target, command, timeout)?)
    }

    /// Run a command on the host
    pub fn run_host(&self, command: &str) -> Result<ExecOutput> {
        self.run_on(&Target::Host, command)
    }

    /// Run a command on the step's target and fail on non-zero exit
    pub fn run_checked(&self, command: &str) -> Result<ExecOutput> {
        let output = self.run(command)?;
        if !output.success() {
            anyhow::bail!(
                "command exited {}: {}",
                output.exit_code,
                output.stderr_trimmed()
            );
        }
        Ok(output)
    }

    /// Run a command on the host and fail on non-zero exit
    pub fn run_host_checked(&self, command: &str) -> Result<ExecOutput> {
        let output = self.run_host(command)?;
        if !output.success() {
            anyhow::bail!(
                "command exited {}: {}",
                output.exit_code,
                output.stderr_trimmed()
            );
        }
        Ok(output)
    }

    /// Write file content on the step's own target
    pub fn upload(&self, content: &str, remote_path: &str, mode: &str) -> Result<()> {
        let timeout = self.timeout()?;
        self.remote
            .upload(&self.target, content, remote_path, mode, timeout)?;
        Ok(())
    }

    /// Write file content on the host
    pub fn upload_host(&self, content: &str, remote_path: &str, mode: &str) -> Result<()> {
        let timeout = self.timeout()?;
        self.remote
            .upload(&Target::Host, content, remote_path, mode, timeout)?;
        Ok(())
    }
}

/// Core trait for provisioning steps.
///
/// Implementations close over the configuration values they need; the
/// engine supplies everything else through [`StepContext`].
///
/// Contract:
/// - `check` is side-effect-free and probes the remote target directly,
///   so the "already done" answer survives process restarts and operator
///   intervention between runs.
/// - `action` is invoked at most once per run, and only when `check`
///   did not report `AlreadyApplied`.
/// - `verify` (optional - the default accepts) runs after a successful
///   action; a verify failure is a hard step failure even if the action
///   exited cleanly.
pub trait Step: Send + Sync {
    /// Unique stable name, e.g. `network.private-bridge`
    fn id(&self) -> String;

    /// Coarse grouping label used for reporting only - scheduling uses
    /// explicit dependencies
    fn phase(&self) -> &'static str;

    /// Logical execution target
    fn target(&self) -> Target;

    /// Ids of steps that must reach `Succeeded`/`Skipped` before this
    /// step becomes eligible
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Human-readable description of what this step does
    fn description(&self) -> String;

    /// Per-step time budget for check + action + verify combined.
    /// `None` uses the run-level default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Guidance surfaced to the operator when this step fails.
    /// Never executed automatically.
    fn rollback_hint(&self) -> Option<String> {
        None
    }

    /// Probe whether the step's effect is already present
    fn check(&self, ctx: &StepContext) -> Result<CheckOutcome>;

    /// Apply the step's effect
    fn action(&self, ctx: &StepContext) -> Result<()>;

    /// Confirm the action achieved its goal
    fn verify(&self, _ctx: &StepContext) -> Result<()> {
        Ok(())
    }
}

/// A boxed step for type-erased storage in the graph
pub type BoxedStep = Box<dyn Step>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
    }

    impl RemoteExecutor for RecordingExecutor {
        fn execute(
            &self,
            target: &Target,
            command: &str,
            _timeout: Duration,
        ) -> Result<ExecOutput, ExecError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}: {command}", target.key()));
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        fn upload(
            &self,
            _target: &Target,
            _content: &str,
            _remote_path: &str,
            _mode: &str,
            _timeout: Duration,
        ) -> Result<(), ExecError> {
            Ok(())
        }
    }

    #[test]
    fn context_routes_to_own_target_and_host() {
        let exec = RecordingExecutor {
            calls: Mutex::new(Vec::new()),
        };
        let vault = SecretVault::new();
        let ctx = StepContext::new(
            &exec,
            &vault,
            Target::Container("dev".to_string()),
            Duration::from_secs(5),
        );

        ctx.run("echo in-container").unwrap();
        ctx.run_host("echo on-host").unwrap();

        let calls = exec.calls.lock().unwrap();
        assert_eq!(calls[0], "container:dev: echo in-container");
        assert_eq!(calls[1], "host: echo on-host");
    }

    #[test]
    fn expired_context_refuses_to_execute() {
        let exec = RecordingExecutor {
            calls: Mutex::new(Vec::new()),
        };
        let vault = SecretVault::new();
        let ctx = StepContext::new(&exec, &vault, Target::Host, Duration::ZERO);

        let err = ctx.run("echo hi").unwrap_err();
        let exec_err = err.downcast_ref::<ExecError>().unwrap();
        assert!(matches!(exec_err, ExecError::Timeout(_)));
        assert!(exec.calls.lock().unwrap().is_empty());
    }
}
