//! Remote execution capability
//!
//! The engine never talks to a server itself. It depends on an injected
//! [`RemoteExecutor`] that can run a command on a target and upload file
//! content, subject to a timeout. The binary provides an SSH-backed
//! implementation; tests provide in-memory fakes.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Logical execution target of a step.
///
/// Steps with different targets and no dependency relation are assumed
/// independent and safe to run concurrently. Steps sharing a target are
/// serialized by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The host machine itself
    Host,
    /// A named container on the host
    Container(String),
}

impl Target {
    /// Stable key used for per-target serialization and reporting
    pub fn key(&self) -> String {
        match self {
            Self::Host => "host".to_string(),
            Self::Container(name) => format!("container:{name}"),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Container(name) => write!(f, "{name}"),
        }
    }
}

/// Output of a remote command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Trimmed stderr
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Errors from the remote execution capability
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command did not finish within the allotted time
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The transport could not reach the target
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// Local I/O failure while driving the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability to run commands and place files on a target.
///
/// Implementations must be safe to call from multiple worker threads;
/// each call is independent.
pub trait RemoteExecutor: Send + Sync {
    /// Execute a shell command on the target, bounded by `timeout`.
    ///
    /// A non-zero exit code is not an error at this layer; it is returned
    /// in [`ExecOutput`] for the caller to interpret.
    fn execute(
        &self,
        target: &Target,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError>;

    /// Write `content` to `remote_path` on the target with the given
    /// octal mode string (e.g. "644").
    fn upload(
        &self,
        target: &Target,
        content: &str,
        remote_path: &str,
        mode: &str,
        timeout: Duration,
    ) -> Result<(), ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_keys_are_distinct() {
        assert_eq!(Target::Host.key(), "host");
        assert_eq!(
            Target::Container("dev".to_string()).key(),
            "container:dev"
        );
        assert_ne!(
            Target::Container("dev".to_string()),
            Target::Container("prod".to_string())
        );
    }

    #[test]
    fn exec_output_success() {
        let out = ExecOutput {
            exit_code: 0,
            stdout: "  ok \n".to_string(),
            stderr: String::new(),
        };
        assert!(out.success());
        assert_eq!(out.stdout_trimmed(), "ok");
    }
}
