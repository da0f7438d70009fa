//! # Orchestrate
//!
//! A framework for dependency-aware, idempotent provisioning.
//!
//! This crate provides the core abstractions for declaring provisioning
//! steps, probing whether their effect is already present, and converging
//! a remote system to the declared state in dependency order.
//!
//! ## Core Concepts
//!
//! - **Step**: one unit of work with a check/action/verify triple
//! - **Graph**: a validated DAG of steps encoding "must run after"
//! - **Scheduler**: bounded concurrent execution with per-target
//!   serialization and fail-fast cancellation
//! - **SecretVault**: generation and opaque storage of sensitive values
//! - **RunState / RunReport**: per-run outcome accumulator and its
//!   read-only projection
//!
//! ## Example
//!
//! ```ignore
//! use orchestrate::{
//!     CheckOutcome, Graph, RunLog, RunOptions, Scheduler, SecretVault,
//!     Step, StepContext, Target,
//! };
//!
//! struct PrivateBridge;
//!
//! impl Step for PrivateBridge {
//!     fn id(&self) -> String { "network.private-bridge".into() }
//!     fn phase(&self) -> &'static str { "network" }
//!     fn target(&self) -> Target { Target::Host }
//!     fn description(&self) -> String { "Create the private bridge".into() }
//!
//!     fn check(&self, ctx: &StepContext) -> anyhow::Result<CheckOutcome> {
//!         let out = ctx.run("incus network show brnet")?;
//!         Ok(if out.success() {
//!             CheckOutcome::AlreadyApplied
//!         } else {
//!             CheckOutcome::NotApplied
//!         })
//!     }
//!
//!     fn action(&self, ctx: &StepContext) -> anyhow::Result<()> {
//!         ctx.run_checked("incus network create brnet --type=bridge")?;
//!         Ok(())
//!     }
//! }
//!
//! let graph = Graph::build(vec![Box::new(PrivateBridge)])?;
//! let vault = SecretVault::new();
//! let scheduler = Scheduler::new(&ssh, &vault);
//! let report = scheduler.run(
//!     &graph,
//!     &RunOptions::default(),
//!     &mut RunLog::disabled(),
//!     &mut orchestrate::NoProgress,
//! )?;
//! ```
//!
//! ## Capability Injection
//!
//! The engine never opens a connection itself. The [`RemoteExecutor`]
//! trait is the only path to the outside world; the caller injects an
//! implementation (SSH in production, fakes in tests). Likewise the
//! engine writes no files except the append-only run log it is handed.

pub mod error;
pub mod graph;
pub mod remote;
pub mod scheduler;
pub mod state;
pub mod step;
pub mod vault;

// Re-export main types at crate root
pub use error::{GraphError, StateError, StepError, VaultError};
pub use graph::Graph;
pub use remote::{ExecError, ExecOutput, RemoteExecutor, Target};
pub use scheduler::{NoProgress, ProgressCallback, RunOptions, Scheduler};
pub use state::{RunLog, RunReport, RunState, RunStatus, StepRecord, StepReport, StepStatus};
pub use step::{BoxedStep, CheckOutcome, Step, StepContext};
pub use vault::{REDACTED, Secret, SecretPolicy, SecretVault};
