//! Execution state - per-run accumulator of step outcomes
//!
//! One `RunState` is created at run start, owned by the scheduler loop
//! (the single writer), and discarded after the report is taken. Step
//! records are append-only: a terminal status never transitions again
//! within a run.

use crate::error::StateError;
use crate::graph::Graph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// Lifecycle status of a step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not yet dispatched
    Pending,
    /// Dispatched to a worker
    Running,
    /// Check reported the effect already present; no action ran
    Skipped,
    /// Dry run: the action would have run
    Planned,
    /// Action (and verify, if any) completed
    Succeeded,
    /// Check error escalated, action failed, verify failed, or timed out
    Failed,
    /// Never dispatched because the run aborted first
    Cancelled,
}

impl StepStatus {
    /// Whether this status is final for the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Planned | Self::Succeeded | Self::Failed | Self::Cancelled
        )
    }

    /// Whether a dependency in this status allows dependents to run.
    /// `Planned` counts so a dry run walks the whole graph.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Skipped | Self::Planned | Self::Succeeded)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Planned => "planned",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Completed,
    Aborted,
}

/// Outcome record for one step
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub status: StepStatus,
    /// Non-secret detail: skip reason, check outcome, notes
    pub detail: Option<String>,
    /// Classified error string for failures
    pub error: Option<String>,
    pub duration: Option<Duration>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            detail: None,
            error: None,
            duration: None,
        }
    }
}

/// Per-run execution state, indexed in step order of the graph.
///
/// The scheduler is the only writer; `record` enforces that terminal
/// statuses are immutable.
pub struct RunState {
    records: Vec<StepRecord>,
    status: RunStatus,
    started_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh state with every step `Pending`
    pub fn new(steps: usize) -> Self {
        Self {
            records: vec![StepRecord::pending(); steps],
            status: RunStatus::InProgress,
            started_at: Utc::now(),
        }
    }

    /// Status of the step at `idx`
    pub fn status(&self, idx: usize) -> StepStatus {
        self.records[idx].status
    }

    /// Overall run status
    pub fn run_status(&self) -> RunStatus {
        self.status
    }

    /// Mark the run aborted (no new steps will be dispatched)
    pub fn abort(&mut self) {
        self.status = RunStatus::Aborted;
    }

    /// Mark the run completed
    pub fn complete(&mut self) {
        if self.status == RunStatus::InProgress {
            self.status = RunStatus::Completed;
        }
    }

    /// Record a status transition for a step.
    ///
    /// Returns an error if the step already reached a terminal status -
    /// outcomes are append-only for the run.
    pub fn record(&mut self, idx: usize, record: StepRecord) -> Result<(), StateError> {
        if self.records[idx].status.is_terminal() {
            return Err(StateError::AlreadyTerminal(idx));
        }
        self.records[idx] = record;
        Ok(())
    }

    /// Indices still `Pending`
    pub fn pending(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == StepStatus::Pending)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether any step is currently `Running`
    pub fn any_running(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.status == StepStatus::Running)
    }

    /// Read-only projection handed to reporting
    pub fn snapshot(&self, graph: &Graph, secret_names: Vec<String>) -> RunReport {
        let steps = self
            .records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let step = graph.step(idx);
                StepReport {
                    id: step.id(),
                    phase: step.phase().to_string(),
                    target: step.target().to_string(),
                    status: record.status,
                    detail: record.detail.clone(),
                    error: record.error.clone(),
                    rollback_hint: if record.status == StepStatus::Failed {
                        step.rollback_hint()
                    } else {
                        None
                    },
                    duration_ms: record.duration.map(|d| d.as_millis() as u64),
                }
            })
            .collect();

        RunReport {
            status: self.status,
            started_at: self.started_at,
            finished_at: Utc::now(),
            steps,
            secret_names,
        }
    }
}

/// Report entry for one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub id: String,
    pub phase: String,
    pub target: String,
    pub status: StepStatus,
    pub detail: Option<String>,
    pub error: Option<String>,
    pub rollback_hint: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Read-only projection of a finished (or aborted) run.
///
/// Carries secret *names* only; values stay in the vault until the
/// handoff renderer asks for them explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub secret_names: Vec<String>,
}

impl RunReport {
    /// Whether the run finished without aborting
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Number of steps with the given status
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Steps that failed, in graph order
    pub fn failures(&self) -> Vec<&StepReport> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .collect()
    }
}

/// Append-only run log - one timestamped line per step transition.
///
/// The only durable artifact the engine produces. Lines are built from
/// step ids, statuses, and error strings; secrets can only reach an
/// error string through their `Display`, which redacts.
pub struct RunLog {
    sink: Box<dyn Write + Send>,
}

impl RunLog {
    /// Log to a file, creating it (append mode)
    pub fn to_file(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            sink: Box::new(file),
        })
    }

    /// Log to an arbitrary writer (tests)
    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self { sink: writer }
    }

    /// Discard all entries
    pub fn disabled() -> Self {
        Self {
            sink: Box::new(std::io::sink()),
        }
    }

    /// Append one transition entry. Log failures must never fail the
    /// run, so I/O errors are downgraded to a warning.
    pub fn transition(&mut self, step_id: &str, status: StepStatus, detail: Option<&str>) {
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let line = match detail {
            Some(d) => format!("{ts} {step_id} {status} - {d}"),
            None => format!("{ts} {step_id} {status}"),
        };
        if let Err(e) = writeln!(self.sink, "{line}") {
            log::warn!("run log write failed: {e}");
        }
    }
}
