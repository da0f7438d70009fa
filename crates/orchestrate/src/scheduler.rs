//! Scheduler - drives steps from `Pending` to a terminal status
//!
//! A bounded pool of worker threads executes steps; every state
//! transition flows through the single dispatch loop, so readiness
//! decisions never race. Failure raises a run-level abort flag: in-flight
//! steps finish their current suboperation (never force-killed), nothing
//! new is dispatched, and unreached steps end `Cancelled`.

use crate::error::StepError;
use crate::graph::Graph;
use crate::remote::{ExecError, RemoteExecutor};
use crate::state::{RunLog, RunReport, RunState, RunStatus, StepRecord, StepStatus};
use crate::step::{CheckOutcome, Step, StepContext};
use crate::vault::SecretVault;
use anyhow::{Context as _, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Options for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Run checks only; actions and verifies never execute
    pub dry_run: bool,
    /// Bound on concurrently executing steps
    pub max_workers: usize,
    /// Time budget for steps that do not declare their own
    pub step_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_workers: 4,
            step_timeout: Duration::from_secs(600),
        }
    }
}

/// Progress callback for step lifecycle events.
///
/// Called from the dispatch loop only, never from workers.
pub trait ProgressCallback: Send {
    /// A step was dispatched to a worker
    fn on_step_start(&mut self, id: &str, description: &str);

    /// A step reached a terminal status
    fn on_step_finish(&mut self, id: &str, status: StepStatus, detail: Option<&str>);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_step_start(&mut self, _id: &str, _description: &str) {}
    fn on_step_finish(&mut self, _id: &str, _status: StepStatus, _detail: Option<&str>) {}
}

/// Drives a graph of steps to completion against a remote target.
pub struct Scheduler<'a> {
    remote: &'a dyn RemoteExecutor,
    vault: &'a SecretVault,
}

impl<'a> Scheduler<'a> {
    pub fn new(remote: &'a dyn RemoteExecutor, vault: &'a SecretVault) -> Self {
        Self { remote, vault }
    }

    /// Run every step of the graph, respecting dependencies, the worker
    /// bound, per-target serialization, and fail-fast cancellation.
    ///
    /// Never returns an error for a step failure - those are recorded in
    /// the report and abort the run. `Err` means the engine itself broke
    /// its invariants.
    pub fn run(
        &self,
        graph: &Graph,
        opts: &RunOptions,
        run_log: &mut RunLog,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RunReport> {
        let mut state = RunState::new(graph.len());
        let abort = AtomicBool::new(false);
        let workers = opts.max_workers.max(1);
        let (tx, rx) = mpsc::channel::<(usize, StepRecord)>();
        // Targets with a step currently executing; same-target steps
        // wait their turn even when otherwise independent
        let mut busy: HashSet<String> = HashSet::new();
        let mut in_flight = 0usize;

        std::thread::scope(|scope| -> Result<()> {
            loop {
                if !abort.load(Ordering::SeqCst) {
                    for idx in graph.ready(&state) {
                        if in_flight >= workers {
                            break;
                        }
                        let step = graph.step(idx);
                        let target_key = step.target().key();
                        if busy.contains(&target_key) {
                            continue;
                        }

                        busy.insert(target_key);
                        in_flight += 1;
                        state
                            .record(idx, running_record())
                            .context("dispatching a terminal step")?;
                        run_log.transition(&step.id(), StepStatus::Running, None);
                        progress.on_step_start(&step.id(), &step.description());
                        log::debug!("dispatch {}", step.id());

                        let tx = tx.clone();
                        let abort = &abort;
                        let remote = self.remote;
                        let vault = self.vault;
                        let budget = step.timeout().unwrap_or(opts.step_timeout);
                        let dry_run = opts.dry_run;
                        scope.spawn(move || {
                            let record =
                                execute_step(step, remote, vault, budget, dry_run, abort);
                            // Receiver outlives every worker; a send can
                            // only fail if the run already tore down
                            let _ = tx.send((idx, record));
                        });
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let (idx, record) = rx.recv().context("worker channel closed")?;
                in_flight -= 1;
                busy.remove(&graph.step(idx).target().key());

                if record.status == StepStatus::Failed {
                    abort.store(true, Ordering::SeqCst);
                    state.abort();
                    log::error!(
                        "{} failed: {}",
                        graph.step(idx).id(),
                        record.error.as_deref().unwrap_or("unknown error")
                    );
                }

                run_log.transition(
                    &graph.step(idx).id(),
                    record.status,
                    record.error.as_deref().or(record.detail.as_deref()),
                );
                progress.on_step_finish(
                    &graph.step(idx).id(),
                    record.status,
                    record.detail.as_deref(),
                );
                state
                    .record(idx, record)
                    .context("recording a completed step")?;
            }
            Ok(())
        })?;

        // Whatever is still pending was never dispatched: the run
        // aborted before its dependencies were satisfied
        for idx in state.pending() {
            state
                .record(idx, cancelled_record("dependencies not satisfied"))
                .context("cancelling an unreached step")?;
            run_log.transition(&graph.step(idx).id(), StepStatus::Cancelled, None);
            progress.on_step_finish(&graph.step(idx).id(), StepStatus::Cancelled, None);
        }

        if state.run_status() == RunStatus::InProgress {
            state.complete();
        }

        Ok(state.snapshot(graph, self.vault.names()))
    }
}

fn running_record() -> StepRecord {
    StepRecord {
        status: StepStatus::Running,
        detail: None,
        error: None,
        duration: None,
    }
}

fn cancelled_record(detail: &str) -> StepRecord {
    StepRecord {
        status: StepStatus::Cancelled,
        detail: Some(detail.to_string()),
        error: None,
        duration: None,
    }
}

/// Execute one step inside a worker: check, then (unless dry-run,
/// already applied, or aborted) action and verify. All errors are
/// caught here and classified into a record - nothing propagates past
/// the worker boundary.
fn execute_step(
    step: &dyn Step,
    remote: &dyn RemoteExecutor,
    vault: &SecretVault,
    budget: Duration,
    dry_run: bool,
    abort: &AtomicBool,
) -> StepRecord {
    let started = Instant::now();
    let ctx = StepContext::new(remote, vault, step.target(), budget);

    let (outcome, check_note) = match step.check(&ctx) {
        Ok(outcome) => (outcome, None),
        Err(err) => {
            if is_timeout(&err) {
                return failed(StepError::Timeout(budget, "check"), started);
            }
            // A failed probe is not an action failure: treat as
            // indeterminate and re-run conservatively
            log::warn!("{}: check failed, assuming not applied: {err:#}", step.id());
            (
                CheckOutcome::Indeterminate,
                Some(format!("check error: {err:#}")),
            )
        }
    };

    if outcome == CheckOutcome::AlreadyApplied {
        return StepRecord {
            status: StepStatus::Skipped,
            detail: Some("already applied".to_string()),
            error: None,
            duration: Some(started.elapsed()),
        };
    }

    if dry_run {
        return StepRecord {
            status: StepStatus::Planned,
            detail: Some(
                check_note.unwrap_or_else(|| format!("check: {outcome}, action would run")),
            ),
            error: None,
            duration: Some(started.elapsed()),
        };
    }

    // Abort is observed between suboperations; a set flag means no new
    // suboperation starts
    if abort.load(Ordering::SeqCst) {
        return StepRecord {
            status: StepStatus::Cancelled,
            detail: Some("run aborted before action".to_string()),
            error: None,
            duration: Some(started.elapsed()),
        };
    }

    if let Err(err) = step.action(&ctx) {
        let classified = if is_timeout(&err) {
            StepError::Timeout(budget, "action")
        } else {
            StepError::Action(format!("{err:#}"))
        };
        return failed(classified, started);
    }

    if abort.load(Ordering::SeqCst) {
        // The mutation completed; only the postcondition went unchecked
        return StepRecord {
            status: StepStatus::Succeeded,
            detail: Some("verify skipped: run aborted".to_string()),
            error: None,
            duration: Some(started.elapsed()),
        };
    }

    if let Err(err) = step.verify(&ctx) {
        let classified = if is_timeout(&err) {
            StepError::Timeout(budget, "verify")
        } else {
            StepError::Verify(format!("{err:#}"))
        };
        return failed(classified, started);
    }

    StepRecord {
        status: StepStatus::Succeeded,
        detail: check_note,
        error: None,
        duration: Some(started.elapsed()),
    }
}

fn failed(error: StepError, started: Instant) -> StepRecord {
    StepRecord {
        status: StepStatus::Failed,
        detail: None,
        error: Some(error.to_string()),
        duration: Some(started.elapsed()),
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<ExecError>(), Some(ExecError::Timeout(_))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ExecOutput, Target};
    use crate::step::BoxedStep;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    /// In-memory stand-in for a remote host: a set of applied step ids
    #[derive(Default)]
    struct FakeRemote {
        applied: Mutex<HashSet<String>>,
    }

    impl FakeRemote {
        fn is_applied(&self, id: &str) -> bool {
            self.applied.lock().unwrap().contains(id)
        }
        fn apply(&self, id: &str) {
            self.applied.lock().unwrap().insert(id.to_string());
        }
    }

    struct NullExecutor;

    impl RemoteExecutor for NullExecutor {
        fn execute(
            &self,
            _target: &Target,
            _command: &str,
            _timeout: Duration,
        ) -> Result<ExecOutput, ExecError> {
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

    /// Executor that always times out, for timeout classification
    struct TimeoutExecutor;

    impl RemoteExecutor for TimeoutExecutor {
        fn execute(
            &self,
            _target: &Target,
            _command: &str,
            timeout: Duration,
        ) -> Result<ExecOutput, ExecError> {
            Err(ExecError::Timeout(timeout))
        }
        fn upload(
            &self,
            _target: &Target,
            _content: &str,
            _remote_path: &str,
            _mode: &str,
            _timeout: Duration,
        ) -> Result<(), ExecError> {
            Err(ExecError::Timeout(timeout_default()))
        }
    }

    fn timeout_default() -> Duration {
        Duration::from_millis(10)
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Succeed,
        FailAction,
        FailVerify,
        SlowAction(Duration),
        TimeoutAction,
    }

    struct TestStep {
        id: String,
        deps: Vec<String>,
        target: Target,
        behavior: Behavior,
        remote_state: Arc<FakeRemote>,
        action_count: Arc<AtomicUsize>,
        /// (start, end) of each action invocation, for overlap checks
        windows: Arc<Mutex<Vec<(Instant, Instant)>>>,
    }

    impl Step for TestStep {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn phase(&self) -> &'static str {
            "test"
        }
        fn target(&self) -> Target {
            self.target.clone()
        }
        fn depends_on(&self) -> Vec<String> {
            self.deps.clone()
        }
        fn description(&self) -> String {
            self.id.clone()
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }
        fn rollback_hint(&self) -> Option<String> {
            Some(format!("undo {}", self.id))
        }
        fn check(&self, _ctx: &StepContext) -> Result<CheckOutcome> {
            if self.remote_state.is_applied(&self.id) {
                Ok(CheckOutcome::AlreadyApplied)
            } else {
                Ok(CheckOutcome::NotApplied)
            }
        }
        fn action(&self, ctx: &StepContext) -> Result<()> {
            let start = Instant::now();
            self.action_count.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::FailAction => anyhow::bail!("deliberate failure"),
                Behavior::SlowAction(d) => std::thread::sleep(d),
                Behavior::TimeoutAction => {
                    ctx.run("anything")?;
                }
                _ => {}
            }
            self.windows.lock().unwrap().push((start, Instant::now()));
            self.remote_state.apply(&self.id);
            Ok(())
        }
        fn verify(&self, _ctx: &StepContext) -> Result<()> {
            if self.behavior == Behavior::FailVerify {
                anyhow::bail!("postcondition does not hold");
            }
            Ok(())
        }
    }

    struct Harness {
        remote_state: Arc<FakeRemote>,
        action_count: Arc<AtomicUsize>,
        windows: Arc<Mutex<Vec<(Instant, Instant)>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                remote_state: Arc::new(FakeRemote::default()),
                action_count: Arc::new(AtomicUsize::new(0)),
                windows: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn step(&self, id: &str, deps: &[&str], target: Target, behavior: Behavior) -> BoxedStep {
            Box::new(TestStep {
                id: id.to_string(),
                deps: deps.iter().map(|d| (*d).to_string()).collect(),
                target,
                behavior,
                remote_state: Arc::clone(&self.remote_state),
                action_count: Arc::clone(&self.action_count),
                windows: Arc::clone(&self.windows),
            })
        }

        fn actions(&self) -> usize {
            self.action_count.load(Ordering::SeqCst)
        }
    }

    fn run_graph(graph: &Graph, opts: &RunOptions) -> RunReport {
        let vault = SecretVault::new();
        let scheduler = Scheduler::new(&NullExecutor, &vault);
        scheduler
            .run(graph, opts, &mut RunLog::disabled(), &mut NoProgress)
            .unwrap()
    }

    fn status_of(report: &RunReport, id: &str) -> StepStatus {
        report
            .steps
            .iter()
            .find(|s| s.id == id)
            .unwrap_or_else(|| panic!("no step {id}"))
            .status
    }

    #[test]
    fn empty_graph_completes() {
        let graph = Graph::build(Vec::new()).unwrap();
        let report = run_graph(&graph, &RunOptions::default());
        assert!(report.is_success());
        assert!(report.steps.is_empty());
    }

    #[test]
    fn all_steps_succeed_in_dependency_order() {
        let h = Harness::new();
        let graph = Graph::build(vec![
            h.step("a", &[], Target::Host, Behavior::Succeed),
            h.step("b", &["a"], Target::Host, Behavior::Succeed),
            h.step("c", &["b"], Target::Host, Behavior::Succeed),
        ])
        .unwrap();

        let report = run_graph(&graph, &RunOptions::default());
        assert!(report.is_success());
        assert_eq!(report.count(StepStatus::Succeeded), 3);
        assert_eq!(h.actions(), 3);
    }

    #[test]
    fn failure_cancels_dependents_but_siblings_complete() {
        // The spec's example scenario: postgres.install fails on its own
        // target; its dependent is cancelled while the container chain
        // completes normally
        let h = Harness::new();
        let graph = Graph::build(vec![
            h.step("net.bridge", &[], Target::Host, Behavior::Succeed),
            h.step(
                "container.dev",
                &["net.bridge"],
                Target::Container("dev".to_string()),
                Behavior::SlowAction(Duration::from_millis(100)),
            ),
            h.step(
                "postgres.install",
                &[],
                Target::Container("postgres".to_string()),
                Behavior::FailAction,
            ),
            h.step(
                "postgres.create-db",
                &["postgres.install"],
                Target::Container("postgres".to_string()),
                Behavior::Succeed,
            ),
        ])
        .unwrap();

        let report = run_graph(
            &graph,
            &RunOptions {
                max_workers: 2,
                ..Default::default()
            },
        );

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(status_of(&report, "postgres.install"), StepStatus::Failed);
        assert_eq!(
            status_of(&report, "postgres.create-db"),
            StepStatus::Cancelled
        );
        // The failure report carries the rollback hint
        let failure = &report.failures()[0];
        assert_eq!(
            failure.rollback_hint.as_deref(),
            Some("undo postgres.install")
        );
    }

    #[test]
    fn transitive_dependents_of_a_failure_never_run() {
        let h = Harness::new();
        let graph = Graph::build(vec![
            h.step("x", &[], Target::Host, Behavior::FailAction),
            h.step("y", &["x"], Target::Host, Behavior::Succeed),
            h.step("z", &["y"], Target::Host, Behavior::Succeed),
        ])
        .unwrap();

        let report = run_graph(&graph, &RunOptions::default());
        assert_eq!(status_of(&report, "y"), StepStatus::Cancelled);
        assert_eq!(status_of(&report, "z"), StepStatus::Cancelled);
        // Only x's action ever ran
        assert_eq!(h.actions(), 1);
    }

    #[test]
    fn idempotent_restart_skips_everything() {
        let h = Harness::new();
        let build = || {
            Graph::build(vec![
                h.step("a", &[], Target::Host, Behavior::Succeed),
                h.step("b", &["a"], Target::Host, Behavior::Succeed),
                h.step(
                    "c",
                    &["a"],
                    Target::Container("dev".to_string()),
                    Behavior::Succeed,
                ),
            ])
            .unwrap()
        };

        let first = run_graph(&build(), &RunOptions::default());
        assert!(first.is_success());
        assert_eq!(h.actions(), 3);

        // Second run against the same remote state: every check reports
        // already-applied, no action re-runs
        let second = run_graph(&build(), &RunOptions::default());
        assert!(second.is_success());
        assert_eq!(h.actions(), 3, "no action may run twice");
        assert_eq!(second.count(StepStatus::Skipped), 3);
        assert_eq!(second.count(StepStatus::Succeeded), 0);
    }

    #[test]
    fn same_target_actions_never_overlap() {
        let h = Harness::new();
        let slow = Behavior::SlowAction(Duration::from_millis(60));
        let graph = Graph::build(vec![
            h.step("p1", &[], Target::Container("db".to_string()), slow),
            h.step("p2", &[], Target::Container("db".to_string()), slow),
            h.step("p3", &[], Target::Container("db".to_string()), slow),
        ])
        .unwrap();

        let report = run_graph(
            &graph,
            &RunOptions {
                max_workers: 4,
                ..Default::default()
            },
        );
        assert!(report.is_success());

        let mut windows = h.windows.lock().unwrap().clone();
        windows.sort_by_key(|w| w.0);
        for pair in windows.windows(2) {
            assert!(
                pair[0].1 <= pair[1].0,
                "actions on the same target overlapped"
            );
        }
    }

    #[test]
    fn different_targets_run_concurrently() {
        let h = Harness::new();
        let slow = Behavior::SlowAction(Duration::from_millis(80));
        let graph = Graph::build(vec![
            h.step("a", &[], Target::Container("one".to_string()), slow),
            h.step("b", &[], Target::Container("two".to_string()), slow),
        ])
        .unwrap();

        let started = Instant::now();
        let report = run_graph(
            &graph,
            &RunOptions {
                max_workers: 2,
                ..Default::default()
            },
        );
        assert!(report.is_success());
        // Serial execution would take at least 160ms
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "independent targets did not run concurrently"
        );
    }

    #[test]
    fn dry_run_never_mutates() {
        let h = Harness::new();
        let graph = Graph::build(vec![
            h.step("a", &[], Target::Host, Behavior::Succeed),
            h.step("b", &["a"], Target::Host, Behavior::FailVerify),
        ])
        .unwrap();

        let report = run_graph(
            &graph,
            &RunOptions {
                dry_run: true,
                ..Default::default()
            },
        );

        assert!(report.is_success());
        assert_eq!(h.actions(), 0, "dry run must not invoke actions");
        assert_eq!(status_of(&report, "a"), StepStatus::Planned);
        // Planned dependencies let the rest of the graph be planned too
        assert_eq!(status_of(&report, "b"), StepStatus::Planned);
        assert!(!h.remote_state.is_applied("a"));
    }

    #[test]
    fn dry_run_reports_already_applied_as_skipped() {
        let h = Harness::new();
        h.remote_state.apply("a");
        let graph = Graph::build(vec![h.step("a", &[], Target::Host, Behavior::Succeed)]).unwrap();

        let report = run_graph(
            &graph,
            &RunOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        assert_eq!(status_of(&report, "a"), StepStatus::Skipped);
    }

    #[test]
    fn verify_failure_fails_the_step_and_aborts() {
        let h = Harness::new();
        let graph = Graph::build(vec![
            h.step("a", &[], Target::Host, Behavior::FailVerify),
            h.step("b", &["a"], Target::Host, Behavior::Succeed),
        ])
        .unwrap();

        let report = run_graph(&graph, &RunOptions::default());
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(status_of(&report, "a"), StepStatus::Failed);
        let failure = &report.failures()[0];
        assert!(failure.error.as_deref().unwrap().contains("verification failed"));
        assert_eq!(status_of(&report, "b"), StepStatus::Cancelled);
    }

    #[test]
    fn timeouts_are_classified_distinctly() {
        let h = Harness::new();
        let graph =
            Graph::build(vec![h.step("t", &[], Target::Host, Behavior::TimeoutAction)]).unwrap();

        let vault = SecretVault::new();
        let scheduler = Scheduler::new(&TimeoutExecutor, &vault);
        let report = scheduler
            .run(
                &graph,
                &RunOptions::default(),
                &mut RunLog::disabled(),
                &mut NoProgress,
            )
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        let failure = &report.failures()[0];
        assert!(failure.error.as_deref().unwrap().contains("timed out"));
    }

    #[test]
    fn run_log_never_contains_secret_plaintext() {
        use std::io::Write;
        use std::sync::{Arc as A, Mutex as M};

        #[derive(Clone)]
        struct SharedBuf(A<M<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        struct GeneratingStep;
        impl Step for GeneratingStep {
            fn id(&self) -> String {
                "secrets.db".to_string()
            }
            fn phase(&self) -> &'static str {
                "test"
            }
            fn target(&self) -> Target {
                Target::Host
            }
            fn description(&self) -> String {
                "generate a credential".to_string()
            }
            fn check(&self, _ctx: &StepContext) -> Result<CheckOutcome> {
                Ok(CheckOutcome::NotApplied)
            }
            fn action(&self, ctx: &StepContext) -> Result<()> {
                ctx.vault()
                    .generate("db.password", &crate::vault::SecretPolicy::default())?;
                Ok(())
            }
        }

        let buf = SharedBuf(A::new(M::new(Vec::new())));
        let vault = SecretVault::new();
        let graph = Graph::build(vec![Box::new(GeneratingStep) as BoxedStep]).unwrap();
        let scheduler = Scheduler::new(&NullExecutor, &vault);
        let mut run_log = RunLog::to_writer(Box::new(buf.clone()));
        let report = scheduler
            .run(&graph, &RunOptions::default(), &mut run_log, &mut NoProgress)
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.secret_names, vec!["db.password"]);

        let plaintext = vault.get("db.password").unwrap().reveal().to_string();
        let log_text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(!log_text.is_empty());
        assert!(!log_text.contains(&plaintext));
    }

    #[test]
    fn check_error_is_treated_as_indeterminate_and_rerun() {
        struct FlakyCheck {
            count: Arc<AtomicUsize>,
        }
        impl Step for FlakyCheck {
            fn id(&self) -> String {
                "flaky".to_string()
            }
            fn phase(&self) -> &'static str {
                "test"
            }
            fn target(&self) -> Target {
                Target::Host
            }
            fn description(&self) -> String {
                "flaky probe".to_string()
            }
            fn check(&self, _ctx: &StepContext) -> Result<CheckOutcome> {
                anyhow::bail!("connection reset by peer")
            }
            fn action(&self, _ctx: &StepContext) -> Result<()> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let graph = Graph::build(vec![Box::new(FlakyCheck {
            count: Arc::clone(&count),
        }) as BoxedStep])
        .unwrap();
        let report = run_graph(&graph, &RunOptions::default());

        // Probe failure never silently skips: the action ran
        assert!(report.is_success());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let step = &report.steps[0];
        assert!(step.detail.as_deref().unwrap().contains("check error"));
    }
}
