//! Progress reporting for provisioning runs
//!
//! Bridges the engine's progress callbacks to an indicatif bar plus
//! per-step status lines.

use indicatif::{ProgressBar, ProgressStyle};
use orchestrate::{ProgressCallback, StepStatus};

use crate::ui;

/// Terminal progress for a run: one bar across all steps, a line per
/// completed step.
pub struct RunProgress {
    bar: ProgressBar,
    verbose: bool,
}

impl RunProgress {
    pub fn new(total_steps: u64, verbose: bool) -> Self {
        let bar = ProgressBar::new(total_steps);
        bar.set_style(
            ProgressStyle::with_template("  {bar:30.cyan/dim} {pos}/{len} {msg}")
                .expect("static template"),
        );
        Self { bar, verbose }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressCallback for RunProgress {
    fn on_step_start(&mut self, id: &str, description: &str) {
        self.bar.set_message(id.to_string());
        if self.verbose {
            self.bar.suspend(|| ui::dim(description));
        }
    }

    fn on_step_finish(&mut self, id: &str, status: StepStatus, detail: Option<&str>) {
        self.bar.inc(1);
        let symbol = ui::status_symbol(status);
        let line = match detail {
            Some(d) if self.verbose || status == StepStatus::Failed => {
                format!("{symbol} {id} ({d})")
            }
            _ => format!("{symbol} {id}"),
        };
        self.bar.suspend(|| println!("  {line}"));
    }
}
