//! Terminal progress for long-running operations.

use std::time::Duration;

use claimstack_core::{ProgressReporter, StepOutcome};
use claimstack_declarations::DeployStep;
use indicatif::{ProgressBar, ProgressStyle};

/// CLI progress reporter using an indicatif spinner.
pub(crate) struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    pub(crate) fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn step_started(&self, step: DeployStep) {
        self.spinner.set_message(format!(
            "Step {}/{} [{step}] {}",
            step.number(),
            DeployStep::ALL.len(),
            step.description()
        ));
    }

    fn step_finished(&self, step: DeployStep, outcome: StepOutcome, detail: &str) {
        let mark = match outcome {
            StepOutcome::Unchanged => "=",
            _ => "✓",
        };
        self.spinner
            .println(format!("  {mark} {:<20} {detail}", step.as_str()));
    }

    fn waiting(&self, what: &str, state: &str, elapsed: Duration) {
        self.spinner.set_message(format!(
            "Waiting for {what}: {state} ({}s)",
            elapsed.as_secs()
        ));
    }

    fn item(&self, label: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Uploading [{current}/{total}] {label}"));
    }
}
