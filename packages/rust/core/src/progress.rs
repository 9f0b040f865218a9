//! Progress callbacks for long-running operations.

use std::time::Duration;

use claimstack_declarations::DeployStep;
use claimstack_storage::StepOutcome;

/// Progress callback for reporting orchestration status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase outside the step sequence.
    fn phase(&self, name: &str);
    /// Called when a deployment step begins.
    fn step_started(&self, step: DeployStep);
    /// Called when a deployment step ends successfully.
    fn step_finished(&self, step: DeployStep, outcome: StepOutcome, detail: &str);
    /// Called after every poll that did not reach the awaited state.
    fn waiting(&self, what: &str, state: &str, elapsed: Duration);
    /// Called per item of a batch (e.g. uploaded documents).
    fn item(&self, label: &str, current: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn step_started(&self, _step: DeployStep) {}
    fn step_finished(&self, _step: DeployStep, _outcome: StepOutcome, _detail: &str) {}
    fn waiting(&self, _what: &str, _state: &str, _elapsed: Duration) {}
    fn item(&self, _label: &str, _current: usize, _total: usize) {}
}
