//! Polling with backoff and an optional bound.
//!
//! Both remote state machines the pipeline waits on (collection activation,
//! stack operations, ingestion jobs) are observed by polling. A
//! [`WaitPolicy`] describes the cadence; `timeout: None` waits indefinitely
//! and is only ever set explicitly by configuration or a CLI flag.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use claimstack_shared::{ClaimStackError, Result, WaitSection};

use crate::progress::ProgressReporter;

#[derive(Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    pub initial: Duration,
    pub max_interval: Duration,
    /// Growth factor between polls; `1.0` polls at a fixed interval.
    pub multiplier: f64,
    pub timeout: Option<Duration>,
}

impl WaitPolicy {
    pub fn from_section(section: &WaitSection) -> Self {
        Self {
            initial: section.initial_interval(),
            max_interval: section.max_interval(),
            multiplier: section.multiplier.max(1.0),
            timeout: section.timeout(),
        }
    }

    pub fn fixed(interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            initial: interval,
            max_interval: interval,
            multiplier: 1.0,
            timeout,
        }
    }

    /// Same cadence, no bound.
    pub fn unbounded(mut self) -> Self {
        self.timeout = None;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }
}

/// Result of one check.
#[derive(Debug)]
pub enum PollState<T> {
    Ready(T),
    /// Not there yet; carries the observed state for progress output.
    Pending(String),
}

/// Check until it reports [`PollState::Ready`], an error, or the policy's
/// timeout elapses. The check runs once before the first sleep.
pub async fn poll_until<T, F, Fut>(
    policy: &WaitPolicy,
    what: &str,
    progress: &dyn ProgressReporter,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>>>,
{
    let started = Instant::now();
    let mut interval = policy.initial;

    loop {
        let state = match check().await? {
            PollState::Ready(value) => return Ok(value),
            PollState::Pending(state) => state,
        };

        let elapsed = started.elapsed();
        progress.waiting(what, &state, elapsed);

        let sleep_for = match policy.timeout {
            Some(limit) if elapsed >= limit => {
                return Err(ClaimStackError::Timeout {
                    what: what.to_string(),
                    waited_secs: elapsed.as_secs(),
                });
            }
            Some(limit) => interval.min(limit - elapsed),
            None => interval,
        };

        debug!(what, state = %state, sleep_ms = sleep_for.as_millis() as u64, "still waiting");
        tokio::time::sleep(sleep_for).await;
        interval = policy.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = WaitPolicy {
            initial: Duration::from_secs(30),
            max_interval: Duration::from_secs(120),
            multiplier: 2.0,
            timeout: None,
        };
        assert_eq!(policy.next_interval(Duration::from_secs(30)), Duration::from_secs(60));
        assert_eq!(policy.next_interval(Duration::from_secs(60)), Duration::from_secs(120));
        assert_eq!(policy.next_interval(Duration::from_secs(120)), Duration::from_secs(120));
    }

    #[test]
    fn section_conversion_honours_unbounded_flag() {
        let mut section = WaitSection {
            initial_interval_secs: 30,
            max_interval_secs: 120,
            multiplier: 2.0,
            timeout_secs: 1800,
            unbounded: false,
        };
        assert_eq!(
            WaitPolicy::from_section(&section).timeout,
            Some(Duration::from_secs(1800))
        );
        section.unbounded = true;
        assert_eq!(WaitPolicy::from_section(&section).timeout, None);
    }

    #[tokio::test]
    async fn returns_first_ready_value() {
        let calls = AtomicUsize::new(0);
        let policy = WaitPolicy::fixed(Duration::ZERO, None);
        let value = poll_until(&policy, "thing", &SilentProgress, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(if n < 2 {
                    PollState::Pending("CREATING".into())
                } else {
                    PollState::Ready(n)
                })
            }
        })
        .await
        .expect("ready");
        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let policy = WaitPolicy::fixed(Duration::ZERO, Some(Duration::ZERO));
        let err = poll_until::<(), _, _>(&policy, "collection demo", &SilentProgress, || async {
            Ok(PollState::Pending("CREATING".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ClaimStackError::Timeout { ref what, .. } if what == "collection demo"));
    }

    #[tokio::test]
    async fn check_errors_stop_the_wait() {
        let policy = WaitPolicy::fixed(Duration::ZERO, None);
        let err = poll_until::<(), _, _>(&policy, "job", &SilentProgress, || async {
            Err(ClaimStackError::external("bedrock-agent", "throttled"))
        })
        .await
        .unwrap_err();
        assert!(err.is_external());
    }
}
