use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::error::ProbeResult;
use super::probe::{ActionSink, Eligibility, SinkOutcome, Target};
use super::signal::StopSignal;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The target stopped being eligible between selection and action.
    StateChanged(Eligibility),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SinkRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Skipped(SkipReason),
    Failed(FailureReason),
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutcome::Applied => f.write_str("applied"),
            ActionOutcome::Skipped(SkipReason::StateChanged(now)) => {
                write!(f, "skipped: target state changed to {now}")
            }
            ActionOutcome::Skipped(SkipReason::Cancelled) => f.write_str("skipped: cancelled"),
            ActionOutcome::Failed(FailureReason::SinkRejected(reason)) => {
                write!(f, "failed: action rejected ({reason})")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub total_wait_ms: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &ActionOutcome) {
        match outcome {
            ActionOutcome::Applied => self.applied = self.applied.saturating_add(1),
            ActionOutcome::Skipped(_) => self.skipped = self.skipped.saturating_add(1),
            ActionOutcome::Failed(_) => self.failed = self.failed.saturating_add(1),
        }
    }

    fn record_wait(&mut self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.total_wait_ms = self.total_wait_ms.saturating_add(millis);
    }
}

/// Applies the action to one target, re-checking eligibility around the pacing
/// delay. Never retries; a skipped or failed target may come back in a later
/// discovery pass.
#[derive(Debug, Default)]
pub struct ActionExecutor {
    stats: ExecutorStats,
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }

    pub fn reset(&mut self) {
        self.stats = ExecutorStats::default();
    }

    pub async fn apply(
        &mut self,
        sink: &dyn ActionSink,
        target: &Target,
        delay: Duration,
        stop: &StopSignal,
    ) -> ProbeResult<ActionOutcome> {
        let outcome = self.run(sink, target, delay, stop).await?;
        self.stats.record(&outcome);
        Ok(outcome)
    }

    async fn run(
        &mut self,
        sink: &dyn ActionSink,
        target: &Target,
        delay: Duration,
        stop: &StopSignal,
    ) -> ProbeResult<ActionOutcome> {
        let before = sink.revalidate(target).await?;
        if before != Eligibility::Eligible {
            debug!(target = %target.id, eligibility = %before, "target changed before delay");
            return Ok(ActionOutcome::Skipped(SkipReason::StateChanged(before)));
        }

        debug!(target = %target.id, delay_ms = delay.as_millis() as u64, "pacing before action");
        sleep(delay).await;
        self.stats.record_wait(delay);
        if stop.is_stopped() {
            return Ok(ActionOutcome::Skipped(SkipReason::Cancelled));
        }

        let after = sink.revalidate(target).await?;
        if after != Eligibility::Eligible {
            debug!(target = %target.id, eligibility = %after, "target changed during delay");
            return Ok(ActionOutcome::Skipped(SkipReason::StateChanged(after)));
        }

        match sink.apply(target).await? {
            SinkOutcome::Applied => Ok(ActionOutcome::Applied),
            SinkOutcome::Rejected(reason) => {
                warn!(target = %target.id, reason = %reason, "action rejected");
                Ok(ActionOutcome::Failed(FailureReason::SinkRejected(reason)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;

    struct ScriptedSink {
        verdicts: RefCell<VecDeque<Eligibility>>,
        response: SinkOutcome,
        applied: RefCell<Vec<String>>,
    }

    impl ScriptedSink {
        fn new(verdicts: &[Eligibility], response: SinkOutcome) -> Self {
            Self {
                verdicts: RefCell::new(verdicts.iter().copied().collect()),
                response,
                applied: RefCell::new(Vec::new()),
            }
        }
    }

    #[async_trait(?Send)]
    impl ActionSink for ScriptedSink {
        async fn apply(&self, target: &Target) -> ProbeResult<SinkOutcome> {
            self.applied.borrow_mut().push(target.id.clone());
            Ok(self.response.clone())
        }

        async fn revalidate(&self, _target: &Target) -> ProbeResult<Eligibility> {
            Ok(self
                .verdicts
                .borrow_mut()
                .pop_front()
                .unwrap_or(Eligibility::Eligible))
        }
    }

    fn target() -> Target {
        Target::new("row-1", Eligibility::Eligible).with_label("someone")
    }

    #[tokio::test(start_paused = true)]
    async fn applies_after_waiting_the_delay() {
        let sink = ScriptedSink::new(&[], SinkOutcome::Applied);
        let mut executor = ActionExecutor::new();
        let started = tokio::time::Instant::now();
        let outcome = executor
            .apply(&sink, &target(), Duration::from_secs(5), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Applied);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(sink.applied.borrow().as_slice(), ["row-1".to_string()]);
        assert_eq!(executor.stats().total_wait_ms, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_target_is_skipped_without_waiting() {
        let sink = ScriptedSink::new(&[Eligibility::Ineligible], SinkOutcome::Applied);
        let mut executor = ActionExecutor::new();
        let started = tokio::time::Instant::now();
        let outcome = executor
            .apply(&sink, &target(), Duration::from_secs(5), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Skipped(SkipReason::StateChanged(Eligibility::Ineligible))
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sink.applied.borrow().is_empty());
        assert_eq!(executor.stats().total_wait_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_delay_is_skipped() {
        let sink = ScriptedSink::new(
            &[Eligibility::Eligible, Eligibility::AlreadyProcessed],
            SinkOutcome::Applied,
        );
        let mut executor = ActionExecutor::new();
        let outcome = executor
            .apply(&sink, &target(), Duration::from_secs(2), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Skipped(SkipReason::StateChanged(Eligibility::AlreadyProcessed))
        );
        assert!(sink.applied.borrow().is_empty());
        assert_eq!(executor.stats().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_a_failure() {
        let sink = ScriptedSink::new(&[], SinkOutcome::Rejected("rate limited".into()));
        let mut executor = ActionExecutor::new();
        let outcome = executor
            .apply(&sink, &target(), Duration::from_secs(1), &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Failed(FailureReason::SinkRejected("rate limited".into()))
        );
        assert_eq!(executor.stats().failed, 1);
        assert_eq!(executor.stats().applied, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_delay_cancels_the_action() {
        let sink = ScriptedSink::new(&[], SinkOutcome::Applied);
        let stop = StopSignal::new();
        stop.stop();
        let mut executor = ActionExecutor::new();
        let outcome = executor
            .apply(&sink, &target(), Duration::from_secs(3), &stop)
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::Cancelled));
        assert!(sink.applied.borrow().is_empty());
    }
}
