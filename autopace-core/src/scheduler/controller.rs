use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AutopaceConfig, SchedulerSettings, SettingsPatch};
use crate::store::{CounterLedger, CounterSnapshot, CounterStore, SettingsStore, StoreResult};

use super::clock::{Clock, SystemClock};
use super::discovery::{ContentDiscovery, DiscoveryConfig, DiscoveryOutcome};
use super::error::SchedulerResult;
use super::events::{
    EventBus, EventKind, EventRecorder, SessionEvent, SessionState, SessionStatus,
    TerminationReason,
};
use super::executor::{ActionExecutor, ActionOutcome, ExecutorStats, SkipReason};
use super::pacing::PacingPolicy;
use super::probe::{ActionSink, DocumentProbe, Target};
use super::signal::StopSignal;

pub const SESSION_STATE_KEY: &str = "session_state";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Settings used for any key missing from the store.
    pub defaults: SchedulerSettings,
    pub discovery: DiscoveryConfig,
    /// Wait before looking for the container again when it cannot be found.
    pub container_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            defaults: SchedulerSettings::default(),
            discovery: DiscoveryConfig::default(),
            container_backoff: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    pub fn from_config(config: &AutopaceConfig) -> Self {
        Self {
            defaults: config.defaults.clone(),
            discovery: DiscoveryConfig::from(&config.discovery),
            container_backoff: config.discovery.container_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub reason: TerminationReason,
    pub actions_applied: u64,
    pub daily_count: u64,
    pub total_count: u64,
    pub cooldowns: u32,
    pub discovery_passes: u32,
    pub stats: ExecutorStats,
}

struct Shared {
    stop: StopSignal,
    status: Mutex<SessionStatus>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Host-side command surface, usable while the controller is running.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    settings: SettingsStore,
    defaults: SchedulerSettings,
}

impl SessionHandle {
    /// Requests termination. Takes effect the next time the loop resumes from a
    /// wait. Calling it again has no further effect.
    pub fn stop(&self) {
        if !self.shared.stop.is_stopped() {
            info!("stop requested");
        }
        self.shared.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.shared.stop.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status().clone()
    }

    /// Validates and persists a settings change; the loop picks it up at its next
    /// iteration.
    pub fn update_config(&self, patch: &SettingsPatch) -> StoreResult<SchedulerSettings> {
        let updated = self.settings.update(&self.defaults, patch)?;
        info!(
            min_delay = updated.min_delay_seconds,
            max_delay = updated.max_delay_seconds,
            max_per_session = updated.max_per_session,
            max_per_day = ?updated.max_per_day,
            cooldown = updated.cooldown_enabled,
            "settings updated"
        );
        Ok(updated)
    }

    pub fn settings(&self) -> StoreResult<SchedulerSettings> {
        self.settings.load(&self.defaults)
    }
}

/// Owns the session state machine: `Idle -> Running -> {Stopped, Completed}`.
pub struct SessionController {
    probe: Box<dyn DocumentProbe>,
    sink: Box<dyn ActionSink>,
    store: Arc<dyn CounterStore>,
    ledger: CounterLedger,
    settings: SettingsStore,
    config: ControllerConfig,
    discovery: ContentDiscovery,
    executor: ActionExecutor,
    pacing: PacingPolicy,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    events: EventBus,
    session_id: Uuid,
    session_actions: u64,
    cooldowns: u32,
    discovery_passes: u32,
    idle_batches: u32,
}

impl SessionController {
    pub fn new(
        probe: Box<dyn DocumentProbe>,
        sink: Box<dyn ActionSink>,
        store: Arc<dyn CounterStore>,
        config: ControllerConfig,
    ) -> Self {
        let discovery = ContentDiscovery::new(config.discovery.clone());
        Self {
            probe,
            sink,
            ledger: CounterLedger::new(Arc::clone(&store)),
            settings: SettingsStore::new(Arc::clone(&store)),
            store,
            config,
            discovery,
            executor: ActionExecutor::new(),
            pacing: PacingPolicy::from_entropy(),
            clock: Arc::new(SystemClock),
            shared: Arc::new(Shared {
                stop: StopSignal::new(),
                status: Mutex::new(SessionStatus::default()),
            }),
            events: EventBus::default(),
            session_id: Uuid::new_v4(),
            session_actions: 0,
            cooldowns: 0,
            discovery_passes: 0,
            idle_batches: 0,
        }
    }

    pub fn with_pacing(mut self, pacing: PacingPolicy) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.events.set_recorder(recorder);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
            settings: self.settings.clone(),
            defaults: self.config.defaults.clone(),
        }
    }

    /// New subscription to the event stream. Only events emitted after the call
    /// are delivered; earlier history lives in the journal.
    pub fn events(&mut self) -> UnboundedReceiverStream<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status().clone()
    }

    pub fn stop(&self) {
        self.handle().stop();
    }

    pub fn counters(&self) -> StoreResult<CounterSnapshot> {
        self.ledger.snapshot()
    }

    /// Zeroes the session and daily counters and drops pacing/discovery state.
    /// Ignored while a run is in progress; stop first.
    pub fn reset(&mut self) -> StoreResult<()> {
        if self.shared.status().state == SessionState::Running {
            warn!("reset ignored while session is running");
            return Ok(());
        }
        self.ledger.reset_daily()?;
        self.session_actions = 0;
        self.cooldowns = 0;
        self.discovery_passes = 0;
        self.idle_batches = 0;
        self.discovery.reset();
        self.pacing.reset();
        self.executor.reset();
        let snapshot = self.ledger.snapshot()?;
        {
            let mut status = self.shared.status();
            status.state = SessionState::Idle;
            status.reason = None;
            status.action_count = 0;
            status.daily_count = snapshot.daily_actions;
            status.total_count = snapshot.total_actions;
        }
        self.persist_state(SessionState::Idle);
        self.emit(EventKind::StateChanged, Some("counters reset".to_string()));
        info!(total = snapshot.total_actions, "session counters reset");
        Ok(())
    }

    /// Runs the scheduling loop until a terminal reason is reached. Returns
    /// `None` without doing anything if a run is already in progress.
    pub async fn start(&mut self) -> Option<SessionReport> {
        if self.shared.status().state == SessionState::Running {
            debug!("start ignored; session already running");
            return None;
        }
        self.begin();

        let reason = loop {
            let fault = match AssertUnwindSafe(self.iteration()).catch_unwind().await {
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(reason))) => break reason,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!(error = %fault, session = %self.session_id, "session fault");
            self.emit(EventKind::Fault, Some(fault.clone()));
            break TerminationReason::UnexpectedFault(fault);
        };

        Some(self.finish(reason))
    }

    fn begin(&mut self) {
        self.shared.stop.clear();
        self.session_id = Uuid::new_v4();
        self.session_actions = 0;
        self.cooldowns = 0;
        self.discovery_passes = 0;
        self.idle_batches = 0;
        self.discovery.reset();
        self.executor.reset();
        let snapshot = self.ledger.snapshot().unwrap_or_else(|err| {
            warn!(error = %err, "failed to read counters at start");
            CounterSnapshot::default()
        });
        {
            let mut status = self.shared.status();
            status.state = SessionState::Running;
            status.reason = None;
            status.action_count = 0;
            status.daily_count = snapshot.daily_actions;
            status.total_count = snapshot.total_actions;
        }
        self.persist_state(SessionState::Running);
        info!(
            session = %self.session_id,
            daily = snapshot.daily_actions,
            total = snapshot.total_actions,
            "session started"
        );
        self.emit(EventKind::StateChanged, None);
    }

    fn finish(&mut self, reason: TerminationReason) -> SessionReport {
        let state = reason.terminal_state();
        let status = {
            let mut status = self.shared.status();
            status.state = state;
            status.reason = Some(reason.clone());
            status.clone()
        };
        self.persist_state(state);
        info!(
            session = %self.session_id,
            state = %state,
            reason = reason.code(),
            actions = self.session_actions,
            daily = status.daily_count,
            "session finished: {}",
            reason.describe()
        );
        self.emit(EventKind::StateChanged, Some(reason.describe()));
        SessionReport {
            session_id: self.session_id,
            state,
            reason,
            actions_applied: self.session_actions,
            daily_count: status.daily_count,
            total_count: status.total_count,
            cooldowns: self.cooldowns,
            discovery_passes: self.discovery_passes,
            stats: self.executor.stats().clone(),
        }
    }

    async fn iteration(&mut self) -> SchedulerResult<Option<TerminationReason>> {
        if self.shared.stop.is_stopped() {
            return Ok(Some(TerminationReason::UserStopped));
        }
        let settings = self.settings.load(&self.config.defaults)?;
        self.check_rollover()?;
        if let Some(reason) = self.quota_reached(&settings)? {
            return Ok(Some(reason));
        }

        self.discovery_passes += 1;
        let outcome = self
            .discovery
            .discover(self.probe.as_ref(), &self.shared.stop)
            .await?;
        match outcome {
            DiscoveryOutcome::Targets(targets) => {
                let applied_before = self.session_actions;
                if let Some(reason) = self.process_batch(&settings, targets).await? {
                    return Ok(Some(reason));
                }
                if self.session_actions > applied_before {
                    self.idle_batches = 0;
                    return Ok(None);
                }
                Ok(self.idle_pass().await)
            }
            DiscoveryOutcome::Exhausted { advances, capped } => {
                debug!(advances, capped, "discovery exhausted");
                Ok(Some(TerminationReason::NoMoreTargets))
            }
            DiscoveryOutcome::Cancelled => Ok(Some(TerminationReason::UserStopped)),
            DiscoveryOutcome::ContainerMissing => {
                let backoff = self.config.container_backoff;
                warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    "list container not found; backing off"
                );
                self.emit(
                    EventKind::ContainerMissing,
                    Some(format!("retrying in {}ms", backoff.as_millis())),
                );
                sleep(backoff).await;
                if self.shared.stop.is_stopped() {
                    return Ok(Some(TerminationReason::UserStopped));
                }
                Ok(None)
            }
        }
    }

    async fn process_batch(
        &mut self,
        settings: &SchedulerSettings,
        targets: Vec<Target>,
    ) -> SchedulerResult<Option<TerminationReason>> {
        for target in targets {
            if self.shared.stop.is_stopped() {
                return Ok(Some(TerminationReason::UserStopped));
            }
            if let Some(reason) = self.quota_reached(settings)? {
                return Ok(Some(reason));
            }

            let delay = self.pacing.next_delay(settings);
            let outcome = self
                .executor
                .apply(self.sink.as_ref(), &target, delay, &self.shared.stop)
                .await?;
            let detail = Some(format!("{}: {}", target.id, outcome));
            match outcome {
                ActionOutcome::Applied => {
                    self.session_actions += 1;
                    let snapshot = self.ledger.record_action()?;
                    {
                        let mut status = self.shared.status();
                        status.action_count = self.session_actions;
                        status.daily_count = snapshot.daily_actions;
                        status.total_count = snapshot.total_actions;
                    }
                    info!(
                        target = %target.id,
                        session = self.session_actions,
                        daily = snapshot.daily_actions,
                        total = snapshot.total_actions,
                        "action applied"
                    );
                    self.emit(EventKind::Applied, detail);

                    if self.pacing.register_action(settings) {
                        if let Some(reason) = self.cooldown(settings).await {
                            return Ok(Some(reason));
                        }
                    }
                }
                ActionOutcome::Skipped(SkipReason::Cancelled) => {
                    return Ok(Some(TerminationReason::UserStopped));
                }
                ActionOutcome::Skipped(SkipReason::StateChanged(_)) => {
                    self.emit(EventKind::Skipped, detail);
                }
                ActionOutcome::Failed(_) => {
                    self.emit(EventKind::Failed, detail);
                }
            }
        }
        Ok(None)
    }

    /// A batch that applied nothing still waits out a settle interval and counts
    /// toward the advance cap, so a listing the sink keeps refusing ends the run.
    async fn idle_pass(&mut self) -> Option<TerminationReason> {
        self.idle_batches += 1;
        let cap = self.config.discovery.max_advance_attempts;
        if self.idle_batches >= cap {
            debug!(
                idle_batches = self.idle_batches,
                "no batch applied anything; giving up"
            );
            return Some(TerminationReason::NoMoreTargets);
        }
        debug!(
            idle_batches = self.idle_batches,
            cap,
            "batch applied nothing; settling before the next pass"
        );
        sleep(self.config.discovery.settle_interval).await;
        if self.shared.stop.is_stopped() {
            return Some(TerminationReason::UserStopped);
        }
        None
    }

    async fn cooldown(&mut self, settings: &SchedulerSettings) -> Option<TerminationReason> {
        let duration = self.pacing.cooldown_duration(settings);
        self.cooldowns += 1;
        info!(
            after = self.pacing.consecutive_actions(),
            duration_secs = duration.as_secs(),
            "cooldown started"
        );
        self.emit(
            EventKind::CooldownStarted,
            Some(format!(
                "pausing {}s after {} actions",
                duration.as_secs(),
                self.pacing.consecutive_actions()
            )),
        );
        sleep(duration).await;
        self.pacing.finish_cooldown();
        if self.shared.stop.is_stopped() {
            return Some(TerminationReason::UserStopped);
        }
        self.emit(EventKind::CooldownFinished, None);
        None
    }

    fn check_rollover(&mut self) -> StoreResult<()> {
        let today = self.clock.today();
        if self.ledger.rollover(today)? {
            let daily = self.ledger.daily_actions()?;
            self.shared.status().daily_count = daily;
            info!(date = %today, "daily counter reset for new date");
            self.emit(EventKind::Rollover, Some(today.to_string()));
        }
        Ok(())
    }

    fn quota_reached(
        &self,
        settings: &SchedulerSettings,
    ) -> StoreResult<Option<TerminationReason>> {
        if let Some(cap) = settings.daily_cap() {
            if self.ledger.daily_actions()? >= u64::from(cap) {
                return Ok(Some(TerminationReason::DailyQuotaReached));
            }
        }
        if let Some(cap) = settings.session_cap() {
            if self.session_actions >= u64::from(cap) {
                return Ok(Some(TerminationReason::SessionQuotaReached));
            }
        }
        Ok(None)
    }

    fn persist_state(&self, state: SessionState) {
        if let Err(err) = self.store.set(SESSION_STATE_KEY, state.as_str()) {
            warn!(error = %err, state = %state, "failed to persist session state");
        }
    }

    fn emit(&mut self, kind: EventKind, detail: Option<String>) {
        let status = self.shared.status().clone();
        let event = SessionEvent::new(self.session_id, kind, &status, detail);
        self.events.publish(event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("collaborator panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("collaborator panicked: {message}")
    } else {
        "collaborator panicked".to_string()
    }
}
