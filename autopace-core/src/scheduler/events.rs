use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Completed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(SessionState::Idle),
            "running" => Ok(SessionState::Running),
            "stopped" => Ok(SessionState::Stopped),
            "completed" => Ok(SessionState::Completed),
            other => Err(format!("invalid session state: {other}")),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    DailyQuotaReached,
    SessionQuotaReached,
    NoMoreTargets,
    UserStopped,
    UnexpectedFault(String),
}

impl TerminationReason {
    pub fn code(&self) -> &'static str {
        match self {
            TerminationReason::DailyQuotaReached => "daily_quota_reached",
            TerminationReason::SessionQuotaReached => "session_quota_reached",
            TerminationReason::NoMoreTargets => "no_more_targets",
            TerminationReason::UserStopped => "user_stopped",
            TerminationReason::UnexpectedFault(_) => "unexpected_fault",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TerminationReason::DailyQuotaReached => "daily action limit reached".to_string(),
            TerminationReason::SessionQuotaReached => "session action limit reached".to_string(),
            TerminationReason::NoMoreTargets => {
                "list stopped growing and no eligible items remain".to_string()
            }
            TerminationReason::UserStopped => "stopped on request".to_string(),
            TerminationReason::UnexpectedFault(message) => {
                format!("stopped after fault: {message}")
            }
        }
    }

    /// `Stopped` for interruptions, `Completed` for graceful ends.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            TerminationReason::UserStopped | TerminationReason::UnexpectedFault(_) => {
                SessionState::Stopped
            }
            _ => SessionState::Completed,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChanged,
    Applied,
    Skipped,
    Failed,
    CooldownStarted,
    CooldownFinished,
    ContainerMissing,
    Rollover,
    Fault,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateChanged => "state_changed",
            EventKind::Applied => "applied",
            EventKind::Skipped => "skipped",
            EventKind::Failed => "failed",
            EventKind::CooldownStarted => "cooldown_started",
            EventKind::CooldownFinished => "cooldown_finished",
            EventKind::ContainerMissing => "container_missing",
            EventKind::Rollover => "rollover",
            EventKind::Fault => "fault",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, shared with the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reason: Option<TerminationReason>,
    pub action_count: u64,
    pub daily_count: u64,
    pub total_count: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            reason: None,
            action_count: 0,
            daily_count: 0,
            total_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    pub state: SessionState,
    pub kind: EventKind,
    pub reason: Option<TerminationReason>,
    pub action_count: u64,
    pub daily_count: u64,
    pub total_count: u64,
    pub detail: Option<String>,
}

impl SessionEvent {
    pub fn new(
        session_id: Uuid,
        kind: EventKind,
        status: &SessionStatus,
        detail: Option<String>,
    ) -> Self {
        Self {
            session_id,
            at: Utc::now(),
            state: status.state,
            kind,
            reason: status.reason.clone(),
            action_count: status.action_count,
            daily_count: status.daily_count,
            total_count: status.total_count,
            detail,
        }
    }
}

/// Durable sink for emitted events, used to replay history after a restart.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: &SessionEvent) -> StoreResult<()>;
}

/// Fans events out to every live subscriber and to the optional recorder.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    recorder: Option<Arc<dyn EventRecorder>>,
}

impl EventBus {
    pub(crate) fn set_recorder(&mut self, recorder: Arc<dyn EventRecorder>) {
        self.recorder = Some(recorder);
    }

    pub(crate) fn subscribe(&mut self) -> UnboundedReceiverStream<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    pub(crate) fn publish(&mut self, event: SessionEvent) {
        debug!(
            kind = %event.kind,
            state = %event.state,
            actions = event.action_count,
            daily = event.daily_count,
            detail = event.detail.as_deref().unwrap_or(""),
            "session event"
        );
        if let Some(recorder) = self.recorder.as_ref() {
            if let Err(err) = recorder.record(&event) {
                warn!(error = %err, kind = %event.kind, "failed to journal session event");
            }
        }
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}
