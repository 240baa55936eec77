mod clock;
mod controller;
mod discovery;
mod error;
mod events;
mod executor;
mod pacing;
mod probe;
mod signal;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{
    ControllerConfig, SessionController, SessionHandle, SessionReport, SESSION_STATE_KEY,
};
pub use discovery::{ContentDiscovery, DiscoveryConfig, DiscoveryOutcome, DiscoveryState};
pub use error::{ProbeError, ProbeResult, SchedulerError, SchedulerResult};
pub use events::{
    EventKind, EventRecorder, SessionEvent, SessionState, SessionStatus, TerminationReason,
};
pub use executor::{ActionExecutor, ActionOutcome, ExecutorStats, FailureReason, SkipReason};
pub use pacing::PacingPolicy;
pub use probe::{ActionSink, ContainerHandle, DocumentProbe, Eligibility, SinkOutcome, Target};
pub use signal::StopSignal;
