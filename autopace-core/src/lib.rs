pub mod config;
pub mod error;
pub mod journal;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use config::{
    load_autopace_config, AutopaceConfig, DiscoverySection, SchedulerSettings, SettingsPatch,
    StorageSection,
};
pub use error::{ConfigError, Result};
pub use journal::{JournalEntry, SqliteEventJournal};
pub use scheduler::{
    ActionOutcome, ActionSink, ContainerHandle, ControllerConfig, DocumentProbe, Eligibility,
    EventKind, PacingPolicy, ProbeError, ProbeResult, SessionController, SessionEvent,
    SessionHandle, SessionReport, SessionState, SessionStatus, SinkOutcome, StopSignal, Target,
    TerminationReason,
};
pub use store::{
    CounterLedger, CounterSnapshot, CounterStore, MemoryCounterStore, SettingsStore,
    SqliteCounterStore, SqliteCounterStoreBuilder, StoreError, StoreResult,
};
