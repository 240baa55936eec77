use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autopace_core::scheduler::{SessionState, SESSION_STATE_KEY};
use autopace_core::{
    load_autopace_config, AutopaceConfig, CounterLedger, CounterSnapshot, CounterStore,
    JournalEntry, SchedulerSettings, SettingsPatch, SettingsStore, SqliteCounterStore,
    SqliteEventJournal,
};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod commands;

use commands::simulate::{simulate, SimulateArgs};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] autopace_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] autopace_core::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Paced action scheduler control interface", long_about = None)]
pub struct Cli {
    /// Path to autopace.toml
    #[arg(long, default_value = "configs/autopace.toml")]
    pub config: PathBuf,
    /// Alternate SQLite database (overrides storage.database)
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Shows counters, settings and the last recorded session state
    Status,
    /// Shows or edits the scheduler settings
    Config(ConfigArgs),
    /// Zeroes the daily counter (and the lifetime total with --all)
    Reset(ResetArgs),
    /// Lists journaled session events
    History(HistoryArgs),
    /// Runs a session against a synthetic list
    Simulate(SimulateArgs),
    /// Checks the configuration and database
    Health,
}

#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// Lower bound of the pacing delay, in seconds
    #[arg(long)]
    pub min_delay: Option<f64>,
    /// Upper bound of the pacing delay, in seconds
    #[arg(long)]
    pub max_delay: Option<f64>,
    /// Actions per run; 0 disables the cap
    #[arg(long)]
    pub max_per_session: Option<u32>,
    /// Actions per calendar day; 0 disables the cap
    #[arg(long)]
    pub max_per_day: Option<u32>,
    /// Enable cooldown pauses
    #[arg(long, conflicts_with = "no_cooldown")]
    pub cooldown: bool,
    /// Disable cooldown pauses
    #[arg(long)]
    pub no_cooldown: bool,
    #[arg(long)]
    pub cooldown_min: Option<f64>,
    #[arg(long)]
    pub cooldown_max: Option<f64>,
    /// Fewest consecutive actions before a cooldown
    #[arg(long)]
    pub trigger_min: Option<u32>,
    /// Most consecutive actions before a cooldown
    #[arg(long)]
    pub trigger_max: Option<u32>,
}

impl ConfigArgs {
    pub fn patch(&self) -> SettingsPatch {
        let cooldown_enabled = if self.cooldown {
            Some(true)
        } else if self.no_cooldown {
            Some(false)
        } else {
            None
        };
        SettingsPatch {
            min_delay_seconds: self.min_delay,
            max_delay_seconds: self.max_delay,
            max_per_session: self.max_per_session,
            max_per_day: self.max_per_day,
            cooldown_enabled,
            cooldown_min_seconds: self.cooldown_min,
            cooldown_max_seconds: self.cooldown_max,
            cooldown_trigger_min: self.trigger_min,
            cooldown_trigger_max: self.trigger_max,
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct ResetArgs {
    /// Also zero the lifetime total
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of events to show
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
    /// Keep only the newest N journal entries before listing
    #[arg(long)]
    pub prune: Option<usize>,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Status => {
            let status = context.status(Local::now().date_naive())?;
            render(&status, cli.format)?;
        }
        Commands::Config(args) => {
            let report = context.configure(&args.patch())?;
            render(&report, cli.format)?;
        }
        Commands::Reset(args) => {
            let report = context.reset(args)?;
            render(&report, cli.format)?;
        }
        Commands::History(args) => {
            let history = context.history(args)?;
            render(&history, cli.format)?;
        }
        Commands::Simulate(args) => {
            context.prepare()?;
            let report = simulate(&context, args, cli.format)?;
            render(&report, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub(crate) trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    pub(crate) config: AutopaceConfig,
    pub(crate) config_path: PathBuf,
    pub(crate) store: SqliteCounterStore,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_autopace_config(&config_path)?;
        let database = match cli.database.clone() {
            Some(path) => path,
            None => config.database_path(std::env::current_dir()?),
        };
        let store = SqliteCounterStore::builder().path(&database).build()?;
        Ok(Self {
            config,
            config_path,
            store,
        })
    }

    /// Creates the schema and seeds settings missing from the database.
    fn prepare(&self) -> Result<()> {
        self.store.initialize()?;
        let seeded = self.settings().seed_defaults(&self.config.defaults)?;
        if seeded > 0 {
            debug!(seeded, "seeded default settings");
        }
        Ok(())
    }

    fn shared_store(&self) -> Arc<dyn CounterStore> {
        Arc::new(self.store.clone())
    }

    fn settings(&self) -> SettingsStore {
        SettingsStore::new(self.shared_store())
    }

    fn ledger(&self) -> CounterLedger {
        CounterLedger::new(self.shared_store())
    }

    fn journal(&self) -> SqliteEventJournal {
        SqliteEventJournal::new(self.store.clone())
    }

    /// Reads a snapshot without touching the database: a missing file shows the
    /// configured defaults, an existing one is opened read-only. The daily count
    /// is shown as it stands on `today`.
    fn status(&self, today: NaiveDate) -> Result<StatusReport> {
        let path = self.store.path();
        let database = path.display().to_string();
        if !path.exists() {
            debug!(%database, "database not created yet; showing configured defaults");
            return Ok(StatusReport {
                database,
                session_state: SessionState::Idle,
                counters: CounterSnapshot::default(),
                settings: self.config.defaults.clone(),
                last_event: None,
            });
        }

        let reader = SqliteCounterStore::builder()
            .path(path)
            .read_only(true)
            .build()?;
        let shared: Arc<dyn CounterStore> = Arc::new(reader.clone());
        let session_state = match reader.get(SESSION_STATE_KEY)? {
            Some(raw) => raw.parse::<SessionState>().unwrap_or_else(|err| {
                warn!(error = %err, "unrecognised session state in store");
                SessionState::Idle
            }),
            None => SessionState::Idle,
        };
        Ok(StatusReport {
            database,
            session_state,
            counters: CounterLedger::new(Arc::clone(&shared)).snapshot()?.as_of(today),
            settings: SettingsStore::new(shared).load(&self.config.defaults)?,
            last_event: SqliteEventJournal::new(reader).recent(1)?.pop(),
        })
    }

    fn configure(&self, patch: &SettingsPatch) -> Result<ConfigReport> {
        self.prepare()?;
        let settings = self.settings();
        if patch.is_empty() {
            return Ok(ConfigReport {
                updated: false,
                settings: settings.load(&self.config.defaults)?,
            });
        }
        let updated = settings.update(&self.config.defaults, patch)?;
        info!(
            min_delay = updated.min_delay_seconds,
            max_delay = updated.max_delay_seconds,
            max_per_session = updated.max_per_session,
            max_per_day = ?updated.max_per_day,
            "settings saved"
        );
        Ok(ConfigReport {
            updated: true,
            settings: updated,
        })
    }

    fn reset(&self, args: &ResetArgs) -> Result<ResetReport> {
        self.prepare()?;
        if self.store.get(SESSION_STATE_KEY)?.as_deref() == Some(SessionState::Running.as_str()) {
            warn!("last recorded state is running; resetting anyway");
        }
        let ledger = self.ledger();
        ledger.reset_daily()?;
        if args.all {
            ledger.reset_total()?;
        }
        self.store
            .set(SESSION_STATE_KEY, SessionState::Idle.as_str())?;
        info!(all = args.all, "counters reset");
        Ok(ResetReport {
            total_reset: args.all,
            counters: ledger.snapshot()?,
        })
    }

    fn history(&self, args: &HistoryArgs) -> Result<HistoryReport> {
        self.prepare()?;
        let journal = self.journal();
        let pruned = match args.prune {
            Some(keep) => journal.trim(keep)?,
            None => 0,
        };
        Ok(HistoryReport {
            pruned,
            entries: journal.recent(args.limit)?,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        vec![
            check_path("autopace.toml", &self.config_path),
            check_database("database", self.store.path()),
        ]
    }
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{path} missing", path = path.display()))
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(
            name,
            format!("{path} not created yet", path = path.display()),
        );
    }
    let conn = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(err) => return HealthEntry::error(name, format!("failed to open: {err}")),
    };
    let pragma: rusqlite::Result<String> =
        conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
    match pragma {
        Ok(result) if result.eq_ignore_ascii_case("ok") => {
            let tables: rusqlite::Result<i64> = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                 AND name IN ('counters', 'session_events')",
                [],
                |row| row.get(0),
            );
            match tables {
                Ok(2) => HealthEntry::ok(name, "integrity ok".to_string()),
                Ok(_) => HealthEntry::warn(name, "schema incomplete".to_string()),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
        Err(err) => HealthEntry::warn(name, format!("error: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub session_state: SessionState,
    pub counters: CounterSnapshot,
    pub settings: SchedulerSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<JournalEntry>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Database: {}", self.database),
            format!("Last session state: {}", self.session_state),
            format!(
                "Actions: today={} total={} (day started {})",
                self.counters.daily_actions,
                self.counters.total_actions,
                self.counters
                    .last_reset_date
                    .map(|date| date.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
        ];
        lines.push(self.settings.display());
        if let Some(event) = &self.last_event {
            lines.push(format!(
                "Last event: {} {} ({})",
                event.kind,
                event.state,
                event.at.to_rfc3339()
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for SchedulerSettings {
    fn display(&self) -> String {
        let cap = |value: Option<u32>| {
            value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "unlimited".to_string())
        };
        let mut lines = vec![
            "Settings:".to_string(),
            format!(
                "  - delay: {:.1}s .. {:.1}s",
                self.min_delay_seconds, self.max_delay_seconds
            ),
            format!("  - per session: {}", cap(self.session_cap())),
            format!("  - per day: {}", cap(self.daily_cap())),
        ];
        if self.cooldown_enabled {
            lines.push(format!(
                "  - cooldown: {:.0}s .. {:.0}s every {}-{} actions",
                self.cooldown_min_seconds,
                self.cooldown_max_seconds,
                self.cooldown_trigger_min,
                self.cooldown_trigger_max
            ));
        } else {
            lines.push("  - cooldown: off".to_string());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub updated: bool,
    pub settings: SchedulerSettings,
}

impl DisplayFallback for ConfigReport {
    fn display(&self) -> String {
        if self.updated {
            format!("Settings saved\n{}", self.settings.display())
        } else {
            self.settings.display()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResetReport {
    pub total_reset: bool,
    pub counters: CounterSnapshot,
}

impl DisplayFallback for ResetReport {
    fn display(&self) -> String {
        let scope = if self.total_reset {
            "daily and total counters"
        } else {
            "daily counter"
        };
        format!(
            "Reset {scope}: today={} total={}",
            self.counters.daily_actions, self.counters.total_actions
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryReport {
    pub pruned: usize,
    pub entries: Vec<JournalEntry>,
}

impl DisplayFallback for HistoryReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        if self.pruned > 0 {
            lines.push(format!("Pruned {} old events", self.pruned));
        }
        if self.entries.is_empty() {
            lines.push("No events recorded".to_string());
        }
        for entry in &self.entries {
            let at = entry.at.format("%Y-%m-%d %H:%M:%S");
            let mut line = format!(
                "{at} {kind:<17} {state:<9} session={session} day={day} total={total}",
                kind = entry.kind,
                state = entry.state,
                session = entry.action_count,
                day = entry.daily_count,
                total = entry.total_count,
            );
            match entry.termination_reason() {
                Some(reason) => line.push_str(&format!(" reason={}", reason.describe())),
                None => {
                    if let Some(code) = entry.reason.as_deref() {
                        line.push_str(&format!(" reason={code}"));
                    }
                }
            }
            if let Some(detail) = entry.detail.as_deref() {
                line.push_str(&format!(" | {detail}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn prepare_test_context(command: Commands) -> (TempDir, Cli, AppContext) {
        let temp = TempDir::new().unwrap();
        let configs_dir = temp.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/autopace.toml", configs_dir.join("autopace.toml")).unwrap();

        let cli = Cli {
            config: configs_dir.join("autopace.toml"),
            database: Some(temp.path().join("data/autopace.sqlite")),
            format: OutputFormat::Json,
            command,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, cli, context)
    }

    #[test]
    fn status_on_fresh_database_uses_configured_defaults() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        let status = context.status(today()).unwrap();
        assert_eq!(status.session_state, SessionState::Idle);
        assert_eq!(status.counters, CounterSnapshot::default());
        assert_eq!(status.settings, context.config.defaults);
        assert!(status.last_event.is_none());
    }

    #[test]
    fn status_does_not_create_the_database() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        context.status(today()).unwrap();
        assert!(!context.store.path().exists());
    }

    #[test]
    fn status_reads_without_writing_and_applies_the_date() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        context.prepare().unwrap();
        let yesterday = today().pred_opt().unwrap();
        let ledger = context.ledger();
        ledger.rollover(yesterday).unwrap();
        ledger.record_action().unwrap();
        ledger.record_action().unwrap();

        let status = context.status(today()).unwrap();
        assert_eq!(status.counters.daily_actions, 0);
        assert_eq!(status.counters.total_actions, 2);
        assert_eq!(status.counters.last_reset_date, Some(yesterday));

        let stored = ledger.snapshot().unwrap();
        assert_eq!(stored.daily_actions, 2);
        assert_eq!(stored.last_reset_date, Some(yesterday));
        assert_eq!(context.status(yesterday).unwrap().counters.daily_actions, 2);
    }

    #[test]
    fn config_edit_is_persisted_and_repaired() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        let args = ConfigArgs {
            min_delay: Some(20.0),
            no_cooldown: true,
            max_per_day: Some(0),
            ..ConfigArgs::default()
        };
        let report = context.configure(&args.patch()).unwrap();
        assert!(report.updated);
        assert_eq!(report.settings.min_delay_seconds, 20.0);
        assert!(report.settings.max_delay_seconds >= 21.0);
        assert!(!report.settings.cooldown_enabled);
        assert_eq!(report.settings.max_per_day, None);

        let status = context.status(today()).unwrap();
        assert_eq!(status.settings, report.settings);
    }

    #[test]
    fn empty_config_call_only_reads() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        let report = context.configure(&ConfigArgs::default().patch()).unwrap();
        assert!(!report.updated);
        assert_eq!(report.settings.max_per_session, 50);
    }

    #[test]
    fn reset_keeps_total_unless_all() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        context.prepare().unwrap();
        let ledger = context.ledger();
        for _ in 0..3 {
            ledger.record_action().unwrap();
        }

        let report = context.reset(&ResetArgs { all: false }).unwrap();
        assert_eq!(report.counters.daily_actions, 0);
        assert_eq!(report.counters.total_actions, 3);

        let report = context.reset(&ResetArgs { all: true }).unwrap();
        assert_eq!(report.counters.total_actions, 0);
        assert_eq!(
            context.store.get(SESSION_STATE_KEY).unwrap().as_deref(),
            Some("idle")
        );
    }

    #[test]
    fn persisted_simulation_updates_counters_and_history() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        context.prepare().unwrap();
        let args = SimulateArgs {
            items: 8,
            page_size: 3,
            seed: Some(7),
            fast: true,
            persist: true,
        };
        let report = simulate(&context, &args, OutputFormat::Json).unwrap();
        assert!(report.session.state.is_terminal());
        assert!(report.session.actions_applied <= 8);

        let status = context.status(today()).unwrap();
        assert_eq!(
            status.counters.total_actions,
            report.session.actions_applied
        );
        assert_eq!(status.session_state, report.session.state);

        let history = context
            .history(&HistoryArgs {
                limit: 500,
                prune: None,
            })
            .unwrap();
        assert_eq!(history.entries.first().unwrap().state, "running");
        assert_eq!(
            history.entries.last().unwrap().state,
            report.session.state.as_str()
        );

        let pruned = context
            .history(&HistoryArgs {
                limit: 500,
                prune: Some(2),
            })
            .unwrap();
        assert_eq!(pruned.entries.len(), 2);
    }

    #[test]
    fn scratch_simulation_leaves_database_untouched() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Status);
        context.prepare().unwrap();
        let args = SimulateArgs {
            items: 5,
            page_size: 5,
            seed: Some(1),
            fast: true,
            persist: false,
        };
        let report = simulate(&context, &args, OutputFormat::Json).unwrap();
        assert!(report.session.state.is_terminal());
        assert_eq!(context.status(today()).unwrap().counters.total_actions, 0);
        assert!(context.journal().recent(10).unwrap().is_empty());
    }

    #[test]
    fn health_reports_missing_database_then_ok() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Health);
        let report = context.health_check();
        assert!(matches!(report[0].status, CheckStatus::Ok));
        assert!(matches!(report[1].status, CheckStatus::Warn));

        context.prepare().unwrap();
        let report = context.health_check();
        assert!(matches!(report[1].status, CheckStatus::Ok));
    }

    #[test]
    fn cooldown_flags_conflict() {
        let parsed = Cli::try_parse_from([
            "autopacectl",
            "config",
            "--cooldown",
            "--no-cooldown",
        ]);
        assert!(parsed.is_err());

        let parsed =
            Cli::try_parse_from(["autopacectl", "config", "--min-delay", "4", "--cooldown"])
                .unwrap();
        match parsed.command {
            Commands::Config(args) => {
                let patch = args.patch();
                assert_eq!(patch.min_delay_seconds, Some(4.0));
                assert_eq!(patch.cooldown_enabled, Some(true));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
