use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::config::{SchedulerSettings, SettingsPatch};
use crate::sqlite::configure_connection;

pub(crate) const STORE_SCHEMA: &str = include_str!("../../sql/autopace.sql");

pub const TOTAL_ACTIONS_KEY: &str = "total_actions";
pub const DAILY_ACTIONS_KEY: &str = "daily_actions";
pub const LAST_RESET_DATE_KEY: &str = "last_reset_date";

const SETTING_MIN_DELAY: &str = "settings.min_delay_seconds";
const SETTING_MAX_DELAY: &str = "settings.max_delay_seconds";
const SETTING_MAX_PER_SESSION: &str = "settings.max_per_session";
const SETTING_MAX_PER_DAY: &str = "settings.max_per_day";
const SETTING_COOLDOWN_ENABLED: &str = "settings.cooldown_enabled";
const SETTING_COOLDOWN_MIN: &str = "settings.cooldown_min_seconds";
const SETTING_COOLDOWN_MAX: &str = "settings.cooldown_max_seconds";
const SETTING_TRIGGER_MIN: &str = "settings.cooldown_trigger_min";
const SETTING_TRIGGER_MAX: &str = "settings.cooldown_trigger_max";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open counter database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on counter database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("counter store path not configured")]
    MissingStore,
    #[error("invalid value {value:?} stored under {key}")]
    InvalidValue { key: String, value: String },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable scalar storage. Each key is read and written independently; there is
/// no transaction spanning two keys.
pub trait CounterStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteCounterStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteCounterStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteCounterStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteCounterStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(SqliteCounterStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteCounterStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCounterStore {
    pub fn builder() -> SqliteCounterStoreBuilder {
        SqliteCounterStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteCounterStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn, self.flags).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
    }

    /// Every stored entry, sorted by key.
    pub fn entries(&self) -> StoreResult<Vec<(String, String)>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT key, value FROM counters ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl CounterStore for SqliteCounterStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM counters WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO counters (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounterStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let guard = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn read_parsed<T: FromStr>(store: &dyn CounterStore, key: &str) -> StoreResult<Option<T>> {
    match store.get(key)? {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub total_actions: u64,
    pub daily_actions: u64,
    pub last_reset_date: Option<NaiveDate>,
}

impl CounterSnapshot {
    /// The counters as they would read on `today`: a daily count stamped with an
    /// earlier date no longer applies.
    pub fn as_of(self, today: NaiveDate) -> Self {
        if self.last_reset_date == Some(today) {
            self
        } else {
            Self {
                daily_actions: 0,
                ..self
            }
        }
    }
}

/// Typed view over the persisted action counters.
#[derive(Clone)]
pub struct CounterLedger {
    store: Arc<dyn CounterStore>,
}

impl CounterLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn total_actions(&self) -> StoreResult<u64> {
        Ok(read_parsed(self.store.as_ref(), TOTAL_ACTIONS_KEY)?.unwrap_or(0))
    }

    pub fn daily_actions(&self) -> StoreResult<u64> {
        Ok(read_parsed(self.store.as_ref(), DAILY_ACTIONS_KEY)?.unwrap_or(0))
    }

    pub fn last_reset_date(&self) -> StoreResult<Option<NaiveDate>> {
        read_parsed(self.store.as_ref(), LAST_RESET_DATE_KEY)
    }

    pub fn snapshot(&self) -> StoreResult<CounterSnapshot> {
        Ok(CounterSnapshot {
            total_actions: self.total_actions()?,
            daily_actions: self.daily_actions()?,
            last_reset_date: self.last_reset_date()?,
        })
    }

    /// Counts one applied action: total first, then daily.
    pub fn record_action(&self) -> StoreResult<CounterSnapshot> {
        let total = self.total_actions()?.saturating_add(1);
        self.store.set(TOTAL_ACTIONS_KEY, &total.to_string())?;
        let daily = self.daily_actions()?.saturating_add(1);
        self.store.set(DAILY_ACTIONS_KEY, &daily.to_string())?;
        Ok(CounterSnapshot {
            total_actions: total,
            daily_actions: daily,
            last_reset_date: self.last_reset_date()?,
        })
    }

    /// Zeroes the daily counter when `today` differs from the stored reset date.
    /// The counter is written before the date, so an interrupted rollover is
    /// retried on the next call. Returns whether a rollover happened.
    pub fn rollover(&self, today: NaiveDate) -> StoreResult<bool> {
        if self.last_reset_date()? == Some(today) {
            return Ok(false);
        }
        self.store.set(DAILY_ACTIONS_KEY, "0")?;
        self.store.set(LAST_RESET_DATE_KEY, &today.to_string())?;
        Ok(true)
    }

    pub fn reset_daily(&self) -> StoreResult<()> {
        self.store.set(DAILY_ACTIONS_KEY, "0")
    }

    pub fn reset_total(&self) -> StoreResult<()> {
        self.store.set(TOTAL_ACTIONS_KEY, "0")
    }
}

/// Settings persisted key by key so the host can edit them while a session runs.
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn CounterStore>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Reads every setting, falling back to `defaults` for missing keys.
    pub fn load(&self, defaults: &SchedulerSettings) -> StoreResult<SchedulerSettings> {
        let store = self.store.as_ref();
        let max_per_day = match read_parsed::<u32>(store, SETTING_MAX_PER_DAY)? {
            Some(0) => None,
            Some(cap) => Some(cap),
            None => defaults.max_per_day,
        };
        let settings = SchedulerSettings {
            min_delay_seconds: read_parsed(store, SETTING_MIN_DELAY)?
                .unwrap_or(defaults.min_delay_seconds),
            max_delay_seconds: read_parsed(store, SETTING_MAX_DELAY)?
                .unwrap_or(defaults.max_delay_seconds),
            max_per_session: read_parsed(store, SETTING_MAX_PER_SESSION)?
                .unwrap_or(defaults.max_per_session),
            max_per_day,
            cooldown_enabled: read_parsed(store, SETTING_COOLDOWN_ENABLED)?
                .unwrap_or(defaults.cooldown_enabled),
            cooldown_min_seconds: read_parsed(store, SETTING_COOLDOWN_MIN)?
                .unwrap_or(defaults.cooldown_min_seconds),
            cooldown_max_seconds: read_parsed(store, SETTING_COOLDOWN_MAX)?
                .unwrap_or(defaults.cooldown_max_seconds),
            cooldown_trigger_min: read_parsed(store, SETTING_TRIGGER_MIN)?
                .unwrap_or(defaults.cooldown_trigger_min),
            cooldown_trigger_max: read_parsed(store, SETTING_TRIGGER_MAX)?
                .unwrap_or(defaults.cooldown_trigger_max),
        };
        Ok(settings.normalized())
    }

    pub fn save(&self, settings: &SchedulerSettings) -> StoreResult<()> {
        for (key, value) in encode_settings(settings) {
            self.store.set(key, &value)?;
        }
        Ok(())
    }

    /// Writes defaults only for keys the store does not hold yet.
    pub fn seed_defaults(&self, defaults: &SchedulerSettings) -> StoreResult<usize> {
        let mut seeded = 0;
        for (key, value) in encode_settings(defaults) {
            if self.store.get(key)?.is_none() {
                self.store.set(key, &value)?;
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Loads, patches, validates and persists the settings.
    pub fn update(
        &self,
        defaults: &SchedulerSettings,
        patch: &SettingsPatch,
    ) -> StoreResult<SchedulerSettings> {
        let mut settings = self.load(defaults)?;
        settings.apply(patch);
        self.save(&settings)?;
        Ok(settings)
    }
}

fn encode_settings(settings: &SchedulerSettings) -> [(&'static str, String); 9] {
    [
        (SETTING_MIN_DELAY, settings.min_delay_seconds.to_string()),
        (SETTING_MAX_DELAY, settings.max_delay_seconds.to_string()),
        (SETTING_MAX_PER_SESSION, settings.max_per_session.to_string()),
        (
            SETTING_MAX_PER_DAY,
            settings.max_per_day.unwrap_or(0).to_string(),
        ),
        (SETTING_COOLDOWN_ENABLED, settings.cooldown_enabled.to_string()),
        (SETTING_COOLDOWN_MIN, settings.cooldown_min_seconds.to_string()),
        (SETTING_COOLDOWN_MAX, settings.cooldown_max_seconds.to_string()),
        (SETTING_TRIGGER_MIN, settings.cooldown_trigger_min.to_string()),
        (SETTING_TRIGGER_MAX, settings.cooldown_trigger_max.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (Arc<MemoryCounterStore>, CounterLedger) {
        let store = Arc::new(MemoryCounterStore::new());
        let ledger = CounterLedger::new(store.clone());
        (store, ledger)
    }

    #[test]
    fn record_action_increments_both_counters() {
        let (_, ledger) = ledger();
        ledger.record_action().unwrap();
        let snapshot = ledger.record_action().unwrap();
        assert_eq!(snapshot.total_actions, 2);
        assert_eq!(snapshot.daily_actions, 2);
    }

    #[test]
    fn rollover_happens_once_per_date() {
        let (_, ledger) = ledger();
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let tuesday = monday.succ_opt().unwrap();
        assert!(ledger.rollover(monday).unwrap());
        ledger.record_action().unwrap();
        assert!(!ledger.rollover(monday).unwrap());
        assert_eq!(ledger.daily_actions().unwrap(), 1);

        assert!(ledger.rollover(tuesday).unwrap());
        assert!(!ledger.rollover(tuesday).unwrap());
        assert_eq!(ledger.daily_actions().unwrap(), 0);
        assert_eq!(ledger.total_actions().unwrap(), 1);
        assert_eq!(ledger.last_reset_date().unwrap(), Some(tuesday));
    }

    #[test]
    fn stale_daily_count_reads_as_zero() {
        let (_, ledger) = ledger();
        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        ledger.rollover(monday).unwrap();
        ledger.record_action().unwrap();
        ledger.record_action().unwrap();

        let snapshot = ledger.snapshot().unwrap();
        assert_eq!(snapshot.as_of(monday), snapshot);
        let later = snapshot.as_of(monday.succ_opt().unwrap());
        assert_eq!(later.daily_actions, 0);
        assert_eq!(later.total_actions, 2);
        assert_eq!(later.last_reset_date, Some(monday));
        assert_eq!(ledger.daily_actions().unwrap(), 2);
    }

    #[test]
    fn corrupt_counter_is_reported() {
        let (store, ledger) = ledger();
        store.set(TOTAL_ACTIONS_KEY, "many").unwrap();
        let err = ledger.total_actions().unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }

    #[test]
    fn seed_keeps_existing_values() {
        let store = Arc::new(MemoryCounterStore::new());
        let settings = SettingsStore::new(store.clone());
        store.set(SETTING_MAX_PER_SESSION, "7").unwrap();
        let seeded = settings
            .seed_defaults(&SchedulerSettings::default())
            .unwrap();
        assert_eq!(seeded, 8);
        let loaded = settings.load(&SchedulerSettings::default()).unwrap();
        assert_eq!(loaded.max_per_session, 7);
    }

    #[test]
    fn update_persists_clamped_values() {
        let store = Arc::new(MemoryCounterStore::new());
        let settings = SettingsStore::new(store);
        let defaults = SchedulerSettings::default();
        let updated = settings
            .update(
                &defaults,
                &SettingsPatch {
                    min_delay_seconds: Some(20.0),
                    max_per_day: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.max_delay_seconds, 21.0);
        let reloaded = settings.load(&defaults).unwrap();
        assert_eq!(reloaded, updated);
        assert_eq!(reloaded.max_per_day, None);
    }

    #[test]
    fn sqlite_store_round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCounterStore::new(dir.path().join("nested/counters.sqlite")).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.get(TOTAL_ACTIONS_KEY).unwrap(), None);
        store.set(TOTAL_ACTIONS_KEY, "3").unwrap();
        store.set(TOTAL_ACTIONS_KEY, "4").unwrap();
        assert_eq!(store.get(TOTAL_ACTIONS_KEY).unwrap().as_deref(), Some("4"));
        assert_eq!(store.entries().unwrap().len(), 1);
    }
}
