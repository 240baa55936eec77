use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Smallest distance kept between a lower and an upper bound after an edit.
pub const MIN_BOUND_GAP_SECONDS: f64 = 1.0;
/// Upper clamp for any configured duration (one week).
pub const MAX_CONFIGURED_SECONDS: f64 = 604_800.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AutopaceConfig {
    pub storage: StorageSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub defaults: SchedulerSettings,
}

impl AutopaceConfig {
    /// Resolves the database path relative to the directory holding the config file.
    pub fn database_path<P: AsRef<Path>>(&self, config_dir: P) -> PathBuf {
        let path = Path::new(&self.storage.database);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_dir.as_ref().join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub settle_interval_ms: u64,
    pub stability_threshold: u32,
    pub max_advance_attempts: u32,
    pub container_backoff_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            settle_interval_ms: 3_000,
            stability_threshold: 3,
            max_advance_attempts: 5,
            container_backoff_ms: 5_000,
        }
    }
}

impl DiscoverySection {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn container_backoff(&self) -> Duration {
        Duration::from_millis(self.container_backoff_ms)
    }

    /// First field that would leave a discovery pass unable to settle or end.
    fn problem(&self) -> Option<(&'static str, &'static str)> {
        if self.settle_interval_ms == 0 {
            Some(("settle_interval_ms", "must be at least 1"))
        } else if self.stability_threshold == 0 {
            Some(("stability_threshold", "must be at least 1"))
        } else if self.max_advance_attempts == 0 {
            Some(("max_advance_attempts", "must be at least 1"))
        } else {
            None
        }
    }
}

/// Runtime quotas and pacing bounds. Read fresh by the scheduler at the start of
/// every loop iteration; edited by the host through [`SettingsPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
    /// 0 disables the session cap.
    pub max_per_session: u32,
    pub max_per_day: Option<u32>,
    pub cooldown_enabled: bool,
    pub cooldown_min_seconds: f64,
    pub cooldown_max_seconds: f64,
    pub cooldown_trigger_min: u32,
    pub cooldown_trigger_max: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_delay_seconds: 5.0,
            max_delay_seconds: 15.0,
            max_per_session: 50,
            max_per_day: Some(100),
            cooldown_enabled: true,
            cooldown_min_seconds: 60.0,
            cooldown_max_seconds: 180.0,
            cooldown_trigger_min: 8,
            cooldown_trigger_max: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundEdit {
    Lower,
    Upper,
}

/// Partial settings update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub min_delay_seconds: Option<f64>,
    pub max_delay_seconds: Option<f64>,
    pub max_per_session: Option<u32>,
    /// 0 disables the daily cap.
    pub max_per_day: Option<u32>,
    pub cooldown_enabled: Option<bool>,
    pub cooldown_min_seconds: Option<f64>,
    pub cooldown_max_seconds: Option<f64>,
    pub cooldown_trigger_min: Option<u32>,
    pub cooldown_trigger_max: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == SettingsPatch::default()
    }
}

impl SchedulerSettings {
    /// Applies a patch and repairs any bound it broke. The bound that was not
    /// edited is the one that moves.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(value) = patch.min_delay_seconds {
            self.min_delay_seconds = sanitize_seconds(value);
        }
        if let Some(value) = patch.max_delay_seconds {
            self.max_delay_seconds = sanitize_seconds(value);
        }
        let delay_edit = edited_bound(patch.min_delay_seconds, patch.max_delay_seconds);
        enforce_gap(
            &mut self.min_delay_seconds,
            &mut self.max_delay_seconds,
            delay_edit,
        );

        if let Some(value) = patch.max_per_session {
            self.max_per_session = value;
        }
        if let Some(value) = patch.max_per_day {
            self.max_per_day = (value > 0).then_some(value);
        }
        if let Some(value) = patch.cooldown_enabled {
            self.cooldown_enabled = value;
        }

        if let Some(value) = patch.cooldown_min_seconds {
            self.cooldown_min_seconds = sanitize_seconds(value);
        }
        if let Some(value) = patch.cooldown_max_seconds {
            self.cooldown_max_seconds = sanitize_seconds(value);
        }
        let cooldown_edit = edited_bound(patch.cooldown_min_seconds, patch.cooldown_max_seconds);
        enforce_gap(
            &mut self.cooldown_min_seconds,
            &mut self.cooldown_max_seconds,
            cooldown_edit,
        );

        if let Some(value) = patch.cooldown_trigger_min {
            self.cooldown_trigger_min = value;
        }
        if let Some(value) = patch.cooldown_trigger_max {
            self.cooldown_trigger_max = value;
        }
        let trigger_edit = edited_bound(patch.cooldown_trigger_min, patch.cooldown_trigger_max);
        self.normalize_trigger(trigger_edit);
    }

    /// Repairs settings that came from an untrusted source (file, store).
    pub fn normalized(mut self) -> Self {
        self.min_delay_seconds = sanitize_seconds(self.min_delay_seconds);
        self.max_delay_seconds = sanitize_seconds(self.max_delay_seconds);
        enforce_gap(
            &mut self.min_delay_seconds,
            &mut self.max_delay_seconds,
            BoundEdit::Lower,
        );
        self.cooldown_min_seconds = sanitize_seconds(self.cooldown_min_seconds);
        self.cooldown_max_seconds = sanitize_seconds(self.cooldown_max_seconds);
        enforce_gap(
            &mut self.cooldown_min_seconds,
            &mut self.cooldown_max_seconds,
            BoundEdit::Lower,
        );
        self.max_per_day = self.max_per_day.filter(|cap| *cap > 0);
        self.normalize_trigger(BoundEdit::Lower);
        self
    }

    pub fn session_cap(&self) -> Option<u32> {
        (self.max_per_session > 0).then_some(self.max_per_session)
    }

    pub fn daily_cap(&self) -> Option<u32> {
        self.max_per_day.filter(|cap| *cap > 0)
    }

    fn normalize_trigger(&mut self, edit: BoundEdit) {
        self.cooldown_trigger_min = self.cooldown_trigger_min.max(1);
        self.cooldown_trigger_max = self.cooldown_trigger_max.max(1);
        if self.cooldown_trigger_min > self.cooldown_trigger_max {
            match edit {
                BoundEdit::Lower => self.cooldown_trigger_max = self.cooldown_trigger_min,
                BoundEdit::Upper => self.cooldown_trigger_min = self.cooldown_trigger_max,
            }
        }
    }
}

fn edited_bound<T>(lower: Option<T>, upper: Option<T>) -> BoundEdit {
    match (lower, upper) {
        (None, Some(_)) => BoundEdit::Upper,
        _ => BoundEdit::Lower,
    }
}

fn sanitize_seconds(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value.min(MAX_CONFIGURED_SECONDS)
    } else {
        0.0
    }
}

fn enforce_gap(lower: &mut f64, upper: &mut f64, edit: BoundEdit) {
    if *lower < *upper {
        return;
    }
    match edit {
        BoundEdit::Lower => *upper = *lower + MIN_BOUND_GAP_SECONDS,
        BoundEdit::Upper => {
            *lower = (*upper - MIN_BOUND_GAP_SECONDS).max(0.0);
            if *lower >= *upper {
                *upper = *lower + MIN_BOUND_GAP_SECONDS;
            }
        }
    }
}

/// Reads the config file, rejects discovery values the scheduler cannot run with,
/// and normalizes the scheduler defaults.
pub fn load_autopace_config<P: AsRef<Path>>(path: P) -> Result<AutopaceConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: AutopaceConfig =
        toml::from_str(&raw).map_err(|source| ConfigError::Syntax {
            path: path.to_path_buf(),
            source,
        })?;
    if let Some((field, reason)) = config.discovery.problem() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            section: "discovery",
            field,
            reason: reason.to_string(),
        });
    }
    config.defaults = config.defaults.normalized();
    Ok(config)
}
