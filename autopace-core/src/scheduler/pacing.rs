use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::SchedulerSettings;

/// Per-action delays and periodic cool-downs.
///
/// The only state is the run of consecutive actions and the trigger threshold
/// drawn for the current cool-down cycle. The RNG is injectable so tests can
/// seed it.
#[derive(Debug, Clone)]
pub struct PacingPolicy<R = ChaCha8Rng> {
    rng: R,
    consecutive: u32,
    trigger: Option<u32>,
}

impl PacingPolicy<ChaCha8Rng> {
    pub fn from_entropy() -> Self {
        Self::with_rng(ChaCha8Rng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed))
    }
}

impl Default for PacingPolicy<ChaCha8Rng> {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl<R: Rng> PacingPolicy<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            consecutive: 0,
            trigger: None,
        }
    }

    /// Fresh sample from `[min_delay_seconds, max_delay_seconds]`.
    pub fn next_delay(&mut self, settings: &SchedulerSettings) -> Duration {
        self.uniform(settings.min_delay_seconds, settings.max_delay_seconds)
    }

    pub fn cooldown_duration(&mut self, settings: &SchedulerSettings) -> Duration {
        self.uniform(settings.cooldown_min_seconds, settings.cooldown_max_seconds)
    }

    /// True once `consecutive` reaches this cycle's trigger. The trigger is drawn
    /// lazily from the configured range and kept until [`finish_cooldown`].
    ///
    /// [`finish_cooldown`]: PacingPolicy::finish_cooldown
    pub fn should_cooldown(&mut self, settings: &SchedulerSettings, consecutive: u32) -> bool {
        if !settings.cooldown_enabled {
            return false;
        }
        let trigger = match self.trigger {
            Some(trigger) => trigger,
            None => {
                let lower = settings
                    .cooldown_trigger_min
                    .min(settings.cooldown_trigger_max)
                    .max(1);
                let upper = settings
                    .cooldown_trigger_min
                    .max(settings.cooldown_trigger_max)
                    .max(lower);
                let drawn = self.rng.gen_range(lower..=upper);
                self.trigger = Some(drawn);
                drawn
            }
        };
        consecutive >= trigger
    }

    /// Counts one successful action and reports whether a cool-down is due.
    pub fn register_action(&mut self, settings: &SchedulerSettings) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.should_cooldown(settings, self.consecutive)
    }

    /// Called after the cool-down elapsed; starts a new cycle.
    pub fn finish_cooldown(&mut self) {
        self.consecutive = 0;
        self.trigger = None;
    }

    pub fn consecutive_actions(&self) -> u32 {
        self.consecutive
    }

    pub fn current_trigger(&self) -> Option<u32> {
        self.trigger
    }

    pub fn reset(&mut self) {
        self.finish_cooldown();
    }

    fn uniform(&mut self, a: f64, b: f64) -> Duration {
        let lower = a.min(b).max(0.0);
        let upper = a.max(b).max(lower);
        if lower == upper {
            return Duration::from_secs_f64(lower);
        }
        Duration::from_secs_f64(self.rng.gen_range(lower..=upper))
    }
}
