use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::config::DiscoverySection;

use super::error::ProbeResult;
use super::probe::{DocumentProbe, Target};
use super::signal::StopSignal;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub settle_interval: Duration,
    /// Consecutive non-growing probes after which the list counts as exhausted.
    pub stability_threshold: u32,
    /// Hard cap on load-more interactions per pass, and on consecutive passes
    /// whose batch applied nothing.
    pub max_advance_attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from(&DiscoverySection::default())
    }
}

impl From<&DiscoverySection> for DiscoveryConfig {
    fn from(section: &DiscoverySection) -> Self {
        Self {
            settle_interval: section.settle_interval(),
            stability_threshold: section.stability_threshold,
            max_advance_attempts: section.max_advance_attempts,
        }
    }
}

/// Bookkeeping for a single pass; cleared whenever a pass starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryState {
    pub last_observed_pool_size: u64,
    pub stable_iteration_count: u32,
    pub scroll_cursor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Eligible targets in document order.
    Targets(Vec<Target>),
    /// No eligible targets and the list stopped growing (or the advance cap hit).
    Exhausted { advances: u32, capped: bool },
    ContainerMissing,
    Cancelled,
}

pub struct ContentDiscovery {
    config: DiscoveryConfig,
    state: DiscoveryState,
}

impl ContentDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            state: DiscoveryState::default(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = DiscoveryState::default();
    }

    /// Runs one discovery pass.
    ///
    /// Visible eligible targets are returned as soon as they exist. Otherwise the
    /// container is advanced and re-measured after the settle interval until the
    /// size metric fails to grow `stability_threshold` times in a row, or
    /// `max_advance_attempts` advances were spent.
    pub async fn discover(
        &mut self,
        probe: &dyn DocumentProbe,
        stop: &StopSignal,
    ) -> ProbeResult<DiscoveryOutcome> {
        self.reset();
        let Some(container) = probe.find_container().await? else {
            return Ok(DiscoveryOutcome::ContainerMissing);
        };
        self.state.last_observed_pool_size = probe.content_size_metric(&container).await?;

        loop {
            let eligible: Vec<Target> = probe
                .list_eligible_targets(&container)
                .await?
                .into_iter()
                .filter(Target::is_eligible)
                .collect();
            if !eligible.is_empty() {
                debug!(
                    targets = eligible.len(),
                    advances = self.state.scroll_cursor,
                    "eligible targets visible"
                );
                return Ok(DiscoveryOutcome::Targets(eligible));
            }

            if self.state.stable_iteration_count >= self.config.stability_threshold {
                debug!(
                    advances = self.state.scroll_cursor,
                    size = self.state.last_observed_pool_size,
                    "content stopped growing"
                );
                return Ok(DiscoveryOutcome::Exhausted {
                    advances: self.state.scroll_cursor,
                    capped: false,
                });
            }
            if self.state.scroll_cursor >= self.config.max_advance_attempts {
                debug!(
                    advances = self.state.scroll_cursor,
                    stable = self.state.stable_iteration_count,
                    "advance cap reached without eligible targets"
                );
                return Ok(DiscoveryOutcome::Exhausted {
                    advances: self.state.scroll_cursor,
                    capped: true,
                });
            }

            probe.advance(&container).await?;
            self.state.scroll_cursor += 1;
            sleep(self.config.settle_interval).await;
            if stop.is_stopped() {
                return Ok(DiscoveryOutcome::Cancelled);
            }

            let size = probe.content_size_metric(&container).await?;
            if size > self.state.last_observed_pool_size {
                self.state.stable_iteration_count = 0;
            } else {
                self.state.stable_iteration_count += 1;
            }
            trace!(
                advance = self.state.scroll_cursor,
                previous = self.state.last_observed_pool_size,
                size,
                stable = self.state.stable_iteration_count,
                "content re-measured"
            );
            self.state.last_observed_pool_size = size;
        }
    }
}
