use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProbeResult;

/// Opaque reference to the lazily growing list inside the host document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Eligible,
    AlreadyProcessed,
    Ineligible,
    Unknown,
}

impl Eligibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Eligibility::Eligible => "eligible",
            Eligibility::AlreadyProcessed => "already_processed",
            Eligibility::Ineligible => "ineligible",
            Eligibility::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub label: Option<String>,
    pub eligibility: Eligibility,
}

impl Target {
    pub fn new(id: impl Into<String>, eligibility: Eligibility) -> Self {
        Self {
            id: id.into(),
            label: None,
            eligibility,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_eligible(&self) -> bool {
        self.eligibility == Eligibility::Eligible
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    Applied,
    Rejected(String),
}

/// Read access to the live document. Implementations are driven from a single
/// task and are never called concurrently.
#[async_trait(?Send)]
pub trait DocumentProbe {
    async fn find_container(&self) -> ProbeResult<Option<ContainerHandle>>;
    async fn list_eligible_targets(&self, container: &ContainerHandle) -> ProbeResult<Vec<Target>>;
    /// Structural size of the container, independent of how many targets it exposes.
    async fn content_size_metric(&self, container: &ContainerHandle) -> ProbeResult<u64>;
    /// Triggers one load-more interaction (scroll, "show more" click, ...).
    async fn advance(&self, container: &ContainerHandle) -> ProbeResult<()>;
}

#[async_trait(?Send)]
pub trait ActionSink {
    async fn apply(&self, target: &Target) -> ProbeResult<SinkOutcome>;
    async fn revalidate(&self, target: &Target) -> ProbeResult<Eligibility>;
}
