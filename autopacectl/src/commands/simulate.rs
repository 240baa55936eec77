use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use autopace_core::scheduler::{
    ActionSink, ContainerHandle, ControllerConfig, DocumentProbe, Eligibility, PacingPolicy,
    ProbeError, ProbeResult, SessionController, SessionEvent, SessionReport, SinkOutcome, Target,
};
use autopace_core::store::{CounterStore, MemoryCounterStore};
use autopace_core::SqliteEventJournal;
use clap::Args;
use futures::StreamExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{AppContext, AppError, DisplayFallback, OutputFormat, Result};

/// Runs a session against a synthetic, lazily loaded list.
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of entries in the synthetic list
    #[arg(long, default_value_t = 40)]
    pub items: usize,
    /// Entries revealed per load-more
    #[arg(long, default_value_t = 12)]
    pub page_size: usize,
    /// Seed for both the synthetic list and the pacing draws
    #[arg(long)]
    pub seed: Option<u64>,
    /// Run on a virtual clock so waits complete instantly
    #[arg(long)]
    pub fast: bool,
    /// Count actions against the real database and journal the events
    #[arg(long)]
    pub persist: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quirk {
    None,
    RejectOnce,
    TakenDuringDelay,
}

#[derive(Debug)]
struct FeedItem {
    id: String,
    label: String,
    state: Eligibility,
    quirk: Quirk,
}

#[derive(Debug)]
struct FeedState {
    items: Vec<FeedItem>,
    loaded: usize,
    page_size: usize,
    revalidations: HashMap<String, u32>,
}

impl FeedState {
    fn generate(count: usize, page_size: usize, rng: &mut ChaCha8Rng) -> Self {
        let items = (0..count)
            .map(|idx| {
                let roll: f64 = rng.gen();
                let (state, quirk) = match roll {
                    r if r < 0.10 => (Eligibility::AlreadyProcessed, Quirk::None),
                    r if r < 0.15 => (Eligibility::Ineligible, Quirk::None),
                    r if r < 0.20 => (Eligibility::Eligible, Quirk::RejectOnce),
                    r if r < 0.25 => (Eligibility::Eligible, Quirk::TakenDuringDelay),
                    _ => (Eligibility::Eligible, Quirk::None),
                };
                FeedItem {
                    id: format!("entry-{idx:04}"),
                    label: format!("account {idx}"),
                    state,
                    quirk,
                }
            })
            .collect();
        let page_size = page_size.max(1);
        Self {
            items,
            loaded: page_size.min(count),
            page_size,
            revalidations: HashMap::new(),
        }
    }

    fn item_mut(&mut self, id: &str) -> Option<&mut FeedItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn remaining_eligible(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.state == Eligibility::Eligible)
            .count()
    }
}

type Feed = Rc<RefCell<FeedState>>;

struct FeedProbe {
    feed: Feed,
}

#[async_trait(?Send)]
impl DocumentProbe for FeedProbe {
    async fn find_container(&self) -> ProbeResult<Option<ContainerHandle>> {
        Ok(Some(ContainerHandle::new("synthetic-feed")))
    }

    async fn list_eligible_targets(&self, _container: &ContainerHandle) -> ProbeResult<Vec<Target>> {
        let feed = self.feed.borrow();
        Ok(feed.items[..feed.loaded]
            .iter()
            .map(|item| Target::new(item.id.clone(), item.state).with_label(item.label.clone()))
            .collect())
    }

    async fn content_size_metric(&self, _container: &ContainerHandle) -> ProbeResult<u64> {
        Ok(self.feed.borrow().loaded as u64)
    }

    async fn advance(&self, _container: &ContainerHandle) -> ProbeResult<()> {
        let mut feed = self.feed.borrow_mut();
        feed.loaded = (feed.loaded + feed.page_size).min(feed.items.len());
        debug!(loaded = feed.loaded, "synthetic feed advanced");
        Ok(())
    }
}

struct FeedSink {
    feed: Feed,
}

#[async_trait(?Send)]
impl ActionSink for FeedSink {
    async fn apply(&self, target: &Target) -> ProbeResult<SinkOutcome> {
        let mut feed = self.feed.borrow_mut();
        let Some(item) = feed.item_mut(&target.id) else {
            return Err(ProbeError::Detached(target.id.clone()));
        };
        if item.quirk == Quirk::RejectOnce {
            item.quirk = Quirk::None;
            return Ok(SinkOutcome::Rejected("temporarily rate limited".to_string()));
        }
        item.state = Eligibility::AlreadyProcessed;
        Ok(SinkOutcome::Applied)
    }

    async fn revalidate(&self, target: &Target) -> ProbeResult<Eligibility> {
        let mut feed = self.feed.borrow_mut();
        let calls = {
            let counter = feed.revalidations.entry(target.id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let Some(item) = feed.item_mut(&target.id) else {
            return Err(ProbeError::Detached(target.id.clone()));
        };
        if item.quirk == Quirk::TakenDuringDelay && calls >= 2 {
            item.quirk = Quirk::None;
            item.state = Eligibility::AlreadyProcessed;
        }
        Ok(item.state)
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub session: SessionReport,
    pub persisted: bool,
    pub items: usize,
    pub loaded: usize,
    pub remaining_eligible: usize,
    pub events: BTreeMap<String, usize>,
}

impl DisplayFallback for SimulationReport {
    fn display(&self) -> String {
        let session = &self.session;
        let mut lines = vec![
            format!(
                "Session {} {}: {}",
                session.session_id,
                session.state,
                session.reason.describe()
            ),
            format!(
                "  applied={} skipped={} failed={} cooldowns={} passes={}",
                session.actions_applied,
                session.stats.skipped,
                session.stats.failed,
                session.cooldowns,
                session.discovery_passes
            ),
            format!(
                "  daily={} total={}{}",
                session.daily_count,
                session.total_count,
                if self.persisted { "" } else { " (not persisted)" }
            ),
            format!(
                "  list: {} entries, {} loaded, {} still eligible",
                self.items, self.loaded, self.remaining_eligible
            ),
        ];
        if !self.events.is_empty() {
            let summary: Vec<String> = self
                .events
                .iter()
                .map(|(kind, count)| format!("{kind}={count}"))
                .collect();
            lines.push(format!("  events: {}", summary.join(" ")));
        }
        lines.join("\n")
    }
}

pub fn simulate(
    context: &AppContext,
    args: &SimulateArgs,
    format: OutputFormat,
) -> Result<SimulationReport> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_simulation(context, args, format))
}

async fn run_simulation(
    context: &AppContext,
    args: &SimulateArgs,
    format: OutputFormat,
) -> Result<SimulationReport> {
    if args.fast {
        tokio::time::pause();
    }
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let feed: Feed = Rc::new(RefCell::new(FeedState::generate(
        args.items,
        args.page_size,
        &mut rng,
    )));
    info!(seed, items = args.items, page_size = args.page_size, "simulated feed ready");

    let store: Arc<dyn CounterStore> = if args.persist {
        Arc::new(context.store.clone())
    } else {
        let scratch = MemoryCounterStore::new();
        for (key, value) in context.store.entries()? {
            scratch.set(&key, &value)?;
        }
        Arc::new(scratch)
    };

    let mut controller = SessionController::new(
        Box::new(FeedProbe {
            feed: Rc::clone(&feed),
        }),
        Box::new(FeedSink {
            feed: Rc::clone(&feed),
        }),
        store,
        ControllerConfig::from_config(&context.config),
    )
    .with_pacing(PacingPolicy::seeded(rng.gen()));
    if args.persist {
        controller =
            controller.with_recorder(Arc::new(SqliteEventJournal::new(context.store.clone())));
    }

    let handle = controller.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    let mut events = controller.events();
    let printer = async move {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        while let Some(event) = events.next().await {
            if matches!(format, OutputFormat::Text) {
                println!("{}", describe_event(&event));
            }
            *counts.entry(event.kind.to_string()).or_default() += 1;
        }
        counts
    };
    let session = async move {
        let mut controller = controller;
        controller.start().await
    };
    let (report, counts) = tokio::join!(session, printer);
    interrupt.abort();

    let Some(session) = report else {
        warn!("simulation did not start");
        return Err(AppError::MissingResource(
            "session is already running".to_string(),
        ));
    };
    let feed = feed.borrow();
    Ok(SimulationReport {
        session,
        persisted: args.persist,
        items: feed.items.len(),
        loaded: feed.loaded,
        remaining_eligible: feed.remaining_eligible(),
        events: counts,
    })
}

fn describe_event(event: &SessionEvent) -> String {
    let mut line = format!(
        "{} {:<17} {:<9} session={} day={} total={}",
        event.at.format("%H:%M:%S"),
        event.kind,
        event.state,
        event.action_count,
        event.daily_count,
        event.total_count
    );
    if let Some(detail) = event.detail.as_deref() {
        line.push_str(" | ");
        line.push_str(detail);
    }
    line
}
