//! Admin analytics. Every section is a named procedure whose JSON answer is
//! passed through untouched for display.

use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::remote::{
    finish_subscribe, next_change, ChangeFilter, ChangeStream, RemoteDataService, Subscribing,
};
use crate::{settle, wait_cancelled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSection {
    Totals,
    Items,
    Options,
    Categories,
    Hourly,
    Peaks,
    Customizations,
}

/// A report section backed by one named procedure.
pub trait StatsSection: Copy + Ord + 'static {
    const ALL: &'static [Self];

    fn procedure(self) -> &'static str;
}

impl StatsSection for EventSection {
    const ALL: &'static [EventSection] = &[
        EventSection::Totals,
        EventSection::Items,
        EventSection::Options,
        EventSection::Categories,
        EventSection::Hourly,
        EventSection::Peaks,
        EventSection::Customizations,
    ];

    fn procedure(self) -> &'static str {
        match self {
            EventSection::Totals => "admin_event_totals",
            EventSection::Items => "admin_event_items_breakdown",
            EventSection::Options => "admin_event_options_breakdown",
            EventSection::Categories => "admin_event_categories_breakdown",
            EventSection::Hourly => "admin_event_hourly_heatmap",
            EventSection::Peaks => "admin_event_peak_analysis",
            EventSection::Customizations => "admin_event_customization_details",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalSection {
    Totals,
    Drinks,
    Options,
    Events,
    Timeline,
    Categories,
}

impl StatsSection for GlobalSection {
    const ALL: &'static [GlobalSection] = &[
        GlobalSection::Totals,
        GlobalSection::Drinks,
        GlobalSection::Options,
        GlobalSection::Events,
        GlobalSection::Timeline,
        GlobalSection::Categories,
    ];

    fn procedure(self) -> &'static str {
        match self {
            GlobalSection::Totals => "admin_global_totals",
            GlobalSection::Drinks => "admin_global_drinks_breakdown",
            GlobalSection::Options => "admin_global_options_breakdown",
            GlobalSection::Events => "admin_global_events_summary",
            GlobalSection::Timeline => "admin_global_timeline",
            GlobalSection::Categories => "admin_global_category_distribution",
        }
    }
}

/// Loaded sections plus the error of every section that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport<S: Ord> {
    pub sections: BTreeMap<S, Value>,
    pub errors: BTreeMap<S, String>,
}

impl<S: Ord> StatsReport<S> {
    pub fn get(&self, section: &S) -> Option<&Value> {
        self.sections.get(section)
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

async fn load_sections<S: StatsSection>(remote: &dyn RemoteDataService, args: Value) -> StatsReport<S> {
    let answers = join_all(S::ALL.iter().map(|s| remote.rpc(s.procedure(), args.clone()))).await;

    let mut report = StatsReport {
        sections: BTreeMap::new(),
        errors: BTreeMap::new(),
    };
    for (section, answer) in S::ALL.iter().copied().zip(answers) {
        match answer {
            Ok(value) => {
                report.sections.insert(section, value);
            }
            Err(e) => {
                warn!(procedure = section.procedure(), error = %e, "stats section failed");
                report.errors.insert(section, e.user_message());
            }
        }
    }
    report
}

pub async fn load_event_stats(
    remote: &dyn RemoteDataService,
    event_id: &str,
) -> StatsReport<EventSection> {
    let report = load_sections(remote, json!({ "event_id": event_id })).await;
    debug!(event_id, loaded = report.sections.len(), failed = report.errors.len(), "event stats loaded");
    report
}

pub async fn load_global_stats(remote: &dyn RemoteDataService) -> StatsReport<GlobalSection> {
    let report = load_sections(remote, json!({})).await;
    debug!(loaded = report.sections.len(), failed = report.errors.len(), "global stats loaded");
    report
}

// ---------------------------------------------------------------------------
// Live event stats
// ---------------------------------------------------------------------------

/// Keeps an event's stats current by reloading on any order change.
pub struct StatsWatcher {
    event_id: String,
    report: watch::Receiver<Option<StatsReport<EventSection>>>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StatsWatcher {
    pub fn mount(remote: Arc<dyn RemoteDataService>, event_id: impl Into<String>) -> Self {
        let event_id = event_id.into();
        let (report_tx, report) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(watch_event(remote, event_id.clone(), report_tx, cancel_rx));
        Self {
            event_id,
            report,
            cancel_tx,
            task: Some(task),
        }
    }

    pub fn report(&self) -> watch::Receiver<Option<StatsReport<EventSection>>> {
        self.report.clone()
    }

    pub async fn unmount(mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(event_id = %self.event_id, error = %e, "stats task ended abnormally");
            }
        }
    }
}

impl Drop for StatsWatcher {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

async fn watch_event(
    remote: Arc<dyn RemoteDataService>,
    event_id: String,
    report_tx: watch::Sender<Option<StatsReport<EventSection>>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let filter = ChangeFilter::new(format!("stats-{event_id}"), "orders").eq("event_id", &event_id);
    let mut subscribing: Option<Subscribing<'_>> = Some(remote.subscribe(filter));
    let mut stream: Option<ChangeStream> = None;
    let mut refresh = Some(Box::pin(load_event_stats(remote.as_ref(), &event_id)));

    loop {
        tokio::select! {
            biased;

            _ = wait_cancelled(&mut cancel_rx) => break,

            joined = finish_subscribe(&mut subscribing), if subscribing.is_some() => match joined {
                Ok(joined) => stream = Some(joined),
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "stats subscription failed, showing a static report");
                }
            },

            report = settle(&mut refresh), if refresh.is_some() => {
                report_tx.send_replace(Some(report));
            }

            change = next_change(&mut stream), if stream.is_some() => match change {
                Some(Ok(change)) => {
                    debug!(event_id = %event_id, kind = change.kind.as_str(), "order changed, refreshing stats");
                    // A newer change supersedes a refresh still in flight.
                    refresh = Some(Box::pin(load_event_stats(remote.as_ref(), &event_id)));
                }
                Some(Err(e)) => {
                    warn!(event_id = %event_id, error = %e, "stats change feed failed");
                    if let Some(stream) = stream.take() {
                        stream.close().await;
                    }
                }
                None => {
                    info!(event_id = %event_id, "stats change feed closed");
                    stream = None;
                }
            },
        }
    }

    if let Some(stream) = stream {
        stream.close().await;
    }
}
