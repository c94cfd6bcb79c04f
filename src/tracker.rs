//! Customer-facing status tracker for a single order.
//!
//! The view is fed from three places: one initial read, push notifications
//! on the order row, and fallback polling that starts when no push has
//! arrived by the signal deadline. Whatever the source, a status is applied
//! only if it does not move the order backwards in its lifecycle.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_SIGNAL_DEADLINE};
use crate::model::{OrderLine, OrderStatus, Stage};
use crate::orders;
use crate::remote::{
    finish_subscribe, next_change, ChangeFilter, ChangeKind, ChangeStream, RemoteDataService,
    Subscribing,
};
use crate::wait_cancelled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long to wait for the first push before polling.
    pub signal_deadline: Duration,
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            signal_deadline: DEFAULT_SIGNAL_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    AwaitingFirstSignal,
    Live,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Fetch,
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Advanced,
    Unchanged,
    Stale,
}

// ---------------------------------------------------------------------------
// View state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerView {
    pub order_id: String,
    pub status: Option<OrderStatus>,
    pub pickup_code: Option<String>,
    pub items: Vec<OrderLine>,
    pub feed: FeedState,
    pub loading: bool,
    pub error: Option<String>,
}

impl TrackerView {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            status: None,
            pickup_code: None,
            items: Vec::new(),
            feed: FeedState::AwaitingFirstSignal,
            loading: true,
            error: None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        self.status.map(OrderStatus::stage)
    }

    pub fn message(&self) -> Option<&'static str> {
        self.stage().map(Stage::message)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(OrderStatus::is_terminal)
    }

    /// Apply a status unless it ranks below the one already shown.
    pub fn apply_status(&mut self, incoming: OrderStatus, source: StatusSource) -> Applied {
        let applied = match self.status {
            Some(current) if incoming.rank() < current.rank() => Applied::Stale,
            Some(current) if incoming == current => Applied::Unchanged,
            _ => Applied::Advanced,
        };
        match applied {
            Applied::Advanced => {
                debug!(order_id = %self.order_id, status = %incoming, ?source, "status applied");
                self.status = Some(incoming);
            }
            Applied::Stale => {
                debug!(
                    order_id = %self.order_id,
                    shown = ?self.status,
                    incoming = %incoming,
                    ?source,
                    "ignoring stale status"
                );
            }
            Applied::Unchanged => {}
        }
        applied
    }

    /// A push arrived. Returns whether the feed state changed.
    pub fn push_received(&mut self) -> bool {
        if self.feed == FeedState::AwaitingFirstSignal {
            self.feed = FeedState::Live;
            return true;
        }
        false
    }

    /// The first-signal deadline passed. Returns whether polling was entered.
    pub fn deadline_elapsed(&mut self) -> bool {
        if self.feed == FeedState::AwaitingFirstSignal {
            self.feed = FeedState::Polling;
            return true;
        }
        false
    }

    /// The push channel is gone. Returns whether polling was entered.
    pub fn feed_lost(&mut self) -> bool {
        if self.feed != FeedState::Polling {
            self.feed = FeedState::Polling;
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Mounted tracker
// ---------------------------------------------------------------------------

pub struct OrderTracker {
    order_id: String,
    view: watch::Receiver<TrackerView>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl OrderTracker {
    pub fn mount(
        remote: Arc<dyn RemoteDataService>,
        order_id: impl Into<String>,
        config: TrackerConfig,
    ) -> Self {
        let order_id = order_id.into();
        let (state_tx, view) = watch::channel(TrackerView::new(order_id.clone()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(remote, order_id.clone(), config, state_tx, cancel_rx));
        info!(order_id = %order_id, "tracker mounted");
        Self {
            order_id,
            view,
            cancel_tx,
            task: Some(task),
        }
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn view(&self) -> watch::Receiver<TrackerView> {
        self.view.clone()
    }

    pub fn current(&self) -> TrackerView {
        self.view.borrow().clone()
    }

    /// Stop the subscription and every timer, and wait until they are gone.
    pub async fn unmount(mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(order_id = %self.order_id, error = %e, "tracker task ended abnormally");
            }
        }
        info!(order_id = %self.order_id, "tracker unmounted");
    }
}

impl Drop for OrderTracker {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

async fn next_tick(poller: &mut Option<Interval>) {
    match poller {
        Some(poller) => {
            poller.tick().await;
        }
        None => pending().await,
    }
}

fn start_polling(period: Duration) -> Interval {
    // First tick completes immediately: the first poll happens at the deadline.
    let mut poller = interval(period);
    poller.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poller
}

async fn run(
    remote: Arc<dyn RemoteDataService>,
    order_id: String,
    config: TrackerConfig,
    state: watch::Sender<TrackerView>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let deadline = sleep(config.signal_deadline);
    tokio::pin!(deadline);

    // The channel handshake, the first read and the deadline run side by side.
    let filter = ChangeFilter::new(format!("order-{order_id}"), "orders")
        .eq("id", &order_id)
        .kinds(&[ChangeKind::Update]);
    let mut subscribing: Option<Subscribing<'_>> = Some(remote.subscribe(filter));
    let mut stream: Option<ChangeStream> = None;

    let snapshot = orders::fetch_snapshot(remote.as_ref(), &order_id);
    tokio::pin!(snapshot);
    let mut snapshot_read = false;

    let mut poller: Option<Interval> = None;
    loop {
        let (feed, terminal) = {
            let view = state.borrow();
            (view.feed, view.is_terminal())
        };
        if terminal {
            poller = None;
        } else if feed == FeedState::Polling && poller.is_none() {
            info!(order_id = %order_id, "falling back to polling");
            poller = Some(start_polling(config.poll_interval));
        }

        tokio::select! {
            biased;

            _ = wait_cancelled(&mut cancel_rx) => break,

            joined = finish_subscribe(&mut subscribing), if subscribing.is_some() => match joined {
                Ok(joined) => {
                    debug!(order_id = %order_id, "change feed joined");
                    stream = Some(joined);
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "subscription failed, polling instead");
                    state.send_if_modified(TrackerView::feed_lost);
                }
            },

            read = &mut snapshot, if !snapshot_read => {
                snapshot_read = true;
                state.send_modify(|v| {
                    v.loading = false;
                    match read {
                        Ok(Some(snap)) => {
                            v.pickup_code = Some(snap.pickup_code);
                            v.items = snap.items;
                            v.apply_status(snap.status, StatusSource::Fetch);
                        }
                        Ok(None) => v.error = Some("Order not found".to_string()),
                        Err(e) => {
                            warn!(order_id = %order_id, error = %e, "initial order read failed");
                            v.error = Some(e.user_message());
                        }
                    }
                });
            }

            change = next_change(&mut stream), if stream.is_some() => match change {
                Some(Ok(change)) => {
                    let Some(status) = change.new_status() else {
                        continue;
                    };
                    state.send_if_modified(|v| {
                        let fed = v.push_received();
                        let applied = v.apply_status(status, StatusSource::Push);
                        fed || applied == Applied::Advanced
                    });
                }
                Some(Err(e)) => {
                    warn!(order_id = %order_id, error = %e, "change feed failed");
                    close(stream.take()).await;
                    state.send_if_modified(TrackerView::feed_lost);
                }
                None => {
                    info!(order_id = %order_id, "change feed closed");
                    stream = None;
                    state.send_if_modified(TrackerView::feed_lost);
                }
            },

            _ = &mut deadline, if feed == FeedState::AwaitingFirstSignal => {
                debug!(order_id = %order_id, "no push before deadline");
                state.send_if_modified(TrackerView::deadline_elapsed);
            }

            _ = next_tick(&mut poller), if poller.is_some() => {
                let polled = tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut cancel_rx) => break,
                    r = orders::fetch_status(remote.as_ref(), &order_id) => r,
                };
                match polled {
                    Ok(Some(status)) => {
                        state.send_if_modified(|v| {
                            let cleared = v.error.take().is_some();
                            v.apply_status(status, StatusSource::Poll) == Applied::Advanced || cleared
                        });
                    }
                    Ok(None) => debug!(order_id = %order_id, "poll found no order row"),
                    Err(e) => {
                        warn!(order_id = %order_id, error = %e, "status poll failed");
                        let message = e.user_message();
                        state.send_if_modified(|v| {
                            let changed = v.error.as_deref() != Some(message.as_str());
                            v.error = Some(message);
                            changed
                        });
                    }
                }
            }
        }
    }

    close(stream).await;
}

async fn close(stream: Option<ChangeStream>) {
    if let Some(stream) = stream {
        stream.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::remote::fake::FakeRemote;
    use serde_json::json;
    use tokio::time::{timeout, Instant};

    fn config() -> TrackerConfig {
        TrackerConfig {
            signal_deadline: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
        }
    }

    fn seeded(status: &str) -> Arc<FakeRemote> {
        let remote = FakeRemote::new();
        remote.script_rpc(
            "public_get_order",
            Ok(json!({
                "id": "abc",
                "pickup_code": "WB42",
                "status": status,
                "items": [{ "item_name": "Latte", "qty": 1, "options": [{ "name": "Oat" }] }]
            })),
        );
        remote.insert_row("orders", json!({ "id": "abc", "status": status }));
        remote
    }

    async fn wait_until(
        view: &mut watch::Receiver<TrackerView>,
        pred: impl FnMut(&TrackerView) -> bool,
    ) -> TrackerView {
        timeout(Duration::from_secs(60), view.wait_for(pred))
            .await
            .expect("condition reached in time")
            .expect("tracker still running")
            .clone()
    }

    #[test]
    fn status_application_is_monotonic() {
        let mut view = TrackerView::new("abc");
        assert_eq!(view.apply_status(OrderStatus::New, StatusSource::Fetch), Applied::Advanced);
        assert_eq!(view.apply_status(OrderStatus::Ready, StatusSource::Push), Applied::Advanced);
        assert_eq!(view.apply_status(OrderStatus::Preparing, StatusSource::Poll), Applied::Stale);
        assert_eq!(view.apply_status(OrderStatus::Ready, StatusSource::Poll), Applied::Unchanged);
        assert_eq!(view.status, Some(OrderStatus::Ready));
        assert_eq!(view.apply_status(OrderStatus::Cancelled, StatusSource::Push), Applied::Advanced);
        assert_eq!(view.apply_status(OrderStatus::Served, StatusSource::Poll), Applied::Stale);
        assert!(view.is_terminal());
    }

    #[test]
    fn feed_state_transitions() {
        let mut view = TrackerView::new("abc");
        assert!(view.push_received());
        assert_eq!(view.feed, FeedState::Live);
        assert!(!view.deadline_elapsed());
        assert_eq!(view.feed, FeedState::Live);

        let mut view = TrackerView::new("abc");
        assert!(view.deadline_elapsed());
        assert_eq!(view.feed, FeedState::Polling);
        assert!(!view.push_received());
        assert_eq!(view.feed, FeedState::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn mounted_order_shows_first_stage() {
        let remote = seeded("new");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();

        let shown = wait_until(&mut view, |v| !v.loading).await;
        assert_eq!(shown.status, Some(OrderStatus::New));
        assert_eq!(shown.stage().and_then(Stage::index), Some(0));
        assert_eq!(
            shown.message(),
            Some("Your order has been sent to your favorite barista")
        );
        assert_eq!(shown.pickup_code.as_deref(), Some("WB42"));
        assert_eq!(shown.items[0].options[0].option_name, "Oat");

        tracker.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_before_deadline_keeps_feed_live_without_polling() {
        let remote = seeded("new");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| !v.loading).await;

        assert_eq!(
            remote.push("orders", ChangeKind::Update, json!({ "id": "abc", "status": "preparing" })),
            1
        );
        let shown = wait_until(&mut view, |v| v.status == Some(OrderStatus::Preparing)).await;
        assert_eq!(shown.feed, FeedState::Live);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.select_count("orders"), 0);
        assert_eq!(tracker.current().feed, FeedState::Live);

        tracker.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_deadline_starts_polling() {
        let remote = seeded("new");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| !v.loading).await;

        wait_until(&mut view, |v| v.feed == FeedState::Polling).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.select_count("orders"), 1);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(remote.select_count("orders"), 2);
        assert_eq!(tracker.current().status, Some(OrderStatus::New));

        tracker.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_poll_never_regresses_a_pushed_stage() {
        // The row the poller reads lags behind the push.
        let remote = seeded("preparing");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| v.feed == FeedState::Polling).await;

        remote.push("orders", ChangeKind::Update, json!({ "id": "abc", "status": "ready" }));
        wait_until(&mut view, |v| v.status == Some(OrderStatus::Ready)).await;

        let polls_before = remote.select_count("orders");
        sleep(Duration::from_secs(5)).await;
        assert!(remote.select_count("orders") > polls_before);
        let shown = tracker.current();
        assert_eq!(shown.status, Some(OrderStatus::Ready));
        assert_eq!(shown.stage().and_then(Stage::index), Some(2));
        assert_eq!(shown.feed, FeedState::Polling);

        tracker.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_once_cancelled() {
        let remote = seeded("new");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| v.feed == FeedState::Polling).await;

        remote.push("orders", ChangeKind::Update, json!({ "id": "abc", "status": "cancelled" }));
        let shown = wait_until(&mut view, |v| v.is_terminal()).await;
        assert_eq!(shown.message(), Some("Your order has been cancelled"));
        assert_eq!(shown.stage().and_then(Stage::index), None);

        let polls = remote.select_count("orders");
        sleep(Duration::from_secs(20)).await;
        assert_eq!(remote.select_count("orders"), polls);
        assert_eq!(remote.open_subscriptions(), 1);

        tracker.unmount().await;
        assert_eq!(remote.open_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscription_polls_right_away() {
        let remote = seeded("preparing");
        remote.fail_subscribe(Error::Subscription("join rejected".into()));
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();

        wait_until(&mut view, |v| v.feed == FeedState::Polling && !v.loading).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.select_count("orders"), 1);
        assert_eq!(tracker.current().status, Some(OrderStatus::Preparing));

        tracker.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handshake_does_not_hold_back_reads_or_polling() {
        let remote = seeded("preparing");
        remote.slow_subscribe(Duration::from_secs(20));
        let started = Instant::now();
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();

        let shown = wait_until(&mut view, |v| !v.loading).await;
        assert_eq!(shown.status, Some(OrderStatus::Preparing));
        assert!(started.elapsed() < Duration::from_secs(1));

        wait_until(&mut view, |v| v.feed == FeedState::Polling).await;
        sleep(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(remote.select_count("orders"), 1);
        assert_eq!(remote.open_subscriptions(), 0);

        // The late channel still delivers once it is joined.
        sleep(Duration::from_secs(20)).await;
        assert_eq!(remote.open_subscriptions(), 1);
        remote.push("orders", ChangeKind::Update, json!({ "id": "abc", "status": "ready" }));
        let shown = wait_until(&mut view, |v| v.status == Some(OrderStatus::Ready)).await;
        assert_eq!(shown.feed, FeedState::Polling);

        tracker.unmount().await;
        assert_eq!(remote.open_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_during_handshake_opens_nothing() {
        let remote = seeded("new");
        remote.slow_subscribe(Duration::from_secs(20));
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| !v.loading).await;

        tracker.unmount().await;
        sleep(Duration::from_secs(30)).await;
        assert_eq!(remote.open_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_feed_falls_back_to_polling() {
        let remote = seeded("new");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| !v.loading).await;
        remote.push("orders", ChangeKind::Update, json!({ "id": "abc", "status": "new" }));
        wait_until(&mut view, |v| v.feed == FeedState::Live).await;

        remote.drop_subscriptions();
        wait_until(&mut view, |v| v.feed == FeedState::Polling).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.select_count("orders"), 1);

        tracker.unmount().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_releases_everything() {
        let remote = seeded("new");
        let tracker = OrderTracker::mount(remote.clone(), "abc", config());
        let mut view = tracker.view();
        wait_until(&mut view, |v| v.feed == FeedState::Polling).await;
        assert_eq!(remote.open_subscriptions(), 1);

        tracker.unmount().await;
        let calls = remote.call_count();
        let last = view.borrow().clone();

        assert_eq!(remote.open_subscriptions(), 0);
        assert_eq!(
            remote.push("orders", ChangeKind::Update, json!({ "id": "abc", "status": "ready" })),
            0
        );
        sleep(Duration::from_secs(30)).await;
        assert_eq!(remote.call_count(), calls);
        assert_eq!(*view.borrow(), last);
        assert!(view.has_changed().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_order_reports_an_error() {
        let remote = FakeRemote::new();
        remote.script_rpc("public_get_order", Ok(json!({})));
        let tracker = OrderTracker::mount(remote.clone(), "nope", config());
        let mut view = tracker.view();
        let shown = wait_until(&mut view, |v| !v.loading).await;
        assert_eq!(shown.error.as_deref(), Some("Order not found"));
        assert_eq!(shown.status, None);
        tracker.unmount().await;
    }
}
