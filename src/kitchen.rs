//! Kitchen board: the staff-side live view of an event's orders.
//!
//! `KitchenBoard` is a plain projection over the loaded orders. It holds no
//! connection and can be tested on its own. `KitchenSession` owns the change
//! subscription, publishes the board through a watch channel and performs
//! status writes.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events;
use crate::model::{Order, OrderStatus};
use crate::orders;
use crate::remote::{
    finish_subscribe, next_change, ChangeFilter, ChangeKind, ChangeStream, RemoteDataService,
    Subscribing,
};
use crate::wait_cancelled;

const FEED_CLOSED_NOTICE: &str = "Live updates stopped. Reload the board to see new orders.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoardFilter {
    /// Only orders still on the counter.
    #[default]
    Active,
    /// Served and cancelled orders too.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    Unchanged,
    Missing,
}

/// Buttons a staff member may press on a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaffAction {
    Take,
    MarkReady,
    Serve,
    Cancel,
}

impl StaffAction {
    pub fn target(self) -> OrderStatus {
        match self {
            StaffAction::Take => OrderStatus::Preparing,
            StaffAction::MarkReady => OrderStatus::Ready,
            StaffAction::Serve => OrderStatus::Served,
            StaffAction::Cancel => OrderStatus::Cancelled,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StaffAction::Take => "Take",
            StaffAction::MarkReady => "Ready",
            StaffAction::Serve => "Served",
            StaffAction::Cancel => "Cancel",
        }
    }
}

/// Transitions offered from `status`. Terminal statuses offer none.
pub fn actions_for(status: OrderStatus) -> &'static [StaffAction] {
    match status {
        OrderStatus::New => &[StaffAction::Take, StaffAction::Cancel],
        OrderStatus::Preparing => &[StaffAction::MarkReady, StaffAction::Cancel],
        OrderStatus::Ready => &[StaffAction::Serve],
        OrderStatus::Served | OrderStatus::Cancelled => &[],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    actions_for(from).iter().any(|a| a.target() == to)
}

/// Relative age shown on cards, rounded to the nearest minute or hour.
pub fn time_ago(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    let minutes = (secs + 30) / 60;
    match minutes {
        0 => "just now".to_string(),
        1 => "1 min ago".to_string(),
        m if m < 60 => format!("{m} min ago"),
        m => match (m + 30) / 60 {
            1 => "1 h ago".to_string(),
            h => format!("{h} h ago"),
        },
    }
}

// ---------------------------------------------------------------------------
// Board projection
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq)]
pub struct Columns<'a> {
    pub new: Vec<&'a Order>,
    pub preparing: Vec<&'a Order>,
    pub ready: Vec<&'a Order>,
    /// Empty unless the board shows all orders.
    pub served: Vec<&'a Order>,
    pub cancelled: Vec<&'a Order>,
}

impl Columns<'_> {
    pub fn counts(&self) -> [usize; 5] {
        [
            self.new.len(),
            self.preparing.len(),
            self.ready.len(),
            self.served.len(),
            self.cancelled.len(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct KitchenBoard {
    pub event_id: Option<String>,
    pub filter: BoardFilter,
    orders: Vec<Order>,
    in_flight: HashSet<String>,
    pub loading: bool,
    /// Last error shown to staff.
    pub notice: Option<String>,
}

impl KitchenBoard {
    pub fn new(event_id: Option<String>, filter: BoardFilter) -> Self {
        Self {
            event_id,
            filter,
            loading: true,
            ..Self::default()
        }
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == order_id)
    }

    /// Swap in a fresh read. Orders are kept newest first.
    pub fn replace_all(&mut self, mut orders: Vec<Order>) {
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.orders = orders;
        self.loading = false;
    }

    /// Patch one order's status in place. Nothing else on the order changes.
    pub fn apply_update(&mut self, order_id: &str, status: OrderStatus) -> PatchOutcome {
        match self.orders.iter_mut().find(|o| o.id == order_id) {
            None => PatchOutcome::Missing,
            Some(order) if order.status == status => PatchOutcome::Unchanged,
            Some(order) => {
                order.status = status;
                PatchOutcome::Patched
            }
        }
    }

    pub fn is_in_flight(&self, order_id: &str) -> bool {
        self.in_flight.contains(order_id)
    }

    /// Claim the write slot for an order. False if one is already pending.
    pub fn begin_transition(&mut self, order_id: &str) -> bool {
        self.in_flight.insert(order_id.to_string())
    }

    pub fn finish_transition(&mut self, order_id: &str) -> bool {
        self.in_flight.remove(order_id)
    }

    /// Actions to render for a card. Disabled while its write is pending.
    pub fn actions(&self, order: &Order) -> &'static [StaffAction] {
        if self.is_in_flight(&order.id) {
            &[]
        } else {
            actions_for(order.status)
        }
    }

    pub fn visible(&self) -> impl Iterator<Item = &Order> {
        let filter = self.filter;
        self.orders
            .iter()
            .filter(move |o| filter == BoardFilter::All || o.status.is_active())
    }

    pub fn columns(&self) -> Columns<'_> {
        let mut columns = Columns::default();
        for order in self.visible() {
            match order.status {
                OrderStatus::New => columns.new.push(order),
                OrderStatus::Preparing => columns.preparing.push(order),
                OrderStatus::Ready => columns.ready.push(order),
                OrderStatus::Served => columns.served.push(order),
                OrderStatus::Cancelled => columns.cancelled.push(order),
            }
        }
        columns
    }
}

// ---------------------------------------------------------------------------
// Live session
// ---------------------------------------------------------------------------

pub struct KitchenSession {
    remote: Arc<dyn RemoteDataService>,
    event_id: Option<String>,
    board_tx: Arc<watch::Sender<KitchenBoard>>,
    board: watch::Receiver<KitchenBoard>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl KitchenSession {
    /// Mount a board for one event, or for every event when `event_id` is `None`.
    pub fn mount(
        remote: Arc<dyn RemoteDataService>,
        event_id: Option<String>,
        filter: BoardFilter,
    ) -> Self {
        let (board_tx, board) = watch::channel(KitchenBoard::new(event_id.clone(), filter));
        let board_tx = Arc::new(board_tx);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            remote.clone(),
            event_id.clone(),
            board_tx.clone(),
            cancel_rx,
        ));
        info!(event_id = ?event_id, ?filter, "kitchen board mounted");
        Self {
            remote,
            event_id,
            board_tx,
            board,
            cancel_tx,
            task: Some(task),
        }
    }

    /// Look the event up by its kitchen code, then mount its board.
    pub async fn open_by_code(
        remote: Arc<dyn RemoteDataService>,
        code: &str,
        filter: BoardFilter,
    ) -> Result<Self> {
        let event = events::find_by_kitchen_code(remote.as_ref(), code).await?;
        Ok(Self::mount(remote, Some(event.id), filter))
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn board(&self) -> watch::Receiver<KitchenBoard> {
        self.board.clone()
    }

    pub fn current(&self) -> KitchenBoard {
        self.board.borrow().clone()
    }

    pub fn set_filter(&self, filter: BoardFilter) {
        self.board_tx.send_if_modified(|b| {
            let changed = b.filter != filter;
            b.filter = filter;
            changed
        });
    }

    pub fn dismiss_notice(&self) {
        self.board_tx.send_if_modified(|b| b.notice.take().is_some());
    }

    pub async fn reload(&self) -> Result<()> {
        load(self.remote.as_ref(), self.event_id.as_deref(), &self.board_tx).await
    }

    /// Write a new status for one order. The board changes only after the
    /// write is confirmed; on failure the notice is set and the order stays put.
    pub async fn transition(&self, order_id: &str, next: OrderStatus) -> Result<OrderStatus> {
        let current = self
            .board
            .borrow()
            .order(order_id)
            .map(|o| o.status)
            .ok_or_else(|| Error::NotFound(format!("Order {order_id} is not on this board")))?;
        if !can_transition(current, next) {
            return Err(Error::InvalidTransition {
                from: current,
                to: next,
            });
        }
        if !self.board_tx.send_if_modified(|b| b.begin_transition(order_id)) {
            debug!(order_id, "transition already pending");
            return Err(Error::TransitionInFlight(order_id.to_string()));
        }

        let result = orders::write_status(self.remote.as_ref(), order_id, current, next).await;

        self.board_tx.send_modify(|b| {
            b.finish_transition(order_id);
            match &result {
                Ok(confirmed) => {
                    b.apply_update(order_id, *confirmed);
                    b.notice = None;
                }
                Err(e) => {
                    warn!(order_id, from = %current, to = %next, error = %e, "status change failed");
                    b.notice = Some(e.user_message());
                }
            }
        });
        result
    }

    pub async fn take(&self, order_id: &str) -> Result<OrderStatus> {
        self.transition(order_id, OrderStatus::Preparing).await
    }

    pub async fn mark_ready(&self, order_id: &str) -> Result<OrderStatus> {
        self.transition(order_id, OrderStatus::Ready).await
    }

    pub async fn serve(&self, order_id: &str) -> Result<OrderStatus> {
        self.transition(order_id, OrderStatus::Served).await
    }

    pub async fn cancel(&self, order_id: &str) -> Result<OrderStatus> {
        self.transition(order_id, OrderStatus::Cancelled).await
    }

    /// Leave the channel and stop the session task.
    pub async fn unmount(mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(event_id = ?self.event_id, error = %e, "kitchen task ended abnormally");
            }
        }
        info!(event_id = ?self.event_id, "kitchen board unmounted");
    }
}

impl Drop for KitchenSession {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

async fn load(
    remote: &dyn RemoteDataService,
    event_id: Option<&str>,
    board_tx: &watch::Sender<KitchenBoard>,
) -> Result<()> {
    match orders::fetch_event_orders(remote, event_id).await {
        Ok(orders) => {
            debug!(event_id = ?event_id, count = orders.len(), "board loaded");
            board_tx.send_modify(|b| b.replace_all(orders));
            Ok(())
        }
        Err(e) => {
            warn!(event_id = ?event_id, error = %e, "board load failed");
            board_tx.send_modify(|b| {
                b.loading = false;
                b.notice = Some(e.user_message());
            });
            Err(e)
        }
    }
}

async fn run(
    remote: Arc<dyn RemoteDataService>,
    event_id: Option<String>,
    board_tx: Arc<watch::Sender<KitchenBoard>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let channel = format!("kitchen-orders-{}", event_id.as_deref().unwrap_or("all"));
    let mut filter = ChangeFilter::new(channel, "orders")
        .kinds(&[ChangeKind::Insert, ChangeKind::Update]);
    if let Some(event_id) = &event_id {
        filter = filter.eq("event_id", event_id);
    }

    // The first load does not wait for the channel handshake.
    let mut subscribing: Option<Subscribing<'_>> = Some(remote.subscribe(filter));
    let mut stream: Option<ChangeStream> = None;

    let initial = load(remote.as_ref(), event_id.as_deref(), &board_tx);
    tokio::pin!(initial);
    let mut loaded = false;

    loop {
        tokio::select! {
            biased;

            _ = wait_cancelled(&mut cancel_rx) => break,

            joined = finish_subscribe(&mut subscribing), if subscribing.is_some() => match joined {
                Ok(joined) => {
                    debug!(event_id = ?event_id, "kitchen change feed joined");
                    stream = Some(joined);
                    if loaded {
                        // Orders placed during the handshake were never pushed.
                        let reloaded = tokio::select! {
                            biased;
                            _ = wait_cancelled(&mut cancel_rx) => break,
                            r = load(remote.as_ref(), event_id.as_deref(), &board_tx) => r,
                        };
                        if let Err(e) = reloaded {
                            debug!(error = %e, "reload after late join failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(event_id = ?event_id, error = %e, "kitchen subscription failed");
                    board_tx.send_modify(|b| b.notice = Some(e.user_message()));
                }
            },

            _ = &mut initial, if !loaded => loaded = true,

            change = next_change(&mut stream), if stream.is_some() => match change {
                Some(Ok(change)) => match change.kind {
                    ChangeKind::Insert => {
                        debug!(event_id = ?event_id, order_id = ?change.new_id(), "new order, reloading");
                        let reloaded = tokio::select! {
                            biased;
                            _ = wait_cancelled(&mut cancel_rx) => break,
                            r = load(remote.as_ref(), event_id.as_deref(), &board_tx) => r,
                        };
                        if let Err(e) = reloaded {
                            debug!(error = %e, "reload after insert failed");
                        }
                    }
                    ChangeKind::Update => {
                        let (Some(order_id), Some(status)) = (change.new_id(), change.new_status()) else {
                            continue;
                        };
                        board_tx.send_if_modified(|b| match b.apply_update(order_id, status) {
                            PatchOutcome::Patched => true,
                            PatchOutcome::Unchanged => false,
                            PatchOutcome::Missing => {
                                debug!(order_id, "update for an order not on the board");
                                false
                            }
                        });
                    }
                    ChangeKind::Delete => {}
                },
                Some(Err(e)) => {
                    warn!(event_id = ?event_id, error = %e, "kitchen change feed failed");
                    board_tx.send_modify(|b| b.notice = Some(e.user_message()));
                    if let Some(stream) = stream.take() {
                        stream.close().await;
                    }
                }
                None => {
                    warn!(event_id = ?event_id, "kitchen change feed closed");
                    stream = None;
                    board_tx.send_modify(|b| b.notice = Some(FEED_CLOSED_NOTICE.to_string()));
                }
            },
        }
    }

    if let Some(stream) = stream {
        stream.close().await;
    }
}
