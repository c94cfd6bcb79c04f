//! Wild Beans - café event ordering core.
//!
//! Customers build a cart from the event menu and submit it through a remote
//! procedure. The status tracker follows one order through push
//! notifications with a polling fallback, and the kitchen board gives staff
//! a live view of an event's orders with guarded status changes. All state
//! lives in the Supabase-backed data service; every view here is a
//! projection of it.

pub mod auth;
pub mod cart;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod kitchen;
pub mod menu;
pub mod model;
pub mod orders;
pub mod remote;
pub mod stats;
pub mod storage;
pub mod tracker;

pub use auth::AdminGate;
pub use cart::{BaristaCart, Cart, CartEntry, Selection, Submitter};
pub use config::Config;
pub use error::{CartError, Error, Result};
pub use kitchen::{BoardFilter, KitchenBoard, KitchenSession};
pub use model::{Order, OrderStatus, Stage};
pub use remote::{RemoteDataService, SupabaseClient};
pub use tracker::{FeedState, OrderTracker, TrackerConfig, TrackerView};

/// Resolves once `cancel_rx` carries `true` or its sender is gone.
pub(crate) async fn wait_cancelled(cancel_rx: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|stop| *stop).await;
}

/// Await the future in `slot` and clear the slot. Pends forever on an empty
/// slot, so it can sit in a `select!` branch guarded by `slot.is_some()`.
pub(crate) async fn settle<F>(slot: &mut Option<F>) -> F::Output
where
    F: std::future::Future + Unpin,
{
    let Some(fut) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let output = fut.await;
    *slot = None;
    output
}

/// First non-empty string under any of `keys`.
pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First integer under any of `keys`. Numeric strings count too.
pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => {
                if let Some(n) = n.as_i64() {
                    return Some(n);
                }
            }
            Some(serde_json::Value::String(s)) => {
                if let Ok(n) = s.trim().parse::<i64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}
