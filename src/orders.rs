//! Order reads and writes against the data service.
//!
//! Orders are created by stored procedures in one atomic call. After
//! creation the only field anyone writes is `status`, always keyed by order
//! id and never by pickup code.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Order, OrderSnapshot, OrderStatus};
use crate::remote::{RemoteDataService, RowQuery};
use crate::{value_i64, value_str};

/// Join code used when the customer did not arrive through a coded link.
pub const DEFAULT_JOIN_CODE: &str = "WB1";

const ORDERS_TABLE: &str = "orders";
const BOARD_SELECT: &str = "id, event_id, pickup_code, customer_name, note, status, created_at, \
     total_cents, items:order_items(id, item_name, qty, \
     options:order_item_options(option_name, price_delta_cents))";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One cup. `qty` is always 1; counts are expanded into separate lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderItemRequest {
    pub item_id: String,
    pub qty: u32,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaceOrderRequest {
    pub event_slug: String,
    pub join_code: String,
    pub customer_name: Option<String>,
    pub note: Option<String>,
    pub items: Vec<OrderItemRequest>,
}

impl PlaceOrderRequest {
    fn to_args(&self) -> Value {
        json!({
            "p_event_slug": self.event_slug,
            "p_join_code": self.join_code,
            "p_customer_name": self.customer_name,
            "p_note": self.note,
            "p_items": self.items,
        })
    }
}

/// Staff-entered line. Options are keyed by modifier id: a single option id
/// for `single` modifiers, a list for `multi`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaristaItemRequest {
    pub item_id: String,
    pub qty: u32,
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaristaOrderRequest {
    pub event_id: String,
    pub items: Vec<BaristaItemRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    pub pickup_code: String,
}

// ---------------------------------------------------------------------------
// Procedures
// ---------------------------------------------------------------------------

/// Table-returning procedures answer with a one-row array.
fn first_row(value: Value) -> Value {
    match value {
        Value::Array(mut rows) if !rows.is_empty() => rows.swap_remove(0),
        other => other,
    }
}

pub async fn place_order(
    remote: &dyn RemoteDataService,
    request: &PlaceOrderRequest,
) -> Result<PlacedOrder> {
    let value = remote.rpc("place_order", request.to_args()).await?;
    let placed: PlacedOrder = serde_json::from_value(first_row(value))
        .map_err(|e| Error::Decode(format!("place_order: {e}")))?;
    info!(
        order_id = %placed.order_id,
        pickup_code = %placed.pickup_code,
        lines = request.items.len(),
        "order placed"
    );
    Ok(placed)
}

/// Returns the number of orders the procedure created.
pub async fn barista_place_order(
    remote: &dyn RemoteDataService,
    request: &BaristaOrderRequest,
) -> Result<u32> {
    let args = json!({
        "p_event_id": request.event_id,
        "p_items": request.items,
    });
    let value = first_row(remote.rpc("barista_place_order", args).await?);
    let created = value_i64(&value, &["orders_created"])
        .ok_or_else(|| Error::Decode("barista_place_order: missing orders_created".into()))?;
    let created = u32::try_from(created)
        .map_err(|_| Error::Decode(format!("barista_place_order: {created} out of range")))?;
    info!(event_id = %request.event_id, orders_created = created, "barista order placed");
    Ok(created)
}

/// Denormalised single-order read. An empty answer means the order is unknown.
pub async fn fetch_snapshot(
    remote: &dyn RemoteDataService,
    order_id: &str,
) -> Result<Option<OrderSnapshot>> {
    let value = first_row(
        remote
            .rpc("public_get_order", json!({ "p_order_id": order_id }))
            .await?,
    );
    let is_empty = match &value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if is_empty {
        debug!(order_id, "no snapshot for order");
        return Ok(None);
    }
    let snapshot = serde_json::from_value(value)
        .map_err(|e| Error::Decode(format!("public_get_order: {e}")))?;
    Ok(Some(snapshot))
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Single-column status read used by fallback polling.
pub async fn fetch_status(
    remote: &dyn RemoteDataService,
    order_id: &str,
) -> Result<Option<OrderStatus>> {
    let query = RowQuery::new(ORDERS_TABLE)
        .select("status")
        .eq("id", order_id)
        .limit(1);
    let rows = remote.select(&query).await?;
    let Some(raw) = rows.first().and_then(|row| value_str(row, &["status"])) else {
        return Ok(None);
    };
    raw.parse::<OrderStatus>().map(Some).map_err(Error::Decode)
}

/// Orders with embedded lines, newest first. `None` reads every event.
pub async fn fetch_event_orders(
    remote: &dyn RemoteDataService,
    event_id: Option<&str>,
) -> Result<Vec<Order>> {
    let mut query = RowQuery::new(ORDERS_TABLE).select(BOARD_SELECT);
    if let Some(event_id) = event_id {
        query = query.eq("event_id", event_id);
    }
    let rows = remote.select(&query.order_desc("created_at")).await?;

    let mut orders = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<Order>(row) {
            Ok(order) => orders.push(order),
            Err(e) => warn!(event_id = ?event_id, error = %e, "skipping malformed order row"),
        }
    }
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(orders)
}

/// Write a new status, conditional on the row still holding `expected`.
///
/// The store must hand back the changed row. An empty answer means nothing
/// was written (stale board, deleted order, or access rule) and is reported
/// as [`Error::NoRowsAffected`].
pub async fn write_status(
    remote: &dyn RemoteDataService,
    order_id: &str,
    expected: OrderStatus,
    next: OrderStatus,
) -> Result<OrderStatus> {
    let query = RowQuery::new(ORDERS_TABLE)
        .select("id,status")
        .eq("id", order_id)
        .any_of("status", expected.spellings());
    let rows = remote
        .update(&query, json!({ "status": next.as_str() }))
        .await?;

    let Some(row) = rows.iter().find(|r| value_str(r, &["id"]).as_deref() == Some(order_id))
    else {
        warn!(order_id, from = %expected, to = %next, "status write affected no rows");
        return Err(Error::NoRowsAffected {
            table: ORDERS_TABLE.to_string(),
            id: order_id.to_string(),
        });
    };

    let confirmed = value_str(row, &["status"])
        .and_then(|s| s.parse::<OrderStatus>().ok())
        .unwrap_or(next);
    info!(order_id, from = %expected, to = %confirmed, "order status written");
    Ok(confirmed)
}
