//! Entities mirrored from the remote store and the order status vocabulary.
//!
//! Line item and option names on orders are snapshots taken when the order
//! was placed. They are never re-joined against the live menu.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Events and menu
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub join_code: String,
    #[serde(default)]
    pub kitchen_code: String,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_closed: bool,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Event {
    /// Name shown on customer-facing banners.
    pub fn banner_name(&self) -> &str {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifierKind {
    Single,
    Multi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierOption {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price_delta_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModifierKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<ModifierOption>,
}

impl Modifier {
    pub fn option(&self, option_id: &str) -> Option<&ModifierOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

impl MenuItem {
    pub fn modifier(&self, modifier_id: &str) -> Option<&Modifier> {
        self.modifiers.iter().find(|m| m.id == modifier_id)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub items: Vec<MenuItem>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineOption {
    #[serde(alias = "name")]
    pub option_name: String,
    #[serde(default)]
    pub price_delta_cents: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    #[serde(default)]
    pub id: Option<String>,
    pub item_name: String,
    #[serde(default = "default_qty")]
    pub qty: u32,
    #[serde(default)]
    pub options: Vec<OrderLineOption>,
}

fn default_qty() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub pickup_code: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub total_cents: Option<i64>,
    #[serde(default)]
    pub items: Vec<OrderLine>,
}

/// Denormalised single-order read used by the status tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    #[serde(default)]
    pub pickup_code: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub items: Vec<OrderLine>,
}

// ---------------------------------------------------------------------------
// Status vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[serde(alias = "pending", alias = "sent")]
    New,
    #[serde(alias = "taken", alias = "in_progress")]
    Preparing,
    Ready,
    #[serde(alias = "done")]
    Served,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::New,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::Served,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Served => "served",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Every spelling stored data may carry for this status.
    pub fn spellings(self) -> &'static [&'static str] {
        match self {
            OrderStatus::New => &["new", "pending", "sent"],
            OrderStatus::Preparing => &["preparing", "taken", "in_progress"],
            OrderStatus::Ready => &["ready"],
            OrderStatus::Served => &["served", "done"],
            OrderStatus::Cancelled => &["cancelled", "canceled"],
        }
    }

    /// Position in the lifecycle. Updates are applied only when the incoming
    /// rank is greater than or equal to the displayed one; `cancelled` ranks
    /// last so nothing can override it.
    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Preparing => 1,
            OrderStatus::Ready => 2,
            OrderStatus::Served => 3,
            OrderStatus::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Served | OrderStatus::Cancelled)
    }

    /// Statuses shown on the board in active mode.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::Preparing | OrderStatus::Ready
        )
    }

    pub fn stage(self) -> Stage {
        match self {
            OrderStatus::New => Stage::Sent,
            OrderStatus::Preparing => Stage::Preparing,
            OrderStatus::Ready | OrderStatus::Served => Stage::Ready,
            OrderStatus::Cancelled => Stage::Cancelled,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" | "pending" | "sent" => Ok(OrderStatus::New),
            "preparing" | "taken" | "in_progress" => Ok(OrderStatus::Preparing),
            "ready" => Ok(OrderStatus::Ready),
            "served" | "done" => Ok(OrderStatus::Served),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("Unknown order status: {other}")),
        }
    }
}

/// Display bucket derived from the raw status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sent,
    Preparing,
    Ready,
    Cancelled,
}

impl Stage {
    /// Progress-dot index (0/1/2). Cancelled has no position.
    pub fn index(self) -> Option<u8> {
        match self {
            Stage::Sent => Some(0),
            Stage::Preparing => Some(1),
            Stage::Ready => Some(2),
            Stage::Cancelled => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Stage::Sent => "Your order has been sent to your favorite barista",
            Stage::Preparing => "Your order is being prepared with love",
            Stage::Ready => "Your drink is ready and dying to meet you!",
            Stage::Cancelled => "Your order has been cancelled",
        }
    }

    pub fn progress(self) -> f32 {
        match self {
            Stage::Sent => 1.0 / 3.0,
            Stage::Preparing => 2.0 / 3.0,
            Stage::Ready => 1.0,
            Stage::Cancelled => 0.0,
        }
    }
}
