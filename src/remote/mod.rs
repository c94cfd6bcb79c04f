//! Remote Data Service boundary.
//!
//! The hosted store owns every persisted row. This module defines the four
//! call shapes the rest of the crate relies on (row reads, row writes, named
//! procedures and change subscriptions) and the reqwest/websocket client
//! that speaks them.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::model::OrderStatus;

#[cfg(test)]
pub(crate) mod fake;
pub mod realtime;
pub mod rest;

pub use rest::SupabaseClient;

// ---------------------------------------------------------------------------
// Row queries
// ---------------------------------------------------------------------------

/// A PostgREST row selection: table, columns, equality filters, ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    pub table: String,
    select: Option<String>,
    filters: Vec<(String, String)>,
    any_of: Vec<(String, Vec<String>)>,
    order: Vec<String>,
    limit: Option<u32>,
}

impl RowQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            select: None,
            filters: Vec::new(),
            any_of: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn select(mut self, columns: &str) -> Self {
        let compact: String = columns.split_whitespace().collect();
        self.select = Some(compact);
        self
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push((column.to_string(), value.to_string()));
        self
    }

    /// `col=in.(a,b)`: the column holds any of the values.
    pub fn any_of(mut self, column: &str, values: &[&str]) -> Self {
        let values = values.iter().map(|v| v.to_string()).collect();
        self.any_of.push((column.to_string(), values));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order.push(format!("{column}.asc"));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order.push(format!("{column}.desc.nullslast"));
        self
    }

    pub fn limit(mut self, n: u32) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn filters(&self) -> &[(String, String)] {
        &self.filters
    }

    pub fn any_of_filters(&self) -> &[(String, Vec<String>)] {
        &self.any_of
    }

    pub fn filter_value(&self, column: &str) -> Option<&str> {
        self.filters
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    /// Render as PostgREST query pairs.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(select) = &self.select {
            params.push(("select".to_string(), select.clone()));
        }
        for (column, value) in &self.filters {
            params.push((column.clone(), format!("eq.{value}")));
        }
        for (column, values) in &self.any_of {
            params.push((column.clone(), format!("in.({})", values.join(","))));
        }
        if !self.order.is_empty() {
            params.push(("order".to_string(), self.order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// What a view wants to hear about: one table, an optional equality filter,
/// and the event kinds (empty means all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub channel: String,
    pub table: String,
    pub filter: Option<(String, String)>,
    pub kinds: Vec<ChangeKind>,
}

impl ChangeFilter {
    pub fn new(channel: impl Into<String>, table: &str) -> Self {
        Self {
            channel: channel.into(),
            table: table.to_string(),
            filter: None,
            kinds: Vec::new(),
        }
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filter = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn kinds(mut self, kinds: &[ChangeKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// `col=eq.value` as the realtime server expects it.
    pub fn filter_expr(&self) -> Option<String> {
        self.filter
            .as_ref()
            .map(|(column, value)| format!("{column}=eq.{value}"))
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub new_row: Value,
    pub old_row: Value,
}

impl ChangeEvent {
    pub fn new_id(&self) -> Option<&str> {
        self.new_row
            .get("id")
            .or_else(|| self.old_row.get("id"))
            .and_then(Value::as_str)
    }

    /// Status carried by the new row. Unknown spellings are dropped.
    pub fn new_status(&self) -> Option<OrderStatus> {
        let raw = self.new_row.get("status").and_then(Value::as_str)?;
        match raw.parse::<OrderStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(table = %self.table, error = %e, "ignoring change with unknown status");
                None
            }
        }
    }
}

/// Live change feed for one subscription. Dropping it tears the channel down.
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeEvent>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChangeStream {
    pub fn new(
        rx: mpsc::Receiver<Result<ChangeEvent>>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, cancel, task }
    }

    /// Next notification, or `None` once the channel has closed.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        self.rx.recv().await
    }

    /// Leave the channel and wait for the socket task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Next change from an optional stream. Pends forever when there is none, so
/// it can sit in a `select!` next to timers.
pub async fn next_change(stream: &mut Option<ChangeStream>) -> Option<Result<ChangeEvent>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// A `subscribe` call that has not resolved yet. The handshake can take a
/// while, so views keep it next to their other work instead of awaiting it.
pub type Subscribing<'a> = Pin<Box<dyn Future<Output = Result<ChangeStream>> + Send + 'a>>;

/// Drive a pending subscribe to completion. Pends forever when there is none.
/// Dropping the returned future leaves the handshake in `pending`.
pub async fn finish_subscribe(pending: &mut Option<Subscribing<'_>>) -> Result<ChangeStream> {
    crate::settle(pending).await
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RemoteDataService: Send + Sync {
    /// Read rows matching the query. An empty match is `Ok(vec![])`.
    async fn select(&self, query: &RowQuery) -> Result<Vec<Value>>;

    /// Patch matching rows and return the rows the store actually changed.
    async fn update(&self, query: &RowQuery, patch: Value) -> Result<Vec<Value>>;

    /// Invoke a named stored procedure.
    async fn rpc(&self, function: &str, args: Value) -> Result<Value>;

    /// Open a change subscription.
    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream>;
}
