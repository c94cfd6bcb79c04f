//! In-memory data service for unit tests.
//!
//! Tables are plain JSON rows. Reads and writes apply equality filters,
//! procedures answer from a per-name script, and tests push change
//! notifications into whatever subscriptions are still open.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::{ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, RemoteDataService, RowQuery};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Select {
        table: String,
        filters: Vec<(String, String)>,
    },
    Update {
        table: String,
        filters: Vec<(String, String)>,
        any_of: Vec<(String, Vec<String>)>,
        patch: Value,
    },
    Rpc {
        name: String,
        args: Value,
    },
    Subscribe {
        channel: String,
    },
}

struct Subscription {
    filter: ChangeFilter,
    tx: mpsc::Sender<Result<ChangeEvent>>,
    cancel: CancellationToken,
}

impl Subscription {
    fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    fn wants(&self, table: &str, kind: ChangeKind, row: &Value) -> bool {
        self.filter.table == table
            && self.filter.accepts(kind)
            && self
                .filter
                .filter
                .as_ref()
                .map_or(true, |(col, val)| cell_matches(row, col, val))
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Value>>,
    rpc_script: HashMap<String, VecDeque<Result<Value>>>,
    select_failures: HashMap<String, VecDeque<Error>>,
    update_script: VecDeque<Result<Vec<Value>>>,
    subscribe_failure: Option<Error>,
    subscribe_delay: Option<Duration>,
    subscriptions: Vec<Subscription>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<State>,
    write_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- seeding ---------------------------------------------------------

    pub fn insert_row(&self, table: &str, row: Value) {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn script_rpc(&self, name: &str, response: Result<Value>) {
        self.lock()
            .rpc_script
            .entry(name.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn fail_next_select(&self, table: &str, err: Error) {
        self.lock()
            .select_failures
            .entry(table.to_string())
            .or_default()
            .push_back(err);
    }

    /// Override the next write's outcome without touching the table.
    pub fn script_update(&self, response: Result<Vec<Value>>) {
        self.lock().update_script.push_back(response);
    }

    pub fn fail_subscribe(&self, err: Error) {
        self.lock().subscribe_failure = Some(err);
    }

    /// Every later subscribe takes `delay` before the channel is joined.
    pub fn slow_subscribe(&self, delay: Duration) {
        self.lock().subscribe_delay = Some(delay);
    }

    /// Writes and procedure calls block until the returned handle is notified.
    pub fn hold_writes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.write_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    async fn pass_gate(&self) {
        let gate = self
            .write_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    // -- inspection ------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn select_count(&self, table: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Select { table: t, .. } if t == table))
            .count()
    }

    pub fn update_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Update { .. }))
            .count()
    }

    pub fn rpc_calls(&self, name: &str) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Rpc { name: n, args } if n == name => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn open_subscriptions(&self) -> usize {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| s.is_open())
            .count()
    }

    // -- notifications ---------------------------------------------------

    /// Deliver a change to every open subscription that matches. Returns how
    /// many subscriptions received it.
    pub fn push(&self, table: &str, kind: ChangeKind, row: Value) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for sub in state.subscriptions.iter().filter(|s| s.is_open()) {
            if !sub.wants(table, kind, &row) {
                continue;
            }
            let change = ChangeEvent {
                kind,
                table: table.to_string(),
                new_row: row.clone(),
                old_row: Value::Null,
            };
            if sub.tx.try_send(Ok(change)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close every open stream from the service side.
    pub fn drop_subscriptions(&self) {
        self.lock().subscriptions.clear();
    }
}

fn cell_matches(row: &Value, column: &str, expected: &str) -> bool {
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == expected,
    }
}

fn matches_query(row: &Value, query: &RowQuery) -> bool {
    query
        .filters()
        .iter()
        .all(|(col, val)| cell_matches(row, col, val))
        && query
            .any_of_filters()
            .iter()
            .all(|(col, vals)| vals.iter().any(|val| cell_matches(row, col, val)))
}

#[async_trait]
impl RemoteDataService for FakeRemote {
    async fn select(&self, query: &RowQuery) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.calls.push(Call::Select {
            table: query.table.clone(),
            filters: query.filters().to_vec(),
        });
        if let Some(err) = state
            .select_failures
            .get_mut(&query.table)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        Ok(state
            .tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_query(row, query))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update(&self, query: &RowQuery, patch: Value) -> Result<Vec<Value>> {
        self.lock().calls.push(Call::Update {
            table: query.table.clone(),
            filters: query.filters().to_vec(),
            any_of: query.any_of_filters().to_vec(),
            patch: patch.clone(),
        });

        self.pass_gate().await;

        let mut state = self.lock();
        if let Some(scripted) = state.update_script.pop_front() {
            return scripted;
        }
        let Some(rows) = state.tables.get_mut(&query.table) else {
            return Ok(Vec::new());
        };
        let mut changed = Vec::new();
        for row in rows.iter_mut().filter(|row| matches_query(row, query)) {
            if let (Value::Object(target), Value::Object(fields)) = (&mut *row, &patch) {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
            }
            changed.push(row.clone());
        }
        Ok(changed)
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value> {
        self.lock().calls.push(Call::Rpc {
            name: function.to_string(),
            args,
        });
        self.pass_gate().await;

        self.lock()
            .rpc_script
            .get_mut(function)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(Error::remote(Some(404), format!("no script for {function}"))))
    }

    async fn subscribe(&self, filter: ChangeFilter) -> Result<ChangeStream> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(Call::Subscribe {
                channel: filter.channel.clone(),
            });
            state.subscribe_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(err) = state.subscribe_failure.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        state.subscriptions.push(Subscription {
            filter,
            tx,
            cancel: cancel.clone(),
        });
        Ok(ChangeStream::new(rx, cancel, None))
    }
}
