//! Multi-drink cart, modifier validation and submission.
//!
//! Validation runs locally and blocks the remote call entirely. A submitted
//! cart becomes one procedure call; counts are expanded into one line per cup
//! before the request is built.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CartError, Error, Result};
use crate::model::{MenuItem, Modifier, ModifierKind};
use crate::orders::{
    self, BaristaItemRequest, BaristaOrderRequest, OrderItemRequest, PlaceOrderRequest,
    PlacedOrder, DEFAULT_JOIN_CODE,
};
use crate::remote::RemoteDataService;

pub type CartResult<T> = std::result::Result<T, CartError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Single(Option<String>),
    Multi(Vec<String>),
}

impl Selection {
    fn empty_for(kind: ModifierKind) -> Self {
        match kind {
            ModifierKind::Single => Selection::Single(None),
            ModifierKind::Multi => Selection::Multi(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Selection::Single(choice) => choice.is_none(),
            Selection::Multi(choices) => choices.is_empty(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One cup: a menu item plus a selection per attached modifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CartEntry {
    item: MenuItem,
    selections: HashMap<String, Selection>,
}

impl CartEntry {
    pub fn new(item: MenuItem) -> Self {
        let selections = item
            .modifiers
            .iter()
            .map(|m| (m.id.clone(), Selection::empty_for(m.kind)))
            .collect();
        Self { item, selections }
    }

    /// Staff entry: required single-choice modifiers start on their first option.
    pub fn with_defaults(item: MenuItem) -> Self {
        let mut entry = Self::new(item);
        for modifier in entry.item.modifiers.iter() {
            if modifier.kind == ModifierKind::Single && modifier.required {
                if let Some(first) = modifier.options.first() {
                    entry
                        .selections
                        .insert(modifier.id.clone(), Selection::Single(Some(first.id.clone())));
                }
            }
        }
        entry
    }

    pub fn item(&self) -> &MenuItem {
        &self.item
    }

    pub fn selection(&self, modifier_id: &str) -> Option<&Selection> {
        self.selections.get(modifier_id)
    }

    fn modifier_of_kind(&self, modifier_id: &str, kind: ModifierKind) -> CartResult<&Modifier> {
        let modifier = self
            .item
            .modifier(modifier_id)
            .ok_or_else(|| CartError::UnknownModifier {
                item: self.item.name.clone(),
                modifier: modifier_id.to_string(),
            })?;
        if modifier.kind != kind {
            return Err(CartError::KindMismatch {
                modifier: modifier.name.clone(),
                expected: match modifier.kind {
                    ModifierKind::Single => "single".to_string(),
                    ModifierKind::Multi => "multiple".to_string(),
                },
            });
        }
        Ok(modifier)
    }

    fn check_option(modifier: &Modifier, option_id: &str) -> CartResult<()> {
        if modifier.option(option_id).is_none() {
            return Err(CartError::UnknownOption {
                modifier: modifier.name.clone(),
                option: option_id.to_string(),
            });
        }
        Ok(())
    }

    /// Choose the option of a single-choice modifier, replacing any previous choice.
    pub fn select_single(&mut self, modifier_id: &str, option_id: &str) -> CartResult<()> {
        let modifier = self.modifier_of_kind(modifier_id, ModifierKind::Single)?;
        Self::check_option(modifier, option_id)?;
        self.selections.insert(
            modifier_id.to_string(),
            Selection::Single(Some(option_id.to_string())),
        );
        Ok(())
    }

    pub fn clear_single(&mut self, modifier_id: &str) -> CartResult<()> {
        self.modifier_of_kind(modifier_id, ModifierKind::Single)?;
        self.selections
            .insert(modifier_id.to_string(), Selection::Single(None));
        Ok(())
    }

    /// Add the option to a multi-choice modifier, or remove it if already chosen.
    pub fn toggle_multi(&mut self, modifier_id: &str, option_id: &str) -> CartResult<()> {
        let modifier = self.modifier_of_kind(modifier_id, ModifierKind::Multi)?;
        Self::check_option(modifier, option_id)?;
        let slot = self
            .selections
            .entry(modifier_id.to_string())
            .or_insert_with(|| Selection::Multi(Vec::new()));
        if let Selection::Multi(chosen) = slot {
            if let Some(pos) = chosen.iter().position(|id| id == option_id) {
                chosen.remove(pos);
            } else {
                chosen.push(option_id.to_string());
            }
        }
        Ok(())
    }

    /// First required modifier left without a choice.
    pub fn missing_required(&self) -> Option<&Modifier> {
        self.item.modifiers.iter().find(|m| {
            m.required
                && self
                    .selections
                    .get(&m.id)
                    .map_or(true, Selection::is_empty)
        })
    }

    pub fn is_complete(&self) -> bool {
        self.missing_required().is_none()
    }

    fn check_complete(&self) -> CartResult<()> {
        match self.missing_required() {
            Some(modifier) => Err(CartError::MissingRequired {
                item: self.item.name.clone(),
                modifier: modifier.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Flattened option ids in modifier order; multi choices keep the order
    /// they were picked in.
    pub fn option_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for modifier in &self.item.modifiers {
            match self.selections.get(&modifier.id) {
                Some(Selection::Single(Some(id))) => ids.push(id.clone()),
                Some(Selection::Multi(chosen)) => ids.extend(chosen.iter().cloned()),
                _ => {}
            }
        }
        ids
    }

    /// Options keyed by modifier id, the shape the staff procedure takes.
    pub fn option_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for modifier in &self.item.modifiers {
            let value = match self.selections.get(&modifier.id) {
                Some(Selection::Single(Some(id))) => Value::String(id.clone()),
                Some(Selection::Multi(chosen)) if !chosen.is_empty() => {
                    Value::Array(chosen.iter().cloned().map(Value::String).collect())
                }
                _ => continue,
            };
            map.insert(modifier.id.clone(), value);
        }
        map
    }

    /// Names of the chosen options, for the cart tray.
    pub fn selected_names(&self) -> Vec<String> {
        let ids = self.option_ids();
        ids.iter()
            .filter_map(|id| {
                self.item
                    .modifiers
                    .iter()
                    .find_map(|m| m.option(id))
                    .map(|o| o.name.clone())
            })
            .collect()
    }

    fn to_line(&self) -> OrderItemRequest {
        OrderItemRequest {
            item_id: self.item.id.clone(),
            qty: 1,
            options: self.option_ids(),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Customer cart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cart {
    entries: Vec<CartEntry>,
    customer_name: Option<String>,
    note: Option<String>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh entry for the item and return its position.
    pub fn add(&mut self, item: MenuItem) -> usize {
        self.entries.push(CartEntry::new(item));
        self.entries.len() - 1
    }

    pub fn push(&mut self, entry: CartEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn entries(&self) -> &[CartEntry] {
        &self.entries
    }

    pub fn entry_mut(&mut self, index: usize) -> CartResult<&mut CartEntry> {
        self.entries
            .get_mut(index)
            .ok_or(CartError::NoSuchEntry(index))
    }

    pub fn remove(&mut self, index: usize) -> CartResult<CartEntry> {
        if index >= self.entries.len() {
            return Err(CartError::NoSuchEntry(index));
        }
        Ok(self.entries.remove(index))
    }

    /// Make the entry appear `count` times in total, copies placed right after it.
    pub fn set_count(&mut self, index: usize, count: u32) -> CartResult<()> {
        if count == 0 {
            return Err(CartError::ZeroCount);
        }
        let entry = self
            .entries
            .get(index)
            .cloned()
            .ok_or(CartError::NoSuchEntry(index))?;
        let copies = std::iter::repeat(entry).take(count as usize - 1);
        self.entries.splice(index + 1..index + 1, copies);
        Ok(())
    }

    pub fn set_customer_name(&mut self, name: &str) {
        self.customer_name = non_empty(name);
    }

    pub fn set_note(&mut self, note: &str) {
        self.note = non_empty(note);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.customer_name = None;
        self.note = None;
    }

    pub fn validate(&self) -> CartResult<()> {
        if self.entries.is_empty() {
            return Err(CartError::EmptyCart);
        }
        self.entries.iter().try_for_each(CartEntry::check_complete)
    }

    /// Validate and flatten into the place-order request.
    pub fn build_request(
        &self,
        event_slug: &str,
        join_code: Option<&str>,
    ) -> CartResult<PlaceOrderRequest> {
        self.validate()?;
        Ok(PlaceOrderRequest {
            event_slug: event_slug.to_string(),
            join_code: join_code
                .and_then(non_empty)
                .unwrap_or_else(|| DEFAULT_JOIN_CODE.to_string()),
            customer_name: self.customer_name.clone(),
            note: self.note.clone(),
            items: self.entries.iter().map(CartEntry::to_line).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Staff cart
// ---------------------------------------------------------------------------

/// Counter-side ordering for one event. Each added entry is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct BaristaCart {
    event_id: String,
    entries: Vec<CartEntry>,
}

impl BaristaCart {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Start configuring an item with staff defaults applied.
    pub fn draft(item: MenuItem) -> CartEntry {
        CartEntry::with_defaults(item)
    }

    /// Add `count` identical cups, one entry each.
    pub fn add_with_count(&mut self, entry: CartEntry, count: u32) -> CartResult<()> {
        if count == 0 {
            return Err(CartError::ZeroCount);
        }
        entry.check_complete()?;
        self.entries
            .extend(std::iter::repeat(entry).take(count as usize));
        Ok(())
    }

    pub fn entries(&self) -> &[CartEntry] {
        &self.entries
    }

    pub fn remove(&mut self, index: usize) -> CartResult<CartEntry> {
        if index >= self.entries.len() {
            return Err(CartError::NoSuchEntry(index));
        }
        Ok(self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn build_request(&self) -> CartResult<BaristaOrderRequest> {
        if self.entries.is_empty() {
            return Err(CartError::EmptyCart);
        }
        self.entries.iter().try_for_each(CartEntry::check_complete)?;
        Ok(BaristaOrderRequest {
            event_id: self.event_id.clone(),
            items: self
                .entries
                .iter()
                .map(|entry| BaristaItemRequest {
                    item_id: entry.item.id.clone(),
                    qty: 1,
                    options: entry.option_map(),
                })
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Sends carts, refusing a second submission while one is still in flight.
pub struct Submitter {
    remote: Arc<dyn RemoteDataService>,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Submitter {
    pub fn new(remote: Arc<dyn RemoteDataService>) -> Self {
        Self {
            remote,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_submitting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::SubmissionInFlight)?;
        Ok(InFlight(&self.in_flight))
    }

    /// Place the customer's order. The cart is cleared only on success.
    pub async fn submit(
        &self,
        cart: &mut Cart,
        event_slug: &str,
        join_code: Option<&str>,
    ) -> Result<PlacedOrder> {
        let request = cart.build_request(event_slug, join_code)?;
        let _guard = self.begin()?;
        debug!(event_slug, lines = request.items.len(), "submitting cart");

        match orders::place_order(self.remote.as_ref(), &request).await {
            Ok(placed) => {
                cart.clear();
                Ok(placed)
            }
            Err(e) => {
                warn!(event_slug, error = %e, "cart submission failed");
                Err(e)
            }
        }
    }

    /// Place a staff order. Returns how many orders were created.
    pub async fn submit_barista(&self, cart: &mut BaristaCart) -> Result<u32> {
        let request = cart.build_request()?;
        let _guard = self.begin()?;

        match orders::barista_place_order(self.remote.as_ref(), &request).await {
            Ok(created) => {
                cart.clear();
                Ok(created)
            }
            Err(e) => {
                warn!(event_id = %cart.event_id, error = %e, "barista submission failed");
                Err(e)
            }
        }
    }
}
