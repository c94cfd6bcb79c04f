//! Menu assembly for the ordering screens and per-event availability for admins.
//!
//! The public menu is read as five flat tables and stitched together
//! locally: categories hold items, items hold their modifiers in link order,
//! modifiers hold their options in sort order.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Category, MenuItem, Modifier, ModifierOption};
use crate::remote::{RemoteDataService, RowQuery};

#[derive(Debug, Clone, Deserialize)]
struct ItemModifierLink {
    item_id: String,
    modifier_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OptionRow {
    id: String,
    name: String,
    modifier_id: String,
    #[serde(default)]
    price_delta_cents: Option<i64>,
}

/// Flat table reads, before assembly.
#[derive(Debug, Clone, Default)]
pub struct MenuTables {
    pub categories: Vec<Value>,
    pub items: Vec<Value>,
    pub item_modifiers: Vec<Value>,
    pub modifiers: Vec<Value>,
    pub options: Vec<Value>,
}

fn decode_rows<T: for<'de> Deserialize<'de>>(rows: Vec<Value>, table: &str) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(table, error = %e, "skipping malformed menu row");
                None
            }
        })
        .collect()
}

pub async fn read_menu_tables(remote: &dyn RemoteDataService) -> Result<MenuTables> {
    let categories = RowQuery::new("categories")
        .select("id, name")
        .order_asc("sort_order");
    let items = RowQuery::new("items")
        .select("id, name, description, category_id, is_active")
        .eq("is_active", true)
        .order_asc("sort_order");
    let item_modifiers = RowQuery::new("item_modifiers").select("item_id, modifier_id");
    let modifiers = RowQuery::new("modifiers").select("id, name, type, required");
    let options = RowQuery::new("modifier_options")
        .select("id, name, modifier_id, sort_order")
        .order_asc("sort_order");

    let (categories, items, item_modifiers, modifiers, options) = futures::try_join!(
        remote.select(&categories),
        remote.select(&items),
        remote.select(&item_modifiers),
        remote.select(&modifiers),
        remote.select(&options),
    )?;
    Ok(MenuTables {
        categories,
        items,
        item_modifiers,
        modifiers,
        options,
    })
}

/// Stitch flat tables into the nested menu. Items whose category is unknown
/// are dropped, as are links to unknown modifiers.
pub fn assemble_menu(tables: MenuTables) -> Vec<Category> {
    let mut modifiers: HashMap<String, Modifier> = decode_rows::<Modifier>(tables.modifiers, "modifiers")
        .into_iter()
        .map(|m| (m.id.clone(), Modifier { options: Vec::new(), ..m }))
        .collect();
    for opt in decode_rows::<OptionRow>(tables.options, "modifier_options") {
        match modifiers.get_mut(&opt.modifier_id) {
            Some(m) => m.options.push(ModifierOption {
                id: opt.id,
                name: opt.name,
                price_delta_cents: opt.price_delta_cents,
            }),
            None => debug!(option_id = %opt.id, "option for unknown modifier"),
        }
    }

    let links = decode_rows::<ItemModifierLink>(tables.item_modifiers, "item_modifiers");
    let mut by_category: HashMap<String, Vec<MenuItem>> = HashMap::new();
    for mut item in decode_rows::<MenuItem>(tables.items, "items") {
        if !item.is_active {
            continue;
        }
        item.modifiers = links
            .iter()
            .filter(|l| l.item_id == item.id)
            .filter_map(|l| modifiers.get(&l.modifier_id).cloned())
            .collect();
        if let Some(category_id) = item.category_id.clone() {
            by_category.entry(category_id).or_default().push(item);
        }
    }

    decode_rows::<Category>(tables.categories, "categories")
        .into_iter()
        .map(|mut c| {
            c.items = by_category.remove(&c.id).unwrap_or_default();
            c
        })
        .collect()
}

pub async fn load_menu(remote: &dyn RemoteDataService) -> Result<Vec<Category>> {
    let menu = assemble_menu(read_menu_tables(remote).await?);
    let items: usize = menu.iter().map(|c| c.items.len()).sum();
    debug!(categories = menu.len(), items, "menu loaded");
    Ok(menu)
}

// ---------------------------------------------------------------------------
// Per-event availability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMenuItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventMenuCategory {
    pub id: String,
    pub name: String,
    pub items: Vec<EventMenuItem>,
}

impl EventMenuCategory {
    pub fn all_enabled(&self) -> bool {
        self.items.iter().all(|i| i.enabled)
    }
}

/// Items of every category with their availability at one event, grouped
/// by category in the order they were returned.
pub async fn list_items_for_event(
    remote: &dyn RemoteDataService,
    event_id: &str,
) -> Result<Vec<EventMenuCategory>> {
    let value = remote
        .rpc("admin_list_items_for_event", json!({ "event_id": event_id }))
        .await?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => {
            return Err(Error::Decode(format!(
                "admin_list_items_for_event: expected list, got {other}"
            )))
        }
    };

    let mut grouped: Vec<EventMenuCategory> = Vec::new();
    for item in decode_rows::<EventMenuItem>(rows, "admin_list_items_for_event") {
        match grouped.iter_mut().find(|c| c.id == item.category_id) {
            Some(category) => category.items.push(item),
            None => grouped.push(EventMenuCategory {
                id: item.category_id.clone(),
                name: item.category_name.clone(),
                items: vec![item],
            }),
        }
    }
    Ok(grouped)
}

pub async fn set_item_enabled(
    remote: &dyn RemoteDataService,
    event_id: &str,
    item_id: &str,
    enabled: bool,
) -> Result<()> {
    remote
        .rpc(
            "admin_set_item_enabled",
            json!({ "event_id": event_id, "item_id": item_id, "enabled": enabled }),
        )
        .await?;
    info!(event_id, item_id, enabled, "item availability changed");
    Ok(())
}

/// Toggle every item of a category in parallel. Returns the ids that failed.
pub async fn set_category_enabled(
    remote: &dyn RemoteDataService,
    event_id: &str,
    category: &EventMenuCategory,
    enabled: bool,
) -> Vec<String> {
    let results = join_all(
        category
            .items
            .iter()
            .map(|item| set_item_enabled(remote, event_id, &item.id, enabled)),
    )
    .await;

    let failed: Vec<String> = category
        .items
        .iter()
        .zip(results)
        .filter_map(|(item, result)| match result {
            Ok(()) => None,
            Err(e) => {
                warn!(event_id, item_id = %item.id, error = %e, "item toggle failed");
                Some(item.id.clone())
            }
        })
        .collect();
    if failed.is_empty() {
        info!(event_id, category_id = %category.id, enabled, "category availability changed");
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModifierKind;
    use crate::remote::fake::FakeRemote;

    fn tables() -> MenuTables {
        MenuTables {
            categories: vec![
                json!({ "id": "hot", "name": "Hot drinks" }),
                json!({ "id": "cold", "name": "Cold drinks" }),
            ],
            items: vec![
                json!({ "id": "latte", "name": "Latte", "category_id": "hot", "is_active": true }),
                json!({ "id": "mocha", "name": "Mocha", "category_id": "hot", "is_active": false }),
                json!({ "id": "tonic", "name": "Espresso tonic", "category_id": "cold", "is_active": true }),
                json!({ "id": "ghost", "name": "Ghost", "category_id": "gone", "is_active": true }),
            ],
            item_modifiers: vec![
                json!({ "item_id": "latte", "modifier_id": "syrup" }),
                json!({ "item_id": "latte", "modifier_id": "milk" }),
                json!({ "item_id": "latte", "modifier_id": "missing" }),
            ],
            modifiers: vec![
                json!({ "id": "milk", "name": "Milk", "type": "single", "required": true }),
                json!({ "id": "syrup", "name": "Syrup", "type": "multi", "required": false }),
            ],
            options: vec![
                json!({ "id": "oat", "name": "Oat", "modifier_id": "milk", "sort_order": 1 }),
                json!({ "id": "whole", "name": "Whole", "modifier_id": "milk", "sort_order": 2 }),
                json!({ "id": "vanilla", "name": "Vanilla", "modifier_id": "syrup", "sort_order": 1 }),
            ],
        }
    }

    #[test]
    fn menu_nests_modifiers_in_link_order() {
        let menu = assemble_menu(tables());
        assert_eq!(menu.len(), 2);

        let hot = &menu[0];
        assert_eq!(hot.items.len(), 1);
        let latte = &hot.items[0];
        let names: Vec<&str> = latte.modifiers.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Syrup", "Milk"]);

        let milk = latte.modifier("milk").unwrap();
        assert_eq!(milk.kind, ModifierKind::Single);
        assert!(milk.required);
        assert_eq!(milk.options[0].id, "oat");
        assert_eq!(milk.options.len(), 2);

        assert_eq!(menu[1].items[0].id, "tonic");
        assert!(menu[1].items[0].modifiers.is_empty());
    }

    #[test]
    fn orphan_items_are_dropped() {
        let menu = assemble_menu(tables());
        assert!(menu
            .iter()
            .flat_map(|c| c.items.iter())
            .all(|i| i.id != "ghost" && i.id != "mocha"));
    }

    #[tokio::test]
    async fn load_menu_reads_active_items_only() {
        let remote = FakeRemote::new();
        let t = tables();
        for row in t.categories {
            remote.insert_row("categories", row);
        }
        for row in t.items {
            remote.insert_row("items", row);
        }
        for row in t.item_modifiers {
            remote.insert_row("item_modifiers", row);
        }
        for row in t.modifiers {
            remote.insert_row("modifiers", row);
        }
        for row in t.options {
            remote.insert_row("modifier_options", row);
        }

        let menu = load_menu(remote.as_ref()).await.unwrap();
        assert_eq!(menu[0].items[0].modifiers.len(), 2);
        assert_eq!(remote.select_count("items"), 1);
        assert_eq!(remote.select_count("modifier_options"), 1);
    }

    #[tokio::test]
    async fn event_items_group_by_category() {
        let remote = FakeRemote::new();
        remote.script_rpc(
            "admin_list_items_for_event",
            Ok(json!([
                { "id": "latte", "name": "Latte", "category_id": "hot", "category_name": "Hot", "enabled": true },
                { "id": "tonic", "name": "Tonic", "category_id": "cold", "category_name": "Cold", "enabled": false },
                { "id": "mocha", "name": "Mocha", "category_id": "hot", "category_name": "Hot", "enabled": true },
            ])),
        );
        let grouped = list_items_for_event(remote.as_ref(), "ev1").await.unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].items.len(), 2);
        assert!(grouped[0].all_enabled());
        assert!(!grouped[1].all_enabled());
        assert_eq!(
            remote.rpc_calls("admin_list_items_for_event"),
            vec![json!({ "event_id": "ev1" })]
        );
    }

    #[tokio::test]
    async fn category_toggle_reports_failed_items() {
        let remote = FakeRemote::new();
        remote.script_rpc("admin_set_item_enabled", Ok(Value::Null));
        remote.script_rpc("admin_set_item_enabled", Err(Error::remote(Some(403), "denied")));
        let category = EventMenuCategory {
            id: "hot".into(),
            name: "Hot".into(),
            items: ["latte", "mocha"]
                .iter()
                .map(|id| EventMenuItem {
                    id: id.to_string(),
                    name: id.to_string(),
                    category_id: "hot".into(),
                    category_name: "Hot".into(),
                    enabled: true,
                })
                .collect(),
        };

        let failed = set_category_enabled(remote.as_ref(), "ev1", &category, false).await;
        assert_eq!(failed.len(), 1);
        let calls = remote.rpc_calls("admin_set_item_enabled");
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c["enabled"] == json!(false)));
    }
}
