//! Event lookup for the ordering page and the kitchen, plus the two admin
//! procedures that act on events.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::Event;
use crate::remote::{RemoteDataService, RowQuery};

const EVENTS_TABLE: &str = "events";
const EVENT_COLUMNS: &str =
    "id, name, slug, display_name, join_code, kitchen_code, starts_at, ends_at, is_closed";

fn decode_events(rows: Vec<Value>, what: &str) -> Vec<Event> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<Event>(row) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(what, error = %e, "skipping malformed event row");
                None
            }
        })
        .collect()
}

async fn find_one(remote: &dyn RemoteDataService, column: &str, value: &str) -> Result<Option<Event>> {
    let query = RowQuery::new(EVENTS_TABLE)
        .select(EVENT_COLUMNS)
        .eq(column, value)
        .limit(1);
    let rows = remote.select(&query).await?;
    Ok(decode_events(rows, column).into_iter().next())
}

pub async fn find_by_slug(remote: &dyn RemoteDataService, slug: &str) -> Result<Option<Event>> {
    find_one(remote, "slug", slug.trim()).await
}

/// Resolve the code typed on the kitchen screen into its event.
pub async fn find_by_kitchen_code(remote: &dyn RemoteDataService, code: &str) -> Result<Event> {
    let code = code.trim();
    if code.is_empty() {
        return Err(Error::NotFound("kitchen code not found".into()));
    }
    match find_one(remote, "kitchen_code", code).await? {
        Some(event) => Ok(event),
        None => {
            info!(code, "unknown kitchen code");
            Err(Error::NotFound(format!("kitchen code not found: {code}")))
        }
    }
}

/// Open events, most recent start first.
pub async fn list_active(remote: &dyn RemoteDataService) -> Result<Vec<Event>> {
    let query = RowQuery::new(EVENTS_TABLE)
        .select(EVENT_COLUMNS)
        .eq("is_closed", false)
        .order_desc("starts_at");
    let rows = remote.select(&query).await?;
    Ok(decode_events(rows, "list_active"))
}

pub async fn list_all(remote: &dyn RemoteDataService) -> Result<Vec<Event>> {
    let value = remote.rpc("admin_list_events", json!({})).await?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => return Err(Error::Decode(format!("admin_list_events: expected list, got {other}"))),
    };
    Ok(decode_events(rows, "admin_list_events"))
}

pub async fn close_event(remote: &dyn RemoteDataService, event_id: &str) -> Result<()> {
    remote
        .rpc("admin_close_event", json!({ "event_id": event_id }))
        .await?;
    info!(event_id, "event closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::{Call, FakeRemote};

    fn event_row(id: &str, code: &str, closed: bool, starts: &str) -> Value {
        json!({
            "id": id,
            "name": format!("Event {id}"),
            "slug": format!("event-{id}"),
            "join_code": "WB1",
            "kitchen_code": code,
            "starts_at": starts,
            "is_closed": closed,
        })
    }

    #[tokio::test]
    async fn kitchen_code_resolves_to_event() {
        let remote = FakeRemote::new();
        remote.insert_row("events", event_row("e1", "KITCHEN1", false, "2026-05-01T09:00:00Z"));
        remote.insert_row("events", event_row("e2", "KITCHEN2", false, "2026-05-02T09:00:00Z"));

        let event = find_by_kitchen_code(remote.as_ref(), " KITCHEN2 ").await.unwrap();
        assert_eq!(event.id, "e2");
        assert_eq!(
            remote.calls()[0],
            Call::Select {
                table: "events".into(),
                filters: vec![("kitchen_code".into(), "KITCHEN2".into())],
            }
        );
    }

    #[tokio::test]
    async fn unknown_kitchen_code_is_not_found() {
        let remote = FakeRemote::new();
        let err = find_by_kitchen_code(remote.as_ref(), "NOPE").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.user_message().contains("kitchen code not found"));

        let err = find_by_kitchen_code(remote.as_ref(), "  ").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(remote.call_count(), 1);
    }

    #[tokio::test]
    async fn active_events_skip_closed_ones() {
        let remote = FakeRemote::new();
        remote.insert_row("events", event_row("e1", "K1", false, "2026-05-01T09:00:00Z"));
        remote.insert_row("events", event_row("e2", "K2", true, "2026-05-02T09:00:00Z"));
        remote.insert_row("events", json!({ "id": "broken" }));

        let events = list_active(remote.as_ref()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "e1");
    }

    #[tokio::test]
    async fn slug_lookup_returns_none_when_missing() {
        let remote = FakeRemote::new();
        remote.insert_row("events", event_row("e1", "K1", false, "2026-05-01T09:00:00Z"));
        assert!(find_by_slug(remote.as_ref(), "event-e1").await.unwrap().is_some());
        assert!(find_by_slug(remote.as_ref(), "other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn admin_procedures_pass_event_id() {
        let remote = FakeRemote::new();
        remote.script_rpc("admin_close_event", Ok(Value::Null));
        remote.script_rpc(
            "admin_list_events",
            Ok(json!([event_row("e1", "K1", true, "2026-05-01T09:00:00Z")])),
        );

        close_event(remote.as_ref(), "e1").await.unwrap();
        assert_eq!(remote.rpc_calls("admin_close_event"), vec![json!({ "event_id": "e1" })]);

        let all = list_all(remote.as_ref()).await.unwrap();
        assert!(all[0].is_closed);
    }
}
