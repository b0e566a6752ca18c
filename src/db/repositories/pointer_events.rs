use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{ensure_session_open, format_timestamp, invalid_data, parse_datetime},
    models::{PointerButton, PointerEvent, PointerEventKind},
};

fn row_to_pointer_event(row: &Row) -> Result<PointerEvent, rusqlite::Error> {
    let timestamp: String = row.get("timestamp")?;
    let kind: String = row.get("kind")?;
    let button: Option<String> = row.get("button")?;

    Ok(PointerEvent {
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp").map_err(invalid_data)?,
        kind: PointerEventKind::parse(&kind)
            .ok_or_else(|| invalid_data(anyhow!("unknown pointer event kind {kind}")))?,
        x: row.get("x")?,
        y: row.get("y")?,
        button: button.as_deref().map(PointerButton::parse),
        pressed: row.get("pressed")?,
        scroll_dx: row.get("scroll_dx")?,
        scroll_dy: row.get("scroll_dy")?,
        task_tag: row.get("task_tag")?,
    })
}

impl Database {
    /// Writes a drained batch of pointer events in one transaction.
    ///
    /// The batch is rejected as a whole if any event references a session
    /// that is unknown or already completed.
    pub async fn append_events_batch(&self, events: Vec<PointerEvent>) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let sessions: BTreeSet<i64> = events.iter().map(|event| event.session_id).collect();
            for session_id in sessions {
                ensure_session_open(&tx, session_id)?;
            }

            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO pointer_events
                     (session_id, timestamp, kind, x, y, button, pressed, scroll_dx, scroll_dy, task_tag)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )?;
                for event in &events {
                    stmt.execute(params![
                        event.session_id,
                        format_timestamp(&event.timestamp),
                        event.kind.as_str(),
                        event.x,
                        event.y,
                        event.button.map(|button| button.as_str()),
                        event.pressed,
                        event.scroll_dx,
                        event.scroll_dy,
                        event.task_tag,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(events.len())
        })
        .await
    }

    /// All pointer events of a session in timestamp order. A session without
    /// events yields an empty list.
    pub async fn query_events(&self, session_id: i64) -> Result<Vec<PointerEvent>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, timestamp, kind, x, y, button, pressed, scroll_dx, scroll_dy, task_tag
                 FROM pointer_events
                 WHERE session_id = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;

            let events_iter = stmt.query_map(params![session_id], row_to_pointer_event)?;

            let mut events = Vec::new();
            for event in events_iter {
                events.push(event?);
            }
            Ok(events)
        })
        .await
    }
}
