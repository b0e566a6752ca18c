use anyhow::Result;
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::to_u64,
    models::SessionStats,
};

fn count(conn: &rusqlite::Connection, sql: &str, session_id: i64) -> Result<u64> {
    let value: i64 = conn.query_row(sql, params![session_id], |row| row.get(0))?;
    to_u64(value, "count")
}

impl Database {
    /// Aggregates a session's persisted records.
    pub async fn session_stats(&self, session_id: i64) -> Result<SessionStats> {
        self.execute(move |conn| {
            let mut stats = SessionStats {
                clicks: count(
                    conn,
                    "SELECT COUNT(*) FROM pointer_events
                     WHERE session_id = ?1 AND kind = 'click' AND pressed = 1",
                    session_id,
                )?,
                moves: count(
                    conn,
                    "SELECT COUNT(*) FROM pointer_events WHERE session_id = ?1 AND kind = 'move'",
                    session_id,
                )?,
                scrolls: count(
                    conn,
                    "SELECT COUNT(*) FROM pointer_events WHERE session_id = ?1 AND kind = 'scroll'",
                    session_id,
                )?,
                frames: count(
                    conn,
                    "SELECT COUNT(*) FROM frames WHERE session_id = ?1",
                    session_id,
                )?,
                audio_segments: count(
                    conn,
                    "SELECT COUNT(*) FROM audio_segments WHERE session_id = ?1",
                    session_id,
                )?,
                biometric_samples: count(
                    conn,
                    "SELECT COUNT(*) FROM biometric_samples WHERE session_id = ?1",
                    session_id,
                )?,
                gaze_samples: count(
                    conn,
                    "SELECT COUNT(*) FROM gaze_samples WHERE session_id = ?1",
                    session_id,
                )?,
                transcriptions: count(
                    conn,
                    "SELECT COUNT(*) FROM transcriptions WHERE session_id = ?1",
                    session_id,
                )?,
                ..SessionStats::default()
            };

            stats.audio_secs = conn.query_row(
                "SELECT COALESCE(SUM(duration_secs), 0.0) FROM audio_segments WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT COALESCE(task_tag, 'untagged'), COUNT(*)
                 FROM pointer_events
                 WHERE session_id = ?1 AND kind = 'click' AND pressed = 1
                 GROUP BY COALESCE(task_tag, 'untagged')",
            )?;
            let mut rows = stmt.query(params![session_id])?;
            while let Some(row) = rows.next()? {
                let tag: String = row.get(0)?;
                let clicks: i64 = row.get(1)?;
                stats.clicks_by_task.insert(tag, to_u64(clicks, "clicks")?);
            }

            Ok(stats)
        })
        .await
    }
}
