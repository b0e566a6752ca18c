use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    connection::Database,
    helpers::{format_timestamp, parse_datetime, parse_optional_datetime, parse_status, to_u32},
    models::{NewSession, Session, SessionStatus},
};

const SESSION_COLUMNS: &str = "id, external_uuid, participant_id, experiment_id, target_url, \
     start_time, end_time, screen_width, screen_height, status, created_at, updated_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let status: String = row.get("status")?;
    let screen_width: i64 = row.get("screen_width")?;
    let screen_height: i64 = row.get("screen_height")?;

    Ok(Session {
        id: row.get("id")?,
        external_uuid: row.get("external_uuid")?,
        participant_id: row.get("participant_id")?,
        experiment_id: row.get("experiment_id")?,
        target_url: row.get("target_url")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        screen_width: to_u32(screen_width, "screen_width")?,
        screen_height: to_u32(screen_height, "screen_height")?,
        status: parse_status(&status)?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn load_session(conn: &rusqlite::Connection, session_id: i64) -> Result<Option<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![session_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

impl Database {
    /// Opens a new active session and returns it with its assigned id.
    pub async fn create_session(&self, params: &NewSession) -> Result<Session> {
        if params.screen_width == 0 || params.screen_height == 0 {
            return Err(anyhow!(
                "session canvas must be non-empty, got {}x{}",
                params.screen_width,
                params.screen_height
            ));
        }

        let record = params.clone();
        self.execute(move |conn| {
            let now = Utc::now();
            let external_uuid = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO sessions (external_uuid, participant_id, experiment_id, target_url,
                                       start_time, end_time, screen_width, screen_height, status,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, ?10)",
                params![
                    external_uuid,
                    record.participant_id,
                    record.experiment_id,
                    record.target_url,
                    format_timestamp(&now),
                    i64::from(record.screen_width),
                    i64::from(record.screen_height),
                    SessionStatus::Active.as_str(),
                    format_timestamp(&now),
                    format_timestamp(&now),
                ],
            )?;

            let id = conn.last_insert_rowid();
            load_session(conn, id)?.ok_or_else(|| anyhow!("session {id} vanished after insert"))
        })
        .await
    }

    /// Marks a session completed. Ending an already completed session is a
    /// no-op that returns the stored record.
    pub async fn end_session(&self, session_id: i64, ended_at: DateTime<Utc>) -> Result<Session> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET end_time = ?1,
                     status = ?2,
                     updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    format_timestamp(&ended_at),
                    SessionStatus::Completed.as_str(),
                    format_timestamp(&ended_at),
                    session_id,
                    SessionStatus::Active.as_str(),
                ],
            )?;

            load_session(conn, session_id)?
                .ok_or_else(|| anyhow!("cannot end unknown session {session_id}"))
        })
        .await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        self.execute(move |conn| load_session(conn, session_id)).await
    }

    pub async fn get_session_by_uuid(&self, external_uuid: &str) -> Result<Option<Session>> {
        let external_uuid = external_uuid.to_string();
        self.execute(move |conn| {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM sessions WHERE external_uuid = ?1",
                    params![external_uuid],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => load_session(conn, id),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn get_active_sessions(&self) -> Result<Vec<Session>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE status = 'active'
                 ORDER BY start_time ASC"
            ))?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
        .await
    }

    /// Closes sessions left active by a process that never reached its stop
    /// path. Returns the sessions that were closed.
    pub async fn recover_active_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let stale = self.get_active_sessions().await?;
        let mut recovered = Vec::with_capacity(stale.len());
        for session in stale {
            recovered.push(self.end_session(session.id, now).await?);
        }
        Ok(recovered)
    }
}
