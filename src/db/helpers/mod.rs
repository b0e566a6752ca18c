use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::db::models::SessionStatus;
use crate::error::CaptureError;

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} out of range: {value}"))
}

/// Fixed-width RFC 3339 (microseconds, `Z` suffix) so that lexical order in
/// SQLite matches chronological order.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_status(value: &str) -> Result<SessionStatus> {
    match value {
        "active" => Ok(SessionStatus::Active),
        "completed" => Ok(SessionStatus::Completed),
        other => Err(anyhow!("unknown session status {other}")),
    }
}

/// Wraps a decode failure so it can be returned from a `query_map` closure.
pub fn invalid_data(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        err.to_string(),
    )))
}

/// Every artifact must reference a session that exists and is still active.
pub fn ensure_session_open(tx: &Transaction<'_>, session_id: i64) -> Result<()> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;

    match status.as_deref() {
        None => Err(CaptureError::InvariantViolation(format!(
            "record references unknown session {session_id}"
        ))
        .into()),
        Some("completed") => Err(CaptureError::InvariantViolation(format!(
            "record references completed session {session_id}"
        ))
        .into()),
        Some(_) => Ok(()),
    }
}

/// Records that may outlive their session's capture window, such as
/// transcripts, only need the session row to exist.
pub fn ensure_session_exists(tx: &Transaction<'_>, session_id: i64) -> Result<()> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT id FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;

    match found {
        Some(_) => Ok(()),
        None => Err(CaptureError::InvariantViolation(format!(
            "record references unknown session {session_id}"
        ))
        .into()),
    }
}
