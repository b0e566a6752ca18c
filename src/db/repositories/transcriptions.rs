use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Row, Transaction};

use crate::db::{
    connection::Database,
    helpers::{ensure_session_exists, format_timestamp, invalid_data, parse_datetime},
    models::Transcription,
};

fn insert_row(tx: &Transaction<'_>, transcription: &Transcription) -> Result<()> {
    tx.execute(
        "INSERT INTO transcriptions (session_id, audio_path, start_timestamp,
                                     end_timestamp, text, task_tag, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            transcription.session_id,
            transcription.audio_path,
            format_timestamp(&transcription.start_timestamp),
            format_timestamp(&transcription.end_timestamp),
            transcription.text,
            transcription.task_tag,
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn row_to_transcription(row: &Row) -> Result<Transcription, rusqlite::Error> {
    let start: String = row.get("start_timestamp")?;
    let end: String = row.get("end_timestamp")?;

    Ok(Transcription {
        session_id: row.get("session_id")?,
        audio_path: row.get("audio_path")?,
        start_timestamp: parse_datetime(&start, "start_timestamp").map_err(invalid_data)?,
        end_timestamp: parse_datetime(&end, "end_timestamp").map_err(invalid_data)?,
        text: row.get("text")?,
        task_tag: row.get("task_tag")?,
    })
}

impl Database {
    pub async fn insert_transcription(&self, transcription: Transcription) -> Result<()> {
        self.append_transcriptions_batch(vec![transcription])
            .await
            .map(|_| ())
    }

    /// Transcripts may land after the session has been closed, so unlike
    /// capture artifacts they only require the session to exist.
    pub async fn append_transcriptions_batch(
        &self,
        transcriptions: Vec<Transcription>,
    ) -> Result<usize> {
        if transcriptions.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let sessions: BTreeSet<i64> = transcriptions.iter().map(|t| t.session_id).collect();
            for session_id in sessions {
                ensure_session_exists(&tx, session_id)?;
            }

            for transcription in &transcriptions {
                insert_row(&tx, transcription).with_context(|| {
                    format!("failed to insert transcription for {}", transcription.audio_path)
                })?;
            }

            tx.commit()?;
            Ok(transcriptions.len())
        })
        .await
    }

    pub async fn get_transcriptions(&self, session_id: i64) -> Result<Vec<Transcription>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, audio_path, start_timestamp, end_timestamp, text, task_tag
                 FROM transcriptions
                 WHERE session_id = ?1
                 ORDER BY start_timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_transcription)?;
            let mut transcriptions = Vec::new();
            for transcription in rows {
                transcriptions.push(transcription?);
            }
            Ok(transcriptions)
        })
        .await
    }
}
