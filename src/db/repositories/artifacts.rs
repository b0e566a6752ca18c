use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Row, Transaction};

use crate::db::{
    connection::Database,
    helpers::{
        ensure_session_open, format_timestamp, invalid_data, parse_datetime, to_i64, to_u32,
        to_u64,
    },
    models::{
        Artifact, ArtifactKind, AudioSegment, BiometricSample, ClassScore, FrameArtifact,
        GazeSample, HeadPose, PupilPosition, TriggerKind,
    },
};

fn insert_frame(tx: &Transaction<'_>, frame: &FrameArtifact) -> Result<()> {
    let metadata = serde_json::to_string(&frame.trigger_metadata)
        .context("failed to serialize trigger metadata")?;
    tx.execute(
        "INSERT INTO frames (session_id, timestamp, storage_path, byte_size, width, height, format,
                             trigger_kind, trigger_x, trigger_y, trigger_metadata, task_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            frame.session_id,
            format_timestamp(&frame.timestamp),
            frame.storage_path,
            to_i64(frame.byte_size)?,
            i64::from(frame.width),
            i64::from(frame.height),
            frame.format,
            frame.trigger_kind.map(|kind| kind.as_str()),
            frame.trigger_x,
            frame.trigger_y,
            metadata,
            frame.task_tag,
        ],
    )?;
    Ok(())
}

fn insert_audio(tx: &Transaction<'_>, segment: &AudioSegment) -> Result<()> {
    tx.execute(
        "INSERT INTO audio_segments (session_id, start_timestamp, end_timestamp, duration_secs,
                                     storage_path, sample_rate, channels, byte_size, rms_level,
                                     task_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            segment.session_id,
            format_timestamp(&segment.start_timestamp),
            format_timestamp(&segment.end_timestamp),
            segment.duration_secs,
            segment.storage_path,
            i64::from(segment.sample_rate),
            i64::from(segment.channels),
            to_i64(segment.byte_size)?,
            segment.rms_level,
            segment.task_tag,
        ],
    )?;
    Ok(())
}

fn insert_biometric(tx: &Transaction<'_>, sample: &BiometricSample) -> Result<()> {
    let scores =
        serde_json::to_string(&sample.scores).context("failed to serialize biometric scores")?;
    tx.execute(
        "INSERT INTO biometric_samples (session_id, timestamp, scores_json, dominant_label,
                                        face_confidence, age, gender, task_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sample.session_id,
            format_timestamp(&sample.timestamp),
            scores,
            sample.dominant_label,
            sample.face_confidence,
            sample.age,
            sample.gender,
            sample.task_tag,
        ],
    )?;
    Ok(())
}

fn insert_gaze(tx: &Transaction<'_>, sample: &GazeSample) -> Result<()> {
    tx.execute(
        "INSERT INTO gaze_samples (session_id, timestamp, gaze_x, gaze_y, left_pupil_x,
                                   left_pupil_y, right_pupil_x, right_pupil_y, left_eye_open,
                                   right_eye_open, head_yaw, head_pitch, head_depth, calibrated,
                                   task_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            sample.session_id,
            format_timestamp(&sample.timestamp),
            sample.gaze_x,
            sample.gaze_y,
            sample.left_pupil.map(|p| p.x),
            sample.left_pupil.map(|p| p.y),
            sample.right_pupil.map(|p| p.x),
            sample.right_pupil.map(|p| p.y),
            sample.left_eye_open,
            sample.right_eye_open,
            sample.head_pose.map(|pose| pose.yaw),
            sample.head_pose.map(|pose| pose.pitch),
            sample.head_pose.map(|pose| pose.depth),
            sample.calibrated,
            sample.task_tag,
        ],
    )?;
    Ok(())
}

fn insert_artifact(tx: &Transaction<'_>, artifact: &Artifact) -> Result<()> {
    match artifact {
        Artifact::Frame(frame) => insert_frame(tx, frame),
        Artifact::Audio(segment) => insert_audio(tx, segment),
        Artifact::Biometric(sample) => insert_biometric(tx, sample),
        Artifact::Gaze(sample) => insert_gaze(tx, sample),
    }
}

fn row_to_frame(row: &Row) -> Result<FrameArtifact, rusqlite::Error> {
    let timestamp: String = row.get("timestamp")?;
    let byte_size: i64 = row.get("byte_size")?;
    let width: i64 = row.get("width")?;
    let height: i64 = row.get("height")?;
    let trigger_kind: Option<String> = row.get("trigger_kind")?;
    let metadata: String = row.get("trigger_metadata")?;

    Ok(FrameArtifact {
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp").map_err(invalid_data)?,
        storage_path: row.get("storage_path")?,
        byte_size: to_u64(byte_size, "byte_size").map_err(invalid_data)?,
        width: to_u32(width, "width").map_err(invalid_data)?,
        height: to_u32(height, "height").map_err(invalid_data)?,
        format: row.get("format")?,
        trigger_kind: match trigger_kind {
            Some(kind) => Some(
                TriggerKind::parse(&kind)
                    .ok_or_else(|| invalid_data(anyhow!("unknown trigger kind {kind}")))?,
            ),
            None => None,
        },
        trigger_x: row.get("trigger_x")?,
        trigger_y: row.get("trigger_y")?,
        trigger_metadata: serde_json::from_str(&metadata)
            .map_err(|err| invalid_data(anyhow!(err)))?,
        task_tag: row.get("task_tag")?,
    })
}

fn row_to_audio(row: &Row) -> Result<AudioSegment, rusqlite::Error> {
    let start: String = row.get("start_timestamp")?;
    let end: String = row.get("end_timestamp")?;
    let sample_rate: i64 = row.get("sample_rate")?;
    let channels: i64 = row.get("channels")?;
    let byte_size: i64 = row.get("byte_size")?;

    Ok(AudioSegment {
        session_id: row.get("session_id")?,
        start_timestamp: parse_datetime(&start, "start_timestamp").map_err(invalid_data)?,
        end_timestamp: parse_datetime(&end, "end_timestamp").map_err(invalid_data)?,
        duration_secs: row.get("duration_secs")?,
        storage_path: row.get("storage_path")?,
        sample_rate: to_u32(sample_rate, "sample_rate").map_err(invalid_data)?,
        channels: u16::try_from(channels)
            .map_err(|_| invalid_data(anyhow!("channels out of range: {channels}")))?,
        byte_size: to_u64(byte_size, "byte_size").map_err(invalid_data)?,
        rms_level: row.get("rms_level")?,
        task_tag: row.get("task_tag")?,
    })
}

fn row_to_biometric(row: &Row) -> Result<BiometricSample, rusqlite::Error> {
    let timestamp: String = row.get("timestamp")?;
    let scores: String = row.get("scores_json")?;
    let scores: Vec<ClassScore> =
        serde_json::from_str(&scores).map_err(|err| invalid_data(anyhow!(err)))?;

    Ok(BiometricSample {
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp").map_err(invalid_data)?,
        scores,
        dominant_label: row.get("dominant_label")?,
        face_confidence: row.get("face_confidence")?,
        age: row.get("age")?,
        gender: row.get("gender")?,
        task_tag: row.get("task_tag")?,
    })
}

fn pupil(row: &Row, x: &str, y: &str) -> Result<Option<PupilPosition>, rusqlite::Error> {
    let x: Option<f64> = row.get(x)?;
    let y: Option<f64> = row.get(y)?;
    Ok(x.zip(y).map(|(x, y)| PupilPosition { x, y }))
}

fn row_to_gaze(row: &Row) -> Result<GazeSample, rusqlite::Error> {
    let timestamp: String = row.get("timestamp")?;
    let yaw: Option<f64> = row.get("head_yaw")?;
    let pitch: Option<f64> = row.get("head_pitch")?;
    let depth: Option<f64> = row.get("head_depth")?;

    Ok(GazeSample {
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp").map_err(invalid_data)?,
        gaze_x: row.get("gaze_x")?,
        gaze_y: row.get("gaze_y")?,
        left_pupil: pupil(row, "left_pupil_x", "left_pupil_y")?,
        right_pupil: pupil(row, "right_pupil_x", "right_pupil_y")?,
        left_eye_open: row.get("left_eye_open")?,
        right_eye_open: row.get("right_eye_open")?,
        head_pose: match (yaw, pitch, depth) {
            (Some(yaw), Some(pitch), Some(depth)) => Some(HeadPose { yaw, pitch, depth }),
            _ => None,
        },
        calibrated: row.get("calibrated")?,
        task_tag: row.get("task_tag")?,
    })
}

fn load_frames(conn: &Connection, session_id: i64) -> Result<Vec<FrameArtifact>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, timestamp, storage_path, byte_size, width, height, format,
                trigger_kind, trigger_x, trigger_y, trigger_metadata, task_tag
         FROM frames
         WHERE session_id = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], row_to_frame)?;
    let mut frames = Vec::new();
    for frame in rows {
        frames.push(frame?);
    }
    Ok(frames)
}

fn load_audio(conn: &Connection, session_id: i64) -> Result<Vec<AudioSegment>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, start_timestamp, end_timestamp, duration_secs, storage_path,
                sample_rate, channels, byte_size, rms_level, task_tag
         FROM audio_segments
         WHERE session_id = ?1
         ORDER BY start_timestamp ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], row_to_audio)?;
    let mut segments = Vec::new();
    for segment in rows {
        segments.push(segment?);
    }
    Ok(segments)
}

fn load_biometrics(conn: &Connection, session_id: i64) -> Result<Vec<BiometricSample>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, timestamp, scores_json, dominant_label, face_confidence, age,
                gender, task_tag
         FROM biometric_samples
         WHERE session_id = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], row_to_biometric)?;
    let mut samples = Vec::new();
    for sample in rows {
        samples.push(sample?);
    }
    Ok(samples)
}

fn load_gaze(conn: &Connection, session_id: i64) -> Result<Vec<GazeSample>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, timestamp, gaze_x, gaze_y, left_pupil_x, left_pupil_y, right_pupil_x,
                right_pupil_y, left_eye_open, right_eye_open, head_yaw, head_pitch, head_depth,
                calibrated, task_tag
         FROM gaze_samples
         WHERE session_id = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], row_to_gaze)?;
    let mut samples = Vec::new();
    for sample in rows {
        samples.push(sample?);
    }
    Ok(samples)
}

impl Database {
    pub async fn append_artifact(&self, artifact: Artifact) -> Result<()> {
        self.append_artifacts_batch(vec![artifact]).await.map(|_| ())
    }

    /// Writes a batch of artifacts atomically. A batch that references an
    /// unknown or completed session is rejected without partial writes.
    pub async fn append_artifacts_batch(&self, artifacts: Vec<Artifact>) -> Result<usize> {
        if artifacts.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let sessions: BTreeSet<i64> = artifacts.iter().map(Artifact::session_id).collect();
            for session_id in sessions {
                ensure_session_open(&tx, session_id)?;
            }

            for artifact in &artifacts {
                insert_artifact(&tx, artifact)
                    .with_context(|| format!("failed to insert {} artifact", artifact.kind().as_str()))?;
            }

            tx.commit()?;
            Ok(artifacts.len())
        })
        .await
    }

    /// Artifacts of one kind for a session, in timestamp order.
    pub async fn query_artifacts(&self, session_id: i64, kind: ArtifactKind) -> Result<Vec<Artifact>> {
        self.execute(move |conn| {
            let artifacts: Vec<Artifact> = match kind {
                ArtifactKind::Frame => load_frames(conn, session_id)?
                    .into_iter()
                    .map(Artifact::Frame)
                    .collect(),
                ArtifactKind::Audio => load_audio(conn, session_id)?
                    .into_iter()
                    .map(Artifact::Audio)
                    .collect(),
                ArtifactKind::Biometric => load_biometrics(conn, session_id)?
                    .into_iter()
                    .map(Artifact::Biometric)
                    .collect(),
                ArtifactKind::Gaze => load_gaze(conn, session_id)?
                    .into_iter()
                    .map(Artifact::Gaze)
                    .collect(),
            };
            Ok(artifacts)
        })
        .await
    }

    pub async fn get_frames(&self, session_id: i64) -> Result<Vec<FrameArtifact>> {
        self.execute(move |conn| load_frames(conn, session_id)).await
    }

    pub async fn get_audio_segments(&self, session_id: i64) -> Result<Vec<AudioSegment>> {
        self.execute(move |conn| load_audio(conn, session_id)).await
    }

    pub async fn get_biometric_samples(&self, session_id: i64) -> Result<Vec<BiometricSample>> {
        self.execute(move |conn| load_biometrics(conn, session_id)).await
    }

    pub async fn get_gaze_samples(&self, session_id: i64) -> Result<Vec<GazeSample>> {
        self.execute(move |conn| load_gaze(conn, session_id)).await
    }
}
