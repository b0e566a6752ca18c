use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// Per-kind subdirectory of a session directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactDir {
    Frames,
    Audio,
    Overlays,
}

impl ArtifactDir {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactDir::Frames => "frames",
            ArtifactDir::Audio => "audio",
            ArtifactDir::Overlays => "overlays",
        }
    }
}

/// `<prefix>_<session>_<unix micros>[_<qualifier>].<ext>`
///
/// Two artifacts of the same kind collide only if they share a session and
/// a microsecond, which the trigger cooldown rules out.
pub fn artifact_file_name(
    prefix: &str,
    session_id: i64,
    timestamp: &DateTime<Utc>,
    qualifier: Option<&str>,
    extension: &str,
) -> String {
    let micros = timestamp.timestamp_micros();
    match qualifier {
        Some(qualifier) => format!("{prefix}_{session_id}_{micros}_{qualifier}.{extension}"),
        None => format!("{prefix}_{session_id}_{micros}.{extension}"),
    }
}

/// `path` itself when nothing exists there yet, otherwise the first free
/// `<stem>_<n>.<ext>` beside it.
pub fn next_free_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|extension| extension.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| {
            path.with_file_name(match &extension {
                Some(extension) => format!("{stem}_{n}.{extension}"),
                None => format!("{stem}_{n}"),
            })
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Resolves where each artifact of a session lives on disk:
/// `<root>/session_<id>/<kind>/<file>`.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: i64) -> PathBuf {
        self.root.join(format!("session_{session_id}"))
    }

    pub fn dir(&self, session_id: i64, kind: ArtifactDir) -> PathBuf {
        self.session_dir(session_id).join(kind.as_str())
    }

    pub fn ensure_dir(&self, session_id: i64, kind: ArtifactDir) -> Result<PathBuf> {
        let dir = self.dir(session_id, kind);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create artifact directory {}", dir.display()))?;
        Ok(dir)
    }

    pub fn frame_path(
        &self,
        session_id: i64,
        timestamp: &DateTime<Utc>,
        trigger: &str,
        extension: &str,
    ) -> PathBuf {
        self.dir(session_id, ArtifactDir::Frames).join(artifact_file_name(
            "frame",
            session_id,
            timestamp,
            Some(trigger),
            extension,
        ))
    }

    pub fn audio_path(&self, session_id: i64, start: &DateTime<Utc>) -> PathBuf {
        self.dir(session_id, ArtifactDir::Audio)
            .join(artifact_file_name("audio", session_id, start, None, "wav"))
    }

    /// `overlays/overlay_<frame stem>.png`
    pub fn overlay_path(&self, session_id: i64, frame_path: &Path) -> PathBuf {
        let stem = frame_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frame".to_string());
        self.dir(session_id, ArtifactDir::Overlays)
            .join(format!("overlay_{stem}.png"))
    }

    pub fn comparison_grid_path(&self, session_id: i64) -> PathBuf {
        self.dir(session_id, ArtifactDir::Overlays)
            .join("comparison_grid.png")
    }

    pub fn activity_map_path(&self, session_id: i64, name: &str) -> PathBuf {
        self.dir(session_id, ArtifactDir::Overlays)
            .join(format!("{name}_map.png"))
    }
}
