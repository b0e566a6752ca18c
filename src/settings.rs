use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

/// Encoding used when persisting captured frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum FrameEncoding {
    Png,
    Jpeg { quality: u8 },
}

impl FrameEncoding {
    pub fn extension(&self) -> &'static str {
        match self {
            FrameEncoding::Png => "png",
            FrameEncoding::Jpeg { .. } => "jpg",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameEncoding::Png => "png",
            FrameEncoding::Jpeg { .. } => "jpeg",
        }
    }
}

impl Default for FrameEncoding {
    fn default() -> Self {
        FrameEncoding::Png
    }
}

/// Tunables for a recording session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory; each session gets its own subdirectory.
    pub data_root: PathBuf,

    /// Moves closer than this to the last emitted position are throttled.
    pub movement_threshold: f64,
    /// Accumulated `|dx|+|dy|` needed for a scroll trigger.
    pub scroll_threshold: f64,
    /// Minimum interval between two fired triggers.
    pub cooldown_secs: f64,
    pub frame_encoding: FrameEncoding,

    pub pointer_buffer_threshold: usize,
    pub artifact_buffer_threshold: usize,

    pub audio_segment_secs: f64,
    pub audio_poll_interval_ms: u64,
    pub biometric_rate_hz: f64,
    pub gaze_rate_hz: f64,
    /// Seconds between unconditional display captures; `None` disables them.
    pub interval_capture_secs: Option<f64>,
    /// Classifier output arrives in this scale (percent by default).
    pub biometric_score_scale: f64,
    /// Pause after a failed poll before the sampler tries again.
    pub sampler_backoff_ms: u64,

    pub join_timeout_secs: u64,
    pub transcription_join_timeout_secs: u64,

    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
    /// Halt the session on an invariant violation instead of dropping the record.
    pub strict_invariants: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("hci-data"),
            movement_threshold: 5.0,
            scroll_threshold: 100.0,
            cooldown_secs: 0.5,
            frame_encoding: FrameEncoding::Png,
            pointer_buffer_threshold: 50,
            artifact_buffer_threshold: 1,
            audio_segment_secs: 30.0,
            audio_poll_interval_ms: 100,
            biometric_rate_hz: 0.5,
            gaze_rate_hz: 30.0,
            interval_capture_secs: None,
            biometric_score_scale: 100.0,
            sampler_backoff_ms: 1000,
            join_timeout_secs: 10,
            transcription_join_timeout_secs: 60,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 100,
            strict_invariants: cfg!(debug_assertions),
        }
    }
}

/// `secs` as a duration, or `fallback` when it is negative, NaN or too
/// large to represent.
fn secs_or(secs: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(fallback)
}

/// Period of a `rate_hz` loop; non-positive or unrepresentable rates fall
/// back to `fallback`.
fn period_or(rate_hz: f64, fallback: Duration) -> Duration {
    if rate_hz > 0.0 {
        secs_or(1.0 / rate_hz, fallback)
    } else {
        fallback
    }
}

impl PipelineConfig {
    pub fn cooldown(&self) -> Duration {
        secs_or(self.cooldown_secs, Duration::from_millis(500))
    }

    pub fn audio_segment_duration(&self) -> Duration {
        secs_or(self.audio_segment_secs, Duration::from_secs(30))
    }

    pub fn audio_poll_interval(&self) -> Duration {
        Duration::from_millis(self.audio_poll_interval_ms)
    }

    /// Interval between biometric polls; a non-positive rate falls back to
    /// one poll per second.
    pub fn biometric_interval(&self) -> Duration {
        period_or(self.biometric_rate_hz, Duration::from_secs(1))
    }

    pub fn gaze_interval(&self) -> Duration {
        period_or(self.gaze_rate_hz, Duration::from_millis(100))
    }

    /// `None` when interval capture is off or its period is not positive.
    pub fn interval_capture(&self) -> Option<Duration> {
        self.interval_capture_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|period| !period.is_zero())
    }

    pub fn sampler_backoff(&self) -> Duration {
        Duration::from_millis(self.sampler_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn transcription_join_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_join_timeout_secs)
    }

    pub fn store_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.store_retry_backoff_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_root.join("sessions.sqlite3")
    }
}

/// Pipeline settings persisted as pretty JSON.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<PipelineConfig>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(
                    "Ignoring unreadable settings at {}: {err}; using defaults",
                    path.display()
                );
                PipelineConfig::default()
            })
        } else {
            PipelineConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn config(&self) -> PipelineConfig {
        self.read().clone()
    }

    pub fn update(&self, config: PipelineConfig) -> Result<()> {
        let mut guard = self.write();
        self.persist(&config)?;
        *guard = config;
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings at {}", self.path.display()))?;
        *self.write() = data;
        Ok(())
    }

    fn persist(&self, data: &PipelineConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, PipelineConfig> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, PipelineConfig> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
