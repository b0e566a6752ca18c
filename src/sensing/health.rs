use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Pointer,
    Display,
    Microphone,
    Camera,
    Gaze,
    IntervalCapture,
    Transcriber,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pointer => "pointer",
            SourceKind::Display => "display",
            SourceKind::Microphone => "microphone",
            SourceKind::Camera => "camera",
            SourceKind::Gaze => "gaze",
            SourceKind::IntervalCapture => "interval-capture",
            SourceKind::Transcriber => "transcriber",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SourceStatus {
    Running,
    /// Never started because its device was missing.
    Disabled(String),
    /// Started, then lost its device.
    Failed(String),
    Stopped,
}

/// Point-in-time view of the pipeline for callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub sources: BTreeMap<SourceKind, SourceStatus>,
    pub halted: Option<String>,
    pub dropped_records: u64,
    pub failed_captures: u64,
    /// Device readings discarded before reaching a sink, e.g. NaN coordinates.
    pub invalid_samples: u64,
}

#[derive(Default)]
struct HealthState {
    sources: BTreeMap<SourceKind, SourceStatus>,
    halted: Option<String>,
    dropped_records: u64,
    failed_captures: u64,
    invalid_samples: u64,
}

/// Shared failure ledger for one recording session.
///
/// Sources report their status here; the store writer reports storage
/// failures, which halt the session.
#[derive(Clone)]
pub struct PipelineHealth {
    state: Arc<Mutex<HealthState>>,
    halt: CancellationToken,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HealthState::default())),
            halt: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_status(&self, source: SourceKind, status: SourceStatus) {
        match &status {
            SourceStatus::Running => log_info!("{source} source running"),
            SourceStatus::Disabled(reason) => log_warn!("{source} source disabled: {reason}"),
            SourceStatus::Failed(reason) => log_error!("{source} source failed: {reason}"),
            SourceStatus::Stopped => log_info!("{source} source stopped"),
        }
        self.lock().sources.insert(source, status);
    }

    /// Marks a running source stopped; disabled and failed sources keep
    /// their reason.
    pub fn mark_stopped(&self, source: SourceKind) {
        let mut state = self.lock();
        if let Some(status) = state.sources.get_mut(&source) {
            if *status == SourceStatus::Running {
                *status = SourceStatus::Stopped;
            }
        }
    }

    pub fn status(&self, source: SourceKind) -> Option<SourceStatus> {
        self.lock().sources.get(&source).cloned()
    }

    pub fn record_failed_capture(&self) {
        self.lock().failed_captures += 1;
    }

    pub fn record_invalid_sample(&self) {
        self.lock().invalid_samples += 1;
    }

    pub fn record_dropped(&self, count: usize) {
        self.lock().dropped_records += count as u64;
    }

    /// Stops the session from accepting more data. Only the first reason is kept.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut state = self.lock();
            if state.halted.is_some() {
                return;
            }
            log_error!("session halted: {reason}");
            state.halted = Some(reason);
        }
        self.halt.cancel();
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.lock().halted.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Resolves when the session is halted.
    pub fn halted(&self) -> CancellationToken {
        self.halt.clone()
    }

    pub fn report(&self) -> HealthReport {
        let state = self.lock();
        HealthReport {
            sources: state.sources.clone(),
            halted: state.halted.clone(),
            dropped_records: state.dropped_records,
            failed_captures: state.failed_captures,
            invalid_samples: state.invalid_samples,
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}
