use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// On-demand aggregates for one session, computed from the store rather
/// than from counters kept by the producers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub clicks: u64,
    pub moves: u64,
    pub scrolls: u64,
    pub clicks_by_task: BTreeMap<String, u64>,
    pub frames: u64,
    pub audio_segments: u64,
    pub audio_secs: f64,
    pub biometric_samples: u64,
    pub gaze_samples: u64,
    pub transcriptions: u64,
}
