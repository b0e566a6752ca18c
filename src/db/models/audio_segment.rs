use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioSegment {
    pub session_id: i64,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    pub storage_path: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub byte_size: u64,
    /// Root-mean-square level of the segment, in [0, 1].
    pub rms_level: f64,
    pub task_tag: Option<String>,
}
