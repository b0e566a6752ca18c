//! Session data models.
//!
//! A session bounds every event and artifact captured during one recording
//! run. It is created once at start and only ever mutated to close it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub external_uuid: String,
    pub participant_id: Option<String>,
    pub experiment_id: Option<String>,
    pub target_url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub screen_width: u32,
    pub screen_height: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Logical canvas in which pointer coordinates are reported.
    pub fn canvas(&self) -> (u32, u32) {
        (self.screen_width, self.screen_height)
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Parameters for opening a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub participant_id: Option<String>,
    pub experiment_id: Option<String>,
    pub target_url: Option<String>,
    pub screen_width: u32,
    pub screen_height: u32,
}

impl NewSession {
    pub fn with_canvas(screen_width: u32, screen_height: u32) -> Self {
        Self {
            screen_width,
            screen_height,
            ..Self::default()
        }
    }
}
