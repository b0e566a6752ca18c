use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AudioSegment, BiometricSample, FrameArtifact, GazeSample};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Frame,
    Audio,
    Biometric,
    Gaze,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Frame => "frame",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Biometric => "biometric",
            ArtifactKind::Gaze => "gaze",
        }
    }
}

/// Any persisted output unit tied to a session and a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Artifact {
    Frame(FrameArtifact),
    Audio(AudioSegment),
    Biometric(BiometricSample),
    Gaze(GazeSample),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Frame(_) => ArtifactKind::Frame,
            Artifact::Audio(_) => ArtifactKind::Audio,
            Artifact::Biometric(_) => ArtifactKind::Biometric,
            Artifact::Gaze(_) => ArtifactKind::Gaze,
        }
    }

    pub fn session_id(&self) -> i64 {
        match self {
            Artifact::Frame(frame) => frame.session_id,
            Artifact::Audio(segment) => segment.session_id,
            Artifact::Biometric(sample) => sample.session_id,
            Artifact::Gaze(sample) => sample.session_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Artifact::Frame(frame) => frame.timestamp,
            Artifact::Audio(segment) => segment.start_timestamp,
            Artifact::Biometric(sample) => sample.timestamp,
            Artifact::Gaze(sample) => sample.timestamp,
        }
    }
}
