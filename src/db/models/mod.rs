pub mod artifact;
pub mod audio_segment;
pub mod biometric_sample;
pub mod frame;
pub mod gaze_sample;
pub mod pointer_event;
pub mod session;
pub mod stats;
pub mod transcription;

pub use artifact::{Artifact, ArtifactKind};
pub use audio_segment::AudioSegment;
pub use biometric_sample::{BiometricSample, ClassScore};
pub use frame::{FrameArtifact, TriggerKind};
pub use gaze_sample::{GazeSample, HeadPose, PupilPosition};
pub use pointer_event::{PointerButton, PointerEvent, PointerEventKind};
pub use session::{NewSession, Session, SessionStatus};
pub use stats::SessionStats;
pub use transcription::Transcription;
