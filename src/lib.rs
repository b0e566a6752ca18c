//! Multi-sensor interaction capture.
//!
//! A [`RecordingController`] runs pointer, display, audio and camera sources
//! on their own threads for one session. Their output is batched by
//! [`BufferedSink`]s into a SQLite [`Database`]; once the session is over,
//! [`ActivityMapEngine`] and [`OverlayCorrelationEngine`] turn the stored
//! events and frames into activity maps and overlays.

pub mod analysis;
pub mod buffer;
pub mod db;
pub mod error;
pub mod sensing;
pub mod settings;
pub mod storage;
pub mod utils;

pub use analysis::{ActivityMapEngine, AnalysisConfig, OverlayCorrelationEngine, OverlayReport};
pub use buffer::{BufferedSink, EventBuffer};
pub use db::Database;
pub use error::CaptureError;
pub use sensing::{HealthReport, RecordingController, SessionSummary, SourceSet};
pub use settings::{FrameEncoding, PipelineConfig, SettingsStore};
pub use storage::ArtifactLayout;
pub use utils::logging::init_logging;
