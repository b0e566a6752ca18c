use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
    DynamicImage, RgbaImage,
};

use crate::{
    db::{Artifact, FrameArtifact, PointerEvent},
    error::CaptureError,
    settings::FrameEncoding,
    storage::{ArtifactDir, ArtifactLayout},
};

use super::{
    sampler::SampleSource,
    trigger_gate::{Trigger, TriggerGate},
    EventSink, PipelineHealth, SourceKind, SourceStatus, TaskTag,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Display area in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Screen grabbing primitive. May be called from any producer thread.
pub trait DisplayCapture: Send + Sync {
    /// Fails when no display can be captured at all.
    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    /// Captures `region`, or the full display for `None`.
    fn capture(&self, region: Option<CaptureRegion>) -> Result<RgbaImage>;
}

/// Clears the in-progress flag however the capture path exits.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Captures, encodes and persists one display image per trigger.
///
/// Runs synchronously on whichever thread delivered the trigger. An explicit
/// in-progress flag rejects overlapping captures instead of relying on the
/// trigger cooldown alone.
pub struct FrameCaptureService {
    display: Arc<dyn DisplayCapture>,
    layout: ArtifactLayout,
    encoding: FrameEncoding,
    in_progress: AtomicBool,
}

impl FrameCaptureService {
    pub fn new(
        display: Arc<dyn DisplayCapture>,
        layout: ArtifactLayout,
        encoding: FrameEncoding,
    ) -> Self {
        Self {
            display,
            layout,
            encoding,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn check_available(&self) -> Result<()> {
        self.display
            .check_available()
            .map_err(|err| CaptureError::unavailable(SourceKind::Display, format!("{err:#}")).into())
    }

    pub fn capture(&self, session_id: i64, trigger: &Trigger) -> Result<FrameArtifact> {
        let stored = self.grab_and_store(session_id, &trigger.timestamp, trigger.kind.as_str())?;
        Ok(FrameArtifact {
            trigger_kind: Some(trigger.kind),
            trigger_x: Some(trigger.x),
            trigger_y: Some(trigger.y),
            trigger_metadata: trigger.metadata(),
            task_tag: trigger.task_tag.clone(),
            ..stored
        })
    }

    /// A scheduled capture with no pointer trigger behind it.
    pub fn capture_untriggered(
        &self,
        session_id: i64,
        timestamp: DateTime<Utc>,
        task_tag: Option<String>,
    ) -> Result<FrameArtifact> {
        let stored = self.grab_and_store(session_id, &timestamp, "interval")?;
        Ok(FrameArtifact { task_tag, ..stored })
    }

    fn grab_and_store(
        &self,
        session_id: i64,
        timestamp: &DateTime<Utc>,
        qualifier: &str,
    ) -> Result<FrameArtifact> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::CaptureBusy.into());
        }
        let _guard = InProgress(&self.in_progress);

        let image = self.display.capture(None).map_err(|err| {
            match CaptureError::classify(&err) {
                Some(typed @ CaptureError::DeviceDisconnected { .. }) => typed.clone(),
                _ => CaptureError::transient(SourceKind::Display, format!("{err:#}")),
            }
        })?;
        let (width, height) = image.dimensions();

        self.layout.ensure_dir(session_id, ArtifactDir::Frames)?;
        let path = self
            .layout
            .frame_path(session_id, timestamp, qualifier, self.encoding.extension());
        let byte_size = encode_to_file(&image, self.encoding, &path)?;

        log_debug!(
            "captured {}x{} frame ({} bytes) at {}",
            width,
            height,
            byte_size,
            path.display()
        );

        Ok(FrameArtifact {
            session_id,
            timestamp: *timestamp,
            storage_path: path.to_string_lossy().into_owned(),
            byte_size,
            width,
            height,
            format: self.encoding.name().to_string(),
            trigger_kind: None,
            trigger_x: None,
            trigger_y: None,
            trigger_metadata: serde_json::json!({}),
            task_tag: None,
        })
    }
}

/// Writes `image` to a new file at `path`. An existing file is never
/// overwritten; a failed write leaves no partial file behind.
fn encode_to_file(image: &RgbaImage, encoding: FrameEncoding, path: &Path) -> Result<u64> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create frame file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let encoded = match encoding {
        FrameEncoding::Png => image
            .write_with_encoder(PngEncoder::new(&mut writer))
            .context("failed to encode PNG frame"),
        FrameEncoding::Jpeg { quality } => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).into_rgb8();
            rgb.write_with_encoder(JpegEncoder::new_with_quality(
                &mut writer,
                quality.clamp(1, 100),
            ))
            .context("failed to encode JPEG frame")
        }
    }
    .and_then(|_| writer.flush().context("failed to flush frame file"));

    if let Err(err) = encoded {
        let _ = fs::remove_file(path);
        return Err(err);
    }

    let byte_size = fs::metadata(path)
        .with_context(|| format!("failed to stat frame file {}", path.display()))?
        .len();
    Ok(byte_size)
}

/// Pointer-event consumer that runs the trigger gate and, when it fires,
/// the frame capture, all on the delivering thread.
pub struct FrameTrigger {
    session_id: i64,
    gate: TriggerGate,
    capture: Arc<FrameCaptureService>,
    artifacts: Arc<dyn EventSink<Artifact>>,
    health: PipelineHealth,
    disabled: AtomicBool,
}

impl FrameTrigger {
    pub fn new(
        session_id: i64,
        gate: TriggerGate,
        capture: Arc<FrameCaptureService>,
        artifacts: Arc<dyn EventSink<Artifact>>,
        health: PipelineHealth,
    ) -> Self {
        Self {
            session_id,
            gate,
            capture,
            artifacts,
            health,
            disabled: AtomicBool::new(false),
        }
    }

    fn handle(&self, trigger: Trigger) {
        match self.capture.capture(self.session_id, &trigger) {
            Ok(frame) => self.artifacts.accept(Artifact::Frame(frame)),
            Err(err) => match CaptureError::classify(&err) {
                Some(CaptureError::DeviceDisconnected { reason, .. }) => {
                    self.disabled.store(true, Ordering::SeqCst);
                    self.health
                        .set_status(SourceKind::Display, SourceStatus::Failed(reason.clone()));
                }
                Some(CaptureError::CaptureBusy) => {
                    log_info!("skipping {:?} trigger: capture in progress", trigger.kind);
                }
                _ => {
                    self.health.record_failed_capture();
                    log_warn!("frame capture failed for {:?} trigger: {err:#}", trigger.kind);
                }
            },
        }
    }
}

impl EventSink<PointerEvent> for FrameTrigger {
    fn accept(&self, event: PointerEvent) {
        if self.disabled.load(Ordering::SeqCst) {
            return;
        }
        if event.session_id != self.session_id {
            log_error!(
                "dropping trigger candidate for session {} (recording {})",
                event.session_id,
                self.session_id
            );
            return;
        }
        if let Some(trigger) = self.gate.on_event(&event) {
            self.handle(trigger);
        }
    }
}

/// Captures the display on a fixed schedule, independent of pointer
/// activity. Shares the capture service, and so its in-progress guard, with
/// [`FrameTrigger`].
pub struct IntervalCapture {
    capture: Arc<FrameCaptureService>,
    session_id: i64,
    task_tag: TaskTag,
}

impl IntervalCapture {
    pub fn new(capture: Arc<FrameCaptureService>, session_id: i64, task_tag: TaskTag) -> Self {
        Self {
            capture,
            session_id,
            task_tag,
        }
    }
}

impl SampleSource for IntervalCapture {
    type Output = Artifact;

    fn kind(&self) -> SourceKind {
        SourceKind::IntervalCapture
    }

    fn open(&mut self) -> Result<()> {
        self.capture.check_available()
    }

    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        match self
            .capture
            .capture_untriggered(self.session_id, now, self.task_tag.get())
        {
            Ok(frame) => Ok(vec![Artifact::Frame(frame)]),
            Err(err) if matches!(CaptureError::classify(&err), Some(CaptureError::CaptureBusy)) => {
                log_debug!("interval capture skipped: triggered capture in progress");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn finish(&mut self, _now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        Ok(Vec::new())
    }
}
