use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{BufferedSink, StoreWriter},
    db::{Artifact, Database, NewSession, PointerEvent, Session, SessionStats, Transcription},
    settings::PipelineConfig,
    storage::ArtifactLayout,
    utils::clock::MonotonicClock,
};

use super::{
    audio::{AudioRecorder, AudioSegmenter},
    biometric::{BiometricClassifier, BiometricSampler, CameraSource},
    frame_capture::{DisplayCapture, FrameCaptureService, FrameTrigger, IntervalCapture},
    gaze::{GazeEstimator, GazeSampler},
    pointer::{PointerDevice, PointerEventSource},
    sampler::{spawn_sampler, SamplerTiming},
    transcription::{Transcriber, TranscriptionWorker},
    trigger_gate::TriggerGate,
    BackgroundWorker, EventSink, Fanout, HealthReport, JoinOutcome, PipelineHealth, SourceKind,
    SourceStatus, Stoppable, TaskTag,
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Devices available to one recording. A missing entry disables that source.
#[derive(Default)]
pub struct SourceSet {
    pub pointer: Option<Box<dyn PointerDevice>>,
    pub display: Option<Arc<dyn DisplayCapture>>,
    pub audio: Option<Box<dyn AudioRecorder>>,
    pub biometric: Option<(Box<dyn CameraSource>, Box<dyn BiometricClassifier>)>,
    pub gaze: Option<(Box<dyn CameraSource>, Box<dyn GazeEstimator>)>,
    pub transcriber: Option<Box<dyn Transcriber>>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pointer(mut self, device: impl PointerDevice) -> Self {
        self.pointer = Some(Box::new(device));
        self
    }

    pub fn with_display(mut self, display: Arc<dyn DisplayCapture>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_audio(mut self, recorder: impl AudioRecorder) -> Self {
        self.audio = Some(Box::new(recorder));
        self
    }

    pub fn with_biometrics(
        mut self,
        camera: impl CameraSource,
        classifier: impl BiometricClassifier,
    ) -> Self {
        self.biometric = Some((Box::new(camera), Box::new(classifier)));
        self
    }

    pub fn with_gaze(mut self, camera: impl CameraSource, estimator: impl GazeEstimator) -> Self {
        self.gaze = Some((Box::new(camera), Box::new(estimator)));
        self
    }

    pub fn with_transcriber(mut self, transcriber: impl Transcriber) -> Self {
        self.transcriber = Some(Box::new(transcriber));
        self
    }
}

/// What a finished recording produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session: Session,
    pub stats: SessionStats,
    pub health: HealthReport,
}

struct ActiveRecording {
    session: Session,
    task_tag: TaskTag,
    health: PipelineHealth,
    cancel: CancellationToken,
    pointer_sink: Arc<BufferedSink<PointerEvent>>,
    artifact_sink: Arc<BufferedSink<Artifact>>,
    workers: Vec<(SourceKind, BackgroundWorker)>,
    transcriber: Option<Arc<TranscriptionWorker>>,
    halt_watcher: JoinHandle<()>,
}

/// Owns the lifecycle of a recording session: creates the session, wires
/// every source to the buffered store sinks, and tears it all down in two
/// phases on stop.
#[derive(Clone)]
pub struct RecordingController {
    db: Database,
    config: PipelineConfig,
    layout: ArtifactLayout,
    active: Arc<Mutex<Option<ActiveRecording>>>,
}

impl RecordingController {
    /// Sessions left active by a previous process are closed here.
    pub async fn new(db: Database, config: PipelineConfig) -> Result<Self> {
        let recovered = db
            .recover_active_sessions(Utc::now())
            .await
            .context("failed to recover interrupted sessions")?;
        for session in &recovered {
            log_warn!(
                "Recovered interrupted session {}; marked completed",
                session.id
            );
        }

        let layout = ArtifactLayout::new(config.data_root.clone());
        Ok(Self {
            db,
            config,
            layout,
            active: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|recording| recording.session.clone())
    }

    pub async fn start(&self, params: NewSession, mut sources: SourceSet) -> Result<Session> {
        let runtime = Handle::current();
        if runtime.runtime_flavor() != RuntimeFlavor::MultiThread {
            bail!("recording requires a multi-threaded tokio runtime");
        }

        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(anyhow!("recording already active"));
        }

        let session = self.db.create_session(&params).await?;
        let config = &self.config;
        let health = PipelineHealth::new();
        let task_tag = TaskTag::new();
        let clock = MonotonicClock::new();
        let cancel = CancellationToken::new();

        let pointer_sink = Arc::new(BufferedSink::<PointerEvent>::new(
            "pointer",
            config.pointer_buffer_threshold,
            Arc::new(StoreWriter::<PointerEvent>::new(
                self.db.clone(),
                runtime.clone(),
                health.clone(),
                config.store_retry_attempts,
                config.store_retry_backoff(),
                config.strict_invariants,
            )),
        ));
        let artifact_sink = Arc::new(BufferedSink::<Artifact>::new(
            "artifact",
            config.artifact_buffer_threshold,
            Arc::new(StoreWriter::<Artifact>::new(
                self.db.clone(),
                runtime.clone(),
                health.clone(),
                config.store_retry_attempts,
                config.store_retry_backoff(),
                config.strict_invariants,
            )),
        ));

        let transcriber = match sources.transcriber.take() {
            Some(transcriber) => match TranscriptionWorker::spawn(
                transcriber,
                Arc::new(StoreWriter::<Transcription>::new(
                    self.db.clone(),
                    runtime.clone(),
                    health.clone(),
                    config.store_retry_attempts,
                    config.store_retry_backoff(),
                    config.strict_invariants,
                )),
                health.clone(),
            ) {
                Ok(worker) => {
                    health.set_status(SourceKind::Transcriber, SourceStatus::Running);
                    Some(Arc::new(worker))
                }
                Err(err) => {
                    health.set_status(
                        SourceKind::Transcriber,
                        SourceStatus::Disabled(format!("{err:#}")),
                    );
                    None
                }
            },
            None => None,
        };

        let artifacts: Arc<dyn EventSink<Artifact>> = match &transcriber {
            Some(worker) => Arc::new(Fanout::new(vec![
                artifact_sink.clone() as Arc<dyn EventSink<Artifact>>,
                worker.clone() as Arc<dyn EventSink<Artifact>>,
            ])),
            None => artifact_sink.clone(),
        };

        let mut pointer_consumers: Vec<Arc<dyn EventSink<PointerEvent>>> =
            vec![pointer_sink.clone() as Arc<dyn EventSink<PointerEvent>>];
        let mut frame_service = None;
        match sources.display.take() {
            Some(display) => {
                let capture = Arc::new(FrameCaptureService::new(
                    display,
                    self.layout.clone(),
                    config.frame_encoding,
                ));
                match capture.check_available() {
                    Ok(()) => {
                        health.set_status(SourceKind::Display, SourceStatus::Running);
                        pointer_consumers.push(Arc::new(FrameTrigger::new(
                            session.id,
                            TriggerGate::new(config.scroll_threshold, config.cooldown()),
                            Arc::clone(&capture),
                            artifacts.clone(),
                            health.clone(),
                        )));
                        frame_service = Some(capture);
                    }
                    Err(err) => health
                        .set_status(SourceKind::Display, SourceStatus::Disabled(format!("{err:#}"))),
                }
            }
            None => health.set_status(
                SourceKind::Display,
                SourceStatus::Disabled("no display configured".into()),
            ),
        }

        let mut workers = Vec::new();

        match (config.interval_capture(), frame_service) {
            (Some(interval), Some(capture)) => {
                let timing = SamplerTiming {
                    interval,
                    backoff: config.sampler_backoff(),
                };
                match spawn_sampler(
                    IntervalCapture::new(capture, session.id, task_tag.clone()),
                    timing,
                    artifacts.clone(),
                    health.clone(),
                    clock,
                    runtime.clone(),
                    cancel.child_token(),
                ) {
                    Ok(worker) => workers.push((SourceKind::IntervalCapture, worker)),
                    Err(err) => log_warn!("interval capture not started: {err:#}"),
                }
            }
            (Some(_), None) => health.set_status(
                SourceKind::IntervalCapture,
                SourceStatus::Disabled("display unavailable".into()),
            ),
            (None, _) => {}
        }

        match sources.pointer.take() {
            Some(device) => {
                let source = PointerEventSource::new(
                    session.id,
                    config.movement_threshold,
                    task_tag.clone(),
                    clock,
                    Arc::new(Fanout::new(pointer_consumers)),
                    health.clone(),
                );
                match source.spawn(device, cancel.child_token()) {
                    Ok(worker) => workers.push((SourceKind::Pointer, worker)),
                    Err(err) => log_warn!("pointer source not started: {err:#}"),
                }
            }
            None => health.set_status(
                SourceKind::Pointer,
                SourceStatus::Disabled("no pointer device configured".into()),
            ),
        }

        match sources.audio.take() {
            Some(recorder) => {
                let segmenter = AudioSegmenter::new(
                    recorder,
                    session.id,
                    self.layout.clone(),
                    task_tag.clone(),
                    config.audio_segment_duration(),
                );
                let timing = SamplerTiming {
                    interval: config.audio_poll_interval(),
                    backoff: config.sampler_backoff(),
                };
                match spawn_sampler(
                    segmenter,
                    timing,
                    artifacts.clone(),
                    health.clone(),
                    clock,
                    runtime.clone(),
                    cancel.child_token(),
                ) {
                    Ok(worker) => workers.push((SourceKind::Microphone, worker)),
                    Err(err) => log_warn!("audio sampler not started: {err:#}"),
                }
            }
            None => health.set_status(
                SourceKind::Microphone,
                SourceStatus::Disabled("no audio recorder configured".into()),
            ),
        }

        match sources.biometric.take() {
            Some((camera, classifier)) => {
                let sampler = BiometricSampler::new(
                    camera,
                    classifier,
                    session.id,
                    task_tag.clone(),
                    config.biometric_score_scale,
                );
                let timing = SamplerTiming {
                    interval: config.biometric_interval(),
                    backoff: config.sampler_backoff(),
                };
                match spawn_sampler(
                    sampler,
                    timing,
                    artifacts.clone(),
                    health.clone(),
                    clock,
                    runtime.clone(),
                    cancel.child_token(),
                ) {
                    Ok(worker) => workers.push((SourceKind::Camera, worker)),
                    Err(err) => log_warn!("biometric sampler not started: {err:#}"),
                }
            }
            None => health.set_status(
                SourceKind::Camera,
                SourceStatus::Disabled("no camera configured".into()),
            ),
        }

        match sources.gaze.take() {
            Some((camera, estimator)) => {
                let sampler = GazeSampler::new(
                    camera,
                    estimator,
                    session.id,
                    session.canvas(),
                    task_tag.clone(),
                    health.clone(),
                );
                let timing = SamplerTiming {
                    interval: config.gaze_interval(),
                    backoff: config.sampler_backoff(),
                };
                match spawn_sampler(
                    sampler,
                    timing,
                    artifacts.clone(),
                    health.clone(),
                    clock,
                    runtime.clone(),
                    cancel.child_token(),
                ) {
                    Ok(worker) => workers.push((SourceKind::Gaze, worker)),
                    Err(err) => log_warn!("gaze sampler not started: {err:#}"),
                }
            }
            None => health.set_status(
                SourceKind::Gaze,
                SourceStatus::Disabled("no gaze estimator configured".into()),
            ),
        }

        let halt_watcher = {
            let halted = health.halted();
            let cancel = cancel.clone();
            let session_id = session.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = halted.cancelled() => {
                        log_error!("session {session_id} halted; stopping capture sources");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        };

        log_info!(
            "Recording session {} ({}x{}) with {} capture threads",
            session.id,
            session.screen_width,
            session.screen_height,
            workers.len()
        );

        *active = Some(ActiveRecording {
            session: session.clone(),
            task_tag,
            health,
            cancel,
            pointer_sink,
            artifact_sink,
            workers,
            transcriber,
            halt_watcher,
        });

        Ok(session)
    }

    /// Sets the tag stamped on everything captured from now on.
    pub async fn set_task_tag(&self, tag: Option<String>) -> Result<()> {
        let active = self.active.lock().await;
        let recording = active
            .as_ref()
            .ok_or_else(|| anyhow!("no active recording"))?;
        log_info!("task tag for session {} set to {:?}", recording.session.id, tag);
        recording.task_tag.set(tag);
        Ok(())
    }

    /// Per-source status and halt state of the active recording.
    pub async fn health(&self) -> Option<HealthReport> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|recording| recording.health.report())
    }

    pub async fn stats(&self, session_id: i64) -> Result<SessionStats> {
        self.db.session_stats(session_id).await
    }

    /// Stops the active recording. Returns `None` when nothing is recording,
    /// so repeated calls are harmless.
    ///
    /// Order: stop sources, join them (bounded), flush the buffers, drain
    /// pending transcriptions (bounded), then close the session.
    pub async fn stop(&self) -> Result<Option<SessionSummary>> {
        let Some(recording) = self.active.lock().await.take() else {
            return Ok(None);
        };
        let ActiveRecording {
            session,
            task_tag: _,
            health,
            cancel,
            pointer_sink,
            artifact_sink,
            workers,
            transcriber,
            halt_watcher,
        } = recording;

        cancel.cancel();

        let join_timeout = self.config.join_timeout();
        let join_health = health.clone();
        tokio::task::spawn_blocking(move || {
            for (kind, worker) in &workers {
                worker.request_stop();
                if worker.join(join_timeout) == JoinOutcome::TimedOut {
                    log_warn!("{kind} source did not stop within {join_timeout:?}");
                }
                join_health.mark_stopped(*kind);
            }
        })
        .await
        .context("source join task failed")?;

        let flush_result = tokio::task::spawn_blocking(move || {
            let pointer = pointer_sink.close();
            let artifacts = artifact_sink.close();
            pointer.and(artifacts)
        })
        .await
        .context("buffer flush task failed")?;
        if let Err(err) = flush_result {
            log_error!("final flush for session {} failed: {err:#}", session.id);
        }

        if let Some(worker) = transcriber {
            let timeout = self.config.transcription_join_timeout();
            worker.request_stop();
            let outcome = tokio::task::spawn_blocking(move || worker.join(timeout))
                .await
                .context("transcription join task failed")?;
            if outcome == JoinOutcome::TimedOut {
                log_warn!("pending transcriptions abandoned after {timeout:?}");
            }
            health.mark_stopped(SourceKind::Transcriber);
        }

        halt_watcher.abort();

        let session = self.db.end_session(session.id, Utc::now()).await?;
        let stats = self.db.session_stats(session.id).await?;
        let report = health.report();

        log_info!(
            "Session {} complete: {} clicks, {} moves, {} frames, {} audio segments, {} biometric samples, {} gaze samples",
            session.id,
            stats.clicks,
            stats.moves,
            stats.frames,
            stats.audio_segments,
            stats.biometric_samples,
            stats.gaze_samples
        );

        Ok(Some(SessionSummary {
            session,
            stats,
            health: report,
        }))
    }
}
