use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use hci_recorder::{
    analysis::{ActivityMapEngine, AnalysisConfig, OverlayCorrelationEngine},
    db::{ArtifactKind, Database, NewSession, PointerButton, PointerEventKind, TriggerKind},
    sensing::{
        AudioFormat, CallbackAudioRecorder, CameraSource, CaptureRegion, DisplayCapture,
        GazeEstimate, GazeEstimator, PointerDevice, RawPointerInput, SourceKind, SourceStatus,
        Transcriber,
    },
    PipelineConfig, RecordingController, SourceSet,
};
use image::{Rgba, RgbImage, RgbaImage};
use tempfile::TempDir;

/// Replays a fixed script, then idles. `drained` flips once every scripted
/// input has been handed out and processed.
struct ScriptedPointer {
    script: VecDeque<RawPointerInput>,
    drained: Arc<AtomicBool>,
}

impl ScriptedPointer {
    fn new(script: Vec<RawPointerInput>) -> (Self, Arc<AtomicBool>) {
        let drained = Arc::new(AtomicBool::new(false));
        (
            Self {
                script: script.into(),
                drained: Arc::clone(&drained),
            },
            drained,
        )
    }
}

impl PointerDevice for ScriptedPointer {
    fn next_input(&mut self, timeout: Duration) -> Result<Option<RawPointerInput>> {
        match self.script.pop_front() {
            Some(input) => Ok(Some(input)),
            None => {
                self.drained.store(true, Ordering::SeqCst);
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

/// Sweeps back and forth forever; `reads` counts inputs handed out.
struct EndlessPointer {
    reads: Arc<AtomicU64>,
}

impl PointerDevice for EndlessPointer {
    fn next_input(&mut self, _timeout: Duration) -> Result<Option<RawPointerInput>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));
        let x = if n % 2 == 0 { 10.0 } else { 200.0 };
        Ok(Some(RawPointerInput::Move { x, y: 10.0 }))
    }
}

struct SolidDisplay {
    width: u32,
    height: u32,
}

impl DisplayCapture for SolidDisplay {
    fn capture(&self, _region: Option<CaptureRegion>) -> Result<RgbaImage> {
        Ok(RgbaImage::from_pixel(
            self.width,
            self.height,
            Rgba([30, 30, 30, 255]),
        ))
    }
}

struct NoDisplay;

impl DisplayCapture for NoDisplay {
    fn check_available(&self) -> Result<()> {
        Err(anyhow!("screen recording permission denied"))
    }

    fn capture(&self, _region: Option<CaptureRegion>) -> Result<RgbaImage> {
        Err(anyhow!("screen recording permission denied"))
    }
}

struct BlankCamera;

impl CameraSource for BlankCamera {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage> {
        Ok(RgbImage::new(8, 8))
    }
}

/// Always reports a gaze point past the right edge of the canvas.
struct OffscreenGaze;

impl GazeEstimator for OffscreenGaze {
    fn estimate(&mut self, _frame: &RgbImage, canvas: (u32, u32)) -> Result<Option<GazeEstimate>> {
        Ok(Some(GazeEstimate {
            screen_x: f64::from(canvas.0) + 50.0,
            screen_y: 200.0,
            left_pupil: None,
            right_pupil: None,
            left_eye_ratio: Some(0.25),
            right_eye_ratio: Some(0.25),
            head_pose: None,
            calibrated: false,
        }))
    }
}

struct FixedTranscriber;

impl Transcriber for FixedTranscriber {
    fn transcribe(&mut self, _audio_path: &Path) -> Result<String> {
        Ok("open the settings page".into())
    }
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        data_root: root.to_path_buf(),
        movement_threshold: 5.0,
        pointer_buffer_threshold: 2,
        audio_poll_interval_ms: 10,
        strict_invariants: true,
        ..PipelineConfig::default()
    }
}

async fn controller(dir: &TempDir) -> (Database, RecordingController) {
    let config = config(dir.path());
    let db = Database::new(config.database_path()).unwrap();
    let controller = RecordingController::new(db.clone(), config).await.unwrap();
    (db, controller)
}

async fn wait_for(flag: &AtomicBool) {
    for _ in 0..200 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scripted device never drained");
}

fn press(x: f64, y: f64, pressed: bool) -> RawPointerInput {
    RawPointerInput::Button {
        x,
        y,
        button: PointerButton::Left,
        pressed,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recording_throttles_moves_and_captures_clicked_frame() {
    let dir = TempDir::new().unwrap();
    let (db, controller) = controller(&dir).await;

    let (pointer, drained) = ScriptedPointer::new(vec![
        RawPointerInput::Move { x: 100.0, y: 100.0 },
        RawPointerInput::Move { x: 100.0, y: 100.0 },
        RawPointerInput::Move { x: 980.0, y: 540.0 },
        press(500.0, 500.0, true),
        press(500.0, 500.0, false),
    ]);
    let sources = SourceSet::new().with_pointer(pointer).with_display(Arc::new(SolidDisplay {
        width: 960,
        height: 540,
    }));

    let session = controller
        .start(NewSession::with_canvas(1920, 1080), sources)
        .await
        .unwrap();
    wait_for(&drained).await;
    let summary = controller.stop().await.unwrap().expect("recording was active");

    assert!(!summary.session.is_active());
    assert!(summary.session.end_time.is_some());
    assert!(summary.health.halted.is_none());
    assert_eq!(summary.stats.moves, 2);
    assert_eq!(summary.stats.clicks, 1);
    assert_eq!(summary.stats.frames, 1);

    let events = db.query_events(session.id).await.unwrap();
    let moves: Vec<(f64, f64)> = events
        .iter()
        .filter(|e| e.kind == PointerEventKind::Move)
        .map(|e| (e.x, e.y))
        .collect();
    assert_eq!(moves, vec![(100.0, 100.0), (980.0, 540.0)]);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == PointerEventKind::Click)
            .count(),
        2
    );
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let frames = db.get_frames(session.id).await.unwrap();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.trigger_kind, Some(TriggerKind::Click));
    assert_eq!(frame.trigger_x, Some(500.0));
    assert_eq!(frame.trigger_y, Some(500.0));
    assert_eq!((frame.width, frame.height), (960, 540));
    assert!(PathBuf::from(&frame.storage_path).is_file());

    let press_time = events.iter().find(|e| e.is_press()).unwrap().timestamp;
    assert_eq!(frame.timestamp, press_time);

    let overlays = OverlayCorrelationEngine::new(
        AnalysisConfig {
            sigma: 2.0,
            grid_thumb_width: 64,
            ..AnalysisConfig::default()
        },
        controller.layout().clone(),
    );
    let report = overlays.render_session(&db, session.id, true).await.unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.skipped(), 0);
    let rendered = &report.rendered[0];
    assert_eq!(rendered.click_events, 1);
    assert_eq!(rendered.activity_events, 3);
    let composite = image::open(&rendered.overlay_path).unwrap();
    assert_eq!((composite.width(), composite.height()), (960, 540));
    assert!(report.comparison_grid.as_deref().is_some_and(Path::is_file));

    let maps = ActivityMapEngine::new(2.0)
        .render_session_maps(&db, controller.layout(), session.id)
        .await
        .unwrap();
    assert_eq!(maps.activity_events, 3);
    assert_eq!(maps.click_events, 1);
    assert!(maps.activity.is_file());
    assert!(maps.clicks.is_file());
    let comparison = image::open(maps.comparison.expect("session had moves and clicks")).unwrap();
    assert!(comparison.width() > 2 * 1920);
    assert_eq!(comparison.height(), 1080);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_session_yields_empty_results_and_stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (db, controller) = controller(&dir).await;

    let session = controller
        .start(NewSession::with_canvas(1920, 1080), SourceSet::new())
        .await
        .unwrap();
    let health = controller.health().await.unwrap();
    assert!(matches!(
        health.sources.get(&SourceKind::Pointer),
        Some(SourceStatus::Disabled(_))
    ));

    let summary = controller.stop().await.unwrap().unwrap();
    assert_eq!(summary.stats.moves, 0);
    assert!(controller.stop().await.unwrap().is_none());
    assert!(controller.active_session().await.is_none());

    assert!(db.query_events(session.id).await.unwrap().is_empty());
    assert!(db
        .query_artifacts(session.id, ArtifactKind::Frame)
        .await
        .unwrap()
        .is_empty());

    let report = OverlayCorrelationEngine::new(AnalysisConfig::default(), controller.layout().clone())
        .render_session(&db, session.id, true)
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 0);
    assert!(report.comparison_grid.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_display_leaves_pointer_recording() {
    let dir = TempDir::new().unwrap();
    let (db, controller) = controller(&dir).await;

    let (pointer, drained) = ScriptedPointer::new(vec![
        RawPointerInput::Move { x: 10.0, y: 10.0 },
        press(10.0, 10.0, true),
    ]);
    let session = controller
        .start(
            NewSession::with_canvas(800, 600),
            SourceSet::new()
                .with_pointer(pointer)
                .with_display(Arc::new(NoDisplay)),
        )
        .await
        .unwrap();
    wait_for(&drained).await;

    let health = controller.health().await.unwrap();
    assert!(matches!(
        health.sources.get(&SourceKind::Display),
        Some(SourceStatus::Disabled(_))
    ));
    assert_eq!(
        health.sources.get(&SourceKind::Pointer),
        Some(&SourceStatus::Running)
    );

    let summary = controller.stop().await.unwrap().unwrap();
    assert_eq!(summary.stats.clicks, 1);
    assert_eq!(summary.stats.frames, 0);
    assert_eq!(db.query_events(session.id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partial_audio_is_flushed_and_transcribed_on_stop() {
    let dir = TempDir::new().unwrap();
    let (db, controller) = controller(&dir).await;

    let format = AudioFormat {
        sample_rate: 8_000,
        channels: 1,
    };
    let (recorder, feed) = CallbackAudioRecorder::new(format);
    let session = controller
        .start(
            NewSession::with_canvas(800, 600),
            SourceSet::new()
                .with_audio(recorder)
                .with_transcriber(FixedTranscriber),
        )
        .await
        .unwrap();

    controller
        .set_task_tag(Some("checkout".into()))
        .await
        .unwrap();
    assert!(feed.push(&[1_000i16; 4_000]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = controller.stop().await.unwrap().unwrap();
    assert_eq!(summary.stats.audio_segments, 1);
    assert!((summary.stats.audio_secs - 0.5).abs() < 1e-6);

    let segments = db.get_audio_segments(session.id).await.unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].task_tag.as_deref(), Some("checkout"));
    assert!(PathBuf::from(&segments[0].storage_path).is_file());

    let transcripts = db.get_transcriptions(session.id).await.unwrap();
    assert_eq!(transcripts.len(), 1);
    assert_eq!(transcripts[0].text, "open the settings page");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_sessions_are_recovered_on_startup() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let db = Database::new(config.database_path()).unwrap();
    let orphan = db
        .create_session(&NewSession::with_canvas(640, 480))
        .await
        .unwrap();
    assert!(orphan.is_active());

    let _controller = RecordingController::new(db.clone(), config).await.unwrap();
    let recovered = db.get_session(orphan.id).await.unwrap().unwrap();
    assert!(!recovered.is_active());
    assert!(recovered.end_time.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_failure_halts_session_and_stops_sources() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        store_retry_attempts: 2,
        store_retry_backoff_ms: 1,
        ..config(dir.path())
    };
    let db = Database::new(config.database_path()).unwrap();
    let controller = RecordingController::new(db.clone(), config.clone())
        .await
        .unwrap();

    // Every pointer insert now fails the way a full disk would.
    let admin = rusqlite::Connection::open(config.database_path()).unwrap();
    admin
        .execute_batch(
            "CREATE TRIGGER reject_pointer BEFORE INSERT ON pointer_events
             BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END;",
        )
        .unwrap();
    drop(admin);

    let reads = Arc::new(AtomicU64::new(0));
    let session = controller
        .start(
            NewSession::with_canvas(800, 600),
            SourceSet::new().with_pointer(EndlessPointer {
                reads: Arc::clone(&reads),
            }),
        )
        .await
        .unwrap();

    let mut halted = None;
    for _ in 0..300 {
        halted = controller.health().await.and_then(|report| report.halted);
        if halted.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let reason = halted.expect("session never halted");
    assert!(reason.starts_with("storage failure writing pointer"));

    // The halt cancels the pointer thread without waiting for stop().
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = reads.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reads.load(Ordering::SeqCst), settled);

    let summary = controller.stop().await.unwrap().unwrap();
    assert_eq!(summary.health.halted.as_deref(), Some(reason.as_str()));
    assert_eq!(
        summary.health.sources.get(&SourceKind::Pointer),
        Some(&SourceStatus::Stopped)
    );
    assert!(!summary.session.is_active());
    assert_eq!(summary.stats.moves, 0);
    assert!(db.query_events(session.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_frames_and_gaze_are_recorded_without_pointer_input() {
    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        interval_capture_secs: Some(0.05),
        gaze_rate_hz: 50.0,
        ..config(dir.path())
    };
    let db = Database::new(config.database_path()).unwrap();
    let controller = RecordingController::new(db.clone(), config).await.unwrap();

    let session = controller
        .start(
            NewSession::with_canvas(800, 600),
            SourceSet::new()
                .with_display(Arc::new(SolidDisplay {
                    width: 80,
                    height: 60,
                }))
                .with_gaze(BlankCamera, OffscreenGaze),
        )
        .await
        .unwrap();
    let health = controller.health().await.unwrap();
    assert_eq!(
        health.sources.get(&SourceKind::IntervalCapture),
        Some(&SourceStatus::Running)
    );
    assert_eq!(health.sources.get(&SourceKind::Gaze), Some(&SourceStatus::Running));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let summary = controller.stop().await.unwrap().unwrap();
    assert!(summary.health.halted.is_none());

    let frames = db.get_frames(session.id).await.unwrap();
    assert!(frames.len() >= 2, "only {} scheduled frames", frames.len());
    assert!(frames.iter().all(|frame| frame.trigger_kind.is_none()));
    assert!(frames
        .iter()
        .all(|frame| PathBuf::from(&frame.storage_path).is_file()));

    let gaze = db.get_gaze_samples(session.id).await.unwrap();
    assert!(gaze.len() >= 2, "only {} gaze samples", gaze.len());
    assert!(gaze.iter().all(|sample| sample.gaze_x == 800.0));
    assert!(gaze.iter().all(|sample| sample.left_eye_open == Some(true)));
    assert_eq!(summary.stats.gaze_samples, gaze.len() as u64);
    assert_eq!(summary.stats.frames, frames.len() as u64);
}
