//! Capture sources and the controller that coordinates them.
//!
//! Every source hands its output to an [`EventSink`] and every background
//! thread is driven through [`Stoppable`], so devices, buffers and the store
//! can each be replaced by fakes.

mod audio;
mod biometric;
mod controller;
mod frame_capture;
mod gaze;
mod health;
mod pointer;
mod sampler;
mod transcription;
mod trigger_gate;
mod worker;

use std::sync::{Arc, RwLock};

pub use audio::{
    rms_level, write_wav, AudioChunkSender, AudioFormat, AudioRecorder, AudioSegmenter,
    CallbackAudioRecorder,
};
pub use biometric::{
    normalize_distribution, normalize_score, BiometricClassifier, BiometricSampler, CameraSource,
    Classification,
};
pub use controller::{RecordingController, SessionSummary, SourceSet};
pub use frame_capture::{
    CaptureRegion, DisplayCapture, FrameCaptureService, FrameTrigger, IntervalCapture,
};
pub use gaze::{GazeEstimate, GazeEstimator, GazeSampler, EYE_OPEN_RATIO};
pub use health::{HealthReport, PipelineHealth, SourceKind, SourceStatus};
pub use pointer::{MoveThrottle, PointerDevice, PointerEventSource, RawPointerInput};
pub use sampler::{spawn_sampler, SampleSource, SamplerTiming};
pub use transcription::{Transcriber, TranscriptionWorker};
pub use trigger_gate::{GateState, Trigger, TriggerGate};
pub use worker::{sleep_or_cancel, BackgroundWorker, JoinOutcome, Stoppable};

/// Receives one item at a time from a producer.
///
/// Implementations are called from the producer's own thread and must not
/// block on other producers.
pub trait EventSink<T>: Send + Sync {
    fn accept(&self, item: T);
}

impl<T, F> EventSink<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn accept(&self, item: T) {
        self(item)
    }
}

/// Forwards every item to each downstream sink in order.
pub struct Fanout<T> {
    sinks: Vec<Arc<dyn EventSink<T>>>,
}

impl<T: Clone> Fanout<T> {
    pub fn new(sinks: Vec<Arc<dyn EventSink<T>>>) -> Self {
        Self { sinks }
    }
}

impl<T: Clone + Send + Sync> EventSink<T> for Fanout<T> {
    fn accept(&self, item: T) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.accept(item.clone());
            }
            last.accept(item);
        }
    }
}

/// The task label currently stamped on captured records. Shared between the
/// controller and every source.
#[derive(Debug, Clone, Default)]
pub struct TaskTag {
    inner: Arc<RwLock<Option<String>>>,
}

impl TaskTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, tag: Option<String>) {
        let tag = tag.filter(|value| !value.trim().is_empty());
        match self.inner.write() {
            Ok(mut guard) => *guard = tag,
            Err(poisoned) => *poisoned.into_inner() = tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |value: u32| seen.lock().unwrap().push(value)
        };
        sink.accept(4);
        sink.accept(2);
        assert_eq!(*seen.lock().unwrap(), vec![4, 2]);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let left = Arc::new(Mutex::new(Vec::new()));
        let right = Arc::new(Mutex::new(Vec::new()));
        let fanout = Fanout::new(vec![
            {
                let left = Arc::clone(&left);
                Arc::new(move |value: String| left.lock().unwrap().push(value))
                    as Arc<dyn EventSink<String>>
            },
            {
                let right = Arc::clone(&right);
                Arc::new(move |value: String| right.lock().unwrap().push(value))
                    as Arc<dyn EventSink<String>>
            },
        ]);
        fanout.accept("click".to_string());
        assert_eq!(*left.lock().unwrap(), vec!["click"]);
        assert_eq!(*right.lock().unwrap(), vec!["click"]);
    }

    #[test]
    fn blank_task_tags_clear_the_tag() {
        let tag = TaskTag::new();
        tag.set(Some("checkout".into()));
        assert_eq!(tag.get().as_deref(), Some("checkout"));

        let shared = tag.clone();
        shared.set(Some("   ".into()));
        assert_eq!(tag.get(), None);
    }
}
