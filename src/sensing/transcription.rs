use std::{
    path::Path,
    sync::{mpsc, Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::BatchWriter,
    db::{Artifact, AudioSegment, Transcription},
};

use super::{BackgroundWorker, EventSink, JoinOutcome, PipelineHealth, SourceKind, Stoppable};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Opaque speech-to-text primitive.
pub trait Transcriber: Send + 'static {
    fn transcribe(&mut self, audio_path: &Path) -> Result<String>;
}

/// Transcribes finished audio segments off the capture path.
///
/// Segments are queued by `accept`; `request_stop` closes the queue and the
/// thread exits once everything already queued has been processed. Each
/// transcript goes through `writer`, which owns retry and halt decisions.
pub struct TranscriptionWorker {
    queue: Mutex<Option<mpsc::Sender<AudioSegment>>>,
    worker: BackgroundWorker,
}

impl TranscriptionWorker {
    pub fn spawn(
        mut transcriber: Box<dyn Transcriber>,
        writer: Arc<dyn BatchWriter<Transcription>>,
        health: PipelineHealth,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<AudioSegment>();

        let worker = BackgroundWorker::spawn("transcriber", CancellationToken::new(), move |_| {
            let mut stored = 0u64;
            let mut unstored = 0u64;
            while let Ok(segment) = receiver.recv() {
                let path = Path::new(&segment.storage_path);
                let text = match transcriber.transcribe(path) {
                    Ok(text) => text,
                    Err(err) => {
                        health.record_failed_capture();
                        log_warn!(
                            "{} failed on {}: {err:#}",
                            SourceKind::Transcriber,
                            path.display()
                        );
                        continue;
                    }
                };

                let text = text.trim();
                if text.is_empty() {
                    continue;
                }

                let record = Transcription {
                    session_id: segment.session_id,
                    audio_path: segment.storage_path.clone(),
                    start_timestamp: segment.start_timestamp,
                    end_timestamp: segment.end_timestamp,
                    text: text.to_string(),
                    task_tag: segment.task_tag.clone(),
                };
                match writer.write_batch(vec![record]) {
                    Ok(()) => stored += 1,
                    Err(err) => {
                        unstored += 1;
                        log_warn!("transcript of {} not stored: {err:#}", path.display());
                    }
                }
            }
            log_info!("transcriber drained; {stored} stored, {unstored} failed");
        })?;

        Ok(Self {
            queue: Mutex::new(Some(sender)),
            worker,
        })
    }

    fn queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<AudioSegment>>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink<Artifact> for TranscriptionWorker {
    fn accept(&self, item: Artifact) {
        let Artifact::Audio(segment) = item else {
            return;
        };
        match self.queue().as_ref() {
            Some(sender) => {
                if sender.send(segment).is_err() {
                    log_warn!("transcriber thread gone; segment not transcribed");
                }
            }
            None => log_warn!("transcriber stopped; segment not transcribed"),
        }
    }
}

impl Stoppable for TranscriptionWorker {
    fn request_stop(&self) {
        self.queue().take();
    }

    fn join(&self, timeout: Duration) -> JoinOutcome {
        self.worker.join(timeout)
    }
}
