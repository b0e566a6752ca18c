use std::{marker::PhantomData, thread, time::Duration};

use anyhow::Result;
use tokio::runtime::Handle;

use crate::{
    db::{Artifact, Database, PointerEvent, Transcription},
    error::CaptureError,
    sensing::PipelineHealth,
};

use super::BatchWriter;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

/// Writes drained batches into the session store from a producer thread.
///
/// Storage failures are retried with a fixed backoff; once retries run out
/// the session is halted through [`PipelineHealth`]. Invariant violations are
/// never retried: strict mode halts, lenient mode drops and logs the batch.
pub struct StoreWriter<T> {
    db: Database,
    runtime: Handle,
    health: PipelineHealth,
    attempts: u32,
    backoff: Duration,
    strict_invariants: bool,
    _records: PhantomData<fn(T)>,
}

impl<T> StoreWriter<T> {
    pub fn new(
        db: Database,
        runtime: Handle,
        health: PipelineHealth,
        attempts: u32,
        backoff: Duration,
        strict_invariants: bool,
    ) -> Self {
        Self {
            db,
            runtime,
            health,
            attempts: attempts.max(1),
            backoff,
            strict_invariants,
            _records: PhantomData,
        }
    }

    fn write_with_retry<F>(&self, label: &str, count: usize, mut attempt_write: F) -> Result<()>
    where
        F: FnMut() -> Result<usize>,
    {
        for attempt in 1..=self.attempts {
            let err = match attempt_write() {
                Ok(written) => {
                    log_debug!("wrote {written} {label} records");
                    return Ok(());
                }
                Err(err) => err,
            };

            if CaptureError::is_invariant_violation(&err) {
                if self.strict_invariants {
                    self.health.halt(format!("{label} batch rejected: {err}"));
                    return Err(err);
                }
                log_warn!("dropping {count} {label} records: {err}");
                self.health.record_dropped(count);
                return Ok(());
            }

            if attempt < self.attempts {
                log_warn!(
                    "{label} batch write failed (attempt {attempt}/{}): {err:?}",
                    self.attempts
                );
                thread::sleep(self.backoff);
                continue;
            }

            log_error!("{label} batch of {count} records could not be stored: {err:?}");
            self.health
                .halt(format!("storage failure writing {label} records: {err}"));
            return Err(CaptureError::Storage(err.to_string()).into());
        }

        Ok(())
    }
}

impl BatchWriter<PointerEvent> for StoreWriter<PointerEvent> {
    fn write_batch(&self, batch: Vec<PointerEvent>) -> Result<()> {
        let count = batch.len();
        self.write_with_retry("pointer", count, || {
            self.runtime
                .block_on(self.db.append_events_batch(batch.clone()))
        })
    }
}

impl BatchWriter<Artifact> for StoreWriter<Artifact> {
    fn write_batch(&self, batch: Vec<Artifact>) -> Result<()> {
        let count = batch.len();
        self.write_with_retry("artifact", count, || {
            self.runtime
                .block_on(self.db.append_artifacts_batch(batch.clone()))
        })
    }
}

impl BatchWriter<Transcription> for StoreWriter<Transcription> {
    fn write_batch(&self, batch: Vec<Transcription>) -> Result<()> {
        let count = batch.len();
        self.write_with_retry("transcription", count, || {
            self.runtime
                .block_on(self.db.append_transcriptions_batch(batch.clone()))
        })
    }
}
