use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;

use crate::sensing::EventSink;

use super::EventBuffer;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_warn};

/// Durably writes one drained batch. Called with no buffer lock held.
pub trait BatchWriter<T>: Send + Sync {
    fn write_batch(&self, batch: Vec<T>) -> Result<()>;
}

/// An [`EventSink`] that batches items and writes each full batch through a
/// [`BatchWriter`] on the producer's thread.
pub struct BufferedSink<T> {
    label: &'static str,
    buffer: EventBuffer<T>,
    writer: Arc<dyn BatchWriter<T>>,
    closed: AtomicBool,
    rejected: AtomicU64,
}

impl<T: Send> BufferedSink<T> {
    pub fn new(label: &'static str, threshold: usize, writer: Arc<dyn BatchWriter<T>>) -> Self {
        Self {
            label,
            buffer: EventBuffer::new(threshold),
            writer,
            closed: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Items refused because they arrived after `close`.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Writes everything pending.
    pub fn flush(&self) -> Result<()> {
        let batch = self.buffer.flush();
        self.write(batch)
    }

    /// Stops accepting items, then writes whatever is pending. Later calls
    /// find nothing to write.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.flush()
    }

    fn write(&self, batch: Vec<T>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.writer.write_batch(batch)
    }
}

impl<T: Send> EventSink<T> for BufferedSink<T> {
    fn accept(&self, item: T) {
        if self.closed.load(Ordering::SeqCst) {
            let rejected = self.rejected.fetch_add(1, Ordering::SeqCst) + 1;
            if rejected == 1 {
                log_warn!("{} sink closed; rejecting late records", self.label);
            }
            return;
        }

        // `append` has already released the buffer lock when it returns.
        if let Some(batch) = self.buffer.append(item) {
            if let Err(err) = self.write(batch) {
                log_error!("{} batch write failed: {err:?}", self.label);
            }
        }
    }
}
