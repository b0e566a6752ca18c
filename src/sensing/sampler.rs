use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{error::CaptureError, utils::clock::MonotonicClock};

use super::{
    sleep_or_cancel, BackgroundWorker, EventSink, PipelineHealth, SourceKind, SourceStatus,
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// A device polled on a fixed schedule that turns its readings into finished
/// outputs.
pub trait SampleSource: Send + 'static {
    type Output: Send + 'static;

    fn kind(&self) -> SourceKind;

    /// Acquires the device. Failure means the source never runs.
    fn open(&mut self) -> Result<()>;

    /// One poll+process cycle. Returns whatever became complete.
    ///
    /// A `CaptureError::DeviceDisconnected` ends the loop; any other error
    /// is treated as transient.
    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Self::Output>>;

    /// Finalizes the in-flight partial output at stop time.
    fn finish(&mut self, now: DateTime<Utc>) -> Result<Vec<Self::Output>>;
}

/// Schedule for a sampler thread.
#[derive(Debug, Clone, Copy)]
pub struct SamplerTiming {
    pub interval: Duration,
    pub backoff: Duration,
}

/// Opens `source` and runs it on its own thread until `cancel` fires.
///
/// Each cycle sleeps whatever remains of `interval` after the poll. A failed
/// poll is logged and followed by `backoff`; it never ends the loop. On stop
/// the partial output is finalized and emitted before the thread exits.
pub fn spawn_sampler<S: SampleSource>(
    mut source: S,
    timing: SamplerTiming,
    sink: Arc<dyn EventSink<S::Output>>,
    health: PipelineHealth,
    clock: MonotonicClock,
    runtime: Handle,
    cancel: CancellationToken,
) -> Result<BackgroundWorker> {
    let kind = source.kind();
    if let Err(err) = source.open() {
        let err = CaptureError::unavailable(kind, format!("{err:#}"));
        health.set_status(kind, SourceStatus::Disabled(err.to_string()));
        return Err(err.into());
    }
    health.set_status(kind, SourceStatus::Running);

    let thread_name = format!("{kind}-sampler");
    BackgroundWorker::spawn(&thread_name, cancel, move |token| {
        let mut emitted = 0u64;
        let mut failures = 0u64;

        while !token.is_cancelled() {
            let started = Instant::now();
            match source.poll(clock.now()) {
                Ok(outputs) => {
                    for output in outputs {
                        emitted += 1;
                        sink.accept(output);
                    }
                }
                Err(err) => {
                    if let Some(CaptureError::DeviceDisconnected { reason, .. }) =
                        CaptureError::classify(&err)
                    {
                        health.set_status(kind, SourceStatus::Failed(reason.clone()));
                        break;
                    }
                    failures += 1;
                    health.record_failed_capture();
                    log_warn!("{kind} poll failed, backing off {:?}: {err:#}", timing.backoff);
                    if sleep_or_cancel(&runtime, &token, timing.backoff) {
                        break;
                    }
                    continue;
                }
            }

            let remaining = timing.interval.saturating_sub(started.elapsed());
            if sleep_or_cancel(&runtime, &token, remaining) {
                break;
            }
        }

        match source.finish(clock.now()) {
            Ok(outputs) => {
                for output in outputs {
                    emitted += 1;
                    sink.accept(output);
                }
            }
            Err(err) => log_error!("{kind} failed to finalize partial output: {err:#}"),
        }

        log_info!("{kind} sampler stopped: {emitted} outputs, {failures} failed polls");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensing::{JoinOutcome, Stoppable};
    use anyhow::anyhow;
    use std::sync::Mutex;

    /// Emits a counter every poll, fails every third poll, and finishes with
    /// a sentinel.
    struct Flaky {
        polls: u32,
    }

    impl SampleSource for Flaky {
        type Output = u32;

        fn kind(&self) -> SourceKind {
            SourceKind::Camera
        }

        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn poll(&mut self, _now: DateTime<Utc>) -> Result<Vec<u32>> {
            self.polls += 1;
            if self.polls % 3 == 0 {
                return Err(anyhow!("classifier hiccup"));
            }
            Ok(vec![self.polls])
        }

        fn finish(&mut self, _now: DateTime<Utc>) -> Result<Vec<u32>> {
            Ok(vec![u32::MAX])
        }
    }

    struct Missing;

    impl SampleSource for Missing {
        type Output = u32;

        fn kind(&self) -> SourceKind {
            SourceKind::Microphone
        }

        fn open(&mut self) -> Result<()> {
            Err(anyhow!("no input device"))
        }

        fn poll(&mut self, _now: DateTime<Utc>) -> Result<Vec<u32>> {
            unreachable!()
        }

        fn finish(&mut self, _now: DateTime<Utc>) -> Result<Vec<u32>> {
            unreachable!()
        }
    }

    fn collector() -> (Arc<dyn EventSink<u32>>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |value: u32| seen.lock().unwrap().push(value)) as Arc<dyn EventSink<u32>>
        };
        (sink, seen)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_back_off_and_stop_flushes_partial() {
        let (sink, seen) = collector();
        let health = PipelineHealth::new();
        let worker = spawn_sampler(
            Flaky { polls: 0 },
            SamplerTiming {
                interval: Duration::from_millis(2),
                backoff: Duration::from_millis(2),
            },
            sink,
            health.clone(),
            MonotonicClock::new(),
            Handle::current(),
            CancellationToken::new(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.request_stop();
        let outcome = tokio::task::spawn_blocking(move || worker.join(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Finished);

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 3, "sampler kept running after failures");
        assert_eq!(seen.last(), Some(&u32::MAX));
        assert!(!seen.contains(&3));
        assert!(health.report().failed_captures >= 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_device_never_starts() {
        let (sink, seen) = collector();
        let health = PipelineHealth::new();
        let err = spawn_sampler(
            Missing,
            SamplerTiming {
                interval: Duration::from_millis(10),
                backoff: Duration::from_millis(10),
            },
            sink,
            health.clone(),
            MonotonicClock::new(),
            Handle::current(),
            CancellationToken::new(),
        )
        .err()
        .unwrap();

        assert!(matches!(
            CaptureError::classify(&err),
            Some(CaptureError::DeviceUnavailable { .. })
        ));
        assert!(matches!(
            health.status(SourceKind::Microphone),
            Some(SourceStatus::Disabled(_))
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}
