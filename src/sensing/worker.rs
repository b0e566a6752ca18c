use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Finished,
    /// The thread was still running at the deadline and has been left
    /// detached.
    TimedOut,
    AlreadyJoined,
}

/// Two-phase shutdown shared by every background-threaded component.
pub trait Stoppable {
    /// Signals the component to stop accepting work. Never blocks.
    fn request_stop(&self);

    /// Waits up to `timeout` for in-flight work to drain and the thread to exit.
    fn join(&self, timeout: Duration) -> JoinOutcome;
}

/// Sleeps for `duration` unless `token` is cancelled first. Returns true when
/// woken by cancellation.
///
/// Must be called from a plain thread, not from inside an async task.
pub fn sleep_or_cancel(runtime: &Handle, token: &CancellationToken, duration: Duration) -> bool {
    if token.is_cancelled() {
        return true;
    }
    if duration.is_zero() {
        return false;
    }
    runtime.block_on(async {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = token.cancelled() => true,
        }
    })
}

/// A named OS thread stopped through a cancellation token.
///
/// The thread owns the sending half of a channel; when it exits the channel
/// disconnects, which lets `join` wait with a deadline instead of blocking on
/// `JoinHandle::join` indefinitely.
pub struct BackgroundWorker {
    name: String,
    cancel: CancellationToken,
    done: Mutex<Option<mpsc::Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl BackgroundWorker {
    pub fn spawn<F>(name: &str, cancel: CancellationToken, body: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let token = cancel.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = done_tx;
                body(token);
            })
            .with_context(|| format!("failed to spawn {name} thread"))?;

        log_info!("{name} thread started");

        Ok(Self {
            name: name.to_string(),
            cancel,
            done: Mutex::new(Some(done_rx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}

impl Stoppable for BackgroundWorker {
    fn request_stop(&self) {
        self.cancel.cancel();
    }

    fn join(&self, timeout: Duration) -> JoinOutcome {
        let mut done = lock(&self.done);
        let Some(receiver) = done.as_ref() else {
            return JoinOutcome::AlreadyJoined;
        };

        match receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log_warn!(
                    "{} thread did not stop within {:?}; detaching",
                    self.name,
                    timeout
                );
                JoinOutcome::TimedOut
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                done.take();
                if let Some(handle) = lock(&self.handle).take() {
                    if let Err(panic) = handle.join() {
                        log_error!("{} thread panicked: {panic:?}", self.name);
                    }
                }
                log_info!("{} thread joined", self.name);
                JoinOutcome::Finished
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn stop_then_join_finishes() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let worker = {
            let ticks = Arc::clone(&ticks);
            BackgroundWorker::spawn("test-loop", CancellationToken::new(), move |token| {
                while !token.is_cancelled() {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap()
        };

        worker.request_stop();
        assert_eq!(worker.join(Duration::from_secs(5)), JoinOutcome::Finished);
        assert_eq!(worker.join(Duration::from_secs(5)), JoinOutcome::AlreadyJoined);
        assert!(worker.is_finished());
    }

    #[test]
    fn join_is_bounded_for_stuck_threads() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let worker = BackgroundWorker::spawn("stuck", CancellationToken::new(), move |_| {
            let _ = release_rx.recv();
        })
        .unwrap();

        worker.request_stop();
        assert_eq!(worker.join(Duration::from_millis(20)), JoinOutcome::TimedOut);

        release_tx.send(()).unwrap();
        assert_eq!(worker.join(Duration::from_secs(5)), JoinOutcome::Finished);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sleep_wakes_on_cancel() {
        let runtime = Handle::current();
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || sleep_or_cancel(&runtime, &token, Duration::from_secs(60)))
        };

        token.cancel();
        let woke_by_cancel = tokio::task::spawn_blocking(move || sleeper.join().unwrap())
            .await
            .unwrap();
        assert!(woke_by_cancel);
    }
}
