use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{PointerButton, PointerEvent, PointerEventKind},
    error::CaptureError,
    utils::clock::MonotonicClock,
};

use super::{BackgroundWorker, EventSink, PipelineHealth, SourceKind, SourceStatus, TaskTag};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Upper bound on how long a stop request can go unnoticed.
const DEVICE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// One notification from the input device, in logical canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawPointerInput {
    Move {
        x: f64,
        y: f64,
    },
    Button {
        x: f64,
        y: f64,
        button: PointerButton,
        pressed: bool,
    },
    Scroll {
        x: f64,
        y: f64,
        dx: f64,
        dy: f64,
    },
}

impl RawPointerInput {
    /// False when any coordinate or scroll delta is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match *self {
            RawPointerInput::Move { x, y } | RawPointerInput::Button { x, y, .. } => {
                x.is_finite() && y.is_finite()
            }
            RawPointerInput::Scroll { x, y, dx, dy } => {
                x.is_finite() && y.is_finite() && dx.is_finite() && dy.is_finite()
            }
        }
    }
}

/// Pointer input device.
pub trait PointerDevice: Send + 'static {
    /// Fails when no device is present.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Waits up to `timeout` for the next input; `Ok(None)` when nothing
    /// arrived. An error means the device is gone.
    fn next_input(&mut self, timeout: Duration) -> Result<Option<RawPointerInput>>;
}

/// Distance throttle for move samples.
///
/// A move passes only if it lies strictly farther than `threshold` from the
/// last *emitted* move; the first move always passes.
#[derive(Debug, Clone)]
pub struct MoveThrottle {
    threshold: f64,
    last_emitted: Option<(f64, f64)>,
}

impl MoveThrottle {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.max(0.0),
            last_emitted: None,
        }
    }

    pub fn admit(&mut self, x: f64, y: f64) -> bool {
        let pass = match self.last_emitted {
            None => true,
            Some((last_x, last_y)) => (x - last_x).hypot(y - last_y) > self.threshold,
        };
        if pass {
            self.last_emitted = Some((x, y));
        }
        pass
    }
}

/// Turns raw device input into session-stamped pointer events.
pub struct PointerEventSource {
    session_id: i64,
    throttle: MoveThrottle,
    task_tag: TaskTag,
    clock: MonotonicClock,
    sink: Arc<dyn EventSink<PointerEvent>>,
    health: PipelineHealth,
    emitted: u64,
    rejected: u64,
}

impl PointerEventSource {
    pub fn new(
        session_id: i64,
        movement_threshold: f64,
        task_tag: TaskTag,
        clock: MonotonicClock,
        sink: Arc<dyn EventSink<PointerEvent>>,
        health: PipelineHealth,
    ) -> Self {
        Self {
            session_id,
            throttle: MoveThrottle::new(movement_threshold),
            task_tag,
            clock,
            sink,
            health,
            emitted: 0,
            rejected: 0,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Builds the event for one input, or `None` when a move is throttled
    /// or the input carries a non-finite value.
    pub fn build_event(
        &mut self,
        input: RawPointerInput,
        timestamp: DateTime<Utc>,
    ) -> Option<PointerEvent> {
        if !input.is_finite() {
            return None;
        }

        let mut event = PointerEvent {
            session_id: self.session_id,
            timestamp,
            kind: PointerEventKind::Move,
            x: 0.0,
            y: 0.0,
            button: None,
            pressed: None,
            scroll_dx: None,
            scroll_dy: None,
            task_tag: self.task_tag.get(),
        };

        match input {
            RawPointerInput::Move { x, y } => {
                if !self.throttle.admit(x, y) {
                    return None;
                }
                event.x = x;
                event.y = y;
            }
            RawPointerInput::Button {
                x,
                y,
                button,
                pressed,
            } => {
                event.kind = PointerEventKind::Click;
                event.x = x;
                event.y = y;
                event.button = Some(button);
                event.pressed = Some(pressed);
            }
            RawPointerInput::Scroll { x, y, dx, dy } => {
                event.kind = PointerEventKind::Scroll;
                event.x = x;
                event.y = y;
                event.scroll_dx = Some(dx);
                event.scroll_dy = Some(dy);
            }
        }
        Some(event)
    }

    /// Stamps, throttles and emits one input. Inputs with non-finite values
    /// are counted in the pipeline health and never reach the sink.
    pub fn process(&mut self, input: RawPointerInput) {
        if !input.is_finite() {
            self.rejected += 1;
            self.health.record_invalid_sample();
            if self.rejected == 1 {
                log_warn!("discarding pointer input with non-finite values: {input:?}");
            }
            return;
        }
        let timestamp = self.clock.now();
        if let Some(event) = self.build_event(input, timestamp) {
            self.emitted += 1;
            self.sink.accept(event);
        }
    }

    /// Opens `device` and starts the listener thread. A device that cannot be
    /// opened is reported as unavailable and no thread is started.
    pub fn spawn(
        mut self,
        mut device: Box<dyn PointerDevice>,
        cancel: CancellationToken,
    ) -> Result<BackgroundWorker> {
        let health = self.health.clone();
        if let Err(err) = device.open() {
            let err = CaptureError::unavailable(SourceKind::Pointer, format!("{err:#}"));
            health.set_status(SourceKind::Pointer, SourceStatus::Disabled(err.to_string()));
            return Err(err.into());
        }
        health.set_status(SourceKind::Pointer, SourceStatus::Running);

        BackgroundWorker::spawn("pointer-source", cancel, move |token| {
            while !token.is_cancelled() {
                match device.next_input(DEVICE_POLL_TIMEOUT) {
                    Ok(Some(input)) => self.process(input),
                    Ok(None) => {}
                    Err(err) => {
                        let err = CaptureError::disconnected(SourceKind::Pointer, format!("{err:#}"));
                        log_warn!("pointer listener ending: {err}");
                        health.set_status(SourceKind::Pointer, SourceStatus::Failed(err.to_string()));
                        break;
                    }
                }
            }
            log_info!(
                "pointer listener stopped after {} events ({} invalid inputs discarded)",
                self.emitted,
                self.rejected
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::sync::Mutex;

    fn collecting_source(threshold: f64) -> (PointerEventSource, Arc<Mutex<Vec<PointerEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = Arc::clone(&events);
            Arc::new(move |event: PointerEvent| events.lock().unwrap().push(event))
        };
        let source = PointerEventSource::new(
            1,
            threshold,
            TaskTag::new(),
            MonotonicClock::new(),
            sink,
            PipelineHealth::new(),
        );
        (source, events)
    }

    #[test]
    fn exact_duplicate_moves_are_suppressed() {
        let (mut source, events) = collecting_source(5.0);
        source.process(RawPointerInput::Move { x: 100.0, y: 100.0 });
        source.process(RawPointerInput::Move { x: 100.0, y: 100.0 });
        source.process(RawPointerInput::Move { x: 980.0, y: 540.0 });

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].position(), (980.0, 540.0));
    }

    #[test]
    fn distance_equal_to_threshold_is_throttled() {
        let mut throttle = MoveThrottle::new(5.0);
        assert!(throttle.admit(0.0, 0.0));
        assert!(!throttle.admit(3.0, 4.0));
        assert!(throttle.admit(3.0, 4.1));
    }

    #[test]
    fn emitted_moves_are_never_within_threshold() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut throttle = MoveThrottle::new(5.0);
        let mut emitted = Vec::new();
        let (mut x, mut y) = (500.0_f64, 500.0_f64);
        for _ in 0..5_000 {
            x += rng.gen_range(-4.0..4.0);
            y += rng.gen_range(-4.0..4.0);
            if throttle.admit(x, y) {
                emitted.push((x, y));
            }
        }

        assert!(emitted.len() > 1);
        for pair in emitted.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!((b.0 - a.0).hypot(b.1 - a.1) > 5.0);
        }
    }

    #[test]
    fn clicks_and_scrolls_bypass_the_throttle() {
        let (mut source, events) = collecting_source(5.0);
        source.process(RawPointerInput::Move { x: 10.0, y: 10.0 });
        for pressed in [true, false] {
            source.process(RawPointerInput::Button {
                x: 10.0,
                y: 10.0,
                button: PointerButton::Left,
                pressed,
            });
        }
        source.process(RawPointerInput::Scroll {
            x: 10.0,
            y: 10.0,
            dx: 0.0,
            dy: -3.0,
        });

        let kinds: Vec<_> = events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PointerEventKind::Move,
                PointerEventKind::Click,
                PointerEventKind::Click,
                PointerEventKind::Scroll
            ]
        );
    }

    #[test]
    fn events_carry_current_task_tag() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let tag = TaskTag::new();
        let mut source = PointerEventSource::new(
            1,
            5.0,
            tag.clone(),
            MonotonicClock::new(),
            {
                let events = Arc::clone(&events);
                Arc::new(move |event: PointerEvent| events.lock().unwrap().push(event))
            },
            PipelineHealth::new(),
        );

        source.process(RawPointerInput::Move { x: 0.0, y: 0.0 });
        tag.set(Some("login".into()));
        source.process(RawPointerInput::Move { x: 50.0, y: 0.0 });

        let events = events.lock().unwrap();
        assert_eq!(events[0].task_tag, None);
        assert_eq!(events[1].task_tag.as_deref(), Some("login"));
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[test]
    fn non_finite_inputs_never_reach_the_sink() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let health = PipelineHealth::new();
        let mut source = PointerEventSource::new(
            1,
            5.0,
            TaskTag::new(),
            MonotonicClock::new(),
            {
                let events = Arc::clone(&events);
                Arc::new(move |event: PointerEvent| events.lock().unwrap().push(event))
            },
            health.clone(),
        );

        source.process(RawPointerInput::Move { x: 10.0, y: 10.0 });
        source.process(RawPointerInput::Move { x: f64::NAN, y: 40.0 });
        source.process(RawPointerInput::Button {
            x: f64::INFINITY,
            y: 0.0,
            button: PointerButton::Left,
            pressed: true,
        });
        source.process(RawPointerInput::Scroll {
            x: 10.0,
            y: 10.0,
            dx: 0.0,
            dy: f64::NAN,
        });
        source.process(RawPointerInput::Move { x: 60.0, y: 10.0 });

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.x.is_finite() && e.y.is_finite()));
        assert_eq!(events[1].position(), (60.0, 10.0));
        assert_eq!(source.emitted(), 2);
        assert_eq!(health.report().invalid_samples, 3);
        assert!(!health.is_halted());
    }
}
