use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::db::{PointerButton, PointerEvent, PointerEventKind, TriggerKind};

/// A decision to capture a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub timestamp: DateTime<Utc>,
    pub x: f64,
    pub y: f64,
    pub button: Option<PointerButton>,
    /// Accumulated `|dx|+|dy|` for scroll triggers.
    pub magnitude: Option<f64>,
    pub task_tag: Option<String>,
}

impl Trigger {
    pub fn metadata(&self) -> serde_json::Value {
        match self.kind {
            TriggerKind::Click => json!({
                "button": self.button.map(|button| button.as_str()),
            }),
            TriggerKind::Scroll => json!({
                "scroll_magnitude": self.magnitude,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Cooldown,
}

struct GateInner {
    last_fired: Option<DateTime<Utc>>,
    scroll_accumulator: f64,
}

/// Debounce state machine deciding when a pointer event warrants a capture.
///
/// Clicks fire immediately; scroll deltas accumulate until they reach the
/// threshold. Anything arriving within `cooldown` of the last fired trigger
/// is dropped. Timing is taken from the events themselves, so identical
/// input always yields identical decisions.
pub struct TriggerGate {
    scroll_threshold: f64,
    cooldown: Duration,
    inner: Mutex<GateInner>,
}

impl TriggerGate {
    pub fn new(scroll_threshold: f64, cooldown: Duration) -> Self {
        Self {
            scroll_threshold,
            cooldown,
            inner: Mutex::new(GateInner {
                last_fired: None,
                scroll_accumulator: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> GateState {
        let inner = self.lock();
        if Self::cooling(&inner, self.cooldown, now) {
            GateState::Cooldown
        } else {
            GateState::Idle
        }
    }

    pub fn scroll_accumulator(&self) -> f64 {
        self.lock().scroll_accumulator
    }

    fn cooling(inner: &GateInner, cooldown: Duration, now: DateTime<Utc>) -> bool {
        match inner.last_fired {
            None => false,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed < cooldown,
                // Earlier than the last fire: still inside the window.
                Err(_) => true,
            },
        }
    }

    /// Fires unless cooling down. Caller holds the lock.
    fn try_fire(&self, inner: &mut GateInner, now: DateTime<Utc>) -> bool {
        if Self::cooling(inner, self.cooldown, now) {
            return false;
        }
        inner.last_fired = Some(now);
        true
    }

    /// Feeds one pointer event. Only presses and scrolls can fire.
    pub fn on_event(&self, event: &PointerEvent) -> Option<Trigger> {
        match event.kind {
            PointerEventKind::Click if event.is_press() => {
                if !self.on_click(event.timestamp) {
                    return None;
                }
                Some(Trigger {
                    kind: TriggerKind::Click,
                    timestamp: event.timestamp,
                    x: event.x,
                    y: event.y,
                    button: event.button,
                    magnitude: None,
                    task_tag: event.task_tag.clone(),
                })
            }
            PointerEventKind::Scroll => {
                let dx = event.scroll_dx.unwrap_or(0.0);
                let dy = event.scroll_dy.unwrap_or(0.0);
                let magnitude = self.on_scroll(dx, dy, event.timestamp)?;
                Some(Trigger {
                    kind: TriggerKind::Scroll,
                    timestamp: event.timestamp,
                    x: event.x,
                    y: event.y,
                    button: None,
                    magnitude: Some(magnitude),
                    task_tag: event.task_tag.clone(),
                })
            }
            _ => None,
        }
    }

    /// Returns true when the click fires a trigger.
    pub fn on_click(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        self.try_fire(&mut inner, now)
    }

    /// Adds a scroll delta. Returns the accumulated magnitude when it fires.
    ///
    /// The accumulator resets whenever it crosses the threshold, even if the
    /// resulting trigger is then dropped by cooldown.
    pub fn on_scroll(&self, dx: f64, dy: f64, now: DateTime<Utc>) -> Option<f64> {
        let mut inner = self.lock();
        let delta = dx.abs() + dy.abs();
        if delta.is_finite() {
            inner.scroll_accumulator += delta;
        }
        if inner.scroll_accumulator < self.scroll_threshold {
            return None;
        }

        let magnitude = inner.scroll_accumulator;
        inner.scroll_accumulator = 0.0;
        self.try_fire(&mut inner, now).then_some(magnitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::{sync::Arc, thread};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
    }

    fn gate() -> TriggerGate {
        TriggerGate::new(100.0, Duration::from_millis(500))
    }

    #[test]
    fn scroll_reaching_threshold_fires_once_and_resets() {
        let gate = gate();
        assert_eq!(gate.on_scroll(0.0, 60.0, at(0)), None);
        assert_eq!(gate.on_scroll(-40.0, 0.0, at(10)), Some(100.0));
        assert_eq!(gate.scroll_accumulator(), 0.0);
    }

    #[test]
    fn scroll_one_short_of_threshold_never_fires() {
        let gate = gate();
        assert_eq!(gate.on_scroll(50.0, 0.0, at(0)), None);
        assert_eq!(gate.on_scroll(0.0, 49.0, at(10)), None);
        assert_eq!(gate.scroll_accumulator(), 99.0);
    }

    #[test]
    fn clicks_inside_cooldown_are_dropped() {
        let gate = gate();
        assert!(gate.on_click(at(0)));
        assert_eq!(gate.state_at(at(100)), GateState::Cooldown);
        assert!(!gate.on_click(at(499)));
        assert!(gate.on_click(at(501)));
    }

    #[test]
    fn click_exactly_at_cooldown_is_accepted() {
        let gate = gate();
        assert!(gate.on_click(at(0)));
        assert_eq!(gate.state_at(at(500)), GateState::Idle);
        assert!(gate.on_click(at(500)));
    }

    #[test]
    fn scroll_crossing_during_cooldown_still_resets() {
        let gate = gate();
        assert!(gate.on_click(at(0)));
        assert_eq!(gate.on_scroll(120.0, 0.0, at(100)), None);
        assert_eq!(gate.scroll_accumulator(), 0.0);
    }

    #[test]
    fn releases_and_moves_do_not_fire() {
        let gate = gate();
        let mut release = PointerEvent {
            session_id: 1,
            timestamp: at(0),
            kind: PointerEventKind::Click,
            x: 5.0,
            y: 6.0,
            button: Some(PointerButton::Left),
            pressed: Some(false),
            scroll_dx: None,
            scroll_dy: None,
            task_tag: None,
        };
        assert!(gate.on_event(&release).is_none());

        release.kind = PointerEventKind::Move;
        assert!(gate.on_event(&release).is_none());

        release.kind = PointerEventKind::Click;
        release.pressed = Some(true);
        let trigger = gate.on_event(&release).expect("press fires");
        assert_eq!((trigger.x, trigger.y), (5.0, 6.0));
        assert_eq!(trigger.metadata()["button"], "left");
    }

    #[test]
    fn concurrent_clicks_fire_once_per_cooldown() {
        let gate = Arc::new(gate());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.on_click(at(0)))
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|fired| *fired)
            .count();
        assert_eq!(fired, 1);
    }
}
