//! Debounced button classification.
//!
//! Pure edge logic, driven by timestamps, so it runs the same from a GPIO
//! interrupt task on target and from host tests:
//!
//! - [`EdgeDetector`] turns press/release edges of a general-purpose button
//!   into `ShortPress` / `LongPress` events.
//! - [`SwitchInput`] maps a dedicated single-function pin straight onto a
//!   start/stop event pair.
//!
//! Buttons are active-low: a falling edge is a press, a rising edge a release.

use crate::config::{Config, BUTTON_DEBOUNCE_MS, LONG_PRESS_MS};
use crate::event::{ButtonId, EventSender, PendingEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Falling,
    Rising,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    pub debounce_ms: u64,
    pub long_press_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            debounce_ms: BUTTON_DEBOUNCE_MS,
            long_press_ms: LONG_PRESS_MS,
        }
    }
}

impl From<&Config> for Timing {
    fn from(config: &Config) -> Self {
        Self {
            debounce_ms: config.debounce_ms,
            long_press_ms: config.long_press_ms,
        }
    }
}

/// Per-button state, owned by its detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ButtonState {
    pub is_pressed: bool,
    pub press_started_at: u64,
    pub long_press_fired: bool,
}

/// What the caller should do after feeding an edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeAction {
    /// Edge fell inside the debounce window.
    Discarded,
    /// Press accepted; call [`EdgeDetector::on_long_press_timer`] at `deadline_ms`.
    ArmLongPress { deadline_ms: u64 },
    /// Release accepted and classified.
    Emit(PendingEvent),
    /// Accepted, nothing to report.
    Nothing,
}

pub struct EdgeDetector {
    id: ButtonId,
    timing: Timing,
    state: ButtonState,
    last_edge_at: Option<u64>,
}

impl EdgeDetector {
    pub const fn new(id: ButtonId, timing: Timing) -> Self {
        Self {
            id,
            timing,
            state: ButtonState {
                is_pressed: false,
                press_started_at: 0,
                long_press_fired: false,
            },
            last_edge_at: None,
        }
    }

    pub fn id(&self) -> ButtonId {
        self.id
    }

    pub fn state(&self) -> ButtonState {
        self.state
    }

    pub fn on_edge(&mut self, edge: Edge, now_ms: u64) -> EdgeAction {
        if let Some(last) = self.last_edge_at {
            if now_ms.saturating_sub(last) < self.timing.debounce_ms {
                return EdgeAction::Discarded;
            }
        }
        self.last_edge_at = Some(now_ms);

        match edge {
            Edge::Falling => {
                self.state = ButtonState {
                    is_pressed: true,
                    press_started_at: now_ms,
                    long_press_fired: false,
                };
                EdgeAction::ArmLongPress {
                    deadline_ms: now_ms + self.timing.long_press_ms,
                }
            }
            Edge::Rising => {
                if !self.state.is_pressed {
                    return EdgeAction::Nothing;
                }
                self.state.is_pressed = false;
                let held = now_ms.saturating_sub(self.state.press_started_at);
                // A release at or past the threshold whose timer was not seen
                // yet still counts as long.
                if self.state.long_press_fired || held >= self.timing.long_press_ms {
                    EdgeAction::Emit(PendingEvent::LongPress(self.id))
                } else {
                    EdgeAction::Emit(PendingEvent::ShortPress(self.id))
                }
            }
        }
    }

    /// Long-press timer expiry. Returns `true` when it marked the current
    /// press as long. Stale timers from an earlier press are ignored.
    pub fn on_long_press_timer(&mut self, now_ms: u64, still_pressed: bool) -> bool {
        let due = now_ms.saturating_sub(self.state.press_started_at) >= self.timing.long_press_ms;
        if self.state.is_pressed && still_pressed && due && !self.state.long_press_fired {
            self.state.long_press_fired = true;
            return true;
        }
        false
    }

    /// Feed an edge and post any resulting event with the interrupt-safe
    /// enqueue.
    pub fn handle_edge(&mut self, edge: Edge, now_ms: u64, events: &EventSender<'_>) -> EdgeAction {
        let action = self.on_edge(edge, now_ms);
        if let EdgeAction::Emit(event) = action {
            events.post_from_isr(event);
        }
        action
    }
}

/// Dedicated single-function input: rising edge starts, falling edge stops.
pub struct SwitchInput {
    on_rise: PendingEvent,
    on_fall: PendingEvent,
    debounce_ms: u64,
    last_edge: Option<(Edge, u64)>,
}

impl SwitchInput {
    pub const fn new(on_rise: PendingEvent, on_fall: PendingEvent, debounce_ms: u64) -> Self {
        Self {
            on_rise,
            on_fall,
            debounce_ms,
            last_edge: None,
        }
    }

    pub fn on_edge(&mut self, edge: Edge, now_ms: u64) -> Option<PendingEvent> {
        if let Some((last, at)) = self.last_edge {
            if now_ms.saturating_sub(at) < self.debounce_ms || last == edge {
                return None;
            }
        }
        self.last_edge = Some((edge, now_ms));
        Some(match edge {
            Edge::Rising => self.on_rise,
            Edge::Falling => self.on_fall,
        })
    }

    pub fn handle_edge(
        &mut self,
        edge: Edge,
        now_ms: u64,
        events: &EventSender<'_>,
    ) -> Option<PendingEvent> {
        let event = self.on_edge(edge, now_ms)?;
        events.post_from_isr(event);
        Some(event)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
