//! GPIO input tasks.
//!
//! Four general-purpose buttons (active-low with internal pull-up) and two
//! dedicated switches. Each pin gets its own task that waits for an edge and
//! feeds the pure classifiers in `bt_door_key::input`; events reach the
//! manager through the interrupt-safe enqueue.

use bt_door_key::event::{ButtonId, EventSender};
use bt_door_key::input::{Edge, EdgeAction, EdgeDetector, SwitchInput, Timing};
use defmt::{debug, info};
use embassy_futures::select::{select, Either};
use embassy_nrf::gpio::{AnyPin, Input, Pull};
use embassy_time::{Instant, Timer};

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

#[embassy_executor::task(pool_size = bt_door_key::config::NUM_BUTTONS)]
pub async fn button_task(pin: AnyPin, id: ButtonId, timing: Timing, events: EventSender<'static>) -> ! {
    let mut btn = Input::new(pin, Pull::Up);
    let mut detector = EdgeDetector::new(id, timing);
    let mut long_press_at: Option<u64> = None;

    loop {
        if let Some(deadline) = long_press_at {
            let timer = Timer::at(Instant::from_millis(deadline));
            if let Either::Second(()) = select(btn.wait_for_any_edge(), timer).await {
                long_press_at = None;
                if detector.on_long_press_timer(now_ms(), btn.is_low()) {
                    debug!("button {}: long press threshold reached", id);
                }
                continue;
            }
        } else {
            btn.wait_for_any_edge().await;
        }

        let edge = if btn.is_low() { Edge::Falling } else { Edge::Rising };
        match detector.handle_edge(edge, now_ms(), &events) {
            EdgeAction::ArmLongPress { deadline_ms } => long_press_at = Some(deadline_ms),
            EdgeAction::Emit(event) => {
                long_press_at = None;
                info!("button {}: {}", id, event);
            }
            EdgeAction::Discarded | EdgeAction::Nothing => {}
        }
    }
}

/// Dedicated switch; high level means "start".
#[embassy_executor::task(pool_size = 2)]
pub async fn switch_task(pin: AnyPin, mut switch: SwitchInput, events: EventSender<'static>) -> ! {
    let mut input = Input::new(pin, Pull::Down);

    loop {
        input.wait_for_any_edge().await;
        let edge = if input.is_high() { Edge::Rising } else { Edge::Falling };
        if let Some(event) = switch.handle_edge(edge, now_ms(), &events) {
            info!("switch: {}", event);
        }
    }
}
