//! Pending events and the queues that carry them to the manager.
//!
//! Three producers feed the single consumer loop:
//!   - GPIO edge handlers and remote commands post [`PendingEvent`]s,
//!   - the Bluetooth stack posts [`StackEvent`]s,
//!   - the network client posts [`RemoteCommand`]s.
//!
//! Every producer-side operation is a non-blocking `try_send`; a full queue
//! drops the item and bumps a counter.

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};

use crate::bt::StackEvent;
use crate::config::{COMMAND_QUEUE_LEN, EVENT_QUEUE_LEN, STACK_QUEUE_LEN};
use crate::error::{Error, Result};
use crate::remote::RemoteCommand;

/// Index of a general-purpose button.
pub type ButtonId = u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PressKind {
    Short,
    Long,
}

/// Work item for the dispatcher. Consumed exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PendingEvent {
    StartWifi,
    StopWifi,
    PhoneConnected,
    PhoneDisconnected,
    StartConnection,
    StopConnection,
    ShortPress(ButtonId),
    LongPress(ButtonId),
}

impl PendingEvent {
    pub const fn press(button: ButtonId, kind: PressKind) -> Self {
        match kind {
            PressKind::Short => PendingEvent::ShortPress(button),
            PressKind::Long => PendingEvent::LongPress(button),
        }
    }
}

pub type EventChannel = Channel<CriticalSectionRawMutex, PendingEvent, EVENT_QUEUE_LEN>;
pub type StackChannel = Channel<CriticalSectionRawMutex, StackEvent, STACK_QUEUE_LEN>;
pub type CommandChannel = Channel<CriticalSectionRawMutex, RemoteCommand, COMMAND_QUEUE_LEN>;

/// All queues feeding the manager. Usually lives in a `static`.
pub struct Queues {
    pub(crate) events: EventChannel,
    pub(crate) stack: StackChannel,
    pub(crate) commands: CommandChannel,
    dropped_events: AtomicU32,
    dropped_stack: AtomicU32,
}

impl Queues {
    pub const fn new() -> Self {
        Self {
            events: Channel::new(),
            stack: Channel::new(),
            commands: Channel::new(),
            dropped_events: AtomicU32::new(0),
            dropped_stack: AtomicU32::new(0),
        }
    }

    pub fn events(&self) -> EventSender<'_> {
        EventSender { queues: self }
    }

    pub fn stack(&self) -> StackSender<'_> {
        StackSender { queues: self }
    }

    pub fn commands(&self) -> CommandSender<'_> {
        CommandSender { queues: self }
    }

    /// Pending events lost to a full queue since boot.
    pub fn dropped_events(&self) -> u32 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Stack notifications lost to a full queue since boot.
    pub fn dropped_stack_events(&self) -> u32 {
        self.dropped_stack.load(Ordering::Relaxed)
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle for [`PendingEvent`]s.
#[derive(Clone, Copy)]
pub struct EventSender<'q> {
    queues: &'q Queues,
}

impl EventSender<'_> {
    /// Enqueue from task context. A full queue drops the event with a warning.
    pub fn post(&self, event: PendingEvent) -> bool {
        match self.queues.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.queues.dropped_events.fetch_add(1, Ordering::Relaxed);
                warn!("event queue full, dropping {}", event);
                false
            }
        }
    }

    /// Enqueue from interrupt context. Never blocks and never logs.
    pub fn post_from_isr(&self, event: PendingEvent) -> bool {
        match self.queues.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.queues.dropped_events.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Producer handle for Bluetooth stack notifications.
#[derive(Clone, Copy)]
pub struct StackSender<'q> {
    queues: &'q Queues,
}

impl StackSender<'_> {
    pub fn post(&self, event: StackEvent) -> bool {
        match self.queues.stack.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.queues.dropped_stack.fetch_add(1, Ordering::Relaxed);
                warn!("stack queue full, dropping notification");
                false
            }
        }
    }
}

/// Producer handle for remote commands.
#[derive(Clone, Copy)]
pub struct CommandSender<'q> {
    queues: &'q Queues,
}

impl CommandSender<'_> {
    pub fn post(&self, command: RemoteCommand) -> Result<()> {
        self.queues.commands.try_send(command).map_err(|_| {
            warn!("command queue full, dropping command");
            Error::QueueFull
        })
    }

    /// Parse an inbound `(topic, payload)` message and enqueue it.
    pub fn post_message(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let command = RemoteCommand::parse(topic, payload).map_err(|e| {
            warn!("ignoring remote message: {}", e);
            e
        })?;
        self.post(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn press_constructor_maps_kind() {
        assert_eq!(
            PendingEvent::press(2, PressKind::Short),
            PendingEvent::ShortPress(2)
        );
        assert_eq!(
            PendingEvent::press(3, PressKind::Long),
            PendingEvent::LongPress(3)
        );
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let queues = Queues::new();
        let events = queues.events();
        for _ in 0..EVENT_QUEUE_LEN {
            assert!(events.post(PendingEvent::StartWifi));
        }
        assert!(!events.post(PendingEvent::StopWifi));
        assert!(!events.post_from_isr(PendingEvent::StopWifi));
        assert_eq!(queues.dropped_events(), 2);
    }

    #[test]
    fn events_come_out_in_order() {
        let queues = Queues::new();
        queues.events().post(PendingEvent::StartConnection);
        queues.events().post_from_isr(PendingEvent::ShortPress(1));
        assert_eq!(queues.events.try_receive(), Ok(PendingEvent::StartConnection));
        assert_eq!(queues.events.try_receive(), Ok(PendingEvent::ShortPress(1)));
        assert!(queues.events.try_receive().is_err());
    }

    #[test]
    fn malformed_remote_message_is_rejected() {
        let queues = Queues::new();
        assert!(queues
            .commands()
            .post_message("cmd/bt_door_key/launch_rockets", b"")
            .is_err());
        assert!(queues.commands.try_receive().is_err());
    }
}
