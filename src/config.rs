//! Application-wide constants and runtime configuration.
//!
//! All pin assignments, timing parameters, capacities and topic names live
//! here so they can be tuned in one place.

// Buttons

/// Button debounce window (ms). Edges closer than this to the previously
/// accepted edge on the same input are discarded.
pub const BUTTON_DEBOUNCE_MS: u64 = 20;

/// Hold time after which a press counts as a long press (ms).
pub const LONG_PRESS_MS: u64 = 1000;

/// Number of general-purpose buttons.
pub const NUM_BUTTONS: usize = 4;

// Queues

/// Capacity of the pending-event queue shared by interrupts, the
/// Bluetooth stack and the dispatcher.
pub const EVENT_QUEUE_LEN: usize = 10;

/// Capacity of the Bluetooth stack notification queue.
pub const STACK_QUEUE_LEN: usize = 8;

/// Capacity of the remote command queue.
pub const COMMAND_QUEUE_LEN: usize = 4;

// Paired-device registry

/// Maximum number of registry slots (live records plus holes).
pub const MAX_PAIRED_DEVICES: usize = 8;

/// Device name capacity in bytes.
pub const DEVICE_NAME_LEN: usize = 32;

/// Flash page index where registry storage starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for registry storage.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

// Bluetooth

/// Inquiry duration for pairing discovery (seconds).
pub const DISCOVERY_DURATION_SECS: u8 = 10;

/// Pause before moving on to the next registered device after a failed
/// service search during periodic connect (ms).
pub const SERVICE_RETRY_DELAY_MS: u32 = 10;

/// Delay between a companion link opening and the indicator switching on (ms).
pub const CONNECT_SETTLE_DELAY_MS: u32 = 500;

/// Serial channel used when connecting to a registered device directly.
pub const DEFAULT_SERIAL_CHANNEL: u8 = 8;

/// Service name the companion app advertises for its serial channel.
pub const SERIAL_SERVICE_NAME: &str = "BT_DOOR_KEY";

/// Maximum number of serial channels reported by one service search.
pub const MAX_SERVICE_CHANNELS: usize = 4;

/// Largest payload accepted by a single link write.
pub const MAX_WRITE_LEN: usize = 64;

// Remote commands / status

/// Prefix of inbound command topics.
pub const COMMAND_TOPIC_PREFIX: &str = "cmd/bt_door_key/";

/// Prefix of outbound status topics.
pub const STATUS_TOPIC_PREFIX: &str = "stat/bt_door_key/";

/// Payload published when no companion is connected.
pub const STATUS_DISCONNECTED: &str = "disconnected";

// GPIO pin assignments (nRF52840-DK defaults)
//
// The actual `embassy_nrf::peripherals::*` are selected in `main.rs`.
//
//   Button 1..4        → P0.11, P0.12, P0.24, P0.25 (active-low, pull-up)
//   Network switch     → P0.03 (high = start network)
//   Connection switch  → P0.04 (high = start periodic connect)
//   Link indicator     → P0.13 (LED1, active-low)

/// Runtime configuration handed to the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub discovery_secs: u8,
    pub service_retry_delay_ms: u32,
    pub connect_settle_delay_ms: u32,
    pub default_channel: u8,
    /// Name matched against the service list during channel discovery.
    pub service_name: &'static str,
    /// Whether status publication is enabled before the first `StartWifi`.
    pub publish_on_boot: bool,
    /// Level that lights the link indicator.
    pub indicator_active_high: bool,
    /// Post `StartConnection` after start-up when devices are registered.
    pub connect_on_boot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce_ms: BUTTON_DEBOUNCE_MS,
            long_press_ms: LONG_PRESS_MS,
            discovery_secs: DISCOVERY_DURATION_SECS,
            service_retry_delay_ms: SERVICE_RETRY_DELAY_MS,
            connect_settle_delay_ms: CONNECT_SETTLE_DELAY_MS,
            default_channel: DEFAULT_SERIAL_CHANNEL,
            service_name: SERIAL_SERVICE_NAME,
            publish_on_boot: false,
            indicator_active_high: true,
            connect_on_boot: false,
        }
    }
}
