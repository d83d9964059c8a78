//! Connection-management core of the bt-door-key controller.
//!
//! Everything here is hardware-independent and runs on the host:
//!
//! - [`registry`] - persisted list of trusted phones,
//! - [`input`] - debounced short/long press classification,
//! - [`bt::pairing`] - discovery & pairing state machine,
//! - [`bt::supervisor`] - the single companion link and periodic connect,
//! - [`manager`] - the event dispatcher that owns all of the above.
//!
//! Bluetooth, storage, GPIO and status publication are reached through
//! traits; the firmware binary (`src/main.rs`, feature `embedded`) supplies
//! the nRF52840 implementations in `hw/`.
//!
//! Usage: `cargo test` on the host, `cargo run --release --features embedded`
//! with a probe attached.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible in every module.
#[macro_use]
mod fmt;

pub mod bt;
pub mod config;
pub mod error;
pub mod event;
pub mod input;
pub mod manager;
pub mod registry;
pub mod remote;
pub mod storage;

pub use bt::{BdAddr, BtTransport, StackEvent};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{PendingEvent, Queues};
pub use manager::{Board, Manager, Parts, Platform};
pub use registry::Registry;
pub use remote::{RemoteCommand, StatusPublisher};
pub use storage::{KeyValueStore, MemoryStore};
