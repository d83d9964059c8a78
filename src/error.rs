//! Unified error type for bt-door-key.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

use core::fmt;

/// Top-level error type used across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Registry
    /// Persisted state could not be read or written.
    Storage(StorageError),

    /// Lookup or deletion miss.
    NotFound,

    /// A record for this address already exists.
    AlreadyRegistered,

    /// Every registry slot is in use.
    RegistryFull,

    // Bluetooth
    /// The Bluetooth transport refused or failed an operation.
    Transport(TransportError),

    /// A notification arrived that does not fit the current state.
    ProtocolViolation(&'static str),

    /// A discovery session is already in progress.
    DiscoveryBusy,

    /// A companion link is already open.
    AlreadyConnected,

    /// No companion link is open.
    NotConnected,

    // Generic
    /// A bounded queue was full and the item was dropped.
    QueueFull,
}

/// Storage-layer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// Flash read/write/erase failed.
    Io,
    /// Stored value does not fit the caller's buffer.
    BufferTooSmall,
    /// Stored value has the wrong shape (length, encoding).
    Corrupted,
}

/// Subset of transport errors we propagate (keeps the enum `Copy`-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The stack cannot accept another request right now.
    Busy,
    /// The request was refused (unknown handle, invalid state).
    Rejected,
    /// Raw status code reported by the stack.
    Status(u16),
}

// Convenience conversions

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Storage(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Storage(e) => write!(f, "storage error: {:?}", e),
            Error::NotFound => f.write_str("not found"),
            Error::AlreadyRegistered => f.write_str("device already registered"),
            Error::RegistryFull => f.write_str("registry full"),
            Error::Transport(e) => write!(f, "transport error: {:?}", e),
            Error::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Error::DiscoveryBusy => f.write_str("discovery already in progress"),
            Error::AlreadyConnected => f.write_str("already connected"),
            Error::NotConnected => f.write_str("not connected"),
            Error::QueueFull => f.write_str("queue full"),
        }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
