//! Remote command channel and status publication.
//!
//! Inbound messages arrive as `(topic, payload)` pairs under
//! `cmd/bt_door_key/<command>`; results go out retained under
//! `stat/bt_door_key/<command>`.
//!
//! | command          | payload                          |
//! |------------------|----------------------------------|
//! | `delete_paired`  | `all`, an address, or a name     |
//! | `reset_device`   | ignored                          |
//! | `stop_discovery` | ignored                          |
//! | `connect`        | empty, or a registry index       |
//! | `disconnect`     | ignored                          |
//! | `pairing`        | `start`/`on` or `stop`/`off`     |

use core::fmt::Write;

use heapless::String;

use crate::bt::{device_name, BdAddr, DeviceName};
use crate::config::{COMMAND_TOPIC_PREFIX, STATUS_TOPIC_PREFIX};
use crate::error::{Error, Result};

/// Capacity of a rendered status topic.
pub const TOPIC_LEN: usize = 48;

/// Which records a `delete_paired` command removes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeleteTarget {
    All,
    Address(BdAddr),
    Name(DeviceName),
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RemoteCommand {
    DeletePaired(DeleteTarget),
    ResetDevice,
    StopDiscovery,
    /// Connect to the n-th registered device, or start periodic connect.
    Connect(Option<usize>),
    Disconnect,
    SetPairingMode(bool),
}

impl RemoteCommand {
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self> {
        let command = topic
            .strip_prefix(COMMAND_TOPIC_PREFIX)
            .ok_or(Error::ProtocolViolation("unknown topic"))?;
        let payload = core::str::from_utf8(payload)
            .map_err(|_| Error::ProtocolViolation("payload is not UTF-8"))?
            .trim();

        match command {
            "delete_paired" => {
                let target = if payload.is_empty() || payload.eq_ignore_ascii_case("all") {
                    DeleteTarget::All
                } else if let Some(address) = BdAddr::parse(payload) {
                    DeleteTarget::Address(address)
                } else {
                    DeleteTarget::Name(device_name(payload))
                };
                Ok(RemoteCommand::DeletePaired(target))
            }
            "reset_device" => Ok(RemoteCommand::ResetDevice),
            "stop_discovery" => Ok(RemoteCommand::StopDiscovery),
            "connect" => {
                if payload.is_empty() {
                    return Ok(RemoteCommand::Connect(None));
                }
                payload
                    .parse::<usize>()
                    .map(|index| RemoteCommand::Connect(Some(index)))
                    .map_err(|_| Error::ProtocolViolation("connect index is not a number"))
            }
            "disconnect" => Ok(RemoteCommand::Disconnect),
            "pairing" => match payload {
                p if p.eq_ignore_ascii_case("start") || p.eq_ignore_ascii_case("on") => {
                    Ok(RemoteCommand::SetPairingMode(true))
                }
                p if p.eq_ignore_ascii_case("stop") || p.eq_ignore_ascii_case("off") => {
                    Ok(RemoteCommand::SetPairingMode(false))
                }
                _ => Err(Error::ProtocolViolation("pairing expects start or stop")),
            },
            _ => Err(Error::ProtocolViolation("unknown command")),
        }
    }

    /// Status topic the result of this command is published on.
    pub fn status_topic(&self) -> StatusTopic {
        match self {
            RemoteCommand::DeletePaired(_) => StatusTopic::DeletePaired,
            RemoteCommand::ResetDevice => StatusTopic::ResetDevice,
            RemoteCommand::StopDiscovery => StatusTopic::StopDiscovery,
            RemoteCommand::Connect(_) => StatusTopic::Connect,
            RemoteCommand::Disconnect => StatusTopic::Disconnect,
            RemoteCommand::SetPairingMode(_) => StatusTopic::Pairing,
        }
    }
}

/// Outbound status topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusTopic {
    /// Address of the connected companion, or `disconnected`.
    Connected,
    /// Comma-joined registered addresses.
    PairedDevices,
    DeletePaired,
    ResetDevice,
    StopDiscovery,
    Connect,
    Disconnect,
    Pairing,
}

impl StatusTopic {
    pub const fn name(self) -> &'static str {
        match self {
            StatusTopic::Connected => "connected",
            StatusTopic::PairedDevices => "paired_devices",
            StatusTopic::DeletePaired => "delete_paired",
            StatusTopic::ResetDevice => "reset_device",
            StatusTopic::StopDiscovery => "stop_discovery",
            StatusTopic::Connect => "connect",
            StatusTopic::Disconnect => "disconnect",
            StatusTopic::Pairing => "pairing",
        }
    }

    /// Full topic, e.g. `stat/bt_door_key/connected`.
    pub fn topic(self) -> String<TOPIC_LEN> {
        let mut topic = String::new();
        let _ = write!(topic, "{}{}", STATUS_TOPIC_PREFIX, self.name());
        topic
    }
}

/// Short status payload for a command result.
pub fn outcome_text(result: &Result<()>) -> &'static str {
    match result {
        Ok(()) => "ok",
        Err(Error::NotFound) => "not_found",
        Err(Error::DiscoveryBusy | Error::AlreadyConnected) => "busy",
        Err(_) => "error",
    }
}

/// Outbound status sink (e.g. an MQTT client).
///
/// Publications are retained and delivered at least once.
pub trait StatusPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
