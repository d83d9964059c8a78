//! Bluetooth-facing types and the transport seam.
//!
//! The core never talks to a Bluetooth stack directly:
//!
//! 1. **Requests** go out through [`BtTransport`]. Every call only *starts*
//!    an operation and returns whether the stack accepted it.
//! 2. **Completions** come back as [`StackEvent`]s on the stack queue, posted
//!    from the stack's own context and consumed by the manager loop.
//!
//! Submodules hold the pieces of logic that sit on top of that seam.

pub mod eir;
pub mod pairing;
pub mod supervisor;

use core::fmt;
use core::str::FromStr;

use heapless::{String, Vec};

use crate::config::{DEVICE_NAME_LEN, MAX_SERVICE_CHANNELS, MAX_WRITE_LEN};
use crate::error::{Error, TransportError};

/// Longest extended-inquiry / advertisement payload carried in a result.
pub const MAX_EIR_LEN: usize = 240;

/// Bounded, UTF-8 device display name.
pub type DeviceName = String<DEVICE_NAME_LEN>;

/// Transport-level identifier of an open link.
pub type LinkHandle = u32;

/// Build a [`DeviceName`], truncating at a character boundary if needed.
pub fn device_name(name: &str) -> DeviceName {
    let mut out = DeviceName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// 6-byte link-layer device address, most significant byte first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Parse `AA:BB:CC:DD:EE:FF` (either case).
    pub fn parse(text: &str) -> Option<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = text.trim().split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(bytes))
    }
}

impl FromStr for BdAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BdAddr::parse(s).ok_or(Error::ProtocolViolation("malformed device address"))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BdAddr {
    fn format(&self, f: defmt::Formatter) {
        let b = &self.0;
        defmt::write!(
            f,
            "{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}",
            b[0],
            b[1],
            b[2],
            b[3],
            b[4],
            b[5]
        )
    }
}

/// Link security requested when connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Security {
    None,
    /// Authenticated (MITM-protected) and encrypted link.
    Authenticate,
}

/// One serial channel found by a service search.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceChannel {
    pub channel: u8,
    pub name: String<32>,
}

impl ServiceChannel {
    pub fn new(channel: u8, name: &str) -> Self {
        let mut n = String::new();
        for c in name.chars() {
            if n.push(c).is_err() {
                break;
            }
        }
        Self { channel, name: n }
    }
}

pub type ServiceChannels = Vec<ServiceChannel, MAX_SERVICE_CHANNELS>;

/// A single device reported during inquiry.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscoveryResult {
    pub address: BdAddr,
    /// Class of device, when the stack reported one.
    pub class_of_device: Option<u32>,
    pub rssi: Option<i8>,
    /// Raw remote name property.
    pub bd_name: Option<DeviceName>,
    /// Extended inquiry response, AD-structure encoded.
    pub eir: Vec<u8, MAX_EIR_LEN>,
}

impl DiscoveryResult {
    pub fn new(address: BdAddr) -> Self {
        Self {
            address,
            class_of_device: None,
            rssi: None,
            bd_name: None,
            eir: Vec::new(),
        }
    }

    pub fn with_class(mut self, class_of_device: u32) -> Self {
        self.class_of_device = Some(class_of_device);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.bd_name = Some(device_name(name));
        self
    }

    /// Attach EIR bytes; anything beyond [`MAX_EIR_LEN`] is cut off.
    pub fn with_eir(mut self, eir: &[u8]) -> Self {
        let n = eir.len().min(MAX_EIR_LEN);
        self.eir.clear();
        let _ = self.eir.extend_from_slice(&eir[..n]);
        self
    }
}

/// Notifications from the Bluetooth stack, handed off to the manager loop.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent {
    /// A device answered the inquiry.
    DiscoveryResult(DiscoveryResult),
    /// Inquiry started or stopped.
    DiscoveryStateChanged { running: bool },
    /// Remote service list for a candidate arrived (or the search failed).
    RemoteServices { address: BdAddr, success: bool },
    /// Serial channel search finished.
    ChannelsDiscovered {
        address: BdAddr,
        result: Result<ServiceChannels, TransportError>,
    },
    /// Bonding finished with a remote device.
    AuthComplete {
        address: BdAddr,
        name: DeviceName,
        success: bool,
    },
    /// A link to `address` is open.
    Opened { handle: LinkHandle, address: BdAddr },
    /// An open link closed.
    Closed { handle: LinkHandle, by_remote: bool },
    /// A connect attempt to `address` ended without a link.
    ConnectFailed { address: BdAddr },
    /// Inbound data on an open link.
    DataReceived {
        handle: LinkHandle,
        data: Vec<u8, MAX_WRITE_LEN>,
    },
}

/// Outbound half of the Bluetooth stack.
///
/// Calls are fire-and-forget: `Ok(())` means the stack accepted the request,
/// the outcome arrives later as a [`StackEvent`].
pub trait BtTransport {
    /// Begin an inquiry lasting `duration_secs`.
    fn start_discovery(&mut self, duration_secs: u8) -> Result<(), TransportError>;

    fn cancel_discovery(&mut self) -> Result<(), TransportError>;

    /// Ask for the remote service list of `address`.
    fn query_services(&mut self, address: BdAddr) -> Result<(), TransportError>;

    /// Search `address` for serial channels.
    fn discover_channels(&mut self, address: BdAddr) -> Result<(), TransportError>;

    fn connect(
        &mut self,
        address: BdAddr,
        channel: u8,
        security: Security,
    ) -> Result<(), TransportError>;

    fn write(&mut self, handle: LinkHandle, data: &[u8]) -> Result<(), TransportError>;

    fn close(&mut self, handle: LinkHandle) -> Result<(), TransportError>;

    /// Toggle whether the controller is discoverable and connectable.
    fn set_discoverable(&mut self, on: bool) -> Result<(), TransportError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn address_displays_as_upper_hex_with_colons() {
        let addr = BdAddr::new([0xaa, 0xbb, 0x0c, 0xdd, 0xee, 0x01]);
        assert_eq!(addr.to_string(), "AA:BB:0C:DD:EE:01");
    }

    #[test]
    fn address_parses_either_case() {
        let addr = BdAddr::parse("aa:BB:cc:DD:ee:FF").unwrap();
        assert_eq!(addr.bytes(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!("AA:BB:CC:DD:EE:FF".parse::<BdAddr>().unwrap(), addr);
    }

    #[test]
    fn address_rejects_malformed_text() {
        assert!(BdAddr::parse("").is_none());
        assert!(BdAddr::parse("AA:BB:CC:DD:EE").is_none());
        assert!(BdAddr::parse("AA:BB:CC:DD:EE:FF:00").is_none());
        assert!(BdAddr::parse("AAB:B:CC:DD:EE:FF").is_none());
        assert!(BdAddr::parse("GG:BB:CC:DD:EE:FF").is_none());
        assert!(matches!(
            "kitchen".parse::<BdAddr>(),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn device_name_truncates_on_char_boundary() {
        // 31 ASCII bytes + a 2-byte char does not fit in 32 bytes.
        let mut long = std::string::String::from("x").repeat(31);
        long.push('é');
        let name = device_name(&long);
        assert_eq!(name.len(), 31);
        assert!(name.chars().all(|c| c == 'x'));
    }

    #[test]
    fn discovery_result_caps_eir_length() {
        let eir = [0u8; 300];
        let result = DiscoveryResult::new(BdAddr::default()).with_eir(&eir);
        assert_eq!(result.eir.len(), MAX_EIR_LEN);
    }
}
