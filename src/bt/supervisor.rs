//! Connection supervisor - owns the single companion link.
//!
//! Connecting is a two-step exchange with the stack:
//!
//! 1. search the target for serial channels and pick the one whose service
//!    name matches ours,
//! 2. open an authenticated link on that channel.
//!
//! Periodic mode walks the registry round-robin. A failed channel search
//! for a periodic target moves on to the next registered device after a
//! short delay, and every close moves on immediately, so one unreachable
//! phone never stalls the fleet.

use embedded_hal_async::delay::DelayNs;

use crate::bt::{BdAddr, BtTransport, LinkHandle, Security, ServiceChannels};
use crate::config::Config;
use crate::error::{Error, Result, TransportError};
use crate::event::{EventSender, PendingEvent};
use crate::registry::Registry;
use crate::storage::KeyValueStore;

/// Why a connect attempt was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectOrigin {
    Periodic,
    Pairing,
    Direct,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetStage {
    ChannelSearch,
    Connecting,
}

/// Connect attempt in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Target {
    pub address: BdAddr,
    pub origin: ConnectOrigin,
    pub stage: TargetStage,
}

/// The open companion link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ActiveConnection {
    pub handle: LinkHandle,
    pub remote: BdAddr,
}

pub struct Supervisor {
    active: Option<ActiveConnection>,
    target: Option<Target>,
    cursor: usize,
    periodic_enabled: bool,
    service_name: &'static str,
    default_channel: u8,
    retry_delay_ms: u32,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            active: None,
            target: None,
            cursor: 0,
            periodic_enabled: false,
            service_name: config.service_name,
            default_channel: config.default_channel,
            retry_delay_ms: config.service_retry_delay_ms,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<ActiveConnection> {
        self.active
    }

    pub fn target(&self) -> Option<Target> {
        self.target
    }

    /// Next round-robin position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_periodic_enabled(&self) -> bool {
        self.periodic_enabled
    }

    pub fn set_periodic_enabled(&mut self, enabled: bool) {
        if self.periodic_enabled != enabled {
            info!("supervisor: periodic connect {}", if enabled { "on" } else { "off" });
        }
        self.periodic_enabled = enabled;
    }

    /// Start a channel search towards the next registered device.
    ///
    /// No-op with an empty registry or while a link is open. The cursor
    /// advances whether or not the stack accepts the request.
    pub fn periodic_connect<S: KeyValueStore>(
        &mut self,
        registry: &Registry<S>,
        transport: &mut impl BtTransport,
    ) -> Result<Option<BdAddr>> {
        let count = registry.count() as usize;
        if count == 0 {
            debug!("supervisor: no registered devices");
            return Ok(None);
        }
        if let Some(active) = self.active {
            debug!("supervisor: link {} already open", active.handle);
            return Ok(None);
        }
        if let Some(target) = self.target {
            if target.origin != ConnectOrigin::Periodic {
                debug!("supervisor: {} attempt in flight", target.origin);
                return Ok(None);
            }
            debug!("supervisor: abandoning attempt on {}", target.address);
        }

        let index = self.cursor % count;
        self.cursor = (index + 1) % count;
        let Some(address) = registry.nth(index).map(|r| r.address) else {
            return Ok(None);
        };

        info!("supervisor: periodic connect {} ({}/{})", address, index + 1, count);
        self.start_channel_search(address, ConnectOrigin::Periodic, transport)?;
        Ok(Some(address))
    }

    /// Connect to a freshly paired candidate.
    pub fn connect_candidate(
        &mut self,
        address: BdAddr,
        transport: &mut impl BtTransport,
    ) -> Result<()> {
        if self.active.is_some() {
            warn!("supervisor: not connecting {}, link already open", address);
            return Err(Error::AlreadyConnected);
        }
        self.start_channel_search(address, ConnectOrigin::Pairing, transport)
    }

    /// Connect straight to the `index`-th registered device on the default
    /// channel.
    pub fn connect_to_registered<S: KeyValueStore>(
        &mut self,
        index: usize,
        registry: &Registry<S>,
        transport: &mut impl BtTransport,
    ) -> Result<BdAddr> {
        if self.active.is_some() {
            return Err(Error::AlreadyConnected);
        }
        let address = registry.nth(index).ok_or(Error::NotFound)?.address;

        info!("supervisor: connecting {} on channel {}", address, self.default_channel);
        transport.connect(address, self.default_channel, Security::Authenticate)?;
        self.target = Some(Target {
            address,
            origin: ConnectOrigin::Direct,
            stage: TargetStage::Connecting,
        });
        Ok(address)
    }

    /// Channel search finished. Returns `true` when the failure should cycle
    /// on to the next registered device.
    pub fn on_channels_discovered(
        &mut self,
        address: BdAddr,
        result: Result<ServiceChannels, TransportError>,
        transport: &mut impl BtTransport,
    ) -> bool {
        let Some(mut target) = self.target else {
            warn!("supervisor: unexpected channel list from {}", address);
            return false;
        };
        if target.address != address || target.stage != TargetStage::ChannelSearch {
            warn!("supervisor: stale channel list from {}", address);
            return false;
        }

        match result {
            Ok(channels) => {
                match channels.iter().find(|c| c.name.as_str() == self.service_name) {
                    Some(found) => {
                        debug!("supervisor: {} serves channel {}", address, found.channel);
                        match transport.connect(address, found.channel, Security::Authenticate) {
                            Ok(()) => {
                                target.stage = TargetStage::Connecting;
                                self.target = Some(target);
                                return false;
                            }
                            Err(e) => warn!("supervisor: connect to {} refused: {}", address, e),
                        }
                    }
                    None => warn!(
                        "supervisor: {} has no matching service ({} channels)",
                        address,
                        channels.len()
                    ),
                }
            }
            Err(e) => warn!("supervisor: channel search on {} failed: {}", address, e),
        }

        self.target = None;
        target.origin == ConnectOrigin::Periodic && self.periodic_enabled
    }

    /// After a failed channel search: wait, then try the next device.
    pub async fn cycle_next<S: KeyValueStore>(
        &mut self,
        registry: &Registry<S>,
        transport: &mut impl BtTransport,
        delay: &mut impl DelayNs,
    ) {
        if !self.periodic_enabled {
            return;
        }
        delay.delay_ms(self.retry_delay_ms).await;
        if let Err(e) = self.periodic_connect(registry, transport) {
            warn!("supervisor: periodic connect failed: {}", e);
        }
    }

    /// A link opened. A second link while one is open is closed again, as is
    /// a link nobody asked for: no attempt in flight and periodic mode off.
    pub fn on_opened(
        &mut self,
        handle: LinkHandle,
        address: BdAddr,
        transport: &mut impl BtTransport,
        events: &EventSender<'_>,
    ) -> Result<()> {
        if let Some(active) = self.active {
            warn!(
                "supervisor: link {} to {} opened while {} is active, closing it",
                handle,
                address,
                active.handle
            );
            if let Err(e) = transport.close(handle) {
                warn!("supervisor: closing extra link failed: {}", e);
            }
            return Err(Error::ProtocolViolation("second link opened"));
        }
        if self.target.is_none() && !self.periodic_enabled {
            warn!("supervisor: link {} to {} was not requested, closing it", handle, address);
            if let Err(e) = transport.close(handle) {
                warn!("supervisor: closing unrequested link failed: {}", e);
            }
            return Err(Error::ProtocolViolation("unrequested link opened"));
        }

        self.active = Some(ActiveConnection {
            handle,
            remote: address,
        });
        self.target = None;
        info!("supervisor: link {} open to {}", handle, address);
        events.post(PendingEvent::PhoneConnected);
        Ok(())
    }

    /// A link closed. Returns `true` when periodic mode wants the next
    /// attempt started. Closes of links already released are ignored.
    pub fn on_closed(
        &mut self,
        handle: LinkHandle,
        by_remote: bool,
        events: &EventSender<'_>,
    ) -> bool {
        match self.active {
            Some(active) if active.handle == handle => {
                info!(
                    "supervisor: link {} closed ({})",
                    handle,
                    if by_remote { "remote" } else { "local" }
                );
                self.active = None;
            }
            Some(active) => {
                debug!("supervisor: close of link {} ignored, {} stays open", handle, active.handle);
                return false;
            }
            None => {
                debug!("supervisor: close of released link {} ignored", handle);
                return false;
            }
        }
        events.post(PendingEvent::PhoneDisconnected);
        self.periodic_enabled
    }

    /// A connect attempt ended without a link. Returns `true` when periodic
    /// mode wants the next attempt started.
    pub fn on_connect_failed(&mut self, address: BdAddr, events: &EventSender<'_>) -> bool {
        match self.target {
            Some(target) if target.address == address => {
                info!("supervisor: connect to {} failed", address);
                self.target = None;
            }
            _ => {
                debug!("supervisor: stale connect failure for {}", address);
                return false;
            }
        }
        events.post(PendingEvent::PhoneDisconnected);
        self.periodic_enabled
    }

    /// Close the open link, if any. A close the stack refuses still drops
    /// the link locally and reports it; the stack's own close for that
    /// handle is then ignored.
    pub fn disconnect(&mut self, transport: &mut impl BtTransport, events: &EventSender<'_>) {
        self.target = None;
        let Some(active) = self.active else {
            debug!("supervisor: disconnect with no open link");
            return;
        };
        if let Err(e) = transport.close(active.handle) {
            warn!("supervisor: close of link {} failed: {}", active.handle, e);
            self.active = None;
            events.post(PendingEvent::PhoneDisconnected);
        }
    }

    fn start_channel_search(
        &mut self,
        address: BdAddr,
        origin: ConnectOrigin,
        transport: &mut impl BtTransport,
    ) -> Result<()> {
        if let Err(e) = transport.discover_channels(address) {
            warn!("supervisor: channel search on {} refused: {}", address, e);
            self.target = None;
            return Err(e.into());
        }
        self.target = Some(Target {
            address,
            origin,
            stage: TargetStage::ChannelSearch,
        });
        Ok(())
    }

    /// Write to the open link.
    pub fn send(&mut self, data: &[u8], transport: &mut impl BtTransport) -> Result<()> {
        let active = self.active.ok_or(Error::NotConnected)?;
        transport.write(active.handle, data)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
