//! Discovery & pairing session.
//!
//! One session exists system-wide:
//!
//! ```text
//! Idle ──start──▶ DeviceDiscovering ──qualifying result──▶ DeviceFound
//!                       │                                     │
//!            inquiry stopped, nothing found        inquiry stopped
//!                       ▼                                     ▼
//!                     Idle                         ServiceDiscovering
//!                                                             │
//!                                               service list (or failure)
//!                                                             ▼
//!                                                ServiceDiscoverComplete
//! ```
//!
//! The first qualifying device latches (`dev_found`) and the inquiry is
//! cancelled right away; later results are ignored. A start request while a
//! session is between `DeviceDiscovering` and `ServiceDiscovering` is
//! rejected with [`Error::DiscoveryBusy`].
//!
//! Authentication completion is handled independently of these states: it
//! only decides whether the registry gains a record or renames one.

use crate::bt::eir::{is_companion_class, resolve_name};
use crate::bt::{BdAddr, BtTransport, DeviceName, DiscoveryResult};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::storage::KeyValueStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryState {
    #[default]
    Idle,
    DeviceDiscovering,
    DeviceFound,
    ServiceDiscovering,
    ServiceDiscoverComplete,
}

/// The device a session latched onto.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Candidate {
    pub address: BdAddr,
    pub class_of_device: u32,
    pub name: Option<DeviceName>,
    pub rssi: Option<i8>,
}

/// What an authentication notification did to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthOutcome {
    Added,
    Renamed,
    Unchanged,
    Failed,
}

pub struct PairingSession {
    state: DiscoveryState,
    dev_found: bool,
    candidate: Option<Candidate>,
    duration_secs: u8,
}

impl PairingSession {
    pub const fn new(duration_secs: u8) -> Self {
        Self {
            state: DiscoveryState::Idle,
            dev_found: false,
            candidate: None,
            duration_secs,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    /// True while the session is between a start and its completion.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            DiscoveryState::DeviceDiscovering
                | DiscoveryState::DeviceFound
                | DiscoveryState::ServiceDiscovering
        )
    }

    /// Begin an inquiry.
    pub fn start(&mut self, transport: &mut impl BtTransport) -> Result<()> {
        if self.is_active() {
            warn!("pairing: discovery already running ({})", self.state);
            return Err(Error::DiscoveryBusy);
        }
        transport.start_discovery(self.duration_secs)?;

        self.dev_found = false;
        self.candidate = None;
        self.state = DiscoveryState::DeviceDiscovering;
        info!("pairing: discovery started ({} s)", self.duration_secs);
        Ok(())
    }

    /// Abandon the session and return to `Idle`.
    pub fn stop(&mut self, transport: &mut impl BtTransport) {
        if matches!(
            self.state,
            DiscoveryState::DeviceDiscovering | DiscoveryState::DeviceFound
        ) {
            if let Err(e) = transport.cancel_discovery() {
                warn!("pairing: cancel discovery failed: {}", e);
            }
        }
        if self.state != DiscoveryState::Idle {
            info!("pairing: session stopped in {}", self.state);
        }
        self.reset();
    }

    /// Filter one inquiry result. Returns `true` when it became the candidate.
    pub fn on_discovery_result(
        &mut self,
        result: &DiscoveryResult,
        transport: &mut impl BtTransport,
    ) -> bool {
        if self.state != DiscoveryState::DeviceDiscovering || self.dev_found {
            trace!("pairing: ignoring result from {}", result.address);
            return false;
        }
        let Some(cod) = result.class_of_device else {
            return false;
        };
        if !is_companion_class(cod) {
            trace!("pairing: {} filtered by class {=u32:x}", result.address, cod);
            return false;
        }

        let name = resolve_name(&result.eir, result.bd_name.as_deref());
        info!("pairing: found {} (class {=u32:x})", result.address, cod);

        self.dev_found = true;
        self.candidate = Some(Candidate {
            address: result.address,
            class_of_device: cod,
            name,
            rssi: result.rssi,
        });
        self.state = DiscoveryState::DeviceFound;

        if let Err(e) = transport.cancel_discovery() {
            warn!("pairing: cancel discovery failed: {}", e);
        }
        true
    }

    /// Inquiry started/stopped notification.
    ///
    /// When the service search for the candidate cannot even be issued the
    /// session completes without services and the candidate is returned for
    /// hand-off.
    pub fn on_discovery_state(
        &mut self,
        running: bool,
        transport: &mut impl BtTransport,
    ) -> Option<Candidate> {
        if running {
            debug!("pairing: inquiry running");
            return None;
        }

        match self.state {
            DiscoveryState::DeviceFound => {
                let address = self.candidate.as_ref()?.address;
                self.state = DiscoveryState::ServiceDiscovering;
                debug!("pairing: querying services of {}", address);
                if let Err(e) = transport.query_services(address) {
                    warn!("pairing: service query for {} failed: {}", address, e);
                    self.state = DiscoveryState::ServiceDiscoverComplete;
                    return self.candidate.clone();
                }
                None
            }
            DiscoveryState::DeviceDiscovering => {
                info!("pairing: inquiry finished without a companion");
                self.reset();
                None
            }
            _ => None,
        }
    }

    /// Remote service list arrived. Returns the candidate to hand off once
    /// the session completes.
    pub fn on_remote_services(&mut self, address: BdAddr, success: bool) -> Option<Candidate> {
        let expected = self.candidate.as_ref().map(|c| c.address);
        if self.state != DiscoveryState::ServiceDiscovering || expected != Some(address) {
            warn!("pairing: unexpected service list from {} in {}", address, self.state);
            return None;
        }
        if !success {
            warn!("pairing: service search on {} failed, no services", address);
        }
        self.state = DiscoveryState::ServiceDiscoverComplete;
        info!("pairing: service discovery complete for {}", address);
        self.candidate.clone()
    }

    /// Record an authenticated device in the registry.
    ///
    /// An empty name from the stack falls back to the name seen during
    /// discovery.
    pub async fn register_authenticated<S: KeyValueStore>(
        &self,
        registry: &mut Registry<S>,
        address: BdAddr,
        name: &str,
        success: bool,
    ) -> Result<AuthOutcome> {
        if !success {
            warn!("pairing: authentication with {} failed", address);
            return Ok(AuthOutcome::Failed);
        }

        let fallback = self
            .candidate
            .as_ref()
            .filter(|c| c.address == address)
            .and_then(|c| c.name.as_deref());
        let name = if name.is_empty() {
            fallback.unwrap_or("")
        } else {
            name
        };

        if registry.exists(address).await? {
            if name.is_empty() {
                return Ok(AuthOutcome::Unchanged);
            }
            registry.update_name(address, name).await?;
            info!("pairing: {} re-authenticated", address);
            Ok(AuthOutcome::Renamed)
        } else {
            registry.add(address, name).await?;
            info!("pairing: {} registered", address);
            Ok(AuthOutcome::Added)
        }
    }

    fn reset(&mut self) {
        self.state = DiscoveryState::Idle;
        self.dev_found = false;
        self.candidate = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bt::{LinkHandle, Security};
    use crate::error::TransportError;
    use crate::storage::MemoryStore;
    use embassy_futures::block_on;
    use std::vec::Vec;

    #[derive(Debug, PartialEq)]
    enum Call {
        Start(u8),
        Cancel,
        Query(BdAddr),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        refuse: bool,
    }

    impl BtTransport for Recorder {
        fn start_discovery(&mut self, secs: u8) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::Busy);
            }
            self.calls.push(Call::Start(secs));
            Ok(())
        }
        fn cancel_discovery(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::Cancel);
            Ok(())
        }
        fn query_services(&mut self, address: BdAddr) -> Result<(), TransportError> {
            if self.refuse {
                return Err(TransportError::Busy);
            }
            self.calls.push(Call::Query(address));
            Ok(())
        }
        fn discover_channels(&mut self, _: BdAddr) -> Result<(), TransportError> {
            Ok(())
        }
        fn connect(&mut self, _: BdAddr, _: u8, _: Security) -> Result<(), TransportError> {
            Ok(())
        }
        fn write(&mut self, _: LinkHandle, _: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
        fn close(&mut self, _: LinkHandle) -> Result<(), TransportError> {
            Ok(())
        }
        fn set_discoverable(&mut self, _: bool) -> Result<(), TransportError> {
            Ok(())
        }
    }

    const PHONE: u32 = 0x5A_02_0C;
    const LAPTOP: u32 = 0x00_01_0C;

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn started() -> (PairingSession, Recorder) {
        let mut session = PairingSession::new(10);
        let mut transport = Recorder::default();
        session.start(&mut transport).unwrap();
        (session, transport)
    }

    #[test]
    fn start_enters_discovering() {
        let (session, transport) = started();
        assert_eq!(session.state(), DiscoveryState::DeviceDiscovering);
        assert_eq!(transport.calls, [Call::Start(10)]);
    }

    #[test]
    fn second_start_is_rejected_while_active() {
        let (mut session, mut transport) = started();
        assert_eq!(session.start(&mut transport), Err(Error::DiscoveryBusy));
        assert_eq!(transport.calls.len(), 1);
    }

    #[test]
    fn refused_start_stays_idle() {
        let mut session = PairingSession::new(10);
        let mut transport = Recorder {
            refuse: true,
            ..Default::default()
        };
        assert_eq!(
            session.start(&mut transport),
            Err(Error::Transport(TransportError::Busy))
        );
        assert_eq!(session.state(), DiscoveryState::Idle);
    }

    #[test]
    fn non_companion_classes_are_skipped() {
        let (mut session, mut transport) = started();
        let laptop = DiscoveryResult::new(addr(1)).with_class(LAPTOP);
        let no_class = DiscoveryResult::new(addr(2));
        assert!(!session.on_discovery_result(&laptop, &mut transport));
        assert!(!session.on_discovery_result(&no_class, &mut transport));
        assert_eq!(session.state(), DiscoveryState::DeviceDiscovering);
    }

    #[test]
    fn first_qualifying_device_latches_and_cancels() {
        let (mut session, mut transport) = started();
        let first = DiscoveryResult::new(addr(1)).with_class(PHONE);
        let second = DiscoveryResult::new(addr(2)).with_class(PHONE);
        assert!(session.on_discovery_result(&first, &mut transport));
        assert!(!session.on_discovery_result(&second, &mut transport));
        assert_eq!(session.state(), DiscoveryState::DeviceFound);
        assert_eq!(session.candidate().unwrap().address, addr(1));
        assert_eq!(transport.calls, [Call::Start(10), Call::Cancel]);
    }

    #[test]
    fn candidate_name_prefers_eir() {
        let (mut session, mut transport) = started();
        let result = DiscoveryResult::new(addr(1))
            .with_class(PHONE)
            .with_name("raw")
            .with_eir(&[0x04, 0x09, b'S', b'2', b'3']);
        session.on_discovery_result(&result, &mut transport);
        let name = session.candidate().unwrap().name.clone().unwrap();
        assert_eq!(name.as_str(), "S23");
    }

    #[test]
    fn full_walk_to_service_discover_complete() {
        let (mut session, mut transport) = started();
        session.on_discovery_result(&DiscoveryResult::new(addr(1)).with_class(PHONE), &mut transport);
        assert!(session.on_discovery_state(false, &mut transport).is_none());
        assert_eq!(session.state(), DiscoveryState::ServiceDiscovering);
        assert_eq!(transport.calls.last(), Some(&Call::Query(addr(1))));

        let handoff = session.on_remote_services(addr(1), true).unwrap();
        assert_eq!(handoff.address, addr(1));
        assert_eq!(session.state(), DiscoveryState::ServiceDiscoverComplete);
        assert!(!session.is_active());
    }

    #[test]
    fn service_failure_still_completes() {
        let (mut session, mut transport) = started();
        session.on_discovery_result(&DiscoveryResult::new(addr(1)).with_class(PHONE), &mut transport);
        session.on_discovery_state(false, &mut transport);
        assert!(session.on_remote_services(addr(1), false).is_some());
        assert_eq!(session.state(), DiscoveryState::ServiceDiscoverComplete);
    }

    #[test]
    fn service_list_for_other_address_is_ignored() {
        let (mut session, mut transport) = started();
        session.on_discovery_result(&DiscoveryResult::new(addr(1)).with_class(PHONE), &mut transport);
        session.on_discovery_state(false, &mut transport);
        assert!(session.on_remote_services(addr(9), true).is_none());
        assert_eq!(session.state(), DiscoveryState::ServiceDiscovering);
    }

    #[test]
    fn inquiry_end_without_candidate_returns_to_idle() {
        let (mut session, mut transport) = started();
        assert!(session.on_discovery_state(false, &mut transport).is_none());
        assert_eq!(session.state(), DiscoveryState::Idle);
        session.start(&mut transport).unwrap();
    }

    #[test]
    fn stop_cancels_running_inquiry() {
        let (mut session, mut transport) = started();
        session.stop(&mut transport);
        assert_eq!(session.state(), DiscoveryState::Idle);
        assert_eq!(transport.calls.last(), Some(&Call::Cancel));
    }

    // ════════════════════════════════════════════════════════════════════════
    // Authentication
    // ════════════════════════════════════════════════════════════════════════

    fn registry() -> Registry<MemoryStore> {
        let mut reg = Registry::new(MemoryStore::new());
        block_on(reg.load()).unwrap();
        reg
    }

    #[test]
    fn auth_adds_then_renames() {
        let session = PairingSession::new(10);
        let mut reg = registry();
        let outcome = block_on(session.register_authenticated(&mut reg, addr(1), "Phone", true));
        assert_eq!(outcome, Ok(AuthOutcome::Added));
        let outcome = block_on(session.register_authenticated(&mut reg, addr(1), "Phone 2", true));
        assert_eq!(outcome, Ok(AuthOutcome::Renamed));
        assert_eq!(reg.count(), 1);
        assert_eq!(reg.nth(0).unwrap().name.as_str(), "Phone 2");
    }

    #[test]
    fn failed_auth_does_not_touch_registry() {
        let session = PairingSession::new(10);
        let mut reg = registry();
        let outcome = block_on(session.register_authenticated(&mut reg, addr(1), "x", false));
        assert_eq!(outcome, Ok(AuthOutcome::Failed));
        assert_eq!(reg.count(), 0);
    }

    #[test]
    fn empty_auth_name_uses_discovered_name() {
        let (mut session, mut transport) = started();
        let result = DiscoveryResult::new(addr(1)).with_class(PHONE).with_name("Pixel");
        session.on_discovery_result(&result, &mut transport);
        let mut reg = registry();
        block_on(session.register_authenticated(&mut reg, addr(1), "", true)).unwrap();
        assert_eq!(reg.nth(0).unwrap().name.as_str(), "Pixel");
    }
}
