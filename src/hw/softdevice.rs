//! SoftDevice S140 central - the Bluetooth transport on hardware.
//!
//! [`SoftdeviceTransport`] is the manager-side handle: every call is a
//! non-blocking `try_send` onto [`REQUESTS`]. [`bt_task`] serves those
//! requests against the SoftDevice and reports outcomes as [`StackEvent`]s.
//!
//! Mapping onto BLE:
//!   - inquiry      → active scan; AD structures share the EIR layout and the
//!     GAP Appearance stands in for the class of device,
//!   - service list → the advertisement already qualified, reported at once,
//!   - channel list → GATT discovery of the door-key service on a probe link,
//!   - connect      → bonded, encrypted link; the door-key message
//!     characteristic carries writes and notifications.

use core::cell::RefCell;

use bt_door_key::bt::eir::{appearance, class_from_appearance, is_companion_class};
use bt_door_key::bt::{
    BdAddr, BtTransport, DiscoveryResult, LinkHandle, Security, ServiceChannel, ServiceChannels,
    StackEvent,
};
use bt_door_key::config::{DEFAULT_SERIAL_CHANNEL, MAX_PAIRED_DEVICES, MAX_WRITE_LEN, SERIAL_SERVICE_NAME};
use bt_door_key::error::TransportError;
use bt_door_key::event::StackSender;
use defmt::{debug, info, warn};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration};
use heapless::Vec;
use nrf_softdevice::ble::central::ScanError;
use nrf_softdevice::ble::security::{IoCapabilities, SecurityHandler};
use nrf_softdevice::ble::{
    central, gatt_client, Address, AddressType, Connection, EncryptError, EncryptionInfo,
    IdentityKey, MasterId, SecurityMode,
};
use nrf_softdevice::Softdevice;
use static_cell::StaticCell;

const REQUEST_QUEUE_LEN: usize = 4;

/// Address types seen while scanning, remembered for later connects.
const KNOWN_ADDRESSES: usize = 16;

#[derive(Clone)]
pub enum Request {
    StartDiscovery(u8),
    QueryServices(BdAddr),
    DiscoverChannels(BdAddr),
    Connect(BdAddr, Security),
    Write(LinkHandle, Vec<u8, MAX_WRITE_LEN>),
    Close(LinkHandle),
    SetDiscoverable(bool),
}

pub static REQUESTS: Channel<CriticalSectionRawMutex, Request, REQUEST_QUEUE_LEN> = Channel::new();

/// Raised by `cancel_discovery`; ends the running scan.
static CANCEL_SCAN: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Outcome of the last security procedure: `true` once the link is encrypted.
static SECURED: Signal<CriticalSectionRawMutex, bool> = Signal::new();

/// How long pairing or re-encryption may take.
const SECURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Manager-side handle onto [`bt_task`].
pub struct SoftdeviceTransport;

impl SoftdeviceTransport {
    fn request(&self, request: Request) -> Result<(), TransportError> {
        REQUESTS.try_send(request).map_err(|_| TransportError::Busy)
    }
}

impl BtTransport for SoftdeviceTransport {
    fn start_discovery(&mut self, duration_secs: u8) -> Result<(), TransportError> {
        CANCEL_SCAN.reset();
        self.request(Request::StartDiscovery(duration_secs))
    }

    fn cancel_discovery(&mut self) -> Result<(), TransportError> {
        CANCEL_SCAN.signal(());
        Ok(())
    }

    fn query_services(&mut self, address: BdAddr) -> Result<(), TransportError> {
        self.request(Request::QueryServices(address))
    }

    fn discover_channels(&mut self, address: BdAddr) -> Result<(), TransportError> {
        self.request(Request::DiscoverChannels(address))
    }

    fn connect(&mut self, address: BdAddr, _channel: u8, security: Security) -> Result<(), TransportError> {
        self.request(Request::Connect(address, security))
    }

    fn write(&mut self, handle: LinkHandle, data: &[u8]) -> Result<(), TransportError> {
        let data = Vec::from_slice(data).map_err(|_| TransportError::Rejected)?;
        self.request(Request::Write(handle, data))
    }

    fn close(&mut self, handle: LinkHandle) -> Result<(), TransportError> {
        self.request(Request::Close(handle))
    }

    fn set_discoverable(&mut self, on: bool) -> Result<(), TransportError> {
        self.request(Request::SetDiscoverable(on))
    }
}

/// GATT client for the door-key service the companion app exposes.
#[nrf_softdevice::gatt_client(uuid = "d00f0001-8c3b-4e2a-9f41-6b2d1c7a0b10")]
pub struct DoorKeyServiceClient {
    /// Messages in both directions (button presses out, app data in).
    #[characteristic(uuid = "d00f0002-8c3b-4e2a-9f41-6b2d1c7a0b10", write, notify)]
    pub message: Vec<u8, MAX_WRITE_LEN>,
}

// Link security

/// Long-term key handed out by a phone, filed under its registry address.
#[derive(Clone, Copy)]
struct Bond {
    address: BdAddr,
    master_id: MasterId,
    key: EncryptionInfo,
}

/// Bonds made since boot, at most one per registry slot. Phones that rotate
/// resolvable private addresses pair again after a rotation.
struct BondTable {
    bonds: RefCell<Vec<Bond, MAX_PAIRED_DEVICES>>,
}

impl BondTable {
    fn new() -> Self {
        Self {
            bonds: RefCell::new(Vec::new()),
        }
    }

    fn lookup(&self, conn: &Connection) -> Option<Bond> {
        let address = to_bd_addr(&conn.peer_address());
        self.bonds.borrow().iter().find(|b| b.address == address).copied()
    }
}

impl SecurityHandler for BondTable {
    fn io_capabilities(&self) -> IoCapabilities {
        IoCapabilities::None
    }

    fn can_bond(&self, _conn: &Connection) -> bool {
        true
    }

    fn on_bonded(&self, conn: &Connection, master_id: MasterId, key: EncryptionInfo, _peer_id: IdentityKey) {
        let address = to_bd_addr(&conn.peer_address());
        let mut bonds = self.bonds.borrow_mut();
        bonds.retain(|b| b.address != address);
        if bonds.is_full() {
            bonds.remove(0);
        }
        let _ = bonds.push(Bond {
            address,
            master_id,
            key,
        });
        info!("bt: bonded with {}", address);
    }

    fn get_key(&self, conn: &Connection, master_id: MasterId) -> Option<EncryptionInfo> {
        self.lookup(conn)
            .filter(|b| b.master_id == master_id)
            .map(|b| b.key)
    }

    fn get_peripheral_key(&self, conn: &Connection) -> Option<(MasterId, EncryptionInfo)> {
        self.lookup(conn).map(|b| (b.master_id, b.key))
    }

    fn on_security_update(&self, _conn: &Connection, mode: SecurityMode) {
        debug!("bt: security mode {}", mode);
        SECURED.signal(!matches!(mode, SecurityMode::NoAccess | SecurityMode::Open));
    }
}

static BONDS: StaticCell<BondTable> = StaticCell::new();

// Address conversion. The SoftDevice keeps addresses least significant
// byte first.

fn to_bd_addr(address: &Address) -> BdAddr {
    let mut bytes = address.bytes();
    bytes.reverse();
    BdAddr::new(bytes)
}

struct AddressBook {
    seen: Vec<(BdAddr, AddressType), KNOWN_ADDRESSES>,
}

impl AddressBook {
    const fn new() -> Self {
        Self { seen: Vec::new() }
    }

    fn remember(&mut self, address: &Address) {
        let bd = to_bd_addr(address);
        if self.seen.iter().any(|(a, _)| *a == bd) {
            return;
        }
        if self.seen.is_full() {
            self.seen.remove(0);
        }
        let _ = self.seen.push((bd, address.address_type()));
    }

    fn address(&self, bd: BdAddr) -> Address {
        let kind = self
            .seen
            .iter()
            .find(|(a, _)| *a == bd)
            .map(|(_, t)| *t)
            .unwrap_or(AddressType::Public);
        let mut bytes = bd.bytes();
        bytes.reverse();
        Address::new(kind, bytes)
    }
}

// Task

/// Serve transport requests forever.
pub async fn bt_task(sd: &'static Softdevice, stack: StackSender<'static>) -> ! {
    let bonds: &'static BondTable = BONDS.init(BondTable::new());
    let mut book = AddressBook::new();
    let mut next_handle: LinkHandle = 1;

    loop {
        match REQUESTS.receive().await {
            Request::StartDiscovery(secs) => scan(sd, secs, &mut book, &stack).await,
            Request::QueryServices(address) => {
                stack.post(StackEvent::RemoteServices {
                    address,
                    success: true,
                });
            }
            Request::DiscoverChannels(address) => {
                let result = probe_channels(sd, book.address(address)).await;
                stack.post(StackEvent::ChannelsDiscovered { address, result });
            }
            Request::Connect(address, security) => {
                let handle = next_handle;
                next_handle = next_handle.wrapping_add(1).max(1);
                let target = book.address(address);
                run_link(sd, bonds, handle, address, target, security, &stack).await;
            }
            Request::Write(handle, _) | Request::Close(handle) => {
                debug!("bt: link {} is not open", handle);
            }
            Request::SetDiscoverable(on) => {
                info!("bt: discoverable={} (central role, pairing is initiated by scan)", on);
            }
        }
    }
}

/// Scan for `secs` seconds, reporting each qualifying phone once.
async fn scan(sd: &Softdevice, secs: u8, book: &mut AddressBook, stack: &StackSender<'static>) {
    info!("bt: inquiry starting ({} s window)", secs);
    stack.post(StackEvent::DiscoveryStateChanged { running: true });

    let config = central::ScanConfig {
        // Active scan to retrieve scan-response data (device names).
        active: true,
        // 10 ms units.
        timeout: u16::from(secs) * 100,
        ..Default::default()
    };
    let mut reported: Vec<BdAddr, KNOWN_ADDRESSES> = Vec::new();

    let scanning = central::scan(sd, &config, |params| {
        let data = unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };
        let class = appearance(data).and_then(class_from_appearance);
        if !class.is_some_and(is_companion_class) {
            return None;
        }

        let peer = Address::from_raw(params.peer_addr);
        let address = to_bd_addr(&peer);
        if reported.contains(&address) || reported.push(address).is_err() {
            return None;
        }
        book.remember(&peer);

        let mut found = DiscoveryResult::new(address).with_eir(data);
        found.rssi = Some(params.rssi);
        found.class_of_device = class;
        stack.post(StackEvent::DiscoveryResult(found));
        None
    });

    match select(scanning, CANCEL_SCAN.wait()).await {
        Either::First(Ok(())) | Either::First(Err(ScanError::Timeout)) => {}
        Either::First(Err(_)) => warn!("bt: scan ended with error"),
        Either::Second(()) => debug!("bt: inquiry cancelled"),
    }
    stack.post(StackEvent::DiscoveryStateChanged { running: false });
    info!("bt: inquiry finished, {} phones reported", reported.len());
}

fn connect_config<'a>(whitelist: &'a [&'a Address]) -> central::ConnectConfig<'a> {
    central::ConnectConfig {
        scan_config: central::ScanConfig {
            whitelist: Some(whitelist),
            timeout: 500,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Open a short-lived link and look for the door-key service.
async fn probe_channels(
    sd: &Softdevice,
    address: Address,
) -> Result<ServiceChannels, TransportError> {
    let whitelist = [&address];
    let conn = central::connect(sd, &connect_config(&whitelist))
        .await
        .map_err(|_| TransportError::Rejected)?;

    let mut channels = ServiceChannels::new();
    if gatt_client::discover::<DoorKeyServiceClient>(&conn).await.is_ok() {
        let _ = channels.push(ServiceChannel::new(DEFAULT_SERIAL_CHANNEL, SERIAL_SERVICE_NAME));
    }
    let _ = conn.disconnect();
    Ok(channels)
}

/// Encrypt with a stored key, or pair when the phone has none, then wait
/// for the SoftDevice to report the resulting security mode.
async fn secure(conn: &Connection) -> bool {
    SECURED.reset();
    let started = match conn.encrypt() {
        Ok(()) => true,
        Err(EncryptError::PeerKeysNotFound) => conn.request_pairing().is_ok(),
        Err(_) => false,
    };
    started && matches!(with_timeout(SECURE_TIMEOUT, SECURED.wait()).await, Ok(true))
}

/// Connect, report the link, and serve it until it closes.
async fn run_link(
    sd: &Softdevice,
    bonds: &'static BondTable,
    handle: LinkHandle,
    bd: BdAddr,
    address: Address,
    security: Security,
    stack: &StackSender<'static>,
) {
    info!("bt: connecting {} as link {}", bd, handle);
    let whitelist = [&address];
    let config = connect_config(&whitelist);

    let conn = match security {
        Security::Authenticate => central::connect_with_security(sd, &config, bonds).await,
        Security::None => central::connect(sd, &config).await,
    };
    let Ok(conn) = conn else {
        warn!("bt: connect to {} failed", bd);
        stack.post(StackEvent::ConnectFailed { address: bd });
        return;
    };

    if security == Security::Authenticate {
        let ok = secure(&conn).await;
        stack.post(StackEvent::AuthComplete {
            address: bd,
            name: bt_door_key::bt::DeviceName::new(),
            success: ok,
        });
        if !ok {
            warn!("bt: failed to secure link to {}", bd);
            let _ = conn.disconnect();
            stack.post(StackEvent::ConnectFailed { address: bd });
            return;
        }
    }

    let client = match gatt_client::discover::<DoorKeyServiceClient>(&conn).await {
        Ok(client) => client,
        Err(_) => {
            warn!("bt: door-key service missing on {}", bd);
            let _ = conn.disconnect();
            stack.post(StackEvent::ConnectFailed { address: bd });
            return;
        }
    };
    if client.message_cccd_write(true).await.is_err() {
        warn!("bt: could not subscribe to {}", bd);
    }

    stack.post(StackEvent::Opened { handle, address: bd });

    let by_remote = serve_link(&conn, &client, handle, stack).await;
    stack.post(StackEvent::Closed { handle, by_remote });
}

/// Returns whether the remote side closed the link.
async fn serve_link(
    conn: &Connection,
    client: &DoorKeyServiceClient,
    handle: LinkHandle,
    stack: &StackSender<'static>,
) -> bool {
    loop {
        let notifications = gatt_client::run(conn, client, |event| match event {
            DoorKeyServiceClientEvent::MessageNotification(data) => {
                stack.post(StackEvent::DataReceived { handle, data });
            }
        });

        match select(REQUESTS.receive(), notifications).await {
            Either::First(Request::Write(h, data)) if h == handle => {
                if client.message_write(&data).await.is_err() {
                    warn!("bt: write on link {} failed", handle);
                }
            }
            Either::First(Request::Close(h)) if h == handle => {
                info!("bt: closing link {}", handle);
                let _ = conn.disconnect();
                return false;
            }
            Either::First(Request::StartDiscovery(_)) => {
                warn!("bt: no inquiry while link {} is open", handle);
                stack.post(StackEvent::DiscoveryStateChanged { running: false });
            }
            Either::First(Request::DiscoverChannels(address)) => {
                stack.post(StackEvent::ChannelsDiscovered {
                    address,
                    result: Err(TransportError::Busy),
                });
            }
            Either::First(Request::Connect(address, _)) => {
                warn!("bt: connect to {} while link {} is open", address, handle);
            }
            Either::First(_) => {}
            Either::Second(_) => return true,
        }
    }
}
