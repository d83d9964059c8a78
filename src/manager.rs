//! The manager - single consumer of every queue and sole owner of all
//! mutable connection state.
//!
//! Registry cache, discovery session, companion link and round-robin cursor
//! are fields of [`Manager`]. Nothing else mutates them: GPIO handlers, the
//! Bluetooth stack and the network client only enqueue, and [`Manager::run`]
//! handles one item to completion before it looks at the next. A handler that
//! posts a follow-up event sees it on a later iteration, never re-entrantly.

use core::fmt::Write;

use embassy_futures::select::{select3, Either3};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use heapless::String;

use crate::bt::pairing::{AuthOutcome, Candidate, PairingSession};
use crate::bt::supervisor::Supervisor;
use crate::bt::{BtTransport, StackEvent};
use crate::config::Config;
use crate::error::Result;
use crate::event::{ButtonId, EventSender, PendingEvent, PressKind, Queues};
use crate::registry::{AddressList, Registry};
use crate::remote::{outcome_text, DeleteTarget, RemoteCommand, StatusPublisher, StatusTopic};
use crate::storage::KeyValueStore;

/// Application hook for general-purpose buttons. May return a follow-up event.
pub type ButtonMap = fn(ButtonId, PressKind) -> Option<PendingEvent>;

/// Default button mapping: presses only go to the companion.
pub fn no_button_actions(_: ButtonId, _: PressKind) -> Option<PendingEvent> {
    None
}

/// Board services that are neither Bluetooth nor storage.
pub trait Platform {
    /// Bring up the network link used for status publication.
    fn start_network(&mut self) -> Result<()>;

    /// Reboot the controller. Does not return on hardware.
    fn restart(&mut self);
}

/// The concrete collaborators a manager is built from.
pub trait Board {
    type Store: KeyValueStore;
    type Transport: BtTransport;
    type Publisher: StatusPublisher;
    type Platform: Platform;
    type Indicator: OutputPin;
    type Delay: DelayNs;
}

pub struct Parts<B: Board> {
    pub store: B::Store,
    pub transport: B::Transport,
    pub publisher: B::Publisher,
    pub platform: B::Platform,
    pub indicator: B::Indicator,
    pub delay: B::Delay,
}

/// Link indicator output.
pub struct Indicator<P> {
    pin: P,
    active_high: bool,
    lit: bool,
}

impl<P: OutputPin> Indicator<P> {
    pub fn new(pin: P, active_high: bool) -> Self {
        let mut indicator = Self {
            pin,
            active_high,
            lit: false,
        };
        indicator.set(false);
        indicator
    }

    pub fn set(&mut self, on: bool) {
        let high = on == self.active_high;
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if result.is_err() {
            warn!("indicator: pin write failed");
            return;
        }
        self.lit = on;
    }

    pub fn is_lit(&self) -> bool {
        self.lit
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }
}

pub struct Manager<'q, B: Board> {
    queues: &'q Queues,
    config: Config,
    registry: Registry<B::Store>,
    pairing: PairingSession,
    supervisor: Supervisor,
    transport: B::Transport,
    publisher: B::Publisher,
    platform: B::Platform,
    indicator: Indicator<B::Indicator>,
    delay: B::Delay,
    button_map: ButtonMap,
    publishing: bool,
    announced_connected: bool,
    pairing_mode: bool,
}

impl<'q, B: Board> Manager<'q, B> {
    pub fn new(queues: &'q Queues, parts: Parts<B>, config: Config) -> Self {
        Self {
            queues,
            registry: Registry::new(parts.store),
            pairing: PairingSession::new(config.discovery_secs),
            supervisor: Supervisor::new(&config),
            transport: parts.transport,
            publisher: parts.publisher,
            platform: parts.platform,
            indicator: Indicator::new(parts.indicator, config.indicator_active_high),
            delay: parts.delay,
            button_map: no_button_actions,
            publishing: config.publish_on_boot,
            announced_connected: false,
            pairing_mode: false,
            config,
        }
    }

    pub fn with_button_map(mut self, map: ButtonMap) -> Self {
        self.button_map = map;
        self
    }

    /// Load the registry and, if configured, kick off periodic connect.
    pub async fn start(&mut self) {
        if let Err(e) = self.registry.load().await {
            error!("manager: registry load failed: {}", e);
        }
        if self.config.connect_on_boot && self.registry.count() > 0 {
            self.events().post(PendingEvent::StartConnection);
        }
    }

    /// Serve all queues forever.
    pub async fn run(&mut self) -> ! {
        let queues = self.queues;
        loop {
            match select3(
                queues.events.receive(),
                queues.stack.receive(),
                queues.commands.receive(),
            )
            .await
            {
                Either3::First(event) => self.dispatch(event).await,
                Either3::Second(event) => self.handle_stack_event(event).await,
                Either3::Third(command) => self.handle_command(command).await,
            }
        }
    }

    /// Handle one queued item without waiting. Returns `false` when every
    /// queue was empty.
    pub async fn poll_once(&mut self) -> bool {
        let queues = self.queues;
        if let Ok(event) = queues.events.try_receive() {
            self.dispatch(event).await;
        } else if let Ok(event) = queues.stack.try_receive() {
            self.handle_stack_event(event).await;
        } else if let Ok(command) = queues.commands.try_receive() {
            self.handle_command(command).await;
        } else {
            return false;
        }
        true
    }

    /// Handle queued items until all queues are empty. Returns the count.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while self.poll_once().await {
            handled += 1;
        }
        handled
    }

    // Exposed to collaborators

    pub fn post_event(&self, event: PendingEvent) -> bool {
        self.events().post(event)
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn registered_device_count(&self) -> u32 {
        self.registry.count()
    }

    pub fn registered_addresses_as_text(&self) -> AddressList {
        self.registry.list_addresses_as_text()
    }

    pub fn registry(&self) -> &Registry<B::Store> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry<B::Store> {
        &mut self.registry
    }

    pub fn pairing(&self) -> &PairingSession {
        &self.pairing
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn transport(&self) -> &B::Transport {
        &self.transport
    }

    pub fn publisher(&self) -> &B::Publisher {
        &self.publisher
    }

    pub fn platform(&self) -> &B::Platform {
        &self.platform
    }

    pub fn indicator(&self) -> &Indicator<B::Indicator> {
        &self.indicator
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    pub fn is_pairing_mode(&self) -> bool {
        self.pairing_mode
    }

    fn events(&self) -> EventSender<'q> {
        self.queues.events()
    }

    // Pending events

    pub async fn dispatch(&mut self, event: PendingEvent) {
        debug!("manager: dispatch {}", event);
        match event {
            PendingEvent::StartWifi => {
                self.publishing = true;
                if let Err(e) = self.platform.start_network() {
                    warn!("manager: network start failed: {}", e);
                }
            }
            PendingEvent::StopWifi => {
                info!("manager: network stop requested, restarting");
                self.platform.restart();
            }
            PendingEvent::PhoneConnected => {
                self.delay.delay_ms(self.config.connect_settle_delay_ms).await;
                let Some(active) = self.supervisor.active() else {
                    debug!("manager: link gone before settle delay ended");
                    return;
                };
                self.indicator.set(true);
                let mut text: String<17> = String::new();
                let _ = write!(text, "{}", active.remote);
                self.publish(StatusTopic::Connected, &text);
                self.announced_connected = true;
            }
            PendingEvent::PhoneDisconnected => {
                self.indicator.set(false);
                if self.announced_connected {
                    self.publish_disconnected();
                }
            }
            PendingEvent::StartConnection => {
                self.supervisor.set_periodic_enabled(true);
                if let Err(e) = self
                    .supervisor
                    .periodic_connect(&self.registry, &mut self.transport)
                {
                    warn!("manager: periodic connect failed: {}", e);
                }
            }
            PendingEvent::StopConnection => {
                self.publish_disconnected();
                self.supervisor.set_periodic_enabled(false);
                let events = self.events();
                self.supervisor.disconnect(&mut self.transport, &events);
            }
            PendingEvent::ShortPress(button) => self.on_button(button, PressKind::Short),
            PendingEvent::LongPress(button) => self.on_button(button, PressKind::Long),
        }
    }

    fn on_button(&mut self, button: ButtonId, kind: PressKind) {
        info!("manager: button {} {}", button, kind);
        if let Some(follow_up) = (self.button_map)(button, kind) {
            self.events().post(follow_up);
        }

        if !self.supervisor.is_connected() {
            return;
        }
        let mut message: String<12> = String::new();
        let label = match kind {
            PressKind::Short => "short",
            PressKind::Long => "long",
        };
        let _ = write!(message, "{}:{}", label, button);
        if let Err(e) = self.supervisor.send(message.as_bytes(), &mut self.transport) {
            warn!("manager: button notification failed: {}", e);
        }
    }

    // Bluetooth stack notifications

    pub async fn handle_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::DiscoveryResult(result) => {
                self.pairing
                    .on_discovery_result(&result, &mut self.transport);
            }
            StackEvent::DiscoveryStateChanged { running } => {
                if let Some(candidate) = self.pairing.on_discovery_state(running, &mut self.transport) {
                    self.hand_off(candidate);
                }
            }
            StackEvent::RemoteServices { address, success } => {
                if let Some(candidate) = self.pairing.on_remote_services(address, success) {
                    self.hand_off(candidate);
                }
            }
            StackEvent::ChannelsDiscovered { address, result } => {
                let cycle = self
                    .supervisor
                    .on_channels_discovered(address, result, &mut self.transport);
                if cycle {
                    self.supervisor
                        .cycle_next(&self.registry, &mut self.transport, &mut self.delay)
                        .await;
                }
            }
            StackEvent::AuthComplete {
                address,
                name,
                success,
            } => {
                match self
                    .pairing
                    .register_authenticated(&mut self.registry, address, &name, success)
                    .await
                {
                    Ok(AuthOutcome::Added | AuthOutcome::Renamed) => self.publish_paired_devices(),
                    Ok(_) => {}
                    Err(e) => error!("manager: registering {} failed: {}", address, e),
                }
            }
            StackEvent::Opened { handle, address } => {
                let events = self.events();
                if let Err(e) = self
                    .supervisor
                    .on_opened(handle, address, &mut self.transport, &events)
                {
                    warn!("manager: {}", e);
                }
            }
            StackEvent::Closed { handle, by_remote } => {
                let events = self.events();
                if self.supervisor.on_closed(handle, by_remote, &events) {
                    if let Err(e) = self
                        .supervisor
                        .periodic_connect(&self.registry, &mut self.transport)
                    {
                        warn!("manager: periodic connect failed: {}", e);
                    }
                }
            }
            StackEvent::ConnectFailed { address } => {
                let events = self.events();
                if self.supervisor.on_connect_failed(address, &events) {
                    if let Err(e) = self
                        .supervisor
                        .periodic_connect(&self.registry, &mut self.transport)
                    {
                        warn!("manager: periodic connect failed: {}", e);
                    }
                }
            }
            StackEvent::DataReceived { handle, data } => {
                debug!("manager: {} bytes on link {}", data.len(), handle);
            }
        }
    }

    fn hand_off(&mut self, candidate: Candidate) {
        info!("manager: handing {} to the supervisor", candidate.address);
        if let Err(e) = self
            .supervisor
            .connect_candidate(candidate.address, &mut self.transport)
        {
            warn!("manager: hand-off of {} failed: {}", candidate.address, e);
        }
    }

    // Remote commands

    pub async fn handle_command(&mut self, command: RemoteCommand) {
        info!("manager: remote command {}", command.status_topic());
        let topic = command.status_topic();
        match command {
            RemoteCommand::DeletePaired(target) => {
                let result = match target {
                    DeleteTarget::All => self.registry.remove_all().await,
                    DeleteTarget::Address(address) => self.registry.remove(address).await,
                    DeleteTarget::Name(name) => self.registry.remove_by_name(&name).await.map(|_| ()),
                };
                if let Err(e) = result {
                    warn!("manager: delete failed: {}", e);
                }
                self.publish(topic, outcome_text(&result));
                self.publish_paired_devices();
            }
            RemoteCommand::ResetDevice => {
                if let Err(e) = self.registry.remove_all().await {
                    error!("manager: wiping registry failed: {}", e);
                }
                self.publish(topic, "restarting");
                self.platform.restart();
            }
            RemoteCommand::StopDiscovery => {
                self.pairing.stop(&mut self.transport);
                self.publish(topic, "ok");
            }
            RemoteCommand::Connect(None) => {
                let queued = self.events().post(PendingEvent::StartConnection);
                self.publish(topic, if queued { "ok" } else { "busy" });
            }
            RemoteCommand::Connect(Some(index)) => {
                let result = self
                    .supervisor
                    .connect_to_registered(index, &self.registry, &mut self.transport)
                    .map(|_| ());
                if let Err(e) = result {
                    warn!("manager: connect to #{} failed: {}", index, e);
                }
                self.publish(topic, outcome_text(&result));
            }
            RemoteCommand::Disconnect => {
                let queued = self.events().post(PendingEvent::StopConnection);
                self.publish(topic, if queued { "ok" } else { "busy" });
            }
            RemoteCommand::SetPairingMode(on) => {
                let result = self.set_pairing_mode(on);
                let text = match result {
                    Ok(()) if on => "on",
                    Ok(()) => "off",
                    Err(_) => outcome_text(&result),
                };
                self.publish(topic, text);
            }
        }
    }

    /// Make the controller discoverable and start a session, or the reverse.
    pub fn set_pairing_mode(&mut self, on: bool) -> Result<()> {
        if let Err(e) = self.transport.set_discoverable(on) {
            warn!("manager: discoverable={} refused: {}", on, e);
        }
        if on {
            self.pairing.start(&mut self.transport)?;
        } else {
            self.pairing.stop(&mut self.transport);
        }
        self.pairing_mode = on;
        info!("manager: pairing mode {}", if on { "on" } else { "off" });
        Ok(())
    }

    // Status

    fn publish(&mut self, topic: StatusTopic, payload: &str) {
        if !self.publishing {
            debug!("manager: status {} not published, network down", topic);
            return;
        }
        let topic = topic.topic();
        if let Err(e) = self.publisher.publish(&topic, payload) {
            warn!("manager: publish failed: {}", e);
        }
    }

    fn publish_disconnected(&mut self) {
        self.publish(StatusTopic::Connected, crate::config::STATUS_DISCONNECTED);
        self.announced_connected = false;
    }

    fn publish_paired_devices(&mut self) {
        let list = self.registry.list_addresses_as_text();
        self.publish(StatusTopic::PairedDevices, &list);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bt::{BdAddr, DiscoveryResult, LinkHandle, Security, ServiceChannel, ServiceChannels};
    use crate::error::TransportError;
    use crate::storage::MemoryStore;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use std::string::{String as StdString, ToString};
    use std::vec::Vec;

    #[derive(Debug, PartialEq)]
    enum Call {
        Discoverable(bool),
        StartDiscovery,
        CancelDiscovery,
        Query(BdAddr),
        Channels(BdAddr),
        Connect(BdAddr, u8),
        Write(LinkHandle, StdString),
        Close(LinkHandle),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl BtTransport for Recorder {
        fn start_discovery(&mut self, _: u8) -> Result<(), TransportError> {
            self.calls.push(Call::StartDiscovery);
            Ok(())
        }
        fn cancel_discovery(&mut self) -> Result<(), TransportError> {
            self.calls.push(Call::CancelDiscovery);
            Ok(())
        }
        fn query_services(&mut self, address: BdAddr) -> Result<(), TransportError> {
            self.calls.push(Call::Query(address));
            Ok(())
        }
        fn discover_channels(&mut self, address: BdAddr) -> Result<(), TransportError> {
            self.calls.push(Call::Channels(address));
            Ok(())
        }
        fn connect(&mut self, address: BdAddr, channel: u8, _: Security) -> Result<(), TransportError> {
            self.calls.push(Call::Connect(address, channel));
            Ok(())
        }
        fn write(&mut self, handle: LinkHandle, data: &[u8]) -> Result<(), TransportError> {
            let text = core::str::from_utf8(data).unwrap_or("?").to_string();
            self.calls.push(Call::Write(handle, text));
            Ok(())
        }
        fn close(&mut self, handle: LinkHandle) -> Result<(), TransportError> {
            self.calls.push(Call::Close(handle));
            Ok(())
        }
        fn set_discoverable(&mut self, on: bool) -> Result<(), TransportError> {
            self.calls.push(Call::Discoverable(on));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Published(Vec<(StdString, StdString)>);

    impl Published {
        fn last_on(&self, name: &str) -> Option<&str> {
            let topic = std::format!("stat/bt_door_key/{}", name);
            self.0
                .iter()
                .rev()
                .find(|(t, _)| *t == topic)
                .map(|(_, p)| p.as_str())
        }
    }

    impl StatusPublisher for Published {
        fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
            self.0.push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Host {
        network_starts: u32,
        restarts: u32,
    }

    impl Platform for Host {
        fn start_network(&mut self) -> Result<()> {
            self.network_starts += 1;
            Ok(())
        }
        fn restart(&mut self) {
            self.restarts += 1;
        }
    }

    #[derive(Default)]
    struct Led {
        high: bool,
    }

    impl embedded_hal::digital::ErrorType for Led {
        type Error = Infallible;
    }

    impl OutputPin for Led {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    struct TestBoard;

    impl Board for TestBoard {
        type Store = MemoryStore;
        type Transport = Recorder;
        type Publisher = Published;
        type Platform = Host;
        type Indicator = Led;
        type Delay = NoDelay;
    }

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    fn manager(queues: &Queues, devices: u8) -> Manager<'_, TestBoard> {
        let parts = Parts::<TestBoard> {
            store: MemoryStore::new(),
            transport: Recorder::default(),
            publisher: Published::default(),
            platform: Host::default(),
            indicator: Led::default(),
            delay: NoDelay,
        };
        let mut m = Manager::new(queues, parts, Config::default());
        block_on(m.start());
        for i in 0..devices {
            block_on(m.registry_mut().add(addr(i), "phone")).unwrap();
        }
        m
    }

    fn calls<'a>(m: &'a Manager<'_, TestBoard>) -> &'a [Call] {
        &m.transport().calls
    }

    fn matching_channels() -> ServiceChannels {
        let mut list = ServiceChannels::new();
        list.push(ServiceChannel::new(5, "BT_DOOR_KEY")).unwrap();
        list
    }

    #[test]
    fn start_connection_searches_first_device() {
        let queues = Queues::new();
        let mut m = manager(&queues, 2);
        m.post_event(PendingEvent::StartConnection);
        assert_eq!(block_on(m.drain()), 1);
        assert_eq!(calls(&m), [Call::Channels(addr(0))]);
        assert!(m.supervisor().is_periodic_enabled());
    }

    #[test]
    fn failed_search_moves_to_next_device() {
        let queues = Queues::new();
        let mut m = manager(&queues, 2);
        m.post_event(PendingEvent::StartConnection);
        block_on(m.drain());
        queues.stack().post(StackEvent::ChannelsDiscovered {
            address: addr(0),
            result: Err(TransportError::Status(3)),
        });
        block_on(m.drain());
        assert_eq!(calls(&m).last(), Some(&Call::Channels(addr(1))));
    }

    #[test]
    fn open_link_lights_indicator_and_publishes_address() {
        let queues = Queues::new();
        let mut m = manager(&queues, 1);
        m.post_event(PendingEvent::StartWifi);
        m.post_event(PendingEvent::StartConnection);
        block_on(m.drain());
        queues.stack().post(StackEvent::ChannelsDiscovered {
            address: addr(0),
            result: Ok(matching_channels()),
        });
        queues.stack().post(StackEvent::Opened {
            handle: 9,
            address: addr(0),
        });
        block_on(m.drain());

        assert!(m.is_connected());
        assert!(m.indicator().is_lit());
        assert!(m.indicator().pin().high);
        assert_eq!(m.publisher().last_on("connected"), Some("AA:BB:CC:DD:EE:00"));
        assert_eq!(m.platform().network_starts, 1);
    }

    #[test]
    fn status_is_not_published_before_network_start() {
        let queues = Queues::new();
        let mut m = manager(&queues, 1);
        m.post_event(PendingEvent::StartConnection);
        block_on(m.drain());
        queues.stack().post(StackEvent::Opened {
            handle: 1,
            address: addr(0),
        });
        block_on(m.drain());
        assert!(m.indicator().is_lit());
        assert!(m.publisher().0.is_empty());
    }

    #[test]
    fn failed_connect_moves_to_next_device() {
        let queues = Queues::new();
        let mut m = manager(&queues, 2);
        m.post_event(PendingEvent::StartConnection);
        block_on(m.drain());
        queues.stack().post(StackEvent::ChannelsDiscovered {
            address: addr(0),
            result: Ok(matching_channels()),
        });
        queues.stack().post(StackEvent::ConnectFailed { address: addr(0) });
        block_on(m.drain());
        assert!(!m.is_connected());
        assert_eq!(calls(&m).last(), Some(&Call::Channels(addr(1))));
    }

    #[test]
    fn remote_close_restarts_periodic_connect() {
        let queues = Queues::new();
        let mut m = manager(&queues, 2);
        m.post_event(PendingEvent::StartWifi);
        m.post_event(PendingEvent::StartConnection);
        block_on(m.drain());
        queues.stack().post(StackEvent::Opened {
            handle: 1,
            address: addr(0),
        });
        block_on(m.drain());

        queues.stack().post(StackEvent::Closed {
            handle: 1,
            by_remote: true,
        });
        block_on(m.drain());
        assert!(!m.is_connected());
        assert!(!m.indicator().is_lit());
        assert_eq!(m.publisher().last_on("connected"), Some("disconnected"));
        assert_eq!(calls(&m).last(), Some(&Call::Channels(addr(1))));
    }

    #[test]
    fn stop_connection_closes_link_and_stops_cycling() {
        let queues = Queues::new();
        let mut m = manager(&queues, 2);
        m.post_event(PendingEvent::StartConnection);
        block_on(m.drain());
        queues.stack().post(StackEvent::Opened {
            handle: 4,
            address: addr(0),
        });
        block_on(m.drain());

        m.post_event(PendingEvent::StopConnection);
        block_on(m.drain());
        assert_eq!(calls(&m).last(), Some(&Call::Close(4)));
        assert!(!m.supervisor().is_periodic_enabled());

        queues.stack().post(StackEvent::Closed {
            handle: 4,
            by_remote: false,
        });
        block_on(m.drain());
        assert!(!m.is_connected());
        assert_eq!(calls(&m).last(), Some(&Call::Close(4)));
    }

    #[test]
    fn pairing_flow_hands_candidate_to_supervisor_and_registers() {
        let queues = Queues::new();
        let mut m = manager(&queues, 0);
        m.post_event(PendingEvent::StartWifi);
        block_on(m.drain());
        m.set_pairing_mode(true).unwrap();

        let phone = DiscoveryResult::new(addr(7)).with_class(0x5A020C).with_name("Pixel");
        queues.stack().post(StackEvent::DiscoveryResult(phone));
        queues.stack().post(StackEvent::DiscoveryStateChanged { running: false });
        queues.stack().post(StackEvent::RemoteServices {
            address: addr(7),
            success: true,
        });
        block_on(m.drain());
        assert_eq!(
            calls(&m),
            [
                Call::Discoverable(true),
                Call::StartDiscovery,
                Call::CancelDiscovery,
                Call::Query(addr(7)),
                Call::Channels(addr(7)),
            ]
        );

        queues.stack().post(StackEvent::AuthComplete {
            address: addr(7),
            name: crate::bt::device_name(""),
            success: true,
        });
        block_on(m.drain());
        assert_eq!(m.registered_device_count(), 1);
        assert_eq!(m.registry().nth(0).unwrap().name.as_str(), "Pixel");
        assert_eq!(m.publisher().last_on("paired_devices"), Some("AA:BB:CC:DD:EE:07"));
    }

    #[test]
    fn repeated_auth_does_not_duplicate() {
        let queues = Queues::new();
        let mut m = manager(&queues, 0);
        for _ in 0..2 {
            queues.stack().post(StackEvent::AuthComplete {
                address: addr(1),
                name: crate::bt::device_name("Phone"),
                success: true,
            });
        }
        block_on(m.drain());
        assert_eq!(m.registered_device_count(), 1);
    }

    #[test]
    fn pairing_mode_twice_is_busy() {
        let queues = Queues::new();
        let mut m = manager(&queues, 0);
        m.set_pairing_mode(true).unwrap();
        assert_eq!(m.set_pairing_mode(true), Err(crate::error::Error::DiscoveryBusy));
        m.set_pairing_mode(false).unwrap();
        assert!(!m.is_pairing_mode());
        assert!(!m.pairing().is_active());
    }

    #[test]
    fn button_press_is_forwarded_to_companion() {
        fn long_press_connects(button: ButtonId, kind: PressKind) -> Option<PendingEvent> {
            (button == 0 && kind == PressKind::Long).then_some(PendingEvent::StartConnection)
        }

        let queues = Queues::new();
        let mut m = manager(&queues, 1).with_button_map(long_press_connects);
        m.post_event(PendingEvent::ShortPress(2));
        block_on(m.drain());
        assert!(calls(&m).is_empty());

        m.post_event(PendingEvent::LongPress(0));
        block_on(m.drain());
        assert_eq!(calls(&m), [Call::Channels(addr(0))]);

        queues.stack().post(StackEvent::Opened {
            handle: 2,
            address: addr(0),
        });
        block_on(m.drain());
        m.post_event(PendingEvent::ShortPress(3));
        block_on(m.drain());
        assert_eq!(calls(&m).last(), Some(&Call::Write(2, "short:3".to_string())));
    }

    #[test]
    fn remote_delete_all_clears_registry() {
        let queues = Queues::new();
        let mut m = manager(&queues, 3);
        m.post_event(PendingEvent::StartWifi);
        queues
            .commands()
            .post_message("cmd/bt_door_key/delete_paired", b"all")
            .unwrap();
        block_on(m.drain());
        assert_eq!(m.registered_device_count(), 0);
        assert_eq!(m.publisher().last_on("delete_paired"), Some("ok"));
        assert_eq!(m.publisher().last_on("paired_devices"), Some(""));
    }

    #[test]
    fn remote_delete_unknown_name_reports_not_found() {
        let queues = Queues::new();
        let mut m = manager(&queues, 1);
        m.post_event(PendingEvent::StartWifi);
        queues
            .commands()
            .post_message("cmd/bt_door_key/delete_paired", b"Nokia")
            .unwrap();
        block_on(m.drain());
        assert_eq!(m.registered_device_count(), 1);
        assert_eq!(m.publisher().last_on("delete_paired"), Some("not_found"));
    }

    #[test]
    fn reset_device_wipes_and_restarts() {
        let queues = Queues::new();
        let mut m = manager(&queues, 2);
        queues.commands().post(RemoteCommand::ResetDevice).unwrap();
        block_on(m.drain());
        assert_eq!(m.registered_device_count(), 0);
        assert_eq!(m.platform().restarts, 1);
    }

    #[test]
    fn stop_wifi_restarts() {
        let queues = Queues::new();
        let mut m = manager(&queues, 0);
        m.post_event(PendingEvent::StopWifi);
        block_on(m.drain());
        assert_eq!(m.platform().restarts, 1);
    }

    #[test]
    fn connect_on_boot_posts_start_connection() {
        let queues = Queues::new();
        let mut reg = Registry::new(MemoryStore::new());
        block_on(reg.load()).unwrap();
        block_on(reg.add(addr(0), "phone")).unwrap();
        let store = reg.into_store();
        let parts = Parts::<TestBoard> {
            store,
            transport: Recorder::default(),
            publisher: Published::default(),
            platform: Host::default(),
            indicator: Led::default(),
            delay: NoDelay,
        };
        let config = Config {
            connect_on_boot: true,
            ..Config::default()
        };
        let mut m = Manager::new(&queues, parts, config);
        block_on(m.start());
        block_on(m.drain());
        assert_eq!(calls(&m), [Call::Channels(addr(0))]);
    }
}
