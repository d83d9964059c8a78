//! bt-door-key firmware for the nRF52840-DK.
//!
//! Task layout:
//!   - `softdevice_task` - runs the SoftDevice event loop,
//!   - `bluetooth_task`  - serves transport requests, posts stack events,
//!   - `button_task` x4, `switch_task` x2 - GPIO edges into pending events,
//!   - main              - the manager, sole consumer of every queue.

#![no_std]
#![no_main]

mod hw;

use core::mem;

use bt_door_key::config::{Config, BUTTON_DEBOUNCE_MS};
use bt_door_key::event::{PendingEvent, Queues};
use bt_door_key::input::{SwitchInput, Timing};
use bt_door_key::manager::{Manager, Parts};
use defmt::info;
use embassy_executor::Spawner;
use embassy_nrf::gpio::{Level, Output, OutputDrive, Pin};
use embassy_nrf::interrupt::Priority;
use embassy_time::Delay;
use nrf_softdevice::{raw, Softdevice};
use {defmt_rtt as _, panic_probe as _};

use crate::hw::board::{DoorKeyBoard, NrfPlatform, RttStatus};
use crate::hw::buttons::{button_task, switch_task};
use crate::hw::flash::FlashStore;
use crate::hw::softdevice::{bt_task, SoftdeviceTransport};

static QUEUES: Queues = Queues::new();

const GAP_DEVICE_NAME: &[u8] = b"BtDoorKey";

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn bluetooth_task(sd: &'static Softdevice) -> ! {
    bt_task(sd, QUEUES.stack()).await
}

fn softdevice_config() -> nrf_softdevice::Config {
    nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_RC as u8,
            rc_ctiv: 16,
            rc_temp_ctiv: 2,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_500_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 128 }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 0,
            periph_role_count: 0,
            central_role_count: 1,
            central_sec_count: 1,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        gap_device_name: Some(raw::ble_gap_cfg_device_name_t {
            p_value: GAP_DEVICE_NAME.as_ptr() as _,
            current_len: GAP_DEVICE_NAME.len() as u16,
            max_len: GAP_DEVICE_NAME.len() as u16,
            write_perm: unsafe { mem::zeroed() },
            _bitfield_1: raw::ble_gap_cfg_device_name_t::new_bitfield_1(raw::BLE_GATTS_VLOC_STACK as u8),
        }),
        ..Default::default()
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("bt-door-key starting");

    // Interrupt priorities 0, 1 and 4 belong to the SoftDevice.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = Priority::P2;
    nrf_config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(nrf_config);

    let sd = Softdevice::enable(&softdevice_config());
    spawner.must_spawn(softdevice_task(sd));
    spawner.must_spawn(bluetooth_task(sd));

    let config = Config::default();
    let timing = Timing::from(&config);
    let events = QUEUES.events();

    for (id, pin) in [
        p.P0_11.degrade(),
        p.P0_12.degrade(),
        p.P0_24.degrade(),
        p.P0_25.degrade(),
    ]
    .into_iter()
    .enumerate()
    {
        spawner.must_spawn(button_task(pin, id as u8, timing, events));
    }

    let network = SwitchInput::new(PendingEvent::StartWifi, PendingEvent::StopWifi, BUTTON_DEBOUNCE_MS);
    let connection = SwitchInput::new(
        PendingEvent::StartConnection,
        PendingEvent::StopConnection,
        BUTTON_DEBOUNCE_MS,
    );
    spawner.must_spawn(switch_task(p.P0_03.degrade(), network, events));
    spawner.must_spawn(switch_task(p.P0_04.degrade(), connection, events));

    // LED1 is active-low; start dark.
    let led = Output::new(p.P0_13, Level::High, OutputDrive::Standard);

    let parts = Parts::<DoorKeyBoard> {
        store: FlashStore::new(nrf_softdevice::Flash::take(sd)),
        transport: SoftdeviceTransport,
        publisher: RttStatus,
        platform: NrfPlatform,
        indicator: led,
        delay: Delay,
    };
    let config = Config {
        indicator_active_high: false,
        connect_on_boot: true,
        ..config
    };

    let mut manager = Manager::new(&QUEUES, parts, config);
    manager.start().await;
    info!("{} registered devices", manager.registered_device_count());
    manager.run().await
}
