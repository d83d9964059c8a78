//! Board glue: the concrete collaborators the manager runs with on the
//! nRF52840-DK.

use bt_door_key::error::Result;
use bt_door_key::manager::{Board, Platform};
use bt_door_key::remote::StatusPublisher;
use defmt::{info, warn};
use embassy_nrf::gpio::Output;
use embassy_time::Delay;

use super::flash::FlashStore;
use super::softdevice::SoftdeviceTransport;

/// No network client runs on this board; status goes to RTT instead.
pub struct RttStatus;

impl StatusPublisher for RttStatus {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        info!("status {=str} = {=str}", topic, payload);
        Ok(())
    }
}

pub struct NrfPlatform;

impl Platform for NrfPlatform {
    fn start_network(&mut self) -> Result<()> {
        warn!("network start requested, status is mirrored to RTT only");
        Ok(())
    }

    fn restart(&mut self) {
        info!("restarting");
        cortex_m::peripheral::SCB::sys_reset();
    }
}

pub struct DoorKeyBoard;

impl Board for DoorKeyBoard {
    type Store = FlashStore<nrf_softdevice::Flash>;
    type Transport = SoftdeviceTransport;
    type Publisher = RttStatus;
    type Platform = NrfPlatform;
    type Indicator = Output<'static>;
    type Delay = Delay;
}
