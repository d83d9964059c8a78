//! nRF52840 implementations of the library's seams.

pub mod board;
pub mod buttons;
pub mod flash;
pub mod softdevice;
