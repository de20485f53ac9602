//! IO Board Serial Loader.
//!
//! Reads and writes the pattern configuration of an IO expansion board and
//! updates its firmware through the serial bootloader.

use core::fmt;

#[macro_use]
extern crate log;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use thiserror::Error;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod config;
pub mod hex;
pub mod iob;
pub mod programmer;
pub mod progress;
pub mod protocol;

pub use config::{DeviceImage, FlightMode, OutputMask, PatternSlot, PatternTable};
pub use hex::FirmwareImage;
pub use programmer::{Configuration, Programmer};
pub use progress::{Progress, ProgressEvent};
pub use protocol::Bootloader;

/// Serial port with control over the modem lines used to reset the board
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Errors from a programmer operation, `E` is the bootloader error type
#[derive(Debug, Error)]
pub enum Error<E: fmt::Debug> {
    /// The serial connection could not be opened
    #[error("unable to open serial port: {0:?}")]
    Io(E),

    /// The bootloader did not answer the handshake, nothing was transferred
    #[error("no response from bootloader")]
    HandshakeFailed,

    /// Exchange with the device failed after a successful handshake
    #[error("transfer failed: {0:?}")]
    Transfer(E),

    /// The bootloader completed the exchange but reported failure
    #[error("device rejected the transfer")]
    Rejected,

    /// Firmware image could not be decoded, the device was not touched
    #[error("invalid firmware image: {0}")]
    Image(#[from] hex::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] config::Error),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Serial port baud rate
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "57600"))]
    pub baud: u32,

    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Page size for memory and flash writes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "128"))]
    pub page_size: usize,

    /// Duration to hold the reset line
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub reset_pulse_ms: u32,

    /// Period to wait for bootloader start after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            baud: protocol::DEFAULT_BAUD,
            no_reset: false,
            page_size: protocol::FLASH_PAGE_SIZE,
            reset_pulse_ms: 100,
            init_delay_ms: 50,
        }
    }
}

/// Pulse DTR / RTS to reset the board into its bootloader
pub fn reset<P, D, E>(port: &mut P, delay: &mut D, options: &Options) -> Result<(), E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
{
    debug!("Resetting device");

    port.set_dtr(true)?;
    port.set_rts(true)?;

    delay.delay_ms(options.reset_pulse_ms);

    port.set_dtr(false)?;
    port.set_rts(false)?;

    delay.delay_ms(options.init_delay_ms);

    Ok(())
}

/// Drop anything already received, returning the number of bytes discarded
pub fn discard_input<P, E>(port: &mut P) -> Result<usize, E>
where
    P: SerialPort<E>,
{
    let mut n = 0;

    loop {
        match port.read() {
            Ok(_) => n += 1,
            Err(nb::Error::WouldBlock) => break,
            Err(nb::Error::Other(e)) => return Err(e),
        }
    }

    if n > 0 {
        debug!("Discarded {} bytes of pending input", n);
    }

    Ok(n)
}
