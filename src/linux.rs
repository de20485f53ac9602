use std::io::ErrorKind as IoErrorKind;
use std::path::Path;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::{Options, SerialPort};

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        ErrorKind::Io(k) => k,
        ErrorKind::NoDevice => IoErrorKind::NotFound,
        ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

/// Open a serial port for the board bootloader.
///
/// Configures 8N1 at `options.baud`, then pulses the reset line unless
/// `options.no_reset` is set and discards whatever the board printed while
/// starting.
pub fn open<P: AsRef<Path>>(port: P, options: &Options) -> Result<Serial, SerialError> {
    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(options.baud as usize))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;

    if !options.no_reset {
        crate::reset(&mut port, &mut Delay {}, options)
            .map_err(|k| SerialError::new(ErrorKind::Io(k), "reset failed"))?;
    }

    crate::discard_input(&mut port)
        .map_err(|k| SerialError::new(ErrorKind::Io(k), "flushing input failed"))?;

    Ok(port)
}
