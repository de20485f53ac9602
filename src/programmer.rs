//! Operation sequencing against a [`Bootloader`].
//!
//! Every operation opens its own connection, performs the handshake, runs a
//! single transfer and closes the connection again before returning.

use crate::config::{DeviceImage, InvalidFlightMode, PatternTable};
use crate::hex::{self, FirmwareImage};
use crate::progress::{Progress, ProgressEvent};
use crate::protocol::{Bootloader, CONFIG_WRITE_LEN, EEPROM_SIZE, START_ADDRESS, WRITE_FLAGS};
use crate::{Error, Options};

/// Configuration read back from a board
#[derive(Clone, PartialEq, Debug)]
pub struct Configuration {
    /// Complete EEPROM contents as read
    pub image: DeviceImage,
    pub table: PatternTable,
    /// Slots whose flight mode byte was not recognised (loaded as the default mode)
    pub invalid: Vec<InvalidFlightMode>,
}

/// Open connection, closed when dropped
struct Session<'a, B: Bootloader> {
    bootloader: &'a mut B,
    conn: B::Connection,
}

impl<'a, B: Bootloader> Session<'a, B> {
    fn open(bootloader: &'a mut B, port: &str, options: &Options) -> Result<Self, Error<B::Error>> {
        debug!("Opening {} at {} baud", port, options.baud);

        let conn = bootloader
            .open(port, options.baud, !options.no_reset)
            .map_err(Error::Io)?;

        Ok(Self { bootloader, conn })
    }

    fn handshake(&mut self) -> Result<(), Error<B::Error>> {
        debug!("Awaiting bootloader response");

        if self.bootloader.connect(&mut self.conn) {
            debug!("Bootloader connected");
            Ok(())
        } else {
            error!("No response from bootloader");
            Err(Error::HandshakeFailed)
        }
    }
}

impl<'a, B: Bootloader> Drop for Session<'a, B> {
    fn drop(&mut self) {
        debug!("Closing connection");
        self.bootloader.close(&mut self.conn);
    }
}

pub struct Programmer<B> {
    bootloader: B,
    port: String,
    options: Options,
    progress: Progress,
}

impl<B: Bootloader> Programmer<B> {
    /// Create a new programmer for the board on `port`
    pub fn new(bootloader: B, port: &str, options: Options) -> Self {
        Self {
            bootloader,
            port: port.to_string(),
            options,
            progress: Progress::none(),
        }
    }

    /// Set the observer for progress events
    pub fn set_progress(&mut self, progress: Progress) {
        self.progress = progress;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the underlying bootloader
    pub fn into_inner(self) -> B {
        self.bootloader
    }

    /// Read the EEPROM and decode the pattern table
    pub fn read_configuration(&mut self) -> Result<Configuration, Error<B::Error>> {
        self.progress.emit(ProgressEvent::Connecting);

        let res = self.read_eeprom();
        self.report(&res);

        let image = DeviceImage::from_bytes(&res?);
        let decoded = image.decode();

        Ok(Configuration {
            image,
            table: decoded.table,
            invalid: decoded.invalid,
        })
    }

    /// Write the pattern table to the board.
    ///
    /// The table is applied over `base` (usually the image from a previous
    /// read) so the remaining EEPROM bytes are preserved, or over a zeroed
    /// image if none is given. Returns the image that was written.
    pub fn write_configuration(
        &mut self,
        table: &PatternTable,
        base: Option<&DeviceImage>,
    ) -> Result<DeviceImage, Error<B::Error>> {
        let mut image = base.cloned().unwrap_or_default();
        image.apply(table);

        self.progress.emit(ProgressEvent::Connecting);

        let res = self.write_eeprom(&image.as_bytes()[..CONFIG_WRITE_LEN]);
        self.report(&res);

        res.map(|_| image)
    }

    /// Clear the whole EEPROM
    pub fn reset_configuration(&mut self) -> Result<(), Error<B::Error>> {
        let image = DeviceImage::default();

        self.progress.emit(ProgressEvent::Connecting);

        let res = self.write_eeprom(image.as_bytes());
        self.report(&res);

        res
    }

    /// Decode a hex file and program it into flash.
    ///
    /// Decode failures are returned as [`Error::Image`] before the port is opened.
    pub fn update_firmware<I, S>(&mut self, lines: I) -> Result<FirmwareImage, Error<B::Error>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines: Vec<S> = lines.into_iter().collect();
        let total = lines.iter().map(|l| l.as_ref().len() + 1).sum();

        let progress = &mut self.progress;
        let image = hex::decode_with_progress(&lines, total, |fraction| {
            progress.emit(ProgressEvent::Decoding { fraction })
        })
        .map_err(|e| {
            error!("Firmware decode failed: {}", e);
            Error::Image(e)
        })?;

        self.flash(&image)?;

        Ok(image)
    }

    /// Program a decoded image into flash
    pub fn flash(&mut self, image: &FirmwareImage) -> Result<(), Error<B::Error>> {
        self.progress.emit(ProgressEvent::Connecting);

        let res = self.write_flash(image.as_bytes());
        self.report(&res);

        res
    }

    fn report<T>(&mut self, res: &Result<T, Error<B::Error>>) {
        match res {
            Ok(_) => self.progress.emit(ProgressEvent::Finished),
            Err(e) => {
                error!("Operation failed: {}", e);
                self.progress.emit(ProgressEvent::Failed)
            }
        }
    }

    fn read_eeprom(&mut self) -> Result<Vec<u8>, Error<B::Error>> {
        let mut session = Session::open(&mut self.bootloader, &self.port, &self.options)?;
        session.handshake()?;
        self.progress.emit(ProgressEvent::Connected);

        debug!("Reading {} bytes of EEPROM", EEPROM_SIZE);
        self.progress.emit(ProgressEvent::Reading { bytes: EEPROM_SIZE });

        let data = session
            .bootloader
            .read_memory(&mut session.conn, EEPROM_SIZE)
            .map_err(Error::Transfer)?;

        Ok(data)
    }

    fn write_eeprom(&mut self, data: &[u8]) -> Result<(), Error<B::Error>> {
        let mut session = Session::open(&mut self.bootloader, &self.port, &self.options)?;
        session.handshake()?;
        self.progress.emit(ProgressEvent::Connected);

        debug!("Writing {} bytes of EEPROM", data.len());
        self.progress.emit(ProgressEvent::Writing { bytes: data.len() });

        let ok = session
            .bootloader
            .write_memory(
                &mut session.conn,
                data,
                START_ADDRESS,
                self.options.page_size,
                WRITE_FLAGS,
            )
            .map_err(Error::Transfer)?;

        if ok {
            Ok(())
        } else {
            Err(Error::Rejected)
        }
    }

    fn write_flash(&mut self, data: &[u8]) -> Result<(), Error<B::Error>> {
        let mut session = Session::open(&mut self.bootloader, &self.port, &self.options)?;
        session.handshake()?;
        self.progress.emit(ProgressEvent::Connected);

        debug!("Programming {} bytes of flash", data.len());
        self.progress.emit(ProgressEvent::Writing { bytes: data.len() });

        let progress = &mut self.progress;
        let ok = session
            .bootloader
            .write_flash(
                &mut session.conn,
                data,
                START_ADDRESS,
                self.options.page_size,
                WRITE_FLAGS,
                &mut |percent| progress.emit(ProgressEvent::Flashing { percent }),
            )
            .map_err(Error::Transfer)?;

        if ok {
            Ok(())
        } else {
            Err(Error::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::FlightMode;

    #[derive(Clone, PartialEq, Debug)]
    enum Call {
        Open { port: String, baud: u32, reset: bool },
        Connect,
        Read(usize),
        WriteMemory { len: usize, start: u32, page_size: usize },
        WriteFlash { len: usize },
        Close,
    }

    #[derive(Debug, PartialEq)]
    enum MockError {
        NoPort,
        Timeout,
    }

    #[derive(Default)]
    struct MockBootloader {
        calls: Vec<Call>,
        open_fails: bool,
        handshake_fails: bool,
        transfer_fails: bool,
        reject: bool,
        panic_on_transfer: bool,
        eeprom: Vec<u8>,
        written: Vec<u8>,
    }

    impl Bootloader for MockBootloader {
        type Connection = ();
        type Error = MockError;

        fn open(&mut self, port: &str, baud: u32, reset: bool) -> Result<(), MockError> {
            self.calls.push(Call::Open {
                port: port.to_string(),
                baud,
                reset,
            });
            match self.open_fails {
                true => Err(MockError::NoPort),
                false => Ok(()),
            }
        }

        fn connect(&mut self, _conn: &mut ()) -> bool {
            self.calls.push(Call::Connect);
            !self.handshake_fails
        }

        fn read_memory(&mut self, _conn: &mut (), len: usize) -> Result<Vec<u8>, MockError> {
            self.calls.push(Call::Read(len));
            if self.panic_on_transfer {
                panic!("port went away");
            }
            match self.transfer_fails {
                true => Err(MockError::Timeout),
                false => Ok(self.eeprom.clone()),
            }
        }

        fn write_memory(
            &mut self,
            _conn: &mut (),
            data: &[u8],
            start: u32,
            page_size: usize,
            _flags: u32,
        ) -> Result<bool, MockError> {
            self.calls.push(Call::WriteMemory {
                len: data.len(),
                start,
                page_size,
            });
            if self.transfer_fails {
                return Err(MockError::Timeout);
            }
            self.written = data.to_vec();
            Ok(!self.reject)
        }

        fn write_flash(
            &mut self,
            _conn: &mut (),
            data: &[u8],
            _start: u32,
            _page_size: usize,
            _flags: u32,
            progress: &mut dyn FnMut(u8),
        ) -> Result<bool, MockError> {
            self.calls.push(Call::WriteFlash { len: data.len() });
            if self.panic_on_transfer {
                panic!("port went away");
            }
            for p in [0u8, 50, 100].iter() {
                progress(*p);
            }
            if self.transfer_fails {
                return Err(MockError::Timeout);
            }
            self.written = data.to_vec();
            Ok(!self.reject)
        }

        fn close(&mut self, _conn: &mut ()) {
            self.calls.push(Call::Close);
        }
    }

    fn programmer(mock: MockBootloader) -> Programmer<MockBootloader> {
        Programmer::new(mock, "/dev/ttyUSB0", Options::default())
    }

    fn recorded(p: &mut Programmer<MockBootloader>) -> Arc<Mutex<Vec<ProgressEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        p.set_progress(Progress::new(move |ev| e.lock().unwrap().push(ev)));
        events
    }

    fn sample_eeprom() -> Vec<u8> {
        let mut t = PatternTable::default();
        t.slot_mut(2).unwrap().flight_mode = FlightMode::Land;
        let mut raw = DeviceImage::with_patterns(&t).as_bytes().to_vec();
        raw[200] = 0xAB;
        raw
    }

    const HEX: [&str; 2] = [":10000000214601360121470136007EFE09D2190141", ":00000001FF"];

    #[test]
    fn read_configuration() {
        let mut p = programmer(MockBootloader {
            eeprom: sample_eeprom(),
            ..Default::default()
        });
        let events = recorded(&mut p);

        let c = p.read_configuration().unwrap();
        assert_eq!(c.table.slot(1).unwrap().mask.bits(), 0xF000);
        assert_eq!(c.table.slot(2).unwrap().flight_mode, FlightMode::Land);
        assert!(c.invalid.is_empty());
        assert_eq!(c.image.as_bytes()[200], 0xAB);

        let mock = p.into_inner();
        assert_eq!(
            mock.calls,
            vec![
                Call::Open {
                    port: "/dev/ttyUSB0".to_string(),
                    baud: 57600,
                    reset: true
                },
                Call::Connect,
                Call::Read(EEPROM_SIZE),
                Call::Close
            ]
        );

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ProgressEvent::Connecting,
                ProgressEvent::Connected,
                ProgressEvent::Reading { bytes: EEPROM_SIZE },
                ProgressEvent::Finished
            ]
        );
    }

    #[test]
    fn read_reports_invalid_flight_modes() {
        let mut eeprom = vec![0u8; EEPROM_SIZE];
        eeprom[64 + 2 * 5] = 20;

        let mut p = programmer(MockBootloader {
            eeprom,
            ..Default::default()
        });

        let c = p.read_configuration().unwrap();
        assert_eq!(c.invalid, vec![InvalidFlightMode { slot: 6, value: 20 }]);
    }

    #[test]
    fn handshake_failure_skips_read() {
        let mut p = programmer(MockBootloader {
            handshake_fails: true,
            ..Default::default()
        });
        let events = recorded(&mut p);

        assert!(matches!(p.read_configuration(), Err(Error::HandshakeFailed)));
        assert_eq!(events.lock().unwrap().last(), Some(&ProgressEvent::Failed));

        let mock = p.into_inner();
        assert!(!mock.calls.iter().any(|c| matches!(c, Call::Read(_))));
        assert_eq!(mock.calls.last(), Some(&Call::Close));
    }

    #[test]
    fn open_failure_is_io_error() {
        let mut p = programmer(MockBootloader {
            open_fails: true,
            ..Default::default()
        });

        assert!(matches!(p.read_configuration(), Err(Error::Io(MockError::NoPort))));

        // Nothing was opened, nothing to close
        let mock = p.into_inner();
        assert_eq!(mock.calls.len(), 1);
    }

    #[test]
    fn read_failure_is_transfer_error() {
        let mut p = programmer(MockBootloader {
            transfer_fails: true,
            ..Default::default()
        });

        assert!(matches!(
            p.read_configuration(),
            Err(Error::Transfer(MockError::Timeout))
        ));
        assert_eq!(p.into_inner().calls.last(), Some(&Call::Close));
    }

    #[test]
    fn connection_closed_on_panic() {
        let mut p = programmer(MockBootloader {
            panic_on_transfer: true,
            ..Default::default()
        });

        let res = catch_unwind(AssertUnwindSafe(|| p.read_configuration()));
        assert!(res.is_err());

        let mock = p.into_inner();
        assert_eq!(mock.calls.last(), Some(&Call::Close));
    }

    #[test]
    fn write_configuration_writes_prefix() {
        let mut p = programmer(MockBootloader::default());

        let mut t = PatternTable::default();
        t.slot_mut(16).unwrap().flight_mode = FlightMode::FlyByWireB;

        let image = p.write_configuration(&t, None).unwrap();
        assert_eq!(image.decode().table, t);

        let mock = p.into_inner();
        assert_eq!(
            mock.calls[2],
            Call::WriteMemory {
                len: CONFIG_WRITE_LEN,
                start: 0,
                page_size: 128
            }
        );
        assert_eq!(mock.calls.last(), Some(&Call::Close));
        assert_eq!(&mock.written[..], &image.as_bytes()[..CONFIG_WRITE_LEN]);
        assert_eq!(&mock.written[0..2], &[0xF0, 0x00]);
        assert_eq!(&mock.written[94..96], &[13, 13]);
    }

    #[test]
    fn write_configuration_preserves_base() {
        let mut raw = vec![0u8; EEPROM_SIZE];
        raw[40] = 0x77;
        raw[100] = 0x66;
        let base = DeviceImage::from_bytes(&raw);

        let mut p = programmer(MockBootloader::default());
        p.write_configuration(&PatternTable::default(), Some(&base))
            .unwrap();

        let mock = p.into_inner();
        assert_eq!(mock.written[40], 0x77);
        assert_eq!(mock.written[100], 0x66);
    }

    #[test]
    fn write_configuration_failures() {
        let mut p = programmer(MockBootloader {
            handshake_fails: true,
            ..Default::default()
        });
        let res = p.write_configuration(&PatternTable::default(), None);
        assert!(matches!(res, Err(Error::HandshakeFailed)));
        assert!(p.into_inner().written.is_empty());

        let mut p = programmer(MockBootloader {
            reject: true,
            ..Default::default()
        });
        let res = p.write_configuration(&PatternTable::default(), None);
        assert!(matches!(res, Err(Error::Rejected)));

        let mut p = programmer(MockBootloader {
            transfer_fails: true,
            ..Default::default()
        });
        let res = p.write_configuration(&PatternTable::default(), None);
        assert!(matches!(res, Err(Error::Transfer(MockError::Timeout))));
        assert_eq!(p.into_inner().calls.last(), Some(&Call::Close));
    }

    #[test]
    fn reset_configuration_clears_eeprom() {
        let mut p = programmer(MockBootloader::default());
        p.reset_configuration().unwrap();

        let mock = p.into_inner();
        assert_eq!(mock.written.len(), EEPROM_SIZE);
        assert!(mock.written.iter().all(|b| *b == 0));
        assert_eq!(mock.calls.last(), Some(&Call::Close));
    }

    #[test]
    fn reset_configuration_failures() {
        let mut p = programmer(MockBootloader {
            handshake_fails: true,
            ..Default::default()
        });
        assert!(matches!(p.reset_configuration(), Err(Error::HandshakeFailed)));
        let mock = p.into_inner();
        assert!(!mock.calls.iter().any(|c| matches!(c, Call::WriteMemory { .. })));
        assert_eq!(mock.calls.last(), Some(&Call::Close));

        let mut p = programmer(MockBootloader {
            transfer_fails: true,
            ..Default::default()
        });
        assert!(matches!(p.reset_configuration(), Err(Error::Transfer(MockError::Timeout))));
        let mock = p.into_inner();
        assert!(mock.written.is_empty());
        assert_eq!(mock.calls.last(), Some(&Call::Close));
    }

    #[test]
    fn update_firmware() {
        let mut p = programmer(MockBootloader::default());
        let events = recorded(&mut p);

        let image = p.update_firmware(&HEX).unwrap();
        assert_eq!(image.len(), 16);

        let events = events.lock().unwrap();
        assert_eq!(events[0], ProgressEvent::Decoding { fraction: 44.0 / 56.0 });
        assert_eq!(events[1], ProgressEvent::Decoding { fraction: 1.0 });
        assert!(events.contains(&ProgressEvent::Flashing { percent: 50 }));
        assert_eq!(events.last(), Some(&ProgressEvent::Finished));

        let mock = p.into_inner();
        assert_eq!(mock.calls[2], Call::WriteFlash { len: 16 });
        assert_eq!(&mock.written[..], image.as_bytes());
        assert_eq!(mock.calls.last(), Some(&Call::Close));
    }

    #[test]
    fn bad_firmware_never_opens_port() {
        let mut p = programmer(MockBootloader::default());

        let res = p.update_firmware(&[":10000000214601360121470136007EFE09D2190140", ":00000001FF"]);
        assert!(matches!(res, Err(Error::Image(hex::Error::CorruptImage { .. }))));

        let res = p.update_firmware(&[":10000000214601360121470136007EFE09D2190141"]);
        assert!(matches!(res, Err(Error::Image(hex::Error::MissingTerminator))));

        assert!(p.into_inner().calls.is_empty());
    }

    #[test]
    fn flash_failures_are_distinct() {
        let mut p = programmer(MockBootloader {
            handshake_fails: true,
            ..Default::default()
        });
        assert!(matches!(p.update_firmware(&HEX), Err(Error::HandshakeFailed)));

        let mut p = programmer(MockBootloader {
            reject: true,
            ..Default::default()
        });
        assert!(matches!(p.update_firmware(&HEX), Err(Error::Rejected)));

        let mut p = programmer(MockBootloader {
            transfer_fails: true,
            ..Default::default()
        });
        let events = recorded(&mut p);
        assert!(matches!(p.update_firmware(&HEX), Err(Error::Transfer(MockError::Timeout))));
        assert_eq!(events.lock().unwrap().last(), Some(&ProgressEvent::Failed));
        let mock = p.into_inner();
        assert!(mock.written.is_empty());
        assert_eq!(mock.calls.last(), Some(&Call::Close));

        let mut p = programmer(MockBootloader {
            panic_on_transfer: true,
            ..Default::default()
        });
        let res = catch_unwind(AssertUnwindSafe(|| p.update_firmware(&HEX)));
        assert!(res.is_err());
        assert_eq!(p.into_inner().calls.last(), Some(&Call::Close));
    }

    #[test]
    fn no_reset_option() {
        let options = Options {
            no_reset: true,
            ..Options::default()
        };
        let mut p = Programmer::new(MockBootloader::default(), "COM3", options);
        p.reset_configuration().unwrap();

        let mock = p.into_inner();
        assert_eq!(
            mock.calls[0],
            Call::Open {
                port: "COM3".to_string(),
                baud: 57600,
                reset: false
            }
        );
    }
}
