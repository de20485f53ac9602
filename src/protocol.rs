//! Board constants and the bootloader interface used by the [`Programmer`](crate::Programmer).

/// Bootloader baud rate
pub const DEFAULT_BAUD: u32 = 57600;

/// Size of the board EEPROM
pub const EEPROM_SIZE: usize = 1024;

/// Bytes written back on a configuration update (config region and padding)
pub const CONFIG_WRITE_LEN: usize = 126;

/// Flash page size of the board microcontroller (ATmega328)
pub const FLASH_PAGE_SIZE: usize = 128;

/// Start address for EEPROM and flash transfers
pub const START_ADDRESS: u32 = 0;

/// Flags passed with every write
pub const WRITE_FLAGS: u32 = 0;

/// Bootloader protocol driver.
///
/// Implementations own the wire protocol, the programmer only sequences the
/// calls. A connection is opened per operation and always handed back to
/// [`Bootloader::close`], whatever the outcome.
pub trait Bootloader {
    type Connection;
    type Error: core::fmt::Debug;

    /// Open the serial port, optionally pulsing the reset line
    fn open(&mut self, port: &str, baud: u32, reset: bool) -> Result<Self::Connection, Self::Error>;

    /// Perform the bootloader handshake, `false` if the bootloader did not respond
    fn connect(&mut self, conn: &mut Self::Connection) -> bool;

    /// Read `len` bytes of EEPROM from address zero
    fn read_memory(&mut self, conn: &mut Self::Connection, len: usize) -> Result<Vec<u8>, Self::Error>;

    /// Write `data` to EEPROM at `start`
    fn write_memory(
        &mut self,
        conn: &mut Self::Connection,
        data: &[u8],
        start: u32,
        page_size: usize,
        flags: u32,
    ) -> Result<bool, Self::Error>;

    /// Program `data` into flash at `start`, reporting percent complete (0..=100)
    fn write_flash(
        &mut self,
        conn: &mut Self::Connection,
        data: &[u8],
        start: u32,
        page_size: usize,
        flags: u32,
        progress: &mut dyn FnMut(u8),
    ) -> Result<bool, Self::Error>;

    /// Release the connection
    fn close(&mut self, conn: &mut Self::Connection);
}
