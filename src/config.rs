//! Pattern configuration region codec.
//!
//! The board keeps its sixteen output patterns in EEPROM:
//!
//! | Offset    | Contents                                              |
//! |-----------|-------------------------------------------------------|
//! | `[0,32)`  | pattern masks, big endian `u16` per slot              |
//! | `[64,96)` | flight mode ordinal per slot, written to both bytes   |
//!
//! Every other byte of the EEPROM image is opaque and left untouched.

use core::fmt;
use core::ops::Range;
use core::str::FromStr;

use thiserror::Error;

use crate::protocol::EEPROM_SIZE;

/// Number of pattern slots on the board
pub const SLOT_COUNT: usize = 16;

/// Number of physical outputs controlled by each pattern
pub const OUTPUT_COUNT: usize = 16;

/// Pattern mask table location
pub const PATTERN_RANGE: Range<usize> = 0..32;

/// Flight mode table location
pub const FLIGHT_MODE_RANGE: Range<usize> = 64..96;

/// Minimum length of a buffer holding the configuration region
pub const REGION_LEN: usize = 96;

/// Factory default pattern masks, slots 1..=16
pub const DEFAULT_PATTERNS: [u16; SLOT_COUNT] = [
    0xF000, 0xF0F0, 0xF804, 0xCCCC, 0x8888, 0xAAA0, 0xAAAA, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

#[derive(Copy, Clone, PartialEq, Debug, Error)]
pub enum Error {
    #[error("configuration region too short ({0} bytes)")]
    RegionTooShort(usize),

    #[error(transparent)]
    InvalidFlightMode(#[from] InvalidFlightMode),
}

/// Flight mode byte outside the known ordinals
#[derive(Copy, Clone, PartialEq, Debug, Error)]
#[error("invalid flight mode {value} for slot {slot}")]
pub struct InvalidFlightMode {
    /// 1-based slot index
    pub slot: usize,
    /// Raw byte read from the device
    pub value: u8,
}

/// Vehicle flight modes a pattern can be bound to
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum FlightMode {
    Stabilize = 0,
    Acro = 1,
    AltHold = 2,
    Auto = 3,
    Loiter = 4,
    Guided = 5,
    Rtl = 6,
    Circle = 7,
    Position = 8,
    Land = 9,
    OfLoiter = 10,
    Manual = 11,
    FlyByWireA = 12,
    FlyByWireB = 13,
}

impl FlightMode {
    /// Ordinal and short name for each mode, in ordinal order
    pub const ALL: [(FlightMode, &'static str); 14] = [
        (FlightMode::Stabilize, "STAB"),
        (FlightMode::Acro, "ACRO"),
        (FlightMode::AltHold, "ALTH"),
        (FlightMode::Auto, "AUTO"),
        (FlightMode::Loiter, "LOIT"),
        (FlightMode::Guided, "GUID"),
        (FlightMode::Rtl, "RETL"),
        (FlightMode::Circle, "CIRC"),
        (FlightMode::Position, "POSI"),
        (FlightMode::Land, "LAND"),
        (FlightMode::OfLoiter, "OFLO"),
        (FlightMode::Manual, "MANU"),
        (FlightMode::FlyByWireA, "FBWA"),
        (FlightMode::FlyByWireB, "FBWB"),
    ];

    pub fn from_ordinal(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).map(|(m, _)| *m)
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Short name as shown on the board configuration UI
    pub fn name(self) -> &'static str {
        Self::ALL[self as usize].1
    }
}

impl Default for FlightMode {
    fn default() -> Self {
        FlightMode::Stabilize
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
#[error("unknown flight mode '{0}'")]
pub struct UnknownFlightMode(pub String);

impl FromStr for FlightMode {
    type Err = UnknownFlightMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(s))
            .map(|(m, _)| *m)
            .ok_or_else(|| UnknownFlightMode(s.to_string()))
    }
}

/// States of the sixteen outputs for one pattern.
///
/// Output `k` (1..=16) is stored in bit `16 - k`, so output 1 is the most
/// significant bit of the packed value.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Hash)]
pub struct OutputMask(u16);

impl OutputMask {
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Build a mask from output states, index 0 is output 1
    pub fn from_outputs(outputs: [bool; OUTPUT_COUNT]) -> Self {
        let mut m = Self(0);
        for (i, on) in outputs.iter().enumerate() {
            m.set(i + 1, *on);
        }
        m
    }

    /// Output states, index 0 is output 1
    pub fn outputs(self) -> [bool; OUTPUT_COUNT] {
        let mut o = [false; OUTPUT_COUNT];
        for (i, v) in o.iter_mut().enumerate() {
            *v = self.get(i + 1) == Some(true);
        }
        o
    }

    fn bit(output: usize) -> Option<u16> {
        if (1..=OUTPUT_COUNT).contains(&output) {
            Some(1 << (OUTPUT_COUNT - output))
        } else {
            None
        }
    }

    /// Fetch the state of output `output` (1..=16)
    pub fn get(self, output: usize) -> Option<bool> {
        Self::bit(output).map(|b| self.0 & b != 0)
    }

    /// Set the state of output `output` (1..=16), other indices are ignored
    pub fn set(&mut self, output: usize, on: bool) {
        let b = match Self::bit(output) {
            Some(b) => b,
            None => return,
        };

        if on {
            self.0 |= b;
        } else {
            self.0 &= !b;
        }
    }
}

impl fmt::Display for OutputMask {
    /// Renders outputs 1..=16 left to right as `#` (on) or `.` (off)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for on in self.outputs().iter() {
            f.write_str(if *on { "#" } else { "." })?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct PatternSlot {
    pub mask: OutputMask,
    pub flight_mode: FlightMode,
}

/// The sixteen pattern slots, addressed by 1-based index
#[derive(Clone, PartialEq, Debug)]
pub struct PatternTable {
    slots: [PatternSlot; SLOT_COUNT],
}

impl Default for PatternTable {
    fn default() -> Self {
        let mut slots = [PatternSlot::default(); SLOT_COUNT];
        for (s, bits) in slots.iter_mut().zip(DEFAULT_PATTERNS.iter()) {
            s.mask = OutputMask::from_bits(*bits);
        }
        Self { slots }
    }
}

impl PatternTable {
    pub fn new(slots: [PatternSlot; SLOT_COUNT]) -> Self {
        Self { slots }
    }

    /// Fetch slot `index` (1..=16)
    pub fn slot(&self, index: usize) -> Option<&PatternSlot> {
        index.checked_sub(1).and_then(|i| self.slots.get(i))
    }

    /// Fetch slot `index` (1..=16) for editing
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut PatternSlot> {
        index.checked_sub(1).and_then(move |i| self.slots.get_mut(i))
    }

    /// Iterate over `(index, slot)` pairs with 1-based indices
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PatternSlot)> {
        self.slots.iter().enumerate().map(|(i, s)| (i + 1, s))
    }

    pub fn slots(&self) -> &[PatternSlot; SLOT_COUNT] {
        &self.slots
    }
}

/// Result of decoding a configuration region.
///
/// Slots with an unknown flight mode byte are loaded as [`FlightMode::Stabilize`]
/// and listed in `invalid`.
#[derive(Clone, PartialEq, Debug)]
pub struct Decoded {
    pub table: PatternTable,
    pub invalid: Vec<InvalidFlightMode>,
}

impl Decoded {
    /// Reject the decode if any slot carried an unknown flight mode
    pub fn strict(self) -> Result<PatternTable, Error> {
        match self.invalid.first() {
            Some(e) => Err((*e).into()),
            None => Ok(self.table),
        }
    }
}

fn pattern_offset(i: usize) -> usize {
    PATTERN_RANGE.start + i * 2
}

fn flight_mode_offset(i: usize) -> usize {
    FLIGHT_MODE_RANGE.start + i * 2
}

/// Decode the pattern table from a configuration region.
///
/// Only the first byte of each flight mode field is read.
pub fn decode(region: &[u8]) -> Result<Decoded, Error> {
    if region.len() < REGION_LEN {
        return Err(Error::RegionTooShort(region.len()));
    }
    Ok(decode_region(&region[..REGION_LEN]))
}

/// Encode the pattern table into a configuration region.
///
/// Writes only the pattern and flight mode ranges, the flight mode ordinal
/// goes to both bytes of its field.
pub fn encode(table: &PatternTable, region: &mut [u8]) -> Result<(), Error> {
    if region.len() < REGION_LEN {
        return Err(Error::RegionTooShort(region.len()));
    }
    encode_region(table, &mut region[..REGION_LEN]);
    Ok(())
}

// Callers guarantee `region.len() >= REGION_LEN`
fn decode_region(region: &[u8]) -> Decoded {
    let mut slots = [PatternSlot::default(); SLOT_COUNT];
    let mut invalid = Vec::new();

    for (i, s) in slots.iter_mut().enumerate() {
        let p = pattern_offset(i);
        s.mask = OutputMask::from_bits(u16::from_be_bytes([region[p], region[p + 1]]));

        let raw = region[flight_mode_offset(i)];
        s.flight_mode = match FlightMode::from_ordinal(raw) {
            Some(m) => m,
            None => {
                warn!("Slot {} has invalid flight mode {}", i + 1, raw);
                invalid.push(InvalidFlightMode { slot: i + 1, value: raw });
                FlightMode::default()
            }
        };
    }

    Decoded {
        table: PatternTable { slots },
        invalid,
    }
}

fn encode_region(table: &PatternTable, region: &mut [u8]) {
    for (i, s) in table.slots.iter().enumerate() {
        let p = pattern_offset(i);
        region[p..p + 2].copy_from_slice(&s.mask.bits().to_be_bytes());

        let f = flight_mode_offset(i);
        let mode = s.flight_mode.ordinal();
        region[f] = mode;
        region[f + 1] = mode;
    }
}

/// Full EEPROM contents of the board
#[derive(Clone, PartialEq)]
pub struct DeviceImage(Box<[u8; EEPROM_SIZE]>);

impl Default for DeviceImage {
    fn default() -> Self {
        Self(Box::new([0u8; EEPROM_SIZE]))
    }
}

impl fmt::Debug for DeviceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceImage({:02x?}..)", &self.0[..REGION_LEN])
    }
}

impl DeviceImage {
    /// Build an image from bytes read back from the device.
    ///
    /// Shorter inputs are zero padded, longer ones truncated.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut image = Self::default();
        let n = data.len().min(EEPROM_SIZE);
        image.0[..n].copy_from_slice(&data[..n]);
        if data.len() != EEPROM_SIZE {
            warn!("Device image is {} bytes, expected {}", data.len(), EEPROM_SIZE);
        }
        image
    }

    /// Image with the given pattern table applied over zeroed memory
    pub fn with_patterns(table: &PatternTable) -> Self {
        let mut image = Self::default();
        image.apply(table);
        image
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn decode(&self) -> Decoded {
        decode_region(&self.0[..])
    }

    /// Write the pattern table into the image, other bytes are kept
    pub fn apply(&mut self, table: &PatternTable) {
        encode_region(table, &mut self.0[..]);
    }
}
