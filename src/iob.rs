//! `.iob` configuration files.
//!
//! One line per slot, tab separated: slot name (`pattern1`..`pattern16`),
//! decimal mask value and decimal flight mode ordinal.
//!
//! ```text
//! pattern1	61440	0
//! pattern2	61680	3
//! ```

use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::config::{FlightMode, OutputMask, PatternTable, SLOT_COUNT};

/// Slot name prefix
pub const SLOT_PREFIX: &str = "pattern";

#[derive(Debug, Error)]
pub enum Error {
    #[error("line {line}: expected <slot>\\t<mask>\\t<flight mode>")]
    Malformed { line: usize },

    #[error("line {line}: unknown slot '{name}'")]
    UnknownSlot { line: usize, name: String },

    #[error("line {line}: invalid mask '{value}'")]
    InvalidMask { line: usize, value: String },

    #[error("line {line}: invalid flight mode '{value}'")]
    InvalidFlightMode { line: usize, value: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Name of slot `index` (1..=16)
pub fn slot_name(index: usize) -> String {
    format!("{}{}", SLOT_PREFIX, index)
}

/// Slot index for a slot name
pub fn slot_index(name: &str) -> Option<usize> {
    name.strip_prefix(SLOT_PREFIX)
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|i| (1..=SLOT_COUNT).contains(i))
}

/// Write all slots of `table`
pub fn write<W: Write>(table: &PatternTable, mut w: W) -> io::Result<()> {
    for (i, s) in table.iter() {
        writeln!(w, "{}\t{}\t{}", slot_name(i), s.mask.bits(), s.flight_mode.ordinal())?;
    }
    w.flush()
}

/// Update `table` from a file, slots that are not listed keep their values.
///
/// Blank lines are skipped, empty fields (repeated tabs) are dropped.
pub fn read<R: BufRead>(r: R, table: &mut PatternTable) -> Result<(), Error> {
    for (n, l) in r.lines().enumerate() {
        let l = l?;
        let line = n + 1;

        let fields: Vec<&str> = l.trim_end().split('\t').filter(|f| !f.is_empty()).collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 3 {
            return Err(Error::Malformed { line });
        }

        let index = slot_index(fields[0]).ok_or_else(|| Error::UnknownSlot {
            line,
            name: fields[0].to_string(),
        })?;

        let mask = fields[1]
            .parse::<u16>()
            .map_err(|_| Error::InvalidMask {
                line,
                value: fields[1].to_string(),
            })?;

        let flight_mode = fields[2]
            .parse::<u8>()
            .ok()
            .and_then(FlightMode::from_ordinal)
            .ok_or_else(|| Error::InvalidFlightMode {
                line,
                value: fields[2].to_string(),
            })?;

        if let Some(s) = table.slot_mut(index) {
            s.mask = OutputMask::from_bits(mask);
            s.flight_mode = flight_mode;
        }
    }

    Ok(())
}

/// Load a table from a file, starting from the defaults
pub fn load<R: BufRead>(r: R) -> Result<PatternTable, Error> {
    let mut table = PatternTable::default();
    read(r, &mut table)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn write_defaults() {
        let mut out = Vec::new();
        write(&PatternTable::default(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), SLOT_COUNT);
        assert_eq!(lines[0], "pattern1\t61440\t0");
        assert_eq!(lines[6], "pattern7\t43690\t0");
        assert_eq!(lines[15], "pattern16\t0\t0");
    }

    #[test]
    fn round_trip() {
        let mut t = PatternTable::default();
        for i in 1..=SLOT_COUNT {
            let s = t.slot_mut(i).unwrap();
            s.mask = OutputMask::from_bits((i as u16) * 4095);
            s.flight_mode = FlightMode::from_ordinal((i % 14) as u8).unwrap();
        }

        let mut out = Vec::new();
        write(&t, &mut out).unwrap();

        let mut loaded = PatternTable::new(Default::default());
        read(Cursor::new(out), &mut loaded).unwrap();
        assert_eq!(loaded, t);
    }

    #[test]
    fn partial_file_keeps_other_slots() {
        let text = "pattern3\t65535\t9\n\n\tpattern10\t\t1\t13\n";

        let t = load(Cursor::new(text)).unwrap();
        assert_eq!(t.slot(3).unwrap().mask.bits(), 0xFFFF);
        assert_eq!(t.slot(3).unwrap().flight_mode, FlightMode::Land);
        assert_eq!(t.slot(10).unwrap().mask.bits(), 1);
        assert_eq!(t.slot(10).unwrap().flight_mode, FlightMode::FlyByWireB);
        assert_eq!(t.slot(1).unwrap().mask.bits(), 0xF000);
    }

    #[test]
    fn invalid_lines() {
        let res = load(Cursor::new("pattern1\t12\n"));
        assert!(matches!(res, Err(Error::Malformed { line: 1 })));

        let res = load(Cursor::new("pattern1\t0\t0\npattern17\t0\t0\n"));
        assert!(matches!(res, Err(Error::UnknownSlot { line: 2, .. })));

        let res = load(Cursor::new("pattern0\t0\t0\n"));
        assert!(matches!(res, Err(Error::UnknownSlot { line: 1, .. })));

        let res = load(Cursor::new("pattern1\t65536\t0\n"));
        assert!(matches!(res, Err(Error::InvalidMask { line: 1, .. })));

        let res = load(Cursor::new("pattern1\t0\t14\n"));
        assert!(matches!(res, Err(Error::InvalidFlightMode { line: 1, .. })));

        let res = load(Cursor::new("pattern1\t0\tSTAB\n"));
        assert!(matches!(res, Err(Error::InvalidFlightMode { line: 1, .. })));
    }

    #[test]
    fn slot_names() {
        assert_eq!(slot_name(1), "pattern1");
        assert_eq!(slot_index("pattern16"), Some(16));
        assert_eq!(slot_index("pattern"), None);
        assert_eq!(slot_index("Pattern1"), None);
    }
}
