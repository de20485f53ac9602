//! Intel HEX firmware image decoding.
//!
//! Reassembles the text records of a `.hex` file into the flat memory image
//! that is streamed to the board during a firmware update.

use std::io::BufRead;
use std::ops::Deref;

use ihex::{ReaderError, Record};
use thiserror::Error;

/// Marker starting every record line, anything else is ignored
pub const START_CODE: char = ':';

/// Byte order mark some editors prepend to text files
const BOM: char = '\u{FEFF}';

#[derive(Debug, Error)]
pub enum Error {
    /// A record checksum did not match its contents
    #[error("corrupt image: checksum mismatch on line {line} (record 0x{checksum:02x}, computed 0x{computed:02x})")]
    CorruptImage { line: usize, checksum: u8, computed: u8 },

    /// The input ended without an end of file record
    #[error("image has no end of file record")]
    MissingTerminator,

    /// A record line that could not be split into its fields
    #[error("malformed record on line {line}")]
    MalformedRecord { line: usize },

    #[error("error reading image: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat memory image assembled from a hex file.
///
/// Addresses never written by a data record read back as zero, the length is
/// one past the highest address written.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct FirmwareImage(Vec<u8>);

impl FirmwareImage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for FirmwareImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for FirmwareImage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Error {
    fn from_reader(e: ReaderError, line: usize) -> Self {
        match e {
            ReaderError::ChecksumMismatch(computed, checksum) => Error::CorruptImage {
                line,
                checksum,
                computed,
            },
            e => {
                debug!("Line {}: {}", line, e);
                Error::MalformedRecord { line }
            }
        }
    }
}

/// Incremental hex image decoder, fed one line at a time
#[derive(Debug, Default)]
pub struct Decoder {
    memory: Vec<u8>,
    segment_base: usize,
    extent: usize,
    terminated: bool,
    line: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process the next line of input
    pub fn feed(&mut self, line: &str) -> Result<(), Error> {
        self.line += 1;

        let text = line.strip_prefix(BOM).unwrap_or(line).trim_end();
        if !text.starts_with(START_CODE) {
            return Ok(());
        }

        let record = match Record::from_record_string(text) {
            Ok(r) => r,
            Err(ReaderError::UnsupportedRecordType(t)) => {
                debug!("Ignoring record type 0x{:02x} on line {}", t, self.line);
                return Ok(());
            }
            Err(e) => return Err(Error::from_reader(e, self.line)),
        };

        match record {
            Record::Data { offset, value } => {
                if self.terminated {
                    warn!("Data record on line {} follows end of file record", self.line);
                }

                let start = self.segment_base + offset as usize;
                let end = start + value.len();

                if self.memory.len() < end {
                    self.memory.resize(end, 0);
                }
                self.memory[start..end].copy_from_slice(&value);

                // Tracks the global maximum, records may arrive out of order
                self.extent = self.extent.max(end);
            }
            Record::EndOfFile => {
                self.terminated = true;
            }
            Record::ExtendedSegmentAddress(segment) => {
                self.segment_base = (segment as usize) << 4;
                debug!("Segment base 0x{:05x} (line {})", self.segment_base, self.line);
            }
            other => {
                debug!("Ignoring {:?} on line {}", other, self.line);
            }
        }

        Ok(())
    }

    /// Complete decoding, returning the image trimmed to the written extent
    pub fn finish(mut self) -> Result<FirmwareImage, Error> {
        if !self.terminated {
            return Err(Error::MissingTerminator);
        }

        self.memory.truncate(self.extent);

        debug!("Decoded {} byte image from {} lines", self.memory.len(), self.line);

        Ok(FirmwareImage(self.memory))
    }
}

/// Decode a complete set of hex lines
pub fn decode<I, S>(lines: I) -> Result<FirmwareImage, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut decoder = Decoder::new();
    for l in lines {
        decoder.feed(l.as_ref())?;
    }
    decoder.finish()
}

/// Decode hex lines, reporting the fraction of `total` input bytes consumed.
///
/// Each line counts for its length plus a line terminator.
pub fn decode_with_progress<I, S, F>(lines: I, total: usize, mut progress: F) -> Result<FirmwareImage, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: FnMut(f32),
{
    let mut decoder = Decoder::new();
    let mut consumed = 0;

    for l in lines {
        let l = l.as_ref();
        decoder.feed(l)?;

        consumed += l.len() + 1;
        if total > 0 {
            progress((consumed as f32 / total as f32).min(1.0));
        }
    }

    decoder.finish()
}

/// Decode hex records from a reader of `total` bytes (usually the file length)
pub fn decode_reader<R, F>(reader: R, total: u64, mut progress: F) -> Result<FirmwareImage, Error>
where
    R: BufRead,
    F: FnMut(f32),
{
    let mut decoder = Decoder::new();
    let mut consumed = 0u64;

    for l in reader.split(b'\n') {
        let l = l?;
        consumed += l.len() as u64 + 1;

        decoder.feed(&String::from_utf8_lossy(&l))?;

        if total > 0 {
            progress((consumed as f32 / total as f32).min(1.0));
        }
    }

    decoder.finish()
}
