//! Sparse memory images and Intel HEX files.

use std::collections::BTreeMap;
use std::io::{self, Write};

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use hex_error::*;

/// Bytes per data record when writing.
const LINE_LIMIT: usize = 32;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXTENDED_SEGMENT: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_EXTENDED_LINEAR: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Byte returned for addresses that hold nothing.
pub const GAP_FILL: u8 = 0xFF;

/// Address to byte store with holes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    bytes: BTreeMap<u32, u8>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single contiguous segment starting at `start`.
    pub fn from_slice(start: u32, data: &[u8]) -> Self {
        let mut image = Self::new();
        image.put(start, data);
        image
    }

    /// Writes `data` at `address`, overwriting what was there.
    pub fn put(&mut self, address: u32, data: &[u8]) {
        for (address, &byte) in (address..).zip(data) {
            self.bytes.insert(address, byte);
        }
    }

    /// Reads `len` bytes at `address`, holes read as [`GAP_FILL`].
    #[must_use]
    pub fn get(&self, address: u32, len: usize) -> Vec<u8> {
        (address..)
            .take(len)
            .map(|a| self.bytes.get(&a).copied().unwrap_or(GAP_FILL))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Contiguous runs of bytes, in address order.
    #[must_use]
    pub fn segments(&self) -> Vec<(u32, Vec<u8>)> {
        let mut segments: Vec<(u32, Vec<u8>)> = Vec::new();

        for (&address, &byte) in &self.bytes {
            match segments.last_mut() {
                Some((start, data)) if u64::from(*start) + data.len() as u64 == u64::from(address) => {
                    data.push(byte);
                }
                _ => segments.push((address, vec![byte])),
            }
        }

        segments
    }

    /// Parses Intel HEX text.
    ///
    /// Data, end of file and both extended address records are supported.
    /// Start address records are accepted and ignored.
    pub fn parse(text: &str) -> Result<Self, HexError> {
        let mut image = Self::new();
        let mut base: u32 = 0;

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let body = line.strip_prefix(':').context(MissingColonSnafu { line: line_no })?;
            let record = hex::decode(body).context(InvalidDigitsSnafu { line: line_no })?;
            ensure!(record.len() >= 5, TooShortSnafu { line: line_no });

            let count = usize::from(record[0]);
            ensure!(
                record.len() == count + 5,
                LengthMismatchSnafu {
                    line: line_no,
                    count,
                    actual: record.len() - 5
                }
            );

            let sum = record.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            ensure!(sum == 0, ChecksumSnafu { line: line_no });

            let offset = u16::from_be_bytes([record[1], record[2]]);
            let kind = record[3];
            let data = &record[4..4 + count];

            match kind {
                RECORD_DATA => {
                    let address = base
                        .checked_add(u32::from(offset))
                        .context(AddressOverflowSnafu { line: line_no })?;
                    image.put(address, data);
                }
                RECORD_EOF => break,
                RECORD_EXTENDED_SEGMENT => {
                    ensure!(count == 2, LengthMismatchSnafu { line: line_no, count: 2usize, actual: count });
                    base = u32::from(u16::from_be_bytes([data[0], data[1]])) << 4;
                }
                RECORD_EXTENDED_LINEAR => {
                    ensure!(count == 2, LengthMismatchSnafu { line: line_no, count: 2usize, actual: count });
                    base = u32::from(u16::from_be_bytes([data[0], data[1]])) << 16;
                }
                RECORD_START_SEGMENT | RECORD_START_LINEAR => {}
                _ => return UnsupportedRecordSnafu { line: line_no, kind }.fail(),
            }
        }

        Ok(image)
    }

    /// Writes the image as Intel HEX.
    ///
    /// Data records hold up to 32 bytes and never cross a 64 KiB boundary
    /// or a hole. An extended linear address record precedes every data
    /// outside the first 64 KiB.
    pub fn write_ihex<W: Write>(&self, mut out: W) -> io::Result<()> {
        for line in self.ihex_lines() {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    /// The image as an Intel HEX string.
    #[must_use]
    pub fn to_ihex_string(&self) -> String {
        let mut text = String::new();
        for line in self.ihex_lines() {
            text.push_str(&line);
            text.push('\n');
        }
        text
    }

    fn ihex_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut current_ela: Option<u16> = None;

        for (start, data) in self.segments() {
            let mut address = start;
            let mut rest = &data[..];

            while !rest.is_empty() {
                let ela = (address >> 16) as u16;
                if current_ela != Some(ela) {
                    if ela != 0 || current_ela.is_some() {
                        lines.push(format_record(RECORD_EXTENDED_LINEAR, 0, &ela.to_be_bytes()));
                    }
                    current_ela = Some(ela);
                }

                let low = (address & 0xFFFF) as u16;
                let to_boundary = 0x1_0000 - usize::from(low);
                let take = rest.len().min(LINE_LIMIT).min(to_boundary);

                lines.push(format_record(RECORD_DATA, low, &rest[..take]));

                rest = &rest[take..];
                address = address.wrapping_add(take as u32);
            }
        }

        lines.push(format_record(RECORD_EOF, 0, &[]));
        lines
    }
}

fn format_record(kind: u8, offset: u16, data: &[u8]) -> String {
    let mut record = Vec::with_capacity(data.len() + 5);
    record.push(data.len() as u8);
    record.extend_from_slice(&offset.to_be_bytes());
    record.push(kind);
    record.extend_from_slice(data);

    let sum = record.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    record.push((!sum).wrapping_add(1));

    format!(":{}", hex::encode_upper(&record))
}

/// Errors when parsing Intel HEX text.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum HexError {
    #[snafu(display("line {line}: record does not start with ':'"))]
    MissingColon { line: usize },

    #[snafu(display("line {line}: invalid hex digits"))]
    InvalidDigits {
        line: usize,
        source: hex::FromHexError,
    },

    #[snafu(display("line {line}: record is too short"))]
    TooShort { line: usize },

    #[snafu(display("line {line}: record announces {count} data bytes but holds {actual}"))]
    LengthMismatch {
        line: usize,
        count: usize,
        actual: usize,
    },

    #[snafu(display("line {line}: checksum mismatch"))]
    Checksum { line: usize },

    #[snafu(display("line {line}: data address is outside the 32-bit address space"))]
    AddressOverflow { line: usize },

    #[snafu(display("line {line}: unsupported record type 0x{kind:02X}"))]
    UnsupportedRecord { line: usize, kind: u8 },
}
