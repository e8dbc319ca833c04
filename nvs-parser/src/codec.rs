//! Bytes to zones, banks and chunks, and back.
//!
//! Id-based chunks are laid out as:
//!
//! ```text
//! [ id : 1 ][ length : 1 ][ crc : 2 LE ][ 0.. to word ][ payload padded to word ]
//! ```
//!
//! Address-based banks are a fixed list of slots taken from the chunk-id
//! map, each `[ payload ][ crc : 2 LE ]`, with zeros in between.

use snafu::{OptionExt, Snafu, ensure};

use crate::bank::{Bank, BankError};
use crate::chunk::{Chunk, ERASED, Padding, SLOT_CRC_SIZE, word_align};
use crate::map::{ChunkIdMap, ChunkLocation, ChunkMethod};
use crate::report::{ParseReport, Warning};
use crate::zone::Zone;

use decode_error::*;

/// Size of every bank, for all zones or zone by zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankCapacity {
    Uniform(usize),
    PerZone(Vec<usize>),
}

impl BankCapacity {
    /// Capacity of the banks of zone `zone`.
    pub fn for_zone(&self, zone: usize) -> Result<usize, DecodeError> {
        let capacity = match self {
            Self::Uniform(capacity) => *capacity,
            Self::PerZone(list) => *list.get(zone).context(NoCapacitySnafu { zone })?,
        };

        ensure!(capacity > 0, ZeroCapacitySnafu { zone });
        Ok(capacity)
    }
}

impl From<usize> for BankCapacity {
    fn from(capacity: usize) -> Self {
        Self::Uniform(capacity)
    }
}

impl From<Vec<usize>> for BankCapacity {
    fn from(list: Vec<usize>) -> Self {
        Self::PerZone(list)
    }
}

/// Decodes every zone found in `segments`.
///
/// Id-based images peel zones of two banks from each segment in turn.
/// Address-based images hold a single bank per segment.
pub fn decode_image<'a, I>(
    map: &ChunkIdMap,
    segments: I,
    capacities: &BankCapacity,
    report: &mut ParseReport,
) -> Result<Vec<Zone>, DecodeError>
where
    I: IntoIterator<Item = (u32, &'a [u8])>,
{
    let mut zones = Vec::new();

    for (start, data) in segments {
        let mut offset = 0;
        while offset < data.len() {
            let number = zones.len();
            let capacity = capacities.for_zone(number)?;
            let zone_start = address_at(start, offset)?;

            let zone = match map.method() {
                ChunkMethod::IdBased => {
                    let first_end = (offset + capacity).min(data.len());
                    let second_end = (offset + 2 * capacity).min(data.len());
                    let first = Bank::decode(map, &data[offset..first_end], zone_start, capacity, report)?;
                    let second_start = address_at(zone_start, capacity)?;
                    let second = Bank::decode(map, &data[first_end..second_end], second_start, capacity, report)?;
                    offset = second_end;
                    Zone::new(number, zone_start, [Some(first), Some(second)])
                }
                ChunkMethod::AddressBased => {
                    let end = (offset + capacity).min(data.len());
                    if end < data.len() {
                        report.warn(Warning::TrailingBytes {
                            address: address_at(zone_start, capacity)?,
                            length: data.len() - end,
                        });
                    }
                    let bank = Bank::decode(map, &data[offset..end], zone_start, capacity, report)?;
                    offset = data.len();
                    Zone::new(number, zone_start, [Some(bank), None])
                }
            };

            tracing::debug!(
                "zone {} at 0x{:08X}, banks of {} bytes, active bank {:?}",
                zone.number(),
                zone.start_address(),
                capacity,
                zone.active_bank_index()
            );
            zones.push(zone);
        }
    }

    Ok(zones)
}

/// Encodes every zone as `(start_address, bytes)`.
#[must_use]
pub fn encode_image(zones: &[Zone]) -> Vec<(u32, Vec<u8>)> {
    zones
        .iter()
        .map(|zone| (zone.start_address(), zone.encode()))
        .collect()
}

/// Decodes the chunks of one bank.
pub fn decode_bank(
    map: &ChunkIdMap,
    buf: &[u8],
    address: u32,
    report: &mut ParseReport,
) -> Result<Vec<Chunk>, DecodeError> {
    match map.method() {
        ChunkMethod::IdBased => decode_id_bank(map, buf, address, report),
        ChunkMethod::AddressBased => decode_slot_bank(map, buf, address),
    }
}

fn decode_id_bank(
    map: &ChunkIdMap,
    buf: &[u8],
    address: u32,
    report: &mut ParseReport,
) -> Result<Vec<Chunk>, DecodeError> {
    let mut chunks = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let chunk_address = address_at(address, offset)?;
        let (chunk, used) = decode_id_chunk(map, &buf[offset..], chunk_address)?;

        // The bank header carries a template CRC, not a computed one.
        let is_header = offset == 0;
        let skip_crc = is_header || chunk.id() == u16::from(map.invalid_chunk_id());
        if let (false, Some(stored), Some(computed)) = (skip_crc, chunk.crc(), chunk.computed_crc()) {
            if stored != computed {
                report.warn(Warning::ChunkCrcMismatch {
                    address: chunk_address,
                    id: chunk.id(),
                    stored,
                    computed,
                });
            }
        }

        chunks.push(chunk);
        offset += used;
    }

    Ok(chunks)
}

/// Decodes the chunk at the start of `buf`, returning it with the number of
/// bytes it takes.
///
/// A leading 0xFF starts a padding chunk covering the whole run of 0xFF.
pub fn decode_id_chunk(
    map: &ChunkIdMap,
    buf: &[u8],
    address: u32,
) -> Result<(Chunk, usize), DecodeError> {
    let word_size = map.word_size();

    if buf.first() == Some(&ERASED) {
        let span = buf.iter().take_while(|&&b| b == ERASED).count();
        return Ok((Chunk::padding(Padding::Erased, span), span));
    }

    ensure!(
        buf.len() >= word_size,
        TruncatedSnafu {
            address,
            needed: word_size,
            available: buf.len()
        }
    );

    let id = buf[0];
    let length = usize::from(buf[1]);
    let crc = u16::from_le_bytes([buf[2], buf[3]]);
    let stored = word_align(length, word_size);

    ensure!(
        buf.len() >= word_size + stored,
        TruncatedSnafu {
            address,
            needed: word_size + stored,
            available: buf.len()
        }
    );

    let payload = buf[word_size..word_size + stored].to_vec();

    Ok((
        Chunk::from_parts(u16::from(id), length, crc, payload),
        word_size + stored,
    ))
}

fn decode_slot_bank(
    map: &ChunkIdMap,
    buf: &[u8],
    address: u32,
) -> Result<Vec<Chunk>, DecodeError> {
    let mut slots: Vec<(&str, u16, u16)> = map
        .chunks()
        .filter_map(|(name, loc)| match loc {
            ChunkLocation::Slot {
                data_offset,
                crc_offset,
            } => Some((name, data_offset, crc_offset)),
            ChunkLocation::Id(_) => None,
        })
        .collect();
    slots.sort_by_key(|&(_, data_offset, _)| data_offset);

    let mut chunks = Vec::with_capacity(slots.len() * 2 + 1);
    let mut end = 0;

    for (name, data_offset, crc_offset) in slots {
        let data_start = usize::from(data_offset);
        let crc_start = usize::from(crc_offset);
        let crc_end = crc_start + SLOT_CRC_SIZE;

        ensure!(
            crc_start >= data_start,
            InvalidSlotSnafu {
                name,
                data_offset,
                crc_offset
            }
        );
        ensure!(
            data_start >= end,
            OverlappingSlotSnafu {
                name,
                data_offset
            }
        );
        ensure!(
            crc_end <= buf.len(),
            TruncatedSnafu {
                address: address_at(address, data_start)?,
                needed: crc_end - data_start,
                available: buf.len().saturating_sub(data_start)
            }
        );

        if data_start > end {
            chunks.push(Chunk::padding(Padding::Zeroed, data_start - end));
        }

        let crc = u16::from_le_bytes([buf[crc_start], buf[crc_start + 1]]);
        chunks.push(Chunk::from_parts(
            data_offset,
            crc_start - data_start,
            crc,
            buf[data_start..crc_start].to_vec(),
        ));
        end = crc_end;
    }

    if end < buf.len() {
        chunks.push(Chunk::padding(Padding::Zeroed, buf.len() - end));
    }

    Ok(chunks)
}

/// Appends the stored form of `chunk` to `out`.
pub fn encode_chunk(method: ChunkMethod, word_size: usize, chunk: &Chunk, out: &mut Vec<u8>) {
    let (Some(length), Some(crc)) = (chunk.length(), chunk.crc()) else {
        out.extend_from_slice(chunk.payload());
        return;
    };

    match method {
        ChunkMethod::IdBased => {
            let header_at = out.len();
            out.push(chunk.id() as u8);
            out.push(length as u8);
            out.extend_from_slice(&crc.to_le_bytes());
            out.resize(header_at + word_size, 0x00);
            out.extend_from_slice(chunk.payload());
        }
        ChunkMethod::AddressBased => {
            out.extend_from_slice(chunk.payload());
            out.extend_from_slice(&crc.to_le_bytes());
        }
    }
}

fn address_at(base: u32, offset: usize) -> Result<u32, DecodeError> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .context(AddressOverflowSnafu { base, offset })
}

/// Errors when decoding an image.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("no bank capacity given for zone {zone}"))]
    NoCapacity { zone: usize },

    #[snafu(display("bank capacity of zone {zone} is zero"))]
    ZeroCapacity { zone: usize },

    #[snafu(display("chunk at 0x{address:08X} needs {needed} bytes but only {available} remain"))]
    Truncated {
        address: u32,
        needed: usize,
        available: usize,
    },

    #[snafu(display("invalid first chunk id 0x{id:02X} in bank at 0x{address:08X}"))]
    UnknownBankHeader { address: u32, id: u8 },

    #[snafu(display(
        "invalid first chunk header ({id:#04X}, {length:#04X}, {crc:#06X}) in bank at 0x{address:08X}"
    ))]
    InvalidBankHeader {
        address: u32,
        id: u8,
        length: u8,
        crc: u16,
    },

    #[snafu(display("slot {name} has its CRC at 0x{crc_offset:04X}, before its data at 0x{data_offset:04X}"))]
    InvalidSlot {
        name: String,
        data_offset: u16,
        crc_offset: u16,
    },

    #[snafu(display("slot {name} at offset 0x{data_offset:04X} overlaps the previous slot"))]
    OverlappingSlot { name: String, data_offset: u16 },

    #[snafu(display("offset {offset} from 0x{base:08X} is outside the address space"))]
    AddressOverflow { base: u32, offset: usize },

    #[snafu(display("bank at 0x{address:08X} is invalid"))]
    InvalidBank { address: u32, source: BankError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::chunk_crc;
    use crate::map::{ChunkIdMap, ChunkMethod, MapValue};

    fn id_map() -> ChunkIdMap {
        ChunkIdMap::new(ChunkMethod::IdBased, 4).unwrap()
    }

    fn slot_map() -> ChunkIdMap {
        ChunkIdMap::from_entries([
            ("NVS_WORD_SIZE", MapValue::Number(4)),
            ("NVS_CHUNK_METHOD", MapValue::Flag(false)),
            ("NVS_SERIAL_NUMBER_ID", MapValue::Pair([0x06, 0x0A])),
            ("NVS_DFU_ID", MapValue::Pair([0x00, 0x02])),
        ])
        .unwrap()
    }

    #[test]
    fn test_decode_id_chunk() {
        let crc = chunk_crc(&[0x01, 0x02, 0x03], 0x10, 3);
        let [lo, hi] = crc.to_le_bytes();
        let buf = [0x10, 0x03, lo, hi, 0x01, 0x02, 0x03, 0x00, 0xFF, 0xFF];

        let (chunk, used) = decode_id_chunk(&id_map(), &buf, 0).unwrap();
        assert_eq!(used, 8);
        assert_eq!(chunk.id(), 0x10);
        assert_eq!(chunk.data(), &[0x01, 0x02, 0x03]);
        assert!(chunk.crc_valid());
    }

    #[test]
    fn test_erased_run_is_one_padding_chunk() {
        let (chunk, used) = decode_id_chunk(&id_map(), &[0xFF; 24], 0).unwrap();
        assert!(chunk.is_padding());
        assert_eq!(used, 24);
    }

    #[test]
    fn test_truncated_chunk_is_fatal() {
        let buf = [0x10, 0x08, 0x00, 0x00, 0x01, 0x02];
        assert!(matches!(
            decode_id_chunk(&id_map(), &buf, 0x100),
            Err(DecodeError::Truncated {
                address: 0x100,
                needed: 12,
                available: 6
            })
        ));
    }

    #[test]
    fn test_crc_mismatch_is_reported() {
        let map = id_map();
        let mut buf = vec![0x01, 0x00, 0x01, 0x00];
        buf.extend_from_slice(&[0x10, 0x01, 0xAD, 0xDE, 0x55, 0x00, 0x00, 0x00]);
        buf.extend_from_slice(&[0xFF; 4]);

        let mut report = ParseReport::new();
        let chunks = decode_bank(&map, &buf, 0x2000, &mut report).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            report.warnings(),
            &[Warning::ChunkCrcMismatch {
                address: 0x2004,
                id: 0x10,
                stored: 0xDEAD,
                computed: chunk_crc(&[0x55], 0x10, 1),
            }]
        );
    }

    #[test]
    fn test_invalidated_chunk_skips_crc_check() {
        let mut buf = vec![0x01, 0x00, 0x01, 0x00];
        buf.extend_from_slice(&[0x00, 0x01, 0xAD, 0xDE, 0x55, 0x00, 0x00, 0x00]);

        let mut report = ParseReport::new();
        decode_bank(&id_map(), &buf, 0, &mut report).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_slot_bank_gaps_are_zero_padding() {
        let map = slot_map();
        let mut buf = vec![0u8; 16];
        buf[0x06..0x0A].copy_from_slice(b"SN01");

        let mut report = ParseReport::new();
        let chunks = decode_bank(&map, &buf, 0, &mut report).unwrap();

        let shape: Vec<_> = chunks
            .iter()
            .map(|c| (c.id(), c.length(), c.payload().len()))
            .collect();
        assert_eq!(
            shape,
            [
                (0x00, Some(2), 2),
                (0x00, None, 2),
                (0x06, Some(4), 4),
                (0x00, None, 4)
            ]
        );

        let mut out = Vec::new();
        for chunk in &chunks {
            encode_chunk(map.method(), map.word_size(), chunk, &mut out);
        }
        assert_eq!(out, buf);
    }

    #[test]
    fn test_reversed_slot_is_rejected() {
        let map = ChunkIdMap::new(ChunkMethod::AddressBased, 4).unwrap().with_chunk(
            "NVS_DFU_ID",
            ChunkLocation::Slot {
                data_offset: 0x08,
                crc_offset: 0x04,
            },
        );

        assert!(matches!(
            decode_bank(&map, &[0u8; 16], 0, &mut ParseReport::new()),
            Err(DecodeError::InvalidSlot {
                data_offset: 0x08,
                crc_offset: 0x04,
                ..
            })
        ));
    }

    #[test]
    fn test_slot_segment_longer_than_bank_is_reported() {
        let map = slot_map();
        let mut report = ParseReport::new();

        let zones = decode_image(
            &map,
            [(0x4000, &[0u8; 24][..])],
            &BankCapacity::Uniform(16),
            &mut report,
        )
        .unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(
            report.warnings(),
            &[Warning::TrailingBytes {
                address: 0x4010,
                length: 8
            }]
        );
    }

    #[test]
    fn test_encode_id_chunk_pads_header_to_word() {
        let map = ChunkIdMap::new(ChunkMethod::IdBased, 8).unwrap();
        let chunk = Chunk::record(0x22, &[0xAB], 8);

        let mut out = Vec::new();
        encode_chunk(map.method(), map.word_size(), &chunk, &mut out);

        let [lo, hi] = chunk.crc().unwrap().to_le_bytes();
        assert_eq!(
            out,
            [0x22, 0x01, lo, hi, 0, 0, 0, 0, 0xAB, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_per_zone_capacity_out_of_range() {
        let capacities = BankCapacity::PerZone(vec![64]);
        assert_eq!(capacities.for_zone(0).unwrap(), 64);
        assert!(matches!(
            capacities.for_zone(1),
            Err(DecodeError::NoCapacity { zone: 1 })
        ));
    }
}
