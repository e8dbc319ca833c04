//! Banks: fixed-size chunk logs.

use snafu::{Snafu, ensure};

use crate::chunk::{Chunk, Padding, word_align};
use crate::codec::{self, DecodeError};
use crate::map::{BankHeader, ChunkIdMap, ChunkMethod};
use crate::report::ParseReport;

use bank_error::*;

/// An ordered list of chunks stored at a fixed address.
///
/// The last chunk is a padding chunk whenever the records do not fill the
/// whole capacity.
#[derive(Debug, Clone)]
#[must_use]
pub struct Bank {
    active: bool,
    start_address: u32,
    capacity: usize,
    method: ChunkMethod,
    word_size: usize,
    chunks: Vec<Chunk>,
}

impl Bank {
    /// Builds a bank from `chunks` and pads it up to `capacity`.
    pub fn new(
        active: bool,
        start_address: u32,
        capacity: usize,
        method: ChunkMethod,
        word_size: usize,
        chunks: Vec<Chunk>,
    ) -> Result<Self, BankError> {
        let mut bank = Self {
            active,
            start_address,
            capacity,
            method,
            word_size,
            chunks,
        };

        let length = bank.current_length();
        ensure!(length <= capacity, OverflowSnafu { length, capacity });

        bank.repad();
        Ok(bank)
    }

    /// An empty bank using the layout of `map`.
    pub fn erased(map: &ChunkIdMap, start_address: u32, capacity: usize) -> Self {
        let mut bank = Self {
            active: false,
            start_address,
            capacity,
            method: map.method(),
            word_size: map.word_size(),
            chunks: Vec::new(),
        };
        bank.repad();
        bank
    }

    /// Decodes a bank and works out whether it is the active one.
    ///
    /// An id-based bank is active only when its first chunk is the
    /// `ACTIVE_BANK_HDR` template. A first chunk that is neither erased
    /// flash nor one of the three header templates is fatal. An address-based bank is
    /// active as soon as it holds anything.
    pub fn decode(
        map: &ChunkIdMap,
        buf: &[u8],
        start_address: u32,
        capacity: usize,
        report: &mut ParseReport,
    ) -> Result<Self, DecodeError> {
        let chunks = codec::decode_bank(map, buf, start_address, report)?;

        let active = match (map.method(), chunks.first()) {
            (_, None) => false,
            (ChunkMethod::AddressBased, Some(_)) => true,
            (ChunkMethod::IdBased, Some(first)) => header_state(map, first, start_address)?,
        };

        Self::new(
            active,
            start_address,
            capacity,
            map.method(),
            map.word_size(),
            chunks,
        )
        .map_err(|source| DecodeError::InvalidBank {
            address: start_address,
            source,
        })
    }

    #[must_use]
    pub const fn active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub const fn start_address(&self) -> u32 {
        self.start_address
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn method(&self) -> ChunkMethod {
        self.method
    }

    #[must_use]
    pub const fn word_size(&self) -> usize {
        self.word_size
    }

    /// Status header held by the first chunk of an id-based bank.
    #[must_use]
    pub fn header(&self) -> Option<BankHeader> {
        if self.method != ChunkMethod::IdBased {
            return None;
        }
        let first = self.chunks.first().filter(|c| !c.is_padding())?;
        Some(BankHeader::new(first.id() as u8, first.length()? as u8, first.crc()?))
    }

    /// All chunks, padding included.
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Non-padding chunks in bank order.
    pub fn records(&self) -> impl DoubleEndedIterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| !c.is_padding())
    }

    /// The last non-padding chunk.
    #[must_use]
    pub fn last_record(&self) -> Option<&Chunk> {
        self.records().next_back()
    }

    /// Occurrences of `id`, oldest first.
    #[must_use]
    pub fn history(&self, id: u16) -> Vec<&Chunk> {
        self.records().filter(|c| c.id() == id).collect()
    }

    /// Bytes used, trailing padding excluded.
    #[must_use]
    pub fn current_length(&self) -> usize {
        self.chunks[..self.content_len()]
            .iter()
            .map(|c| c.encoded_size(self.method, self.word_size))
            .sum()
    }

    #[must_use]
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.current_length())
    }

    /// Bytes `chunk` would take in this bank.
    #[must_use]
    pub fn encoded_size_of(&self, chunk: &Chunk) -> usize {
        chunk.encoded_size(self.method, self.word_size)
    }

    /// Appends `chunk` after the last record.
    pub fn append(&mut self, chunk: Chunk) -> Result<(), BankError> {
        let length = self.current_length() + self.encoded_size_of(&chunk);
        ensure!(
            length <= self.capacity,
            OverflowSnafu {
                length,
                capacity: self.capacity
            }
        );

        self.chunks.truncate(self.content_len());
        self.chunks.push(chunk);
        self.repad();
        Ok(())
    }

    /// Writes `header` over the first chunk and sets the active flag.
    ///
    /// An erased bank gets a new header chunk in front of its padding.
    pub fn stamp_header(&mut self, header: BankHeader, active: bool) -> Result<(), BankError> {
        let length = usize::from(header.length);

        match self.chunks.first_mut() {
            Some(first) if !first.is_padding() => {
                first.set_id(u16::from(header.id));
                let payload = first.payload().to_vec();
                first.overwrite(length, header.crc, payload);
            }
            _ => {
                let chunk = Chunk::from_parts(
                    u16::from(header.id),
                    length,
                    header.crc,
                    vec![0x00; word_align(length, self.word_size)],
                );
                let needed = self.current_length() + self.encoded_size_of(&chunk);
                ensure!(
                    needed <= self.capacity,
                    OverflowSnafu {
                        length: needed,
                        capacity: self.capacity
                    }
                );

                self.chunks.insert(0, chunk);
                self.chunks.truncate(self.content_len());
                self.repad();
            }
        }

        self.active = active;
        Ok(())
    }

    /// Encodes the bank, with or without its trailing padding.
    #[must_use]
    pub fn encode(&self, with_padding: bool) -> Vec<u8> {
        let chunks = if with_padding {
            &self.chunks[..]
        } else {
            &self.chunks[..self.content_len()]
        };

        let mut out = Vec::with_capacity(self.capacity);
        for chunk in chunks {
            codec::encode_chunk(self.method, self.word_size, chunk, &mut out);
        }
        out
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub(crate) fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    /// Replaces every chunk, padding up to capacity.
    pub(crate) fn replace_chunks(&mut self, chunks: Vec<Chunk>) -> Result<(), BankError> {
        let previous = std::mem::replace(&mut self.chunks, chunks);

        let length = self.current_length();
        if length > self.capacity {
            self.chunks = previous;
            return OverflowSnafu {
                length,
                capacity: self.capacity,
            }
            .fail();
        }

        self.repad();
        Ok(())
    }

    /// Replaces the chunk at `index`, padding up to capacity.
    ///
    /// The bank is left untouched when the new chunk does not fit.
    pub(crate) fn replace_chunk(&mut self, index: usize, chunk: Chunk) -> Result<(), BankError> {
        let mut chunks = self.chunks[..self.content_len()].to_vec();
        if let Some(slot) = chunks.get_mut(index) {
            *slot = chunk;
        }
        self.replace_chunks(chunks)
    }

    /// Number of chunks before the trailing padding.
    fn content_len(&self) -> usize {
        match self.chunks.last() {
            Some(last) if last.is_padding() => self.chunks.len() - 1,
            _ => self.chunks.len(),
        }
    }

    fn repad(&mut self) {
        let used: usize = self
            .chunks
            .iter()
            .map(|c| c.encoded_size(self.method, self.word_size))
            .sum();
        if used >= self.capacity {
            return;
        }

        let missing = self.capacity - used;
        match self.chunks.last_mut() {
            Some(last) if last.is_padding() => last.grow_padding(missing),
            _ => {
                let fill = match self.method {
                    ChunkMethod::IdBased => Padding::Erased,
                    ChunkMethod::AddressBased => Padding::Zeroed,
                };
                self.chunks.push(Chunk::padding(fill, missing));
            }
        }
    }
}

/// Trailing padding does not take part in the comparison.
impl PartialEq for Bank {
    fn eq(&self, other: &Self) -> bool {
        self.active == other.active
            && self.start_address == other.start_address
            && self.capacity == other.capacity
            && self.chunks[..self.content_len()] == other.chunks[..other.content_len()]
    }
}

impl Eq for Bank {}

fn header_state(map: &ChunkIdMap, first: &Chunk, address: u32) -> Result<bool, DecodeError> {
    let (Some(length), Some(crc)) = (first.length(), first.crc()) else {
        return Ok(false);
    };

    let id = first.id() as u8;
    let templates = [
        map.active_bank_header(),
        map.temp_bank_header(),
        map.invalid_bank_header(),
    ];
    if !templates.iter().any(|t| t.id == id) {
        return Err(DecodeError::UnknownBankHeader { address, id });
    }

    let header = BankHeader::new(id, length as u8, crc);
    if header == map.active_bank_header() {
        Ok(true)
    } else if header == map.temp_bank_header() || header == map.invalid_bank_header() {
        Ok(false)
    } else {
        Err(DecodeError::InvalidBankHeader {
            address,
            id,
            length: header.length,
            crc,
        })
    }
}

/// Errors when changing the chunks of a bank.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum BankError {
    #[snafu(display("{length} bytes of chunks overflow the {capacity}-byte bank"))]
    Overflow { length: usize, capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::ChunkMethod;

    fn map() -> ChunkIdMap {
        ChunkIdMap::new(ChunkMethod::IdBased, 4).unwrap()
    }

    fn active_bank() -> Bank {
        let mut bank = Bank::erased(&map(), 0x1000, 64);
        bank.stamp_header(map().active_bank_header(), true).unwrap();
        bank
    }

    #[test]
    fn test_erased_bank_is_one_padding_chunk() {
        let bank = Bank::erased(&map(), 0, 64);

        assert!(!bank.active());
        assert_eq!(bank.chunks().len(), 1);
        assert_eq!(bank.current_length(), 0);
        assert_eq!(bank.encode(true), vec![0xFF; 64]);
        assert!(bank.encode(false).is_empty());
    }

    #[test]
    fn test_stamp_header_on_erased_bank() {
        let bank = active_bank();

        assert!(bank.active());
        assert_eq!(bank.current_length(), 4);
        assert_eq!(&bank.encode(true)[..5], &[0x01, 0x00, 0x01, 0x00, 0xFF]);
        assert_eq!(bank.encode(true).len(), 64);
    }

    #[test]
    fn test_header_of_stamped_bank() {
        let mut bank = active_bank();
        assert_eq!(bank.header(), Some(map().active_bank_header()));

        bank.stamp_header(map().invalid_bank_header(), false).unwrap();
        assert_eq!(bank.header(), Some(map().invalid_bank_header()));
        assert_eq!(Bank::erased(&map(), 0, 64).header(), None);
    }

    #[test]
    fn test_append_replaces_padding() {
        let mut bank = active_bank();
        bank.append(Chunk::record(0x10, &[1, 2, 3], 4)).unwrap();
        bank.append(Chunk::record(0x10, &[4], 4)).unwrap();

        assert_eq!(bank.current_length(), 20);
        assert_eq!(bank.history(0x10).len(), 2);
        assert_eq!(bank.last_record().map(Chunk::data), Some(&[4u8][..]));
        assert!(bank.chunks().last().is_some_and(Chunk::is_padding));
    }

    #[test]
    fn test_append_overflow_is_rejected() {
        let mut bank = active_bank();
        bank.append(Chunk::record(0x10, &[0; 52], 52)).unwrap();
        assert_eq!(bank.free_space(), 4);

        assert!(matches!(
            bank.append(Chunk::record(0x11, &[0], 4)),
            Err(BankError::Overflow {
                length: 68,
                capacity: 64
            })
        ));
    }

    #[test]
    fn test_replace_chunk_repads_or_rolls_back() {
        let mut bank = active_bank();
        bank.append(Chunk::record(0x10, &[1], 4)).unwrap();
        bank.append(Chunk::record(0x11, &[2], 4)).unwrap();

        bank.replace_chunk(1, Chunk::record(0x10, &[3; 20], 20)).unwrap();
        assert_eq!(bank.current_length(), 4 + 24 + 8);
        assert_eq!(bank.encode(true).len(), 64);
        assert_eq!(bank.history(0x10)[0].data(), &[3; 20]);

        let before = bank.clone();
        assert!(matches!(
            bank.replace_chunk(1, Chunk::record(0x10, &[4; 52], 52)),
            Err(BankError::Overflow { length: 68, .. })
        ));
        assert_eq!(bank, before);
        assert_eq!(bank.encode(true).len(), 64);
    }

    #[test]
    fn test_exact_fit_has_no_padding() {
        let mut bank = active_bank();
        bank.append(Chunk::record(0x10, &[0; 56], 56)).unwrap();

        assert_eq!(bank.free_space(), 0);
        assert!(!bank.chunks().last().is_some_and(Chunk::is_padding));
    }

    #[test]
    fn test_decode_recognises_headers() {
        let map = map();
        let mut report = ParseReport::new();

        let mut buf = vec![0xFF; 32];
        buf[..4].copy_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let bank = Bank::decode(&map, &buf, 0, 32, &mut report).unwrap();
        assert!(!bank.active());

        buf[..4].copy_from_slice(&[0x01, 0x00, 0x01, 0x00]);
        let bank = Bank::decode(&map, &buf, 0, 32, &mut report).unwrap();
        assert!(bank.active());
        assert!(report.is_clean());
    }

    #[test]
    fn test_decode_unknown_header_is_fatal() {
        let mut buf = vec![0xFF; 32];
        buf[..4].copy_from_slice(&[0x42, 0x00, 0x00, 0x00]);

        assert!(matches!(
            Bank::decode(&map(), &buf, 0x800, 32, &mut ParseReport::new()),
            Err(DecodeError::UnknownBankHeader {
                address: 0x800,
                id: 0x42
            })
        ));
    }

    #[test]
    fn test_decode_header_mismatch_is_fatal() {
        let mut buf = vec![0xFF; 32];
        buf[..4].copy_from_slice(&[0x01, 0x00, 0x07, 0x00]);

        assert!(matches!(
            Bank::decode(&map(), &buf, 0x400, 32, &mut ParseReport::new()),
            Err(DecodeError::InvalidBankHeader {
                address: 0x400,
                id: 0x01,
                length: 0x00,
                crc: 0x0007
            })
        ));
    }

    #[test]
    fn test_equality_ignores_trailing_padding() {
        let a = active_bank();
        let mut b = Bank::new(
            true,
            0x1000,
            64,
            ChunkMethod::IdBased,
            4,
            a.records().cloned().collect(),
        )
        .unwrap();
        assert_eq!(a, b);

        b.set_active(false);
        assert_ne!(a, b);
    }
}
