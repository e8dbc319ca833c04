//! Zones: a pair of redundant banks.

use crate::bank::{Bank, BankError};
use crate::chunk::Chunk;

/// Two banks at contiguous addresses, at most one of them active.
///
/// Address-based images only fill the first bank slot.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Zone {
    number: usize,
    start_address: u32,
    banks: [Option<Bank>; 2],
}

impl Zone {
    pub fn new(number: usize, start_address: u32, banks: [Option<Bank>; 2]) -> Self {
        Self {
            number,
            start_address,
            banks,
        }
    }

    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    #[must_use]
    pub const fn start_address(&self) -> u32 {
        self.start_address
    }

    #[must_use]
    pub fn banks(&self) -> &[Option<Bank>; 2] {
        &self.banks
    }

    #[must_use]
    pub fn bank(&self, index: usize) -> Option<&Bank> {
        self.banks.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn bank_mut(&mut self, index: usize) -> Option<&mut Bank> {
        self.banks.get_mut(index).and_then(Option::as_mut)
    }

    /// Index of the active bank, if any.
    #[must_use]
    pub fn active_bank_index(&self) -> Option<usize> {
        self.banks
            .iter()
            .position(|b| b.as_ref().is_some_and(Bank::active))
    }

    /// Index of the first present bank that is not active.
    #[must_use]
    pub fn disabled_bank_index(&self) -> Option<usize> {
        self.banks
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| !b.active()))
    }

    #[must_use]
    pub fn active_bank(&self) -> Option<&Bank> {
        self.active_bank_index().and_then(|i| self.bank(i))
    }

    pub(crate) fn active_bank_mut(&mut self) -> Option<&mut Bank> {
        let index = self.active_bank_index()?;
        self.bank_mut(index)
    }

    #[must_use]
    pub fn disabled_bank(&self) -> Option<&Bank> {
        self.disabled_bank_index().and_then(|i| self.bank(i))
    }

    /// Banks that are present.
    pub fn valid_banks(&self) -> impl Iterator<Item = &Bank> {
        self.banks.iter().flatten()
    }

    /// Bank encodings in address order, padding included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.valid_banks().flat_map(|b| b.encode(true)).collect()
    }

    /// The bank `bank_2` should hold after `bank_1` switched over to it.
    ///
    /// Carries every id of `bank_1` once at the position of its last
    /// occurrence, without invalidated chunks. Unless the switch came from
    /// a delete, the last record of `bank_2` is the chunk that caused the
    /// switch: its older copies are dropped and it is appended last.
    pub fn expected_bank_on_switch(
        bank_1: &Bank,
        bank_2: &Bank,
        invalid_chunk_id: u8,
        delete: bool,
    ) -> Result<Bank, BankError> {
        let new_chunk = bank_2.last_record().filter(|_| !delete);

        let mut chunks = carry_over(bank_1, new_chunk.map(Chunk::id), invalid_chunk_id);
        chunks.extend(new_chunk.cloned());

        Bank::new(
            true,
            bank_2.start_address(),
            bank_2.capacity(),
            bank_2.method(),
            bank_2.word_size(),
            chunks,
        )
    }
}

/// Chunks copied out of `bank` when it overflows.
///
/// Padding, invalidated chunks and chunks with id `skip` are left behind.
/// Of every other id only the last occurrence is kept, in bank order.
pub(crate) fn carry_over(bank: &Bank, skip: Option<u16>, invalid_chunk_id: u8) -> Vec<Chunk> {
    let invalid = u16::from(invalid_chunk_id);
    let candidates: Vec<&Chunk> = bank
        .records()
        .filter(|c| c.id() != invalid && Some(c.id()) != skip)
        .collect();

    candidates
        .iter()
        .enumerate()
        .filter(|(i, chunk)| !candidates[i + 1..].iter().any(|later| later.id() == chunk.id()))
        .map(|(_, chunk)| (*chunk).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{ChunkIdMap, ChunkMethod};

    fn map() -> ChunkIdMap {
        ChunkIdMap::new(ChunkMethod::IdBased, 4).unwrap()
    }

    fn zone() -> Zone {
        let map = map();
        let mut first = Bank::erased(&map, 0x0000, 64);
        first.stamp_header(map.active_bank_header(), true).unwrap();
        let second = Bank::erased(&map, 0x0040, 64);
        Zone::new(0, 0x0000, [Some(first), Some(second)])
    }

    fn ids(chunks: &[Chunk]) -> Vec<u16> {
        chunks.iter().map(Chunk::id).collect()
    }

    #[test]
    fn test_active_and_disabled_banks() {
        let zone = zone();

        assert_eq!(zone.active_bank_index(), Some(0));
        assert_eq!(zone.disabled_bank_index(), Some(1));
        assert_eq!(zone.valid_banks().count(), 2);
        assert_eq!(zone.encode().len(), 128);
    }

    #[test]
    fn test_no_active_bank() {
        let map = map();
        let zone = Zone::new(
            0,
            0,
            [
                Some(Bank::erased(&map, 0, 32)),
                Some(Bank::erased(&map, 32, 32)),
            ],
        );

        assert!(zone.active_bank().is_none());
        assert_eq!(zone.disabled_bank_index(), Some(0));
    }

    #[test]
    fn test_carry_over_keeps_last_occurrence() {
        let mut zone = zone();
        let bank = zone.active_bank_mut().unwrap();
        for (id, byte) in [(0x10, 1), (0x11, 2), (0x10, 3), (0x00, 4), (0x12, 5)] {
            bank.append(Chunk::record(id, &[byte], 4)).unwrap();
        }

        let carried = carry_over(zone.active_bank().unwrap(), Some(0x12), 0x00);
        assert_eq!(ids(&carried), [0x01, 0x11, 0x10]);
        assert_eq!(carried[2].data(), &[3]);
    }

    #[test]
    fn test_expected_bank_appends_new_chunk() {
        let mut zone = zone();
        let bank = zone.active_bank_mut().unwrap();
        bank.append(Chunk::record(0x10, &[1], 4)).unwrap();
        bank.append(Chunk::record(0x11, &[2], 4)).unwrap();
        let before = zone.active_bank().unwrap().clone();

        let mut after = zone.bank(1).unwrap().clone();
        let chunks = vec![
            before.chunks()[0].clone(),
            Chunk::record(0x11, &[2], 4),
            Chunk::record(0x10, &[9], 4),
        ];
        after.replace_chunks(chunks).unwrap();
        after.set_active(true);

        let expected = Zone::expected_bank_on_switch(&before, &after, 0x00, false).unwrap();
        assert_eq!(expected, after);

        let expected = Zone::expected_bank_on_switch(&before, &after, 0x00, true).unwrap();
        assert_eq!(ids(&expected.records().cloned().collect::<Vec<_>>()), [0x01, 0x10, 0x11]);
    }
}
