//! Structural comparison of two parsers.
//!
//! A diff is a tree: parser, zones, banks, chunks. Every node lists the
//! attributes that differ and the children that differ. A node whose
//! counterpart is missing has an empty attribute list and no children.

use crate::bank::Bank;
use crate::chunk::Chunk;
use crate::crypto::Envelope;
use crate::map::BankHeader;
use crate::parser::NvsParser;
use crate::view::stored_encrypted;
use crate::zone::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserField {
    AesKey,
    ChunkIdMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneField {
    Number,
    StartAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BankField {
    Active,
    StartAddress,
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkField {
    Id,
    Length,
    Crc,
    Payload,
    /// Fields below only appear for chunks both parsers can decrypt.
    Clear,
    Iv,
    InnerCrc,
    TailPad,
}

/// Differences between two parsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserDiff {
    pub fields: Vec<ParserField>,
    pub zones: Vec<ZoneDiff>,
}

/// Number and start address of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSummary {
    pub number: usize,
    pub start_address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneDiff {
    pub index: usize,
    pub old: Option<ZoneSummary>,
    pub new: Option<ZoneSummary>,
    pub fields: Vec<ZoneField>,
    pub banks: Vec<BankDiff>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankSummary {
    pub active: bool,
    pub start_address: u32,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankDiff {
    /// Bank slot in the zone, `None` when expected and actual active banks
    /// were compared across a bank switch.
    pub index: Option<usize>,
    pub old: Option<BankSummary>,
    pub new: Option<BankSummary>,
    pub fields: Vec<BankField>,
    pub chunks: Vec<ChunkDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDiff {
    pub index: usize,
    pub old: Option<Chunk>,
    pub new: Option<Chunk>,
    pub fields: Vec<ChunkField>,
}

impl ZoneSummary {
    fn of(zone: &Zone) -> Self {
        Self {
            number: zone.number(),
            start_address: zone.start_address(),
        }
    }
}

impl BankSummary {
    fn of(bank: &Bank) -> Self {
        Self {
            active: bank.active(),
            start_address: bank.start_address(),
            capacity: bank.capacity(),
        }
    }
}

/// Which side of a diff switched banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Switch {
    /// `old` is the image before the switch.
    Forward,
    /// `new` is the image before the switch.
    Backward,
}

/// Possible readings of two zones whose active banks differ.
///
/// The image after a switch holds `INVALID_BANK_HDR` on the bank that was
/// active before it. Both readings remain when both images carry such a
/// bank, none when the active banks agree or neither image does.
fn switch_directions(old: &Zone, new: &Zone, invalid: BankHeader) -> Vec<Switch> {
    let (Some(old_index), Some(new_index)) = (old.active_bank_index(), new.active_bank_index()) else {
        return Vec::new();
    };
    if old_index == new_index {
        return Vec::new();
    }

    let retired = |zone: &Zone, index: usize| {
        zone.bank(index)
            .is_some_and(|bank| !bank.active() && bank.header() == Some(invalid))
    };

    let mut directions = Vec::new();
    if retired(new, old_index) {
        directions.push(Switch::Forward);
    }
    if retired(old, new_index) {
        directions.push(Switch::Backward);
    }
    directions
}

impl NvsParser {
    /// Compares this parser to `other`, `None` when they match.
    ///
    /// With `active_only`, zones whose active bank moved are compared
    /// through [`Zone::expected_bank_on_switch()`]: the bank the older image
    /// should have switched to against the active bank of the newer one,
    /// whichever of the two parsers is older. Set `delete` when the switch
    /// came from a delete rather than a write.
    #[must_use]
    pub fn diff(&self, other: &Self, active_only: bool, delete: bool) -> Option<ParserDiff> {
        let mut fields = Vec::new();
        if self.key() != other.key() {
            fields.push(ParserField::AesKey);
        }
        if self.map() != other.map() {
            fields.push(ParserField::ChunkIdMap);
        }

        let count = self.zones().len().max(other.zones().len());
        let zones: Vec<ZoneDiff> = (0..count)
            .filter_map(|index| {
                match (self.zones().get(index), other.zones().get(index)) {
                    (Some(old), Some(new)) => {
                        self.zone_diff(other, index, old, new, active_only, delete)
                    }
                    (old, new) => Some(ZoneDiff {
                        index,
                        old: old.map(ZoneSummary::of),
                        new: new.map(ZoneSummary::of),
                        fields: Vec::new(),
                        banks: Vec::new(),
                    }),
                }
            })
            .collect();

        (!fields.is_empty() || !zones.is_empty()).then_some(ParserDiff { fields, zones })
    }

    /// Every `(old, new)` chunk pair that differs between active banks.
    #[must_use]
    pub fn get_changed_chunks(&self, other: &Self, delete: bool) -> Vec<(Option<Chunk>, Option<Chunk>)> {
        self.diff(other, true, delete)
            .into_iter()
            .flat_map(|diff| diff.zones)
            .flat_map(|zone| zone.banks)
            .flat_map(|bank| bank.chunks)
            .map(|chunk| (chunk.old, chunk.new))
            .collect()
    }

    fn zone_diff(
        &self,
        other: &Self,
        index: usize,
        old: &Zone,
        new: &Zone,
        active_only: bool,
        delete: bool,
    ) -> Option<ZoneDiff> {
        let mut fields = Vec::new();
        if old.number() != new.number() {
            fields.push(ZoneField::Number);
        }
        if old.start_address() != new.start_address() {
            fields.push(ZoneField::StartAddress);
        }

        let mut banks = Vec::new();
        let directions = if active_only {
            switch_directions(old, new, self.map().invalid_bank_header())
        } else {
            Vec::new()
        };

        let switched = match (old.active_bank(), new.active_bank()) {
            (Some(before), Some(after)) if !directions.is_empty() => Some((before, after)),
            _ => None,
        };

        if let Some((before, after)) = switched {
            let invalid = self.map().invalid_chunk_id();
            let diffs: Vec<Option<BankDiff>> = directions
                .into_iter()
                .map(|direction| match direction {
                    Switch::Forward => match Zone::expected_bank_on_switch(before, after, invalid, delete) {
                        Ok(expected) => self.bank_diff(other, None, &expected, after),
                        Err(error) => {
                            tracing::debug!("expected bank does not fit: {error}");
                            self.bank_diff(other, None, before, after)
                        }
                    },
                    Switch::Backward => match Zone::expected_bank_on_switch(after, before, invalid, delete) {
                        Ok(expected) => self.bank_diff(other, None, before, &expected),
                        Err(error) => {
                            tracing::debug!("expected bank does not fit: {error}");
                            self.bank_diff(other, None, before, after)
                        }
                    },
                })
                .collect();

            // Either reading of the switch explains the change.
            if diffs.iter().all(Option::is_some) {
                banks.extend(diffs.into_iter().flatten().next());
            }
        } else {
            for slot in 0..2 {
                match (old.bank(slot), new.bank(slot)) {
                    (None, None) => {}
                    (Some(a), Some(b)) => banks.extend(self.bank_diff(other, Some(slot), a, b)),
                    (a, b) => banks.push(BankDiff {
                        index: Some(slot),
                        old: a.map(BankSummary::of),
                        new: b.map(BankSummary::of),
                        fields: Vec::new(),
                        chunks: Vec::new(),
                    }),
                }
            }
        }

        (!fields.is_empty() || !banks.is_empty()).then(|| ZoneDiff {
            index,
            old: Some(ZoneSummary::of(old)),
            new: Some(ZoneSummary::of(new)),
            fields,
            banks,
        })
    }

    fn bank_diff(&self, other: &Self, index: Option<usize>, old: &Bank, new: &Bank) -> Option<BankDiff> {
        let mut fields = Vec::new();
        if old.active() != new.active() {
            fields.push(BankField::Active);
        }
        if old.start_address() != new.start_address() {
            fields.push(BankField::StartAddress);
        }
        if old.capacity() != new.capacity() {
            fields.push(BankField::Capacity);
        }

        let count = old.chunks().len().max(new.chunks().len());
        let chunks: Vec<ChunkDiff> = (0..count)
            .filter_map(|i| {
                let a = old.chunks().get(i);
                let b = new.chunks().get(i);
                let fields = match (a, b) {
                    (Some(a), Some(b)) => {
                        let fields = self.chunk_fields(other, a, b);
                        if fields.is_empty() {
                            return None;
                        }
                        fields
                    }
                    _ => Vec::new(),
                };
                Some(ChunkDiff {
                    index: i,
                    old: a.cloned(),
                    new: b.cloned(),
                    fields,
                })
            })
            .collect();

        (!fields.is_empty() || !chunks.is_empty()).then(|| BankDiff {
            index,
            old: Some(BankSummary::of(old)),
            new: Some(BankSummary::of(new)),
            fields,
            chunks,
        })
    }

    fn chunk_fields(&self, other: &Self, a: &Chunk, b: &Chunk) -> Vec<ChunkField> {
        let mut fields = Vec::new();
        if a.id() != b.id() {
            fields.push(ChunkField::Id);
        }
        if a.length() != b.length() {
            fields.push(ChunkField::Length);
        }
        if a.crc() != b.crc() {
            fields.push(ChunkField::Crc);
        }
        if a.payload() != b.payload() {
            fields.push(ChunkField::Payload);
        }

        if let (Some(x), Some(y)) = (self.envelope_of(a), other.envelope_of(b)) {
            if x.clear() != y.clear() {
                fields.push(ChunkField::Clear);
            }
            if x.iv() != y.iv() {
                fields.push(ChunkField::Iv);
            }
            if x.inner_crc() != y.inner_crc() {
                fields.push(ChunkField::InnerCrc);
            }
            if x.tail_pad() != y.tail_pad() {
                fields.push(ChunkField::TailPad);
            }
        }

        fields
    }

    /// Envelope of a chunk stored encrypted in either mode.
    fn envelope_of(&self, chunk: &Chunk) -> Option<Envelope> {
        if chunk.is_padding() || !self.chunk_name(chunk.id()).is_some_and(stored_encrypted) {
            return None;
        }

        self.decrypt_chunk(chunk).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ERASED;
    use crate::codec::BankCapacity;
    use crate::map::{ChunkIdMap, ChunkLocation, ChunkMethod};

    fn parser() -> NvsParser {
        let map = ChunkIdMap::new(ChunkMethod::IdBased, 4)
            .unwrap()
            .with_chunk("NVS_FOO_ID", ChunkLocation::Id(0x10))
            .with_chunk("NVS_BAR_ID", ChunkLocation::Id(0x11));
        let (mut parser, _) =
            NvsParser::from_memory_read(0, &[ERASED; 128], &BankCapacity::Uniform(64), map, None).unwrap();
        parser.activate_bank(0, 0).unwrap();
        parser
    }

    #[test]
    fn test_identical_parsers() {
        let parser = parser();

        assert_eq!(parser.diff(&parser.clone(), true, false), None);
        assert_eq!(parser.diff(&parser.clone(), false, false), None);
    }

    #[test]
    fn test_added_chunk_is_reported() {
        let before = parser();
        let mut after = before.clone();
        after.add_new_chunk("NVS_FOO_ID", &[1, 2], None).unwrap();

        let diff = before.diff(&after, true, false).unwrap();
        assert!(diff.fields.is_empty());
        assert_eq!(diff.zones.len(), 1);
        assert_eq!(diff.zones[0].banks[0].index, Some(0));

        let changed = before.get_changed_chunks(&after, false);
        assert_eq!(changed.len(), 2);
        let (old, new) = &changed[0];
        assert!(old.as_ref().is_some_and(Chunk::is_padding));
        assert_eq!(new.as_ref().map(Chunk::id), Some(0x10));
    }

    #[test]
    fn test_switch_matches_expected_bank() {
        let mut before = parser();
        before.add_new_chunk("NVS_FOO_ID", &[0xAA; 20], None).unwrap();
        before.add_new_chunk("NVS_BAR_ID", &[0xBB; 20], None).unwrap();

        let mut after = before.clone();
        after.add_new_chunk("NVS_FOO_ID", &[0xCC; 12], None).unwrap();
        assert_eq!(after.zones()[0].active_bank_index(), Some(1));

        assert_eq!(before.diff(&after, true, false), None);
        assert_eq!(after.diff(&before, true, false), None);
        assert!(before.diff(&after, false, false).is_some());
        assert!(after.diff(&before, false, false).is_some());
    }

    #[test]
    fn test_unexpected_switch_is_reported_both_ways() {
        let mut before = parser();
        before.add_new_chunk("NVS_FOO_ID", &[0xAA; 20], None).unwrap();
        before.add_new_chunk("NVS_BAR_ID", &[0xBB; 20], None).unwrap();

        let mut after = before.clone();
        after.add_new_chunk("NVS_FOO_ID", &[0xCC; 12], None).unwrap();
        after.add_new_chunk("NVS_BAR_ID", &[0xDD; 4], None).unwrap();
        assert_eq!(after.zones()[0].active_bank_index(), Some(1));

        assert!(before.diff(&after, true, false).is_some());
        assert!(after.diff(&before, true, false).is_some());
    }

    #[test]
    fn test_missing_zone() {
        let a = parser();
        let b = NvsParser::new(a.map().clone(), Vec::new(), None);

        let diff = a.diff(&b, true, false).unwrap();
        assert_eq!(diff.zones[0].old.map(|z| z.number), Some(0));
        assert_eq!(diff.zones[0].new, None);
        assert!(b.diff(&a, true, false).is_some());
    }

    #[test]
    fn test_key_difference() {
        let a = parser();
        let b = NvsParser::new(a.map().clone(), a.zones().to_vec(), Some([1; 16]));

        assert_eq!(
            a.diff(&b, true, false).map(|d| d.fields),
            Some(vec![ParserField::AesKey])
        );
    }
}
