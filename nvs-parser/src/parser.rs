//! The NVS parser facade.

use std::fmt;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::bank::{Bank, BankError};
use crate::chunk::{Chunk, ERASED, word_align};
use crate::codec::{self, BankCapacity, DecodeError};
use crate::crypto::{AesKey, CryptoError, Envelope, IV_SIZE};
use crate::ihex::MemoryImage;
use crate::map::{ChunkIdMap, ChunkLocation, ChunkMethod, ChunkRef};
use crate::report::{ParseReport, Warning};
use crate::view::{ChunkView, Mode, ViewError, ViewSpec, stored_encrypted, view_spec};
use crate::zone::{Zone, carry_over};

use mutate_error::*;
use query_error::*;

/// Payloads must be shorter than this.
pub const MAX_CHUNK_DATA_SIZE: usize = 256;

const PAIRING_RANGES: [(&str, &str); 2] = [
    ("NVS_EQUAD_H0_ADDR_ID", "NVS_EQUAD_H7_PAIRING_SRC_ID"),
    ("NVS_BLE_BOND_ID_0", "NVS_BLE_LAST_GAP_ADDR_USED"),
];
const PAIRING_SINGLES: [&str; 2] = ["NVS_BTLDR_CONNECT_ID", "NVS_CONNECT_ID"];

/// Usage of the bank a chunk would be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankStatus {
    pub bank_index: usize,
    pub used: usize,
    pub capacity: usize,
}

/// Which occurrences [`NvsParser::get_chunk_history()`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    /// Keep the active-bank copy of a chunk carried over by a bank switch.
    pub include_duplicates: bool,
    /// Only look at the active bank.
    pub active_only: bool,
}

/// A decoded NVS with its chunk-id map and optional AES key.
///
/// Every query and mutation takes a chunk by numeric id or by map name.
/// With several zones, the high byte of an id-based id selects the zone.
#[derive(Clone, PartialEq, Eq)]
pub struct NvsParser {
    map: ChunkIdMap,
    zones: Vec<Zone>,
    key: Option<AesKey>,
    last_written: Option<u16>,
}

impl fmt::Debug for NvsParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NvsParser")
            .field("method", &self.map.method())
            .field("word_size", &self.map.word_size())
            .field("zones", &self.zones)
            .field("key", &self.key.map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Where a chunk reference points.
#[derive(Debug, Clone, Copy)]
struct Target {
    zone: usize,
    /// Id the chunk carries inside its bank.
    id: u16,
    location: ChunkLocation,
}

enum Unresolved {
    Unknown(String),
    Zone { zone: usize, zones: usize },
}

impl NvsParser {
    pub fn new(map: ChunkIdMap, zones: Vec<Zone>, key: Option<AesKey>) -> Self {
        Self {
            map,
            zones,
            key,
            last_written: None,
        }
    }

    /// Decodes `(start_address, bytes)` segments into a parser.
    pub fn from_segments<'a, I>(
        segments: I,
        capacities: &BankCapacity,
        map: ChunkIdMap,
        key: Option<AesKey>,
    ) -> Result<(Self, ParseReport), DecodeError>
    where
        I: IntoIterator<Item = (u32, &'a [u8])>,
    {
        let mut report = ParseReport::new();
        let zones = codec::decode_image(&map, segments, capacities, &mut report)?;
        let parser = Self::new(map, zones, key);
        parser.check_envelopes(&mut report);
        Ok((parser, report))
    }

    /// Decodes every contiguous segment of a memory image.
    pub fn from_hex_image(
        image: &MemoryImage,
        capacities: &BankCapacity,
        map: ChunkIdMap,
        key: Option<AesKey>,
    ) -> Result<(Self, ParseReport), DecodeError> {
        let segments = image.segments();
        Self::from_segments(
            segments.iter().map(|(start, data)| (*start, data.as_slice())),
            capacities,
            map,
            key,
        )
    }

    /// Decodes a raw memory dump starting at `start`.
    pub fn from_memory_read(
        start: u32,
        bytes: &[u8],
        capacities: &BankCapacity,
        map: ChunkIdMap,
        key: Option<AesKey>,
    ) -> Result<(Self, ParseReport), DecodeError> {
        Self::from_segments([(start, bytes)], capacities, map, key)
    }

    #[must_use]
    pub fn map(&self) -> &ChunkIdMap {
        &self.map
    }

    #[must_use]
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    #[must_use]
    pub fn key(&self) -> Option<&AesKey> {
        self.key.as_ref()
    }

    /// Encodes every zone as `(start_address, bytes)`.
    #[must_use]
    pub fn encode(&self) -> Vec<(u32, Vec<u8>)> {
        codec::encode_image(&self.zones)
    }

    /// The encoded zones placed in a memory image.
    #[must_use]
    pub fn to_hex_image(&self) -> MemoryImage {
        let mut image = MemoryImage::new();
        for (start, bytes) in self.encode() {
            image.put(start, &bytes);
        }
        image
    }

    /// First map name of `id`.
    #[must_use]
    pub fn chunk_name(&self, id: u16) -> Option<&str> {
        self.map.chunk_name(id)
    }

    /// Map name of `id`, sentinel names included.
    #[must_use]
    pub fn chunk_id_name(&self, id: u16) -> &str {
        self.map.chunk_id_name(id)
    }

    /// Opens the AES envelope of a stored chunk.
    ///
    /// Returns `None` when the parser has no key.
    pub fn decrypt_chunk(&self, chunk: &Chunk) -> Result<Option<Envelope>, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let length = chunk.length().unwrap_or_default();
        Envelope::open(key, chunk.payload(), length).map(Some)
    }

    /// Typed view of a stored chunk, the way [`NvsParser::get_chunk`] would
    /// return it for `mode`.
    pub fn view_chunk<'a>(
        &'a self,
        chunk: &'a Chunk,
        mode: Option<Mode>,
    ) -> Result<ChunkView<'a>, ViewError> {
        let spec = self.view_spec_of(ChunkRef::Id(chunk.id()), mode);
        ChunkView::new(chunk, spec, self.key.as_ref())
    }

    /// Last occurrence of a chunk.
    ///
    /// With a `mode`, chunks listed in the view table are decrypted and
    /// decoded.
    pub fn get_chunk<'c>(
        &self,
        chunk: impl Into<ChunkRef<'c>>,
        mode: Option<Mode>,
    ) -> Result<Option<ChunkView<'_>>, QueryError> {
        let mut history = self.get_chunk_history(chunk, mode, HistoryOptions::default())?;
        Ok(history.pop())
    }

    /// Every occurrence of a chunk, oldest first.
    ///
    /// The disabled bank comes before the active one. The first active
    /// occurrence is dropped when it equals the last disabled one, unless
    /// `options.include_duplicates` is set.
    pub fn get_chunk_history<'c>(
        &self,
        chunk: impl Into<ChunkRef<'c>>,
        mode: Option<Mode>,
        options: HistoryOptions,
    ) -> Result<Vec<ChunkView<'_>>, QueryError> {
        let chunk = chunk.into();
        let target = self.target(chunk)?;
        let spec = self.view_spec_of(chunk, mode);
        let zone = &self.zones[target.zone];

        let Some(active) = zone.active_bank() else {
            return Ok(Vec::new());
        };
        let mut history = active.history(target.id);

        if !options.active_only && zone.valid_banks().count() > 1 {
            if let Some(disabled) = zone.disabled_bank() {
                let mut older = disabled.history(target.id);
                let carried = match (older.last(), history.first()) {
                    (Some(last), Some(first)) => last == first,
                    _ => false,
                };
                if carried && !options.include_duplicates {
                    history.remove(0);
                }
                older.append(&mut history);
                history = older;
            }
        }

        history
            .into_iter()
            .map(|chunk| ChunkView::new(chunk, spec, self.key.as_ref()).context(ViewSnafu))
            .collect()
    }

    /// Whether the last record written to the chunk's bank is that chunk.
    ///
    /// Address-based banks have no write order; the last slot written
    /// through this parser counts, or the highest slot.
    pub fn is_last_chunk_id<'c>(&self, chunk: impl Into<ChunkRef<'c>>) -> Result<bool, QueryError> {
        let target = self.target(chunk.into())?;
        let Some(bank) = self.zones[target.zone].active_bank() else {
            return Ok(false);
        };

        let last = match self.map.method() {
            ChunkMethod::IdBased => bank.last_record().map(Chunk::id),
            ChunkMethod::AddressBased => self
                .last_written
                .or_else(|| bank.last_record().map(Chunk::id)),
        };
        Ok(last == Some(target.id))
    }

    /// Usage of the active bank holding a chunk, `None` without active bank.
    pub fn get_active_bank_status<'c>(
        &self,
        chunk: impl Into<ChunkRef<'c>>,
    ) -> Result<Option<BankStatus>, QueryError> {
        let target = self.target(chunk.into())?;
        let zone = &self.zones[target.zone];

        Ok(zone.active_bank_index().and_then(|bank_index| {
            zone.bank(bank_index).map(|bank| BankStatus {
                bank_index,
                used: bank.current_length(),
                capacity: bank.capacity(),
            })
        }))
    }

    /// Writes a new occurrence of a chunk.
    ///
    /// With an `iv` and a key, `data` is stored in an AES envelope. Id-based
    /// chunks are appended to the active bank, switching banks when it is
    /// full. Address-based chunks overwrite their slot.
    pub fn add_new_chunk<'c>(
        &mut self,
        chunk: impl Into<ChunkRef<'c>>,
        data: &[u8],
        iv: Option<[u8; IV_SIZE]>,
    ) -> Result<(), MutateError> {
        ensure!(
            data.len() < MAX_CHUNK_DATA_SIZE,
            PayloadTooLargeSnafu {
                length: data.len(),
                max: MAX_CHUNK_DATA_SIZE - 1
            }
        );

        let target = self.target(chunk.into())?;
        let body = match (iv, &self.key) {
            (Some(iv), Some(key)) => Envelope::new(iv, data).seal(key),
            (Some(_), None) => {
                tracing::warn!(
                    "no AES key to encrypt chunk 0x{:04X}, storing it in clear",
                    target.location.raw_id()
                );
                data.to_vec()
            }
            (None, _) => data.to_vec(),
        };
        ensure!(
            body.len() < MAX_CHUNK_DATA_SIZE,
            PayloadTooLargeSnafu {
                length: body.len(),
                max: MAX_CHUNK_DATA_SIZE - 1
            }
        );

        match target.location {
            ChunkLocation::Id(_) => {
                let stored = word_align(body.len(), self.map.word_size());
                self.push_record(target.zone, Chunk::record(target.id, &body, stored))
            }
            ChunkLocation::Slot { data_offset, .. } => {
                let slot_len = target.location.slot_len().unwrap_or_default();
                ensure!(
                    body.len() <= slot_len,
                    SlotOverflowSnafu {
                        data_offset,
                        length: body.len(),
                        slot_len
                    }
                );

                let mut payload = body;
                payload.resize(slot_len, 0x00);
                let record = Chunk::record(target.id, &payload, slot_len);
                self.write_slot(target, record)
            }
        }
    }

    /// Deletes one occurrence of a chunk from its active bank.
    ///
    /// Without `data`, the last occurrence is deleted and a missing chunk
    /// is not an error. With `data`, the first occurrence holding exactly
    /// that data is deleted and must exist. Id-based chunks get the invalid
    /// chunk id, address-based slots are filled with 0xFF.
    pub fn delete_chunk<'c>(
        &mut self,
        chunk: impl Into<ChunkRef<'c>>,
        data: Option<&[u8]>,
    ) -> Result<(), MutateError> {
        let chunk = chunk.into();
        let target = self.target(chunk)?;
        let invalid = u16::from(self.map.invalid_chunk_id());
        let bank = self.zones[target.zone]
            .active_bank_mut()
            .context(NoActiveBankSnafu { zone: target.zone })?;

        let mut records = bank
            .chunks_mut()
            .iter_mut()
            .filter(|c| !c.is_padding() && c.id() == target.id);
        let found = match data {
            Some(data) => records.find(|c| c.data() == data),
            None => records.next_back(),
        };

        match (found, data) {
            (Some(found), _) => {
                erase(found, target.location, invalid);
                Ok(())
            }
            (None, Some(_)) => NotFoundSnafu {
                chunk: chunk.to_string(),
            }
            .fail(),
            (None, None) => Ok(()),
        }
    }

    /// Deletes every occurrence of a chunk in both banks of its zone.
    pub fn delete_all_chunks<'c>(&mut self, chunk: impl Into<ChunkRef<'c>>) -> Result<(), MutateError> {
        let target = self.target(chunk.into())?;
        let invalid = u16::from(self.map.invalid_chunk_id());

        for index in 0..2 {
            if let Some(bank) = self.zones[target.zone].bank_mut(index) {
                bank.chunks_mut()
                    .iter_mut()
                    .filter(|c| !c.is_padding() && c.id() == target.id)
                    .for_each(|c| erase(c, target.location, invalid));
            }
        }

        Ok(())
    }

    /// Copies the last active occurrence of every id in `ids` from `other`.
    ///
    /// An existing local occurrence is overwritten in place, otherwise the
    /// chunk is added. Ids missing from `other` are skipped.
    pub fn copy_chunks(&mut self, other: &Self, ids: &[u16]) -> Result<(), MutateError> {
        for &id in ids {
            let Ok(source) = other.target(ChunkRef::Id(id)) else {
                continue;
            };
            let Some(copied) = other.zones[source.zone]
                .active_bank()
                .and_then(|bank| bank.history(source.id).last().copied())
                .cloned()
            else {
                continue;
            };

            let target = self.target(ChunkRef::Id(id))?;
            if let ChunkLocation::Slot { .. } = target.location {
                self.write_slot(target, copied)?;
                continue;
            }

            let zone = target.zone;
            let local = self.zones[zone].active_bank().and_then(|bank| {
                bank.chunks()
                    .iter()
                    .rposition(|c| !c.is_padding() && c.id() == target.id)
            });
            match local {
                Some(index) => self.zones[zone]
                    .active_bank_mut()
                    .context(NoActiveBankSnafu { zone })?
                    .replace_chunk(index, copied)
                    .context(BankFullSnafu { zone })?,
                None => {
                    tracing::debug!("chunk 0x{id:04X} is not present locally, adding it");
                    self.push_record(zone, copied)?;
                }
            }
        }

        Ok(())
    }

    /// Copies the pairing information of `other`: EQuad pairing chunks,
    /// BLE bonds up to the last GAP address, bootloader and connect ids.
    pub fn copy_pairing(&mut self, other: &Self) -> Result<(), MutateError> {
        let id_of = |name: &str| match self.map.location(name) {
            Some(ChunkLocation::Id(id)) => Some(id),
            _ => None,
        };

        let mut ids = Vec::new();
        for (first, last) in PAIRING_RANGES {
            let (Some(first), Some(last)) = (id_of(first), id_of(last)) else {
                continue;
            };
            ids.extend(self.map.chunks().filter_map(|(_, location)| match location {
                ChunkLocation::Id(id) if (first..=last).contains(&id) => Some(id),
                _ => None,
            }));
        }
        ids.extend(PAIRING_SINGLES.iter().filter_map(|name| id_of(name)));
        ids.dedup();

        self.copy_chunks(other, &ids)
    }

    /// Makes bank `bank` of zone `zone` the active one.
    ///
    /// The bank gets `ACTIVE_BANK_HDR`; the other bank, if it was active,
    /// gets `INVALID_BANK_HDR`.
    pub fn activate_bank(&mut self, zone: usize, bank: usize) -> Result<(), MutateError> {
        let zones = self.zones.len();
        let active_header = self.map.active_bank_header();
        let invalid_header = self.map.invalid_bank_header();
        let entry = self
            .zones
            .get_mut(zone)
            .context(mutate_error::ZoneOutOfRangeSnafu { zone, zones })?;

        let previous = entry.active_bank_index().filter(|&index| index != bank);
        entry
            .bank_mut(bank)
            .context(MissingBankSnafu { zone, bank })?
            .stamp_header(active_header, true)
            .context(BankFullSnafu { zone })?;

        if let Some(bank) = previous.and_then(|index| entry.bank_mut(index)) {
            bank.stamp_header(invalid_header, false)
                .context(BankFullSnafu { zone })?;
        }

        Ok(())
    }

    fn target(&self, chunk: ChunkRef<'_>) -> Result<Target, Unresolved> {
        let location = self
            .map
            .resolve(chunk)
            .ok_or_else(|| Unresolved::Unknown(chunk.to_string()))?;

        let (zone, id) = match location {
            ChunkLocation::Id(raw) => {
                let zone = if self.zones.len() > 1 {
                    usize::from((raw >> 8) & 0xFF)
                } else {
                    0
                };
                (zone, raw & ChunkMethod::IdBased.id_mask())
            }
            ChunkLocation::Slot { data_offset, .. } => (0, data_offset),
        };

        if zone >= self.zones.len() {
            return Err(Unresolved::Zone {
                zone,
                zones: self.zones.len(),
            });
        }

        Ok(Target { zone, id, location })
    }

    /// Reports every encrypted chunk whose inner CRC does not match.
    fn check_envelopes(&self, report: &mut ParseReport) {
        let Some(key) = &self.key else {
            return;
        };

        let records = self
            .zones
            .iter()
            .flat_map(Zone::valid_banks)
            .flat_map(Bank::records);
        for chunk in records {
            if !self.map.chunk_name(chunk.id()).is_some_and(stored_encrypted) {
                continue;
            }

            let length = chunk.length().unwrap_or_default();
            match Envelope::open(key, chunk.payload(), length) {
                Ok(envelope) if !envelope.crc_valid() => report.warn(Warning::InnerCrcMismatch {
                    id: chunk.id(),
                    stored: envelope.inner_crc(),
                    computed: envelope.computed_crc(),
                }),
                Ok(_) => {}
                Err(error) => tracing::debug!("chunk 0x{:02X} has no envelope: {error}", chunk.id()),
            }
        }
    }

    fn view_spec_of(&self, chunk: ChunkRef<'_>, mode: Option<Mode>) -> Option<ViewSpec> {
        let mode = mode?;
        let name = match chunk {
            ChunkRef::Name(name) => Some(name),
            ChunkRef::Id(id) => self.map.chunk_name(id),
        };
        view_spec(name?, mode)
    }

    /// Appends an id-based record, switching banks when it does not fit.
    fn push_record(&mut self, zone_number: usize, record: Chunk) -> Result<(), MutateError> {
        let invalid_id = self.map.invalid_chunk_id();
        let invalid_header = self.map.invalid_bank_header();
        let zone = &mut self.zones[zone_number];

        let active_index = zone
            .active_bank_index()
            .context(NoActiveBankSnafu { zone: zone_number })?;
        let active = zone
            .bank_mut(active_index)
            .context(NoActiveBankSnafu { zone: zone_number })?;

        if active.current_length() + active.encoded_size_of(&record) <= active.capacity() {
            return active.append(record).context(BankFullSnafu { zone: zone_number });
        }

        let mut carried = carry_over(active, Some(record.id()), invalid_id);
        carried.push(record);

        let disabled_index = zone
            .disabled_bank_index()
            .context(NoBankToSwitchSnafu { zone: zone_number })?;
        tracing::info!(
            "bank {active_index} of zone {zone_number} is full, switching to bank {disabled_index}"
        );

        let disabled = zone
            .bank_mut(disabled_index)
            .context(NoBankToSwitchSnafu { zone: zone_number })?;
        disabled
            .replace_chunks(carried)
            .context(BankFullSnafu { zone: zone_number })?;
        disabled.set_active(true);

        if let Some(previous) = zone.bank_mut(active_index) {
            previous
                .stamp_header(invalid_header, false)
                .context(BankFullSnafu { zone: zone_number })?;
        }

        Ok(())
    }

    /// Replaces the content of an address-based slot.
    fn write_slot(&mut self, target: Target, record: Chunk) -> Result<(), MutateError> {
        let bank = self.zones[target.zone]
            .bank_mut(0)
            .context(NoActiveBankSnafu { zone: target.zone })?;
        let slot = bank
            .chunks_mut()
            .iter_mut()
            .find(|c| !c.is_padding() && c.id() == target.id)
            .context(NotFoundSnafu {
                chunk: format!("0x{:04X}", target.id),
            })?;

        ensure!(
            record.payload().len() == slot.payload().len(),
            SlotOverflowSnafu {
                data_offset: target.id,
                length: record.payload().len(),
                slot_len: slot.payload().len()
            }
        );
        if let (Some(length), Some(crc)) = (record.length(), record.crc()) {
            slot.overwrite(length, crc, record.payload().to_vec());
        }
        self.last_written = Some(target.id);
        Ok(())
    }
}

fn erase(chunk: &mut Chunk, location: ChunkLocation, invalid_id: u16) {
    match location {
        ChunkLocation::Id(_) => chunk.set_id(invalid_id),
        ChunkLocation::Slot { .. } => chunk.fill_payload(ERASED),
    }
}

impl From<Unresolved> for QueryError {
    fn from(unresolved: Unresolved) -> Self {
        match unresolved {
            Unresolved::Unknown(chunk) => Self::UnknownChunk { chunk },
            Unresolved::Zone { zone, zones } => Self::ZoneOutOfRange { zone, zones },
        }
    }
}

impl From<Unresolved> for MutateError {
    fn from(unresolved: Unresolved) -> Self {
        match unresolved {
            Unresolved::Unknown(chunk) => Self::UnknownChunk { chunk },
            Unresolved::Zone { zone, zones } => Self::ZoneOutOfRange { zone, zones },
        }
    }
}

/// Errors when reading chunks.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum QueryError {
    #[snafu(display("chunk {chunk} is not in the chunk-id map"))]
    UnknownChunk { chunk: String },

    #[snafu(display("zone {zone} does not exist, the image has {zones} zones"))]
    ZoneOutOfRange { zone: usize, zones: usize },

    #[snafu(display("cannot decode chunk view"))]
    View { source: ViewError },
}

/// Errors when changing chunks.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum MutateError {
    #[snafu(display("chunk payload of {length} bytes is larger than {max}"))]
    PayloadTooLarge { length: usize, max: usize },

    #[snafu(display("{length} bytes do not fit the {slot_len}-byte slot at 0x{data_offset:04X}"))]
    SlotOverflow {
        data_offset: u16,
        length: usize,
        slot_len: usize,
    },

    #[snafu(display("zone {zone} has no active bank"))]
    NoActiveBank { zone: usize },

    #[snafu(display("zone {zone} has no bank to switch to"))]
    NoBankToSwitch { zone: usize },

    #[snafu(display("zone {zone} has no bank {bank}"))]
    MissingBank { zone: usize, bank: usize },

    #[snafu(display("bank of zone {zone} is full"))]
    BankFull { zone: usize, source: BankError },

    #[snafu(display("could not find chunk {chunk} with the given data"))]
    NotFound { chunk: String },

    #[snafu(display("chunk {chunk} is not in the chunk-id map"))]
    UnknownChunk { chunk: String },

    #[snafu(display("zone {zone} does not exist, the image has {zones} zones"))]
    ZoneOutOfRange { zone: usize, zones: usize },
}
