//! Chunk-id maps.
//!
//! A map names every chunk a firmware stores and carries the layout
//! constants of its NVS: word size, chunk method, sentinel ids and the
//! three bank header templates.

use snafu::{OptionExt, Snafu, ensure};

use map_error::*;

pub const KEY_WORD_SIZE: &str = "NVS_WORD_SIZE";
pub const KEY_CHUNK_METHOD: &str = "NVS_CHUNK_METHOD";
pub const KEY_INVALID_CHUNK_ID: &str = "NVS_INVALID_CHUNK_ID";
pub const KEY_ACTIVE_BANK_ID: &str = "NVS_ACTIVE_BANK_ID";
pub const KEY_EMPTY_CHUNK_ID: &str = "NVS_EMPTY_CHUNK_ID";
pub const KEY_ACTIVE_BANK_HDR: &str = "ACTIVE_BANK_HDR";
pub const KEY_TEMP_BANK_HDR: &str = "TEMP_BANK_HDR";
pub const KEY_INVALID_BANK_HDR: &str = "INVALID_BANK_HDR";

/// Name returned by [`ChunkIdMap::chunk_id_name()`] for ids the map does not know.
pub const UNKNOWN_CHUNK_NAME: &str = "NVS_UNKNOWN_ID";

const RESERVED_KEYS: [&str; 8] = [
    KEY_WORD_SIZE,
    KEY_CHUNK_METHOD,
    KEY_INVALID_CHUNK_ID,
    KEY_ACTIVE_BANK_ID,
    KEY_EMPTY_CHUNK_ID,
    KEY_ACTIVE_BANK_HDR,
    KEY_TEMP_BANK_HDR,
    KEY_INVALID_BANK_HDR,
];

/// Size of the in-band header of an id-based chunk.
pub const ID_CHUNK_HEADER_SIZE: usize = 4;

/// How chunks are laid out inside a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkMethod {
    /// Chunks carry an `(id, length, crc)` header and are appended in order.
    IdBased,
    /// Chunks live in fixed slots declared by the map and carry no header.
    AddressBased,
}

impl ChunkMethod {
    /// Mask applied to a chunk id to get its bank-local value.
    #[must_use]
    pub const fn id_mask(self) -> u16 {
        match self {
            Self::IdBased => 0xFF,
            Self::AddressBased => 0xFFF,
        }
    }
}

/// The `(id, length, crc)` triple of a bank status header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BankHeader {
    pub id: u8,
    pub length: u8,
    pub crc: u16,
}

impl BankHeader {
    #[must_use]
    pub const fn new(id: u8, length: u8, crc: u16) -> Self {
        Self { id, length, crc }
    }
}

/// Where a named chunk lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkLocation {
    /// Id-based chunk id. The high byte selects the zone in multi-zone images.
    Id(u16),
    /// Address-based slot: payload at `data_offset`, CRC at `crc_offset`.
    Slot { data_offset: u16, crc_offset: u16 },
}

impl ChunkLocation {
    /// The numeric id a chunk of this location carries once decoded.
    #[must_use]
    pub const fn raw_id(&self) -> u16 {
        match *self {
            Self::Id(id) => id,
            Self::Slot { data_offset, .. } => data_offset,
        }
    }

    /// Payload size of a slot.
    ///
    /// `None` for id-based chunks and for slots whose CRC sits before the
    /// payload.
    #[must_use]
    pub const fn slot_len(&self) -> Option<usize> {
        match *self {
            Self::Id(_) => None,
            Self::Slot {
                data_offset,
                crc_offset,
            } => match crc_offset.checked_sub(data_offset) {
                Some(len) => Some(len as usize),
                None => None,
            },
        }
    }
}

/// A raw map value, as found in a map description file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(untagged))]
pub enum MapValue {
    Flag(bool),
    Number(u32),
    Pair([u32; 2]),
    Triple([u32; 3]),
}

/// A way to designate a chunk: by numeric id or by map name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRef<'a> {
    Id(u16),
    Name(&'a str),
}

impl From<u16> for ChunkRef<'_> {
    fn from(id: u16) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a str> for ChunkRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl std::fmt::Display for ChunkRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "0x{id:04X}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Layout constants and chunk names of one firmware's NVS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkIdMap {
    word_size: usize,
    method: ChunkMethod,
    invalid_chunk_id: u8,
    active_bank_id: u8,
    empty_chunk_id: u8,
    active_bank_header: BankHeader,
    temp_bank_header: BankHeader,
    invalid_bank_header: BankHeader,
    chunks: Vec<(String, ChunkLocation)>,
}

impl ChunkIdMap {
    /// Creates a map without any named chunk.
    ///
    /// Sentinels and headers start with the usual nRF52 values: invalid id
    /// 0x00, active bank id 0x01, empty id 0xFF, `ACTIVE_BANK_HDR = (01, 00, 0001)`,
    /// `TEMP_BANK_HDR = (FF, 00, 0002)` and `INVALID_BANK_HDR = (00, 00, 0000)`.
    pub fn new(method: ChunkMethod, word_size: usize) -> Result<Self, MapError> {
        check_word_size(method, word_size)?;

        Ok(Self {
            word_size,
            method,
            invalid_chunk_id: 0x00,
            active_bank_id: 0x01,
            empty_chunk_id: 0xFF,
            active_bank_header: BankHeader::new(0x01, 0x00, 0x0001),
            temp_bank_header: BankHeader::new(0xFF, 0x00, 0x0002),
            invalid_bank_header: BankHeader::new(0x00, 0x00, 0x0000),
            chunks: Vec::new(),
        })
    }

    /// Builds a map from ordered `(key, value)` entries.
    ///
    /// Reserved keys configure the layout, every other key names a chunk.
    /// Declaration order is kept: reverse lookups return the first name.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, MapError>
    where
        I: IntoIterator<Item = (S, MapValue)>,
        S: Into<String>,
    {
        let entries: Vec<(String, MapValue)> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let lookup = |key: &'static str| {
            entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value)
        };

        let method = match lookup(KEY_CHUNK_METHOD).context(MissingKeySnafu {
            key: KEY_CHUNK_METHOD,
        })? {
            MapValue::Flag(true) | MapValue::Number(1) => ChunkMethod::IdBased,
            MapValue::Flag(false) | MapValue::Number(0) => ChunkMethod::AddressBased,
            _ => {
                return InvalidValueSnafu {
                    key: KEY_CHUNK_METHOD,
                }
                .fail();
            }
        };

        let word_size = match lookup(KEY_WORD_SIZE).context(MissingKeySnafu { key: KEY_WORD_SIZE })? {
            MapValue::Number(n) => *n as usize,
            _ => return InvalidValueSnafu { key: KEY_WORD_SIZE }.fail(),
        };

        let mut map = Self::new(method, word_size)?;

        if let Some(value) = lookup(KEY_INVALID_CHUNK_ID) {
            map.invalid_chunk_id = byte_value(KEY_INVALID_CHUNK_ID, value)?;
        } else {
            ensure!(
                method == ChunkMethod::AddressBased,
                MissingKeySnafu {
                    key: KEY_INVALID_CHUNK_ID
                }
            );
        }

        if let Some(value) = lookup(KEY_ACTIVE_BANK_ID) {
            map.active_bank_id = byte_value(KEY_ACTIVE_BANK_ID, value)?;
        }

        if let Some(value) = lookup(KEY_EMPTY_CHUNK_ID) {
            map.empty_chunk_id = byte_value(KEY_EMPTY_CHUNK_ID, value)?;
        }

        for (key, slot) in [
            (KEY_ACTIVE_BANK_HDR, &mut map.active_bank_header),
            (KEY_TEMP_BANK_HDR, &mut map.temp_bank_header),
            (KEY_INVALID_BANK_HDR, &mut map.invalid_bank_header),
        ] {
            match lookup(key) {
                Some(value) => *slot = header_value(key, value)?,
                None => ensure!(method == ChunkMethod::AddressBased, MissingKeySnafu { key }),
            }
        }

        for (name, value) in &entries {
            if RESERVED_KEYS.contains(&name.as_str()) {
                continue;
            }

            let location = match (method, value) {
                (ChunkMethod::IdBased, MapValue::Number(id)) => {
                    let id = u16::try_from(*id)
                        .ok()
                        .context(InvalidChunkSnafu { name: name.clone() })?;
                    ChunkLocation::Id(id)
                }
                (ChunkMethod::AddressBased, MapValue::Pair([data, crc])) => {
                    let data_offset = u16::try_from(*data).ok();
                    let crc_offset = u16::try_from(*crc).ok();
                    match (data_offset, crc_offset) {
                        (Some(data_offset), Some(crc_offset)) if data_offset <= crc_offset => {
                            ChunkLocation::Slot {
                                data_offset,
                                crc_offset,
                            }
                        }
                        _ => return InvalidChunkSnafu { name: name.clone() }.fail(),
                    }
                }
                _ => return InvalidChunkSnafu { name: name.clone() }.fail(),
            };

            map.chunks.push((name.clone(), location));
        }

        Ok(map)
    }

    /// Adds a named chunk.
    pub fn with_chunk(mut self, name: impl Into<String>, location: ChunkLocation) -> Self {
        self.chunks.push((name.into(), location));
        self
    }

    /// Replaces the three bank header templates.
    pub fn with_headers(mut self, active: BankHeader, temp: BankHeader, invalid: BankHeader) -> Self {
        self.active_bank_header = active;
        self.temp_bank_header = temp;
        self.invalid_bank_header = invalid;
        self
    }

    /// Replaces the id written over deleted chunks.
    pub fn with_invalid_chunk_id(mut self, id: u8) -> Self {
        self.invalid_chunk_id = id;
        self
    }

    #[must_use]
    pub const fn word_size(&self) -> usize {
        self.word_size
    }

    #[must_use]
    pub const fn method(&self) -> ChunkMethod {
        self.method
    }

    #[must_use]
    pub const fn invalid_chunk_id(&self) -> u8 {
        self.invalid_chunk_id
    }

    #[must_use]
    pub const fn active_bank_id(&self) -> u8 {
        self.active_bank_id
    }

    #[must_use]
    pub const fn empty_chunk_id(&self) -> u8 {
        self.empty_chunk_id
    }

    #[must_use]
    pub const fn active_bank_header(&self) -> BankHeader {
        self.active_bank_header
    }

    #[must_use]
    pub const fn temp_bank_header(&self) -> BankHeader {
        self.temp_bank_header
    }

    #[must_use]
    pub const fn invalid_bank_header(&self) -> BankHeader {
        self.invalid_bank_header
    }

    /// Named chunks in declaration order.
    pub fn chunks(&self) -> impl Iterator<Item = (&str, ChunkLocation)> {
        self.chunks.iter().map(|(name, loc)| (name.as_str(), *loc))
    }

    /// Looks up a chunk by name.
    #[must_use]
    pub fn location(&self, name: &str) -> Option<ChunkLocation> {
        self.chunks
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, loc)| *loc)
    }

    /// Address-based slot starting at `data_offset`.
    #[must_use]
    pub fn slot_at(&self, data_offset: u16) -> Option<ChunkLocation> {
        let mask = self.method.id_mask();
        self.chunks
            .iter()
            .map(|(_, loc)| *loc)
            .find(|loc| matches!(loc, ChunkLocation::Slot { .. }) && loc.raw_id() & mask == data_offset & mask)
    }

    /// Resolves a [`ChunkRef`] to a location.
    ///
    /// Numeric ids always resolve for id-based maps; for address-based maps
    /// they must match the data offset of a declared slot.
    #[must_use]
    pub fn resolve(&self, chunk: ChunkRef<'_>) -> Option<ChunkLocation> {
        match (chunk, self.method) {
            (ChunkRef::Name(name), _) => self.location(name),
            (ChunkRef::Id(id), ChunkMethod::IdBased) => Some(ChunkLocation::Id(id)),
            (ChunkRef::Id(id), ChunkMethod::AddressBased) => self.slot_at(id),
        }
    }

    /// First map name whose masked id equals the masked `id`.
    #[must_use]
    pub fn chunk_name(&self, id: u16) -> Option<&str> {
        let mask = self.method.id_mask();
        self.chunks
            .iter()
            .find(|(_, loc)| loc.raw_id() & mask == id & mask)
            .map(|(name, _)| name.as_str())
    }

    /// Like [`chunk_name()`](Self::chunk_name), also naming the sentinel ids
    /// and falling back to [`UNKNOWN_CHUNK_NAME`].
    #[must_use]
    pub fn chunk_id_name(&self, id: u16) -> &str {
        if self.method == ChunkMethod::IdBased {
            let local = id & self.method.id_mask();
            if local == u16::from(self.invalid_chunk_id) {
                return KEY_INVALID_CHUNK_ID;
            } else if local == u16::from(self.active_bank_id) {
                return KEY_ACTIVE_BANK_ID;
            } else if local == u16::from(self.empty_chunk_id) {
                return KEY_EMPTY_CHUNK_ID;
            }
        }

        self.chunk_name(id).unwrap_or(UNKNOWN_CHUNK_NAME)
    }
}

fn check_word_size(method: ChunkMethod, word_size: usize) -> Result<(), MapError> {
    let min = match method {
        ChunkMethod::IdBased => ID_CHUNK_HEADER_SIZE,
        ChunkMethod::AddressBased => 1,
    };
    ensure!(word_size >= min, WordSizeTooSmallSnafu { word_size, min });
    Ok(())
}

fn byte_value(key: &'static str, value: &MapValue) -> Result<u8, MapError> {
    match value {
        MapValue::Number(n) => u8::try_from(*n).ok().context(InvalidValueSnafu { key }),
        _ => InvalidValueSnafu { key }.fail(),
    }
}

fn header_value(key: &'static str, value: &MapValue) -> Result<BankHeader, MapError> {
    let MapValue::Triple([id, length, crc]) = value else {
        return InvalidValueSnafu { key }.fail();
    };

    let id = u8::try_from(*id).ok().context(InvalidValueSnafu { key })?;
    let length = u8::try_from(*length).ok().context(InvalidValueSnafu { key })?;
    let crc = u16::try_from(*crc).ok().context(InvalidValueSnafu { key })?;

    Ok(BankHeader::new(id, length, crc))
}

/// Errors when building a [`ChunkIdMap`].
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum MapError {
    #[snafu(display("chunk-id map has no {key} entry"))]
    MissingKey { key: &'static str },

    #[snafu(display("chunk-id map entry {key} has an invalid value"))]
    InvalidValue { key: &'static str },

    #[snafu(display("chunk {name} has a location that does not fit the chunk method"))]
    InvalidChunk { name: String },

    #[snafu(display("word size {word_size} is smaller than {min}"))]
    WordSizeTooSmall { word_size: usize, min: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entries() -> Vec<(&'static str, MapValue)> {
        vec![
            (KEY_WORD_SIZE, MapValue::Number(4)),
            (KEY_CHUNK_METHOD, MapValue::Flag(true)),
            (KEY_INVALID_CHUNK_ID, MapValue::Number(0x00)),
            (KEY_ACTIVE_BANK_ID, MapValue::Number(0x01)),
            (KEY_EMPTY_CHUNK_ID, MapValue::Number(0xFF)),
            (KEY_ACTIVE_BANK_HDR, MapValue::Triple([0x01, 0x00, 0x01])),
            (KEY_TEMP_BANK_HDR, MapValue::Triple([0xFF, 0x00, 0x02])),
            (KEY_INVALID_BANK_HDR, MapValue::Triple([0x00, 0x00, 0x00])),
            ("NVS_DFU_ID", MapValue::Number(0x10)),
            ("NVS_DFU_ALIAS", MapValue::Number(0x0110)),
            ("NVS_CONNECT_ID", MapValue::Number(0x22)),
        ]
    }

    #[test]
    fn test_from_entries_id_based() {
        let map = ChunkIdMap::from_entries(test_entries()).unwrap();

        assert_eq!(map.method(), ChunkMethod::IdBased);
        assert_eq!(map.word_size(), 4);
        assert_eq!(map.active_bank_header(), BankHeader::new(0x01, 0x00, 0x0001));
        assert_eq!(map.temp_bank_header(), BankHeader::new(0xFF, 0x00, 0x0002));
        assert_eq!(map.location("NVS_CONNECT_ID"), Some(ChunkLocation::Id(0x22)));
        assert_eq!(map.chunks().count(), 3);
    }

    #[test]
    fn test_reverse_lookup_returns_first_name() {
        let map = ChunkIdMap::from_entries(test_entries()).unwrap();

        assert_eq!(map.chunk_name(0x0110), Some("NVS_DFU_ID"));
        assert_eq!(map.chunk_id_name(0x00), KEY_INVALID_CHUNK_ID);
        assert_eq!(map.chunk_id_name(0x01), KEY_ACTIVE_BANK_ID);
        assert_eq!(map.chunk_id_name(0x42), UNKNOWN_CHUNK_NAME);
    }

    #[test]
    fn test_missing_header_is_rejected_for_id_based() {
        let entries = test_entries()
            .into_iter()
            .filter(|(k, _)| *k != KEY_TEMP_BANK_HDR);

        assert!(matches!(
            ChunkIdMap::from_entries(entries),
            Err(MapError::MissingKey { key: KEY_TEMP_BANK_HDR })
        ));
    }

    #[test]
    fn test_address_based_slots() {
        let map = ChunkIdMap::from_entries([
            (KEY_WORD_SIZE, MapValue::Number(4)),
            (KEY_CHUNK_METHOD, MapValue::Flag(false)),
            ("NVS_DFU_ID", MapValue::Pair([0x00, 0x02])),
            ("NVS_REGULATORY_MODEL_NB_ID", MapValue::Pair([0x04, 0x0A])),
        ])
        .unwrap();

        let slot = map.location("NVS_REGULATORY_MODEL_NB_ID").unwrap();
        assert_eq!(slot.slot_len(), Some(6));
        assert_eq!(map.resolve(ChunkRef::Id(0x04)), Some(slot));
        assert_eq!(map.resolve(ChunkRef::Id(0x05)), None);
    }

    #[test]
    fn test_reversed_slot_has_no_length() {
        let slot = ChunkLocation::Slot {
            data_offset: 0x08,
            crc_offset: 0x04,
        };

        assert_eq!(slot.slot_len(), None);
        assert_eq!(ChunkLocation::Id(0x10).slot_len(), None);
    }

    #[test]
    fn test_id_value_on_address_based_map_is_rejected() {
        let result = ChunkIdMap::from_entries([
            (KEY_WORD_SIZE, MapValue::Number(4)),
            (KEY_CHUNK_METHOD, MapValue::Flag(false)),
            ("NVS_DFU_ID", MapValue::Number(0x10)),
        ]);

        assert!(matches!(result, Err(MapError::InvalidChunk { .. })));
    }

    #[test]
    fn test_builder_overrides_sentinels() {
        let map = ChunkIdMap::new(ChunkMethod::IdBased, 4)
            .unwrap()
            .with_headers(
                BankHeader::new(0xA0, 0x00, 0x1234),
                BankHeader::new(0xFF, 0x00, 0x0002),
                BankHeader::new(0xA1, 0x00, 0x0000),
            )
            .with_invalid_chunk_id(0x7F);

        assert_eq!(map.active_bank_header().crc, 0x1234);
        assert_eq!(map.invalid_bank_header().id, 0xA1);
        assert_eq!(map.chunk_id_name(0x7F), KEY_INVALID_CHUNK_ID);
        assert_eq!(map.chunk_id_name(0x01), KEY_ACTIVE_BANK_ID);
        assert_eq!(map.chunk_id_name(0x42), UNKNOWN_CHUNK_NAME);
    }

    #[test]
    fn test_word_size_below_header_is_rejected() {
        assert!(matches!(
            ChunkIdMap::new(ChunkMethod::IdBased, 2),
            Err(MapError::WordSizeTooSmall { word_size: 2, min: 4 })
        ));
    }
}
