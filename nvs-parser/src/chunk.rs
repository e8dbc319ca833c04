//! Chunks, the records stored in a bank.

use crate::crc::chunk_crc;
use crate::map::ChunkMethod;

/// Byte of erased flash.
pub const ERASED: u8 = 0xFF;

/// Size of the CRC that follows the payload of an address-based slot.
pub const SLOT_CRC_SIZE: usize = 2;

/// Fill of a padding chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    /// Erased flash (0xFF) up to the end of an id-based bank.
    Erased,
    /// Zero bytes between or after address-based slots.
    Zeroed,
}

impl Padding {
    #[must_use]
    pub const fn fill(self) -> u8 {
        match self {
            Self::Erased => ERASED,
            Self::Zeroed => 0x00,
        }
    }
}

/// What a chunk holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    /// A stored record.
    Record { length: usize, crc: u16 },
    /// Filler up to the next slot or the end of the bank.
    Padding(Padding),
}

/// A chunk of a bank.
///
/// For records, `payload` is the stored body: `length` bytes of data
/// followed by the word (id-based) or slot (address-based) padding. For
/// padding chunks it is the whole filled span.
#[derive(Clone, PartialEq, Eq)]
#[must_use]
pub struct Chunk {
    id: u16,
    kind: ChunkKind,
    payload: Vec<u8>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Chunk");
        s.field("id", &format_args!("0x{:04X}", self.id));
        match self.kind {
            ChunkKind::Record { length, crc } => {
                s.field("length", &length)
                    .field("crc", &format_args!("0x{crc:04X}"))
                    .field("payload", &self.payload);
            }
            ChunkKind::Padding(padding) => {
                s.field("padding", &padding).field("span", &self.payload.len());
            }
        }
        s.finish()
    }
}

impl Chunk {
    /// A record with an already known CRC, as read from flash.
    pub fn from_parts(id: u16, length: usize, crc: u16, payload: Vec<u8>) -> Self {
        Self {
            id,
            kind: ChunkKind::Record { length, crc },
            payload,
        }
    }

    /// A record holding `data`, zero-padded to `stored_len` bytes, with its
    /// CRC computed.
    pub fn record(id: u16, data: &[u8], stored_len: usize) -> Self {
        let mut payload = data.to_vec();
        payload.resize(stored_len.max(data.len()), 0x00);

        let mut chunk = Self::from_parts(id, data.len(), 0, payload);
        chunk.update_crc();
        chunk
    }

    /// A padding chunk spanning `span` bytes.
    pub fn padding(padding: Padding, span: usize) -> Self {
        Self {
            id: u16::from(padding.fill()),
            kind: ChunkKind::Padding(padding),
            payload: vec![padding.fill(); span],
        }
    }

    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Data length, `None` for padding.
    #[must_use]
    pub const fn length(&self) -> Option<usize> {
        match self.kind {
            ChunkKind::Record { length, .. } => Some(length),
            ChunkKind::Padding(_) => None,
        }
    }

    /// Stored CRC, `None` for padding.
    #[must_use]
    pub const fn crc(&self) -> Option<u16> {
        match self.kind {
            ChunkKind::Record { crc, .. } => Some(crc),
            ChunkKind::Padding(_) => None,
        }
    }

    #[must_use]
    pub const fn is_padding(&self) -> bool {
        matches!(self.kind, ChunkKind::Padding(_))
    }

    /// Stored body, padding included.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The first `length` bytes of the payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match self.kind {
            ChunkKind::Record { length, .. } => &self.payload[..length.min(self.payload.len())],
            ChunkKind::Padding(_) => &self.payload,
        }
    }

    /// CRC the chunk should carry given its id, length and data.
    #[must_use]
    pub fn computed_crc(&self) -> Option<u16> {
        self.length()
            .map(|length| chunk_crc(self.data(), self.id, length))
    }

    #[must_use]
    pub fn crc_valid(&self) -> bool {
        self.crc() == self.computed_crc()
    }

    /// Number of bytes the chunk takes in a bank.
    #[must_use]
    pub fn encoded_size(&self, method: ChunkMethod, word_size: usize) -> usize {
        match (self.kind, method) {
            (ChunkKind::Padding(_), _) => self.payload.len(),
            (ChunkKind::Record { .. }, ChunkMethod::IdBased) => word_size + self.payload.len(),
            (ChunkKind::Record { .. }, ChunkMethod::AddressBased) => {
                self.payload.len() + SLOT_CRC_SIZE
            }
        }
    }

    pub(crate) fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    /// Replaces the whole record, keeping the id.
    pub(crate) fn overwrite(&mut self, length: usize, crc: u16, payload: Vec<u8>) {
        self.kind = ChunkKind::Record { length, crc };
        self.payload = payload;
    }

    /// Overwrites the payload bytes in place, leaving length and CRC as they are.
    pub(crate) fn fill_payload(&mut self, byte: u8) {
        self.payload.fill(byte);
    }

    pub(crate) fn update_crc(&mut self) {
        if let (ChunkKind::Record { length, .. }, Some(crc)) = (self.kind, self.computed_crc()) {
            self.kind = ChunkKind::Record { length, crc };
        }
    }

    pub(crate) fn grow_padding(&mut self, extra: usize) {
        if let ChunkKind::Padding(padding) = self.kind {
            self.payload
                .resize(self.payload.len() + extra, padding.fill());
        }
    }
}

/// Rounds `len` up to a multiple of `word_size`.
#[must_use]
pub const fn word_align(len: usize, word_size: usize) -> usize {
    len.div_ceil(word_size) * word_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16_ccitt;

    #[test]
    fn test_record_pads_to_stored_len() {
        let chunk = Chunk::record(0x10, &[0x01, 0x02, 0x03], word_align(3, 4));

        assert_eq!(chunk.payload(), &[0x01, 0x02, 0x03, 0x00]);
        assert_eq!(chunk.data(), &[0x01, 0x02, 0x03]);
        assert_eq!(chunk.length(), Some(3));
        assert_eq!(
            chunk.crc(),
            Some(crc16_ccitt(&[0x01, 0x02, 0x03, 0x10, 0x03]))
        );
        assert!(chunk.crc_valid());
    }

    #[test]
    fn test_padding_has_no_length_or_crc() {
        let chunk = Chunk::padding(Padding::Erased, 12);

        assert!(chunk.is_padding());
        assert_eq!(chunk.id(), 0xFF);
        assert_eq!(chunk.length(), None);
        assert_eq!(chunk.crc(), None);
        assert_eq!(chunk.encoded_size(ChunkMethod::IdBased, 4), 12);
        assert!(chunk.payload().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_encoded_size_per_method() {
        let chunk = Chunk::record(0x10, &[0xAA; 5], 8);

        assert_eq!(chunk.encoded_size(ChunkMethod::IdBased, 4), 12);
        assert_eq!(chunk.encoded_size(ChunkMethod::IdBased, 8), 16);
        assert_eq!(chunk.encoded_size(ChunkMethod::AddressBased, 4), 10);
    }

    #[test]
    fn test_equality_covers_crc() {
        let a = Chunk::from_parts(0x10, 1, 0x1234, vec![0xAA, 0, 0, 0]);
        let b = Chunk::from_parts(0x10, 1, 0x4321, vec![0xAA, 0, 0, 0]);

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_word_align() {
        assert_eq!(word_align(0, 4), 0);
        assert_eq!(word_align(1, 4), 4);
        assert_eq!(word_align(4, 4), 4);
        assert_eq!(word_align(35, 4), 36);
    }
}
