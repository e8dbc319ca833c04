//! Recoverable corruption found while decoding.
//!
//! Images with bad CRCs must still load so tests can assert on them.
//! Such problems are collected in a [`ParseReport`] instead of failing,
//! and mirrored as `tracing` warnings.

use std::fmt;

/// A recoverable problem in an image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Warning {
    /// Stored outer CRC does not match the chunk content.
    ChunkCrcMismatch {
        address: u32,
        id: u16,
        stored: u16,
        computed: u16,
    },

    /// CRC inside an AES envelope does not match the decrypted payload.
    InnerCrcMismatch { id: u16, stored: u16, computed: u16 },

    /// Bytes after the single bank of an address-based segment, not decoded.
    TrailingBytes { address: u32, length: usize },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ChunkCrcMismatch {
                address,
                id,
                stored,
                computed,
            } => write!(
                f,
                "CRC error for chunk 0x{id:02X} at 0x{address:08X}: stored 0x{stored:04X}, computed 0x{computed:04X}"
            ),
            Self::InnerCrcMismatch {
                id,
                stored,
                computed,
            } => write!(
                f,
                "internal CRC error for chunk 0x{id:02X}: stored 0x{stored:04X}, computed 0x{computed:04X}"
            ),
            Self::TrailingBytes { address, length } => {
                write!(f, "{length} bytes at 0x{address:08X} are past the end of the bank")
            }
        }
    }
}

/// Warnings collected while decoding an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct ParseReport {
    warnings: Vec<Warning>,
}

impl ParseReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a warning and emits it as a `tracing` event.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{warning}");
        self.warnings.push(warning);
    }

    #[must_use]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl IntoIterator for ParseReport {
    type Item = Warning;
    type IntoIter = std::vec::IntoIter<Warning>;

    fn into_iter(self) -> Self::IntoIter {
        self.warnings.into_iter()
    }
}
