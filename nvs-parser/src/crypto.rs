//! AES envelope of encrypted chunks.
//!
//! An encrypted chunk payload is laid out as:
//!
//! ```text
//! [ iv : 16 ][ AES-128-CBC(clear ‖ inner_crc_le) ][ tail_pad ]
//! ```
//!
//! The stored chunk length covers `iv` and the ciphertext, which has the
//! same size as the clear text plus its CRC. Whole 16-byte blocks are
//! chained with CBC. A trailing partial block is XORed with the encryption
//! of the previous ciphertext block (the IV when there is none), so the
//! ciphertext never needs block padding.

use aes::Aes128;
use aes::cipher::consts::U16;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use snafu::{Snafu, ensure};

use crate::crc::crc16_ccitt;

use crypto_error::*;

/// AES-128 key.
pub type AesKey = [u8; 16];

pub const BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = BLOCK_SIZE;
pub const INNER_CRC_SIZE: usize = 2;

/// Bytes an envelope adds to the clear payload.
pub const ENVELOPE_OVERHEAD: usize = IV_SIZE + INNER_CRC_SIZE;

/// A decrypted (or to-be-encrypted) chunk payload.
#[derive(Clone, PartialEq, Eq)]
#[must_use]
pub struct Envelope {
    iv: [u8; IV_SIZE],
    clear: Vec<u8>,
    inner_crc: u16,
    tail_pad: Vec<u8>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("iv", &self.iv)
            .field("clear_len", &self.clear.len())
            .field("inner_crc", &self.inner_crc)
            .field("tail_pad", &self.tail_pad)
            .finish_non_exhaustive()
    }
}

impl Envelope {
    /// Wraps a clear payload, computing its inner CRC.
    pub fn new(iv: [u8; IV_SIZE], clear: &[u8]) -> Self {
        Self {
            iv,
            clear: clear.to_vec(),
            inner_crc: crc16_ccitt(clear),
            tail_pad: Vec::new(),
        }
    }

    /// Decrypts a stored chunk payload.
    ///
    /// `length` is the chunk length from the header; bytes past it are kept
    /// as the tail padding. A wrong inner CRC is not an error, see
    /// [`crc_valid()`](Self::crc_valid).
    pub fn open(key: &AesKey, payload: &[u8], length: usize) -> Result<Self, CryptoError> {
        ensure!(
            length >= ENVELOPE_OVERHEAD,
            TooShortSnafu {
                length,
                min: ENVELOPE_OVERHEAD
            }
        );
        ensure!(
            payload.len() >= length,
            TruncatedSnafu {
                length,
                available: payload.len()
            }
        );

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&payload[..IV_SIZE]);

        let mut clear = payload[IV_SIZE..length].to_vec();
        decrypt_in_place(key, &iv, &mut clear);

        let crc_at = clear.len() - INNER_CRC_SIZE;
        let inner_crc = u16::from_le_bytes([clear[crc_at], clear[crc_at + 1]]);
        clear.truncate(crc_at);

        Ok(Self {
            iv,
            clear,
            inner_crc,
            tail_pad: payload[length..].to_vec(),
        })
    }

    /// Encrypts back to a chunk payload: `iv ‖ ciphertext ‖ tail_pad`.
    #[must_use]
    pub fn seal(&self, key: &AesKey) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.clear.len() + INNER_CRC_SIZE);
        body.extend_from_slice(&self.clear);
        body.extend_from_slice(&crc16_ccitt(&self.clear).to_le_bytes());
        encrypt_in_place(key, &self.iv, &mut body);

        let mut out = Vec::with_capacity(self.envelope_len() + self.tail_pad.len());
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&body);
        out.extend_from_slice(&self.tail_pad);
        out
    }

    /// Length stored in the chunk header for this envelope.
    #[must_use]
    pub fn envelope_len(&self) -> usize {
        ENVELOPE_OVERHEAD + self.clear.len()
    }

    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    #[must_use]
    pub fn clear(&self) -> &[u8] {
        &self.clear
    }

    #[must_use]
    pub const fn inner_crc(&self) -> u16 {
        self.inner_crc
    }

    #[must_use]
    pub fn tail_pad(&self) -> &[u8] {
        &self.tail_pad
    }

    /// CRC of the clear payload as computed now.
    #[must_use]
    pub fn computed_crc(&self) -> u16 {
        crc16_ccitt(&self.clear)
    }

    #[must_use]
    pub fn crc_valid(&self) -> bool {
        self.computed_crc() == self.inner_crc
    }
}

fn encrypt_in_place(key: &AesKey, iv: &[u8; IV_SIZE], data: &mut [u8]) {
    let key = GenericArray::from(*key);
    let mut encryptor = cbc::Encryptor::<Aes128>::new(&key, &GenericArray::from(*iv));
    let mut prev = *iv;

    let mut blocks = data.chunks_exact_mut(BLOCK_SIZE);
    for block in &mut blocks {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }

    xor_residual(&key, &prev, blocks.into_remainder());
}

fn decrypt_in_place(key: &AesKey, iv: &[u8; IV_SIZE], data: &mut [u8]) {
    let key = GenericArray::from(*key);
    let mut decryptor = cbc::Decryptor::<Aes128>::new(&key, &GenericArray::from(*iv));
    let mut prev = *iv;

    let mut blocks = data.chunks_exact_mut(BLOCK_SIZE);
    for block in &mut blocks {
        let mut cipher_block = [0u8; BLOCK_SIZE];
        cipher_block.copy_from_slice(block);
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
        prev = cipher_block;
    }

    xor_residual(&key, &prev, blocks.into_remainder());
}

// Residual block termination, the same operation in both directions.
fn xor_residual(key: &GenericArray<u8, U16>, prev: &[u8; BLOCK_SIZE], tail: &mut [u8]) {
    if tail.is_empty() {
        return;
    }

    let mut keystream = GenericArray::from(*prev);
    Aes128::new(key).encrypt_block(&mut keystream);

    for (byte, k) in tail.iter_mut().zip(keystream.iter()) {
        *byte ^= k;
    }
}

/// Errors when opening an envelope.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum CryptoError {
    #[snafu(display("envelope length {length} is shorter than {min} bytes"))]
    TooShort { length: usize, min: usize },

    #[snafu(display("envelope length {length} exceeds the {available} stored bytes"))]
    Truncated { length: usize, available: usize },
}
