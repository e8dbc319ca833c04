//! CRC-16/CCITT-FALSE as used for chunk and envelope checksums.
//!
//! | Parameter  | Value  |
//! |------------|--------|
//! | Polynomial | 0x1021 |
//! | Init       | 0xFFFF |
//! | RefIn      | false  |
//! | RefOut     | false  |
//! | XorOut     | 0x0000 |
//!
//! ```
//! use nvs_parser::crc::crc16_ccitt;
//!
//! assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
//! ```

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

const CRC_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Computes the CRC of `data`.
#[inline]
#[must_use]
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_ccitt_update(INIT, data)
}

/// Continues a running CRC with more data.
#[inline]
#[must_use]
pub fn crc16_ccitt_update(crc: u16, data: &[u8]) -> u16 {
    let mut crc = crc;
    for &byte in data {
        let index = ((crc >> 8) ^ u16::from(byte)) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Outer chunk CRC: `payload ‖ id ‖ length`, id and length truncated to one byte each.
#[must_use]
pub fn chunk_crc(payload: &[u8], id: u16, length: usize) -> u16 {
    crc16_ccitt_update(crc16_ccitt(payload), &[id as u8, length as u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_empty_is_seed() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data = b"non-volatile storage";
        let (a, b) = data.split_at(7);
        assert_eq!(crc16_ccitt_update(crc16_ccitt(a), b), crc16_ccitt(data));
    }

    #[test]
    fn test_chunk_crc_appends_id_and_length() {
        let payload = [0x01, 0x02, 0x03];
        assert_eq!(
            chunk_crc(&payload, 0x10, 3),
            crc16_ccitt(&[0x01, 0x02, 0x03, 0x10, 0x03])
        );
    }
}
