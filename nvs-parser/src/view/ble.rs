//! nRF52 BLE bonding records.
//!
//! Bit fields are packed MSB first inside their byte. Multi-byte integers
//! are little-endian.

use std::fmt;

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Address type, resolvable private address flag and a 6-byte address.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BleAddress {
    pub type_and_flag: u8, // type: bits 7..1, RPA flag: bit 0
    pub address: [u8; 6],
}

impl BleAddress {
    #[must_use]
    pub const fn address_type(&self) -> u8 {
        self.type_and_flag >> 1
    }

    #[must_use]
    pub const fn is_resolvable_private(&self) -> bool {
        self.type_and_flag & 0x01 != 0
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.address.iter().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleAddress")
            .field("type", &self.address_type())
            .field("rpa", &self.is_resolvable_private())
            .field("address", &format_args!("{self}"))
            .finish()
    }
}

/// `ble_gap_sec_kdist_t`-style authentication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct AuthStatus {
    pub status: u8,
    pub flags: u8, // reserved: 7..4, lesc: 3, bonded: 2, error source: 1..0
    pub security_mode_1: u8,
    pub security_mode_2: u8,
    pub local_key_distribution: u8,
    pub remote_key_distribution: u8,
}

impl AuthStatus {
    #[must_use]
    pub const fn lesc(&self) -> bool {
        (self.flags >> 3) & 1 != 0
    }

    #[must_use]
    pub const fn bonded(&self) -> bool {
        (self.flags >> 2) & 1 != 0
    }

    #[must_use]
    pub const fn error_source(&self) -> u8 {
        self.flags & 0x03
    }
}

/// Long term key with its properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct EncInfo {
    pub ltk: [u8; 16],
    pub flags: u8, // ltk_len: 7..2, auth: 1, lesc: 0
}

impl EncInfo {
    #[must_use]
    pub const fn ltk_len(&self) -> u8 {
        self.flags >> 2
    }

    #[must_use]
    pub const fn authenticated(&self) -> bool {
        (self.flags >> 1) & 1 != 0
    }

    #[must_use]
    pub const fn lesc(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct MasterId {
    pub ediv: U16,
    pub rand: [u8; 8],
}

/// Identity resolving key and identity address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IdentityKey {
    pub irk: [u8; 16],
    pub address: BleAddress,
}

/// Device side bond, first layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DeviceBleBondIdV1 {
    pub is_master_paired: [u8; 4],     // 0x00
    pub auth_status: AuthStatus,       // 0x04
    pub local_enc_info: EncInfo,       // 0x0A
    pub padding_0x1b: u8,              // 0x1B
    pub local_master_id: MasterId,     // 0x1C
    pub local_id_key: IdentityKey,     // 0x26
    pub local_csrk: [u8; 16],          // 0x3D
    pub remote_enc_info: EncInfo,      // 0x4D
    pub padding_0x5e: [u8; 2],         // 0x5E
    pub remote_master_id: MasterId,    // 0x60
    pub remote_id_key: IdentityKey,    // 0x6A
    pub remote_csrk: [u8; 16],         // 0x81
    pub padding_0x91: u8,              // 0x91
    pub master_address: BleAddress,    // 0x92
    pub padding_0x99: [u8; 3],         // 0x99
    pub os_detected_type: u8,          // 0x9C
    pub reserved_0x9d: [u8; 3],        // 0x9D
    pub device_address: BleAddress,    // 0xA0
    pub padding_0xa7: u8,              // 0xA7
}

/// Device side bond with BLE Pro attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct DeviceBleBondIdV2 {
    pub is_master_paired: [u8; 4],     // 0x00
    pub auth_status: AuthStatus,       // 0x04
    pub local_enc_info: EncInfo,       // 0x0A
    pub padding_0x1b: u8,              // 0x1B
    pub local_master_id: MasterId,     // 0x1C
    pub local_id_key: IdentityKey,     // 0x26
    pub local_csrk: [u8; 16],          // 0x3D
    pub remote_enc_info: EncInfo,      // 0x4D
    pub padding_0x5e: [u8; 2],         // 0x5E
    pub remote_master_id: MasterId,    // 0x60
    pub remote_id_key: IdentityKey,    // 0x6A
    pub remote_csrk: [u8; 16],         // 0x81
    pub padding_0x91: u8,              // 0x91
    pub master_address: BleAddress,    // 0x92
    pub padding_0x99: [u8; 3],         // 0x99
    pub os_detected_type: u8,          // 0x9C
    pub reserved_0x9d: [u8; 3],        // 0x9D
    pub device_address: BleAddress,    // 0xA0
    pub ble_pro_attributes: [u8; 4],   // 0xA7
    pub padding_0xab: u8,              // 0xAB
}

/// Drops the BLE Pro attributes.
impl From<&DeviceBleBondIdV2> for DeviceBleBondIdV1 {
    fn from(v2: &DeviceBleBondIdV2) -> Self {
        Self {
            is_master_paired: v2.is_master_paired,
            auth_status: v2.auth_status,
            local_enc_info: v2.local_enc_info,
            padding_0x1b: v2.padding_0x1b,
            local_master_id: v2.local_master_id,
            local_id_key: v2.local_id_key,
            local_csrk: v2.local_csrk,
            remote_enc_info: v2.remote_enc_info,
            padding_0x5e: v2.padding_0x5e,
            remote_master_id: v2.remote_master_id,
            remote_id_key: v2.remote_id_key,
            remote_csrk: v2.remote_csrk,
            padding_0x91: v2.padding_0x91,
            master_address: v2.master_address,
            padding_0x99: v2.padding_0x99,
            os_detected_type: v2.os_detected_type,
            reserved_0x9d: v2.reserved_0x9d,
            device_address: v2.device_address,
            padding_0xa7: v2.padding_0xab,
        }
    }
}

/// Receiver side bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct ReceiverBleBondId {
    pub device_address: BleAddress,    // 0x00
    pub unknown_0x07: u8,              // 0x07
    pub auth_status: AuthStatus,       // 0x08
    pub local_enc_info: EncInfo,       // 0x0E
    pub padding_0x1f: u8,              // 0x1F
    pub local_master_id: MasterId,     // 0x20
    pub local_id_key: IdentityKey,     // 0x2A
    pub padding_0x41: u8,              // 0x41
    pub remote_enc_info: EncInfo,      // 0x42
    pub padding_0x53: u8,              // 0x53
    pub remote_master_id: MasterId,    // 0x54
    pub remote_id_key: IdentityKey,    // 0x5E
    pub padding_0x75: u8,              // 0x75
    pub entropy: u8,                   // 0x76
    pub ble_pro_auth_control: u8,      // 0x77
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<BleAddress>(), 7);
        assert_eq!(size_of::<AuthStatus>(), 6);
        assert_eq!(size_of::<EncInfo>(), 17);
        assert_eq!(size_of::<MasterId>(), 10);
        assert_eq!(size_of::<IdentityKey>(), 23);
        assert_eq!(size_of::<DeviceBleBondIdV1>(), 168);
        assert_eq!(size_of::<DeviceBleBondIdV2>(), 172);
        assert_eq!(size_of::<ReceiverBleBondId>(), 120);
    }

    #[test]
    fn test_address_bit_fields() {
        let address = BleAddress::read_from_bytes(&[0x03, 0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();

        assert_eq!(address.address_type(), 1);
        assert!(address.is_resolvable_private());
        assert_eq!(address.to_string(), "C0:11:22:33:44:55");
    }

    #[test]
    fn test_enc_info_bit_fields() {
        let mut raw = [0u8; 17];
        raw[16] = (16 << 2) | 0b10;
        let info = EncInfo::read_from_bytes(&raw).unwrap();

        assert_eq!(info.ltk_len(), 16);
        assert!(info.authenticated());
        assert!(!info.lesc());
    }

    #[test]
    fn test_v2_to_v1_keeps_shared_fields() {
        let mut raw = [0u8; 172];
        raw[0xA0..0xA7].copy_from_slice(&[0x02, 1, 2, 3, 4, 5, 6]);
        raw[0xA7..0xAB].copy_from_slice(&[0xAA; 4]);
        let v2 = DeviceBleBondIdV2::read_from_bytes(&raw).unwrap();

        let v1 = DeviceBleBondIdV1::from(&v2);
        assert_eq!(&v1.as_bytes()[..0xA7], &raw[..0xA7]);
        assert_eq!(v1.padding_0xa7, 0);
        assert_eq!(v1.device_address.address, [1, 2, 3, 4, 5, 6]);
    }
}
