//! Typed views of chunk payloads.
//!
//! A fixed table maps chunk names to the record they hold for a given
//! [`Mode`], and whether that record is stored inside an AES envelope.
//! Chunks without an entry are returned raw.

use snafu::{ResultExt, Snafu, ensure};
use zerocopy::FromBytes;

use crate::chunk::Chunk;
use crate::crypto::{AesKey, CryptoError, Envelope};
use crate::report::Warning;

pub mod ble;

use self::ble::{BleAddress, DeviceBleBondIdV1, DeviceBleBondIdV2, ReceiverBleBondId};

use view_error::*;

/// Role of the device that owns the NVS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Device,
    Receiver,
}

/// Record layouts known to the view table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    TdeMfgAccess,
    DeviceFriendlyName,
    TdeDeactivation,
    BleProPrePairing,
    DeviceBleBondId,
    ReceiverBleBondId,
    BondInfoV0,
    BondInfoV1,
    UserServices,
    LastBluetoothAddress,
    DfuCtrl,
    DfuCheckFwInfo,
    BootloaderConnectId,
    ConnectId,
    DfuRecovery,
    Backlight,
    KbdMaskTable,
}

/// How a chunk is stored and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSpec {
    pub encrypted: bool,
    pub kind: RecordKind,
}

const DEVICE: &[Mode] = &[Mode::Device];
const RECEIVER: &[Mode] = &[Mode::Receiver];
const BOTH: &[Mode] = &[Mode::Device, Mode::Receiver];

#[rustfmt::skip]
const VIEWS: &[(&str, &[Mode], bool, RecordKind)] = &[
    ("NVS_TDE_MFG_ACCESS_ID", DEVICE, false, RecordKind::TdeMfgAccess),
    ("NVS_DEVICE_FRIENDLY_NAME_ID", DEVICE, false, RecordKind::DeviceFriendlyName),
    ("NVS_XEE_DEACT_CNTR_ID", RECEIVER, false, RecordKind::TdeDeactivation),
    ("NVS_X1E01_CONN_CNTR_ID", DEVICE, false, RecordKind::TdeDeactivation),
    ("NVS_X1E02_STATE_ID", BOTH, false, RecordKind::TdeDeactivation),
    ("NVS_BLE_PRO_PRE_PAIRING_ID_0", DEVICE, true, RecordKind::BleProPrePairing),
    ("NVS_BLE_BOND_ID_0", DEVICE, true, RecordKind::DeviceBleBondId),
    ("NVS_BLE_BOND_ID_0", RECEIVER, true, RecordKind::ReceiverBleBondId),
    ("NVS_BLE_BOND_ID_1", DEVICE, true, RecordKind::DeviceBleBondId),
    ("NVS_BLE_BOND_ID_1", RECEIVER, true, RecordKind::ReceiverBleBondId),
    ("NVS_BLE_BOND_ID_2", DEVICE, true, RecordKind::DeviceBleBondId),
    ("NVS_BLE_BOND_ID_2", RECEIVER, true, RecordKind::ReceiverBleBondId),
    ("NVS_BLE_BOND_ID_3", RECEIVER, true, RecordKind::ReceiverBleBondId),
    ("NVS_BLE_BOND_ID_4", RECEIVER, true, RecordKind::ReceiverBleBondId),
    ("NVS_BLE_BOND_ID_5", RECEIVER, true, RecordKind::ReceiverBleBondId),
    ("NVS_BLE_BOND_INFO_ID_V0_0", RECEIVER, false, RecordKind::BondInfoV0),
    ("NVS_BLE_BOND_INFO_ID_V0_1", RECEIVER, false, RecordKind::BondInfoV0),
    ("NVS_BLE_BOND_INFO_ID_0", RECEIVER, false, RecordKind::BondInfoV1),
    ("NVS_BLE_BOND_INFO_ID_1", RECEIVER, false, RecordKind::BondInfoV1),
    ("NVS_BLE_SYS_ATTR_USR_SRVCS_ID_0", DEVICE, false, RecordKind::UserServices),
    ("NVS_BLE_SYS_ATTR_USR_SRVCS_ID_1", DEVICE, false, RecordKind::UserServices),
    ("NVS_BLE_SYS_ATTR_USR_SRVCS_ID_2", DEVICE, false, RecordKind::UserServices),
    ("NVS_BLE_LAST_GAP_ADDR_USED", DEVICE, false, RecordKind::LastBluetoothAddress),
    ("NVS_DFU_ID", BOTH, false, RecordKind::DfuCtrl),
    ("NVS_DFU_CHECK_ID", RECEIVER, false, RecordKind::DfuCheckFwInfo),
    ("NVS_BTLDR_CONNECT_ID", DEVICE, false, RecordKind::BootloaderConnectId),
    ("NVS_CONNECT_ID", DEVICE, false, RecordKind::ConnectId),
    ("NVS_DFU_OUT_OF_RECOVERY_ID", DEVICE, false, RecordKind::DfuRecovery),
    ("NVS_LEDBKLT_ID", DEVICE, false, RecordKind::Backlight),
    ("NVS_KBD_MASK_TABLE_ID", DEVICE, false, RecordKind::KbdMaskTable),
];

/// Looks up how chunk `name` is viewed in `mode`.
#[must_use]
pub fn view_spec(name: &str, mode: Mode) -> Option<ViewSpec> {
    VIEWS
        .iter()
        .find(|(n, modes, ..)| *n == name && modes.contains(&mode))
        .map(|&(_, _, encrypted, kind)| ViewSpec { encrypted, kind })
}

/// Whether chunk `name` is stored inside an AES envelope in either mode.
#[must_use]
pub fn stored_encrypted(name: &str) -> bool {
    VIEWS
        .iter()
        .any(|&(n, _, encrypted, _)| n == name && encrypted)
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Record {
    DeviceBondV1(DeviceBleBondIdV1),
    DeviceBondV2(DeviceBleBondIdV2),
    ReceiverBond(ReceiverBleBondId),
    LastAddress(BleAddress),
    /// A record whose fields are not broken out.
    Opaque { kind: RecordKind, bytes: Vec<u8> },
}

impl Record {
    /// Decodes the clear payload of a chunk as `kind`.
    pub fn decode(kind: RecordKind, clear: &[u8]) -> Result<Self, ViewError> {
        let record = match kind {
            RecordKind::DeviceBleBondId => {
                match clear.len() {
                    n if n == size_of::<DeviceBleBondIdV1>() => {
                        Self::DeviceBondV1(read_record(kind, clear)?)
                    }
                    n if n == size_of::<DeviceBleBondIdV2>() => {
                        Self::DeviceBondV2(read_record(kind, clear)?)
                    }
                    length => return UnknownBondLayoutSnafu { length }.fail(),
                }
            }
            RecordKind::ReceiverBleBondId => Self::ReceiverBond(read_record(kind, clear)?),
            RecordKind::LastBluetoothAddress => Self::LastAddress(read_record(kind, clear)?),
            kind => Self::Opaque {
                kind,
                bytes: clear.to_vec(),
            },
        };

        Ok(record)
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::DeviceBondV1(_) | Self::DeviceBondV2(_) => RecordKind::DeviceBleBondId,
            Self::ReceiverBond(_) => RecordKind::ReceiverBleBondId,
            Self::LastAddress(_) => RecordKind::LastBluetoothAddress,
            Self::Opaque { kind, .. } => *kind,
        }
    }
}

fn read_record<T: FromBytes>(kind: RecordKind, clear: &[u8]) -> Result<T, ViewError> {
    let needed = size_of::<T>();
    ensure!(
        clear.len() >= needed,
        TooShortSnafu {
            kind,
            needed,
            actual: clear.len()
        }
    );

    T::read_from_prefix(clear)
        .map(|(record, _)| record)
        .map_err(|_| ViewError::TooShort {
            kind,
            needed,
            actual: clear.len(),
        })
}

/// A chunk as returned by queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkView<'a> {
    /// The stored chunk, no view applies or it cannot be decrypted.
    Raw(&'a Chunk),
    /// The chunk with its decoded record.
    Decoded {
        chunk: &'a Chunk,
        envelope: Option<Envelope>,
        record: Record,
    },
}

impl<'a> ChunkView<'a> {
    /// Builds the view of `chunk` for `spec`.
    ///
    /// Encrypted chunks are only decoded when a key is given. A wrong
    /// inner CRC is logged and the view is still returned.
    pub fn new(
        chunk: &'a Chunk,
        spec: Option<ViewSpec>,
        key: Option<&AesKey>,
    ) -> Result<Self, ViewError> {
        let Some(spec) = spec else {
            return Ok(Self::Raw(chunk));
        };

        if !spec.encrypted {
            let record = Record::decode(spec.kind, chunk.data())?;
            return Ok(Self::Decoded {
                chunk,
                envelope: None,
                record,
            });
        }

        let Some(key) = key else {
            return Ok(Self::Raw(chunk));
        };

        let length = chunk.length().unwrap_or_default();
        let envelope = Envelope::open(key, chunk.payload(), length)
            .context(DecryptSnafu { id: chunk.id() })?;
        if !envelope.crc_valid() {
            let warning = Warning::InnerCrcMismatch {
                id: chunk.id(),
                stored: envelope.inner_crc(),
                computed: envelope.computed_crc(),
            };
            tracing::warn!("{warning}");
        }

        let record = Record::decode(spec.kind, envelope.clear())?;
        Ok(Self::Decoded {
            chunk,
            envelope: Some(envelope),
            record,
        })
    }

    /// The stored chunk behind the view.
    #[must_use]
    pub fn chunk(&self) -> &'a Chunk {
        match self {
            Self::Raw(chunk) | Self::Decoded { chunk, .. } => chunk,
        }
    }

    /// Clear payload: the decrypted data for encrypted chunks, otherwise
    /// the first `length` bytes.
    #[must_use]
    pub fn clear_payload(&self) -> &[u8] {
        match self {
            Self::Decoded {
                envelope: Some(envelope),
                ..
            } => envelope.clear(),
            _ => self.chunk().data(),
        }
    }

    #[must_use]
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Raw(_) => None,
            Self::Decoded { record, .. } => Some(record),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Decoded { envelope, .. } => envelope.as_ref(),
            Self::Raw(_) => None,
        }
    }
}

/// Errors when decoding a typed view.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ViewError {
    #[snafu(display("cannot decrypt chunk 0x{id:02X}"))]
    Decrypt { id: u16, source: CryptoError },

    #[snafu(display("{kind:?} record needs {needed} bytes, chunk holds {actual}"))]
    TooShort {
        kind: RecordKind,
        needed: usize,
        actual: usize,
    },

    #[snafu(display("Unknown Device Ble BondId chunk structure ({length} bytes)"))]
    UnknownBondLayout { length: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AesKey = [0x11; 16];
    const IV: [u8; 16] = [0x22; 16];

    fn sealed_chunk(id: u16, clear: &[u8]) -> Chunk {
        let payload = Envelope::new(IV, clear).seal(&KEY);
        Chunk::record(id, &payload, payload.len().next_multiple_of(4))
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!(
            view_spec("NVS_BLE_BOND_ID_1", Mode::Receiver),
            Some(ViewSpec {
                encrypted: true,
                kind: RecordKind::ReceiverBleBondId
            })
        );
        assert_eq!(view_spec("NVS_BLE_BOND_ID_4", Mode::Device), None);
        assert_eq!(view_spec("NVS_UNKNOWN_ID", Mode::Device), None);
    }

    #[test]
    fn test_unknown_name_is_raw() {
        let chunk = Chunk::record(0x10, &[1, 2, 3], 4);
        let view = ChunkView::new(&chunk, None, Some(&KEY)).unwrap();

        assert_eq!(view, ChunkView::Raw(&chunk));
        assert_eq!(view.clear_payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_encrypted_bond_is_decoded() {
        let clear = [0x5A; 168];
        let chunk = sealed_chunk(0x30, &clear);
        let spec = view_spec("NVS_BLE_BOND_ID_0", Mode::Device);

        let view = ChunkView::new(&chunk, spec, Some(&KEY)).unwrap();
        assert_eq!(view.clear_payload(), &clear);
        assert!(view.envelope().is_some_and(Envelope::crc_valid));
        assert!(matches!(view.record(), Some(Record::DeviceBondV1(_))));
    }

    #[test]
    fn test_encrypted_without_key_is_raw() {
        let chunk = sealed_chunk(0x30, &[0x5A; 168]);
        let spec = view_spec("NVS_BLE_BOND_ID_0", Mode::Device);

        assert_eq!(
            ChunkView::new(&chunk, spec, None).unwrap(),
            ChunkView::Raw(&chunk)
        );
    }

    #[test]
    fn test_unknown_bond_layout_is_fatal() {
        let chunk = sealed_chunk(0x30, &[0x00; 100]);
        let spec = view_spec("NVS_BLE_BOND_ID_0", Mode::Device);

        assert!(matches!(
            ChunkView::new(&chunk, spec, Some(&KEY)),
            Err(ViewError::UnknownBondLayout { length: 100 })
        ));
    }

    #[test]
    fn test_last_address_is_decoded() {
        let chunk = Chunk::record(0x40, &[0x00, 1, 2, 3, 4, 5, 6], 8);
        let spec = view_spec("NVS_BLE_LAST_GAP_ADDR_USED", Mode::Device);

        let view = ChunkView::new(&chunk, spec, None).unwrap();
        let Some(Record::LastAddress(address)) = view.record() else {
            panic!("expected an address, got {view:?}");
        };
        assert_eq!(address.to_string(), "01:02:03:04:05:06");
    }
}
