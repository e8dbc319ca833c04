//! End-to-end scenarios on a single-zone, id-based image with two banks of
//! 128 bytes and a word size of 4.

use nvs_parser::crc::crc16_ccitt;
use nvs_parser::crypto::{ENVELOPE_OVERHEAD, Envelope};
use nvs_parser::{
    BankCapacity, Chunk, ChunkIdMap, ChunkLocation, ChunkMethod, ChunkView, HistoryOptions, Mode,
    NvsParser, Record,
};

const BANK_SIZE: usize = 128;
const FOO: u16 = 0x10;

fn map() -> ChunkIdMap {
    ChunkIdMap::new(ChunkMethod::IdBased, 4)
        .unwrap()
        .with_chunk("FOO", ChunkLocation::Id(FOO))
        .with_chunk("NVS_BLE_BOND_ID_0", ChunkLocation::Id(0x30))
}

fn erased(bank_size: usize, key: Option<[u8; 16]>) -> NvsParser {
    let (parser, report) = NvsParser::from_memory_read(
        0x0000,
        &vec![0xFF; 2 * bank_size],
        &BankCapacity::Uniform(bank_size),
        map(),
        key,
    )
    .unwrap();
    assert!(report.is_clean());
    parser
}

fn single_write() -> NvsParser {
    let mut parser = erased(BANK_SIZE, None);
    parser.activate_bank(0, 0).unwrap();
    parser.add_new_chunk("FOO", &[0x01, 0x02, 0x03], None).unwrap();
    parser
}

/// Fills the active bank, then writes one chunk too many.
fn before_and_after_switch() -> (NvsParser, NvsParser) {
    let mut parser = erased(BANK_SIZE, None);
    parser.activate_bank(0, 0).unwrap();
    parser.add_new_chunk("FOO", &[1, 1, 1, 1], None).unwrap();
    parser.add_new_chunk("FOO", &[2, 2, 2, 2], None).unwrap();
    for id in 0x20..0x2D_u16 {
        parser.add_new_chunk(id, &[id as u8; 4], None).unwrap();
    }

    let status = parser.get_active_bank_status(FOO).unwrap().unwrap();
    assert_eq!(status.used, 124);

    let before = parser.clone();
    parser.add_new_chunk(0x30, &[0x30; 4], None).unwrap();
    (before, parser)
}

fn payload(view: Option<ChunkView<'_>>) -> Option<Vec<u8>> {
    view.map(|v| v.clear_payload().to_vec())
}

#[test]
fn scenario_a_empty_bank() {
    let parser = erased(BANK_SIZE, None);

    assert_eq!(parser.zones().len(), 1);
    let zone = &parser.zones()[0];
    assert!(zone.valid_banks().all(|bank| !bank.active()));
    assert!(zone.active_bank().is_none());

    assert_eq!(parser.get_chunk("FOO", None).unwrap(), None);
    assert_eq!(parser.get_chunk(0x42, None).unwrap(), None);
}

#[test]
fn scenario_b_single_write() {
    let parser = single_write();

    let crc = crc16_ccitt(&[0x01, 0x02, 0x03, 0x10, 0x03]).to_le_bytes();
    let encoded = &parser.encode()[0].1;
    assert_eq!(&encoded[..4], &[0x01, 0x00, 0x01, 0x00]);
    assert_eq!(
        &encoded[4..12],
        &[0x10, 0x03, crc[0], crc[1], 0x01, 0x02, 0x03, 0x00]
    );
    assert!(encoded[12..].iter().all(|&b| b == 0xFF));
}

#[test]
fn scenario_c_overwrite() {
    let mut parser = single_write();
    parser.add_new_chunk("FOO", &[0xAA], None).unwrap();

    let bank = parser.zones()[0].active_bank().unwrap();
    let ids: Vec<u16> = bank.records().map(Chunk::id).collect();
    assert_eq!(ids, [0x01, FOO, FOO]);

    assert_eq!(payload(parser.get_chunk("FOO", None).unwrap()), Some(vec![0xAA]));
    let history = parser
        .get_chunk_history("FOO", None, HistoryOptions::default())
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(parser.is_last_chunk_id("FOO").unwrap());
}

#[test]
fn scenario_d_bank_switch_on_overflow() {
    let (before, after) = before_and_after_switch();

    let zone = &after.zones()[0];
    assert_eq!(zone.active_bank_index(), Some(1));

    let old = zone.bank(0).unwrap();
    assert!(!old.active());
    let header = &old.chunks()[0];
    let invalid = after.map().invalid_bank_header();
    assert_eq!(header.id(), u16::from(invalid.id));
    assert_eq!(header.length(), Some(usize::from(invalid.length)));
    assert_eq!(header.crc(), Some(invalid.crc));

    let mut expected = vec![0x01, FOO];
    expected.extend(0x20..0x2D);
    expected.push(0x30);
    let ids: Vec<u16> = zone.bank(1).unwrap().records().map(Chunk::id).collect();
    assert_eq!(ids, expected);

    assert_eq!(payload(after.get_chunk("FOO", None).unwrap()), Some(vec![2; 4]));
    assert!(after.is_last_chunk_id(0x30).unwrap());
    assert!(before.zones()[0].bank(0).unwrap().active());
}

#[test]
fn scenario_e_encrypted_chunk() {
    let key = [0x2B; 16];
    let iv = [0x0F; 16];
    let bond: Vec<u8> = (0..168).map(|i| i as u8).collect();

    let mut parser = erased(512, Some(key));
    parser.activate_bank(0, 0).unwrap();
    parser.add_new_chunk("NVS_BLE_BOND_ID_0", &bond, Some(iv)).unwrap();

    let view = parser
        .get_chunk("NVS_BLE_BOND_ID_0", Some(Mode::Device))
        .unwrap()
        .unwrap();
    assert_eq!(view.clear_payload(), &bond[..]);
    let envelope = view.envelope().unwrap();
    assert!(envelope.crc_valid());
    assert_eq!(envelope.iv(), &iv);
    assert!(matches!(view.record(), Some(Record::DeviceBondV1(_))));

    let stored = view.chunk();
    assert_eq!(stored.length(), Some(ENVELOPE_OVERHEAD + bond.len()));
    assert_eq!(stored.payload().len(), 188);
    assert!(stored.crc_valid());
    assert_eq!(
        Envelope::open(&key, stored.payload(), 186).unwrap().clear(),
        &bond[..]
    );

    let raw = parser.get_chunk("NVS_BLE_BOND_ID_0", None).unwrap().unwrap();
    assert_eq!(raw, ChunkView::Raw(stored));
}

#[test]
fn scenario_f_diff_across_bank_switch() {
    let (before, after) = before_and_after_switch();

    assert_eq!(before.diff(&after, true, false), None);
    assert_eq!(after.diff(&before, true, false), None);
    assert!(before.get_changed_chunks(&after, false).is_empty());
    assert!(after.get_changed_chunks(&before, false).is_empty());
    assert!(before.diff(&after, false, false).is_some());
    assert!(after.diff(&before, false, false).is_some());
}
