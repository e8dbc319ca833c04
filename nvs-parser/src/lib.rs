//! A library for parsing and rewriting NVS flash images of nRF52 based
//! receivers and devices.
//!
//! The NVS is a list of zones. Each zone is a pair of banks, at most one of
//! them active, and each bank is an append-only log of chunks. Writing to a
//! full bank copies the live chunks to the other bank and switches over.
//!
//! # Features
//!
//! - Decode and encode id-based and address-based chunk layouts
//! - Query the last value or the whole history of a chunk
//! - Add and delete chunks, with the firmware's bank switch behavior
//! - AES-128 chunk envelopes and typed views of BLE bonding records
//! - Structural diff of two images, aware of bank switches
//! - Intel HEX import and export
//!
//! # Example
//!
//! ```no_run
//! use nvs_parser::{BankCapacity, ChunkIdMap, ChunkLocation, ChunkMethod, MemoryImage, NvsParser};
//!
//! let text = std::fs::read_to_string("nvs.hex").unwrap();
//! let image = MemoryImage::parse(&text).unwrap();
//!
//! let map = ChunkIdMap::new(ChunkMethod::IdBased, 4)
//!     .unwrap()
//!     .with_chunk("NVS_CONNECT_ID", ChunkLocation::Id(0x22));
//! let (mut parser, report) =
//!     NvsParser::from_hex_image(&image, &BankCapacity::Uniform(0x800), map, None).unwrap();
//!
//! for warning in report.warnings() {
//!     println!("{warning}");
//! }
//!
//! parser.add_new_chunk("NVS_CONNECT_ID", &[0x01, 0x02], None).unwrap();
//! if let Some(chunk) = parser.get_chunk("NVS_CONNECT_ID", None).unwrap() {
//!     println!("{:02X?}", chunk.clear_payload());
//! }
//!
//! std::fs::write("nvs_new.hex", parser.to_hex_image().to_ihex_string()).unwrap();
//! ```

pub use self::bank::{Bank, BankError};
pub use self::chunk::{Chunk, ChunkKind, Padding};
pub use self::codec::{BankCapacity, DecodeError};
pub use self::crypto::{AesKey, CryptoError, Envelope};
pub use self::diff::{BankDiff, ChunkDiff, ChunkField, ParserDiff, ZoneDiff};
pub use self::ihex::{HexError, MemoryImage};
pub use self::map::{
    BankHeader, ChunkIdMap, ChunkLocation, ChunkMethod, ChunkRef, MapError, MapValue,
};
pub use self::parser::{BankStatus, HistoryOptions, MutateError, NvsParser, QueryError};
pub use self::report::{ParseReport, Warning};
pub use self::view::{ChunkView, Mode, Record, RecordKind, ViewError};
pub use self::zone::Zone;

pub mod bank;
pub mod chunk;
pub mod codec;
pub mod crc;
pub mod crypto;
pub mod diff;
pub mod ihex;
pub mod map;
pub mod parser;
pub mod report;
pub mod view;
pub mod zone;
