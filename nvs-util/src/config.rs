//! Chunk-id maps, AES keys and numeric arguments.

use std::path::{Path, PathBuf};

use nvs_parser::{AesKey, BankCapacity, ChunkIdMap, ChunkRef, MapError, MapValue};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use config_error::*;

/// Loads a chunk-id map from a JSON object of `name: value` entries.
pub fn load_map(path: &Path) -> Result<ChunkIdMap, ConfigError> {
    let text = std::fs::read_to_string(path).context(ReadMapSnafu { path })?;
    map_from_json(&text)
}

/// Builds a chunk-id map from JSON text.
///
/// Entries keep their declaration order, so reverse lookups return the
/// first name declared for an id.
pub fn map_from_json(text: &str) -> Result<ChunkIdMap, ConfigError> {
    let object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(text).context(ParseJsonSnafu)?;

    let entries = object
        .into_iter()
        .map(|(name, value)| {
            let value: MapValue =
                serde_json::from_value(value).context(InvalidEntrySnafu { name: &name })?;
            Ok((name, value))
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    ChunkIdMap::from_entries(entries).context(BuildMapSnafu)
}

/// Parses a 16-byte AES key written as 32 hex digits.
pub fn parse_key(text: &str) -> Result<AesKey, ConfigError> {
    let bytes = parse_bytes(text)?;
    let length = bytes.len();
    bytes.try_into().ok().context(KeyLengthSnafu { length })
}

/// Parses hex digits into bytes. A `0x` prefix, spaces and colons are
/// ignored.
pub fn parse_bytes(text: &str) -> Result<Vec<u8>, ConfigError> {
    let digits: String = strip_hex_prefix(text.trim())
        .chars()
        .filter(|c| !matches!(c, ' ' | ':'))
        .collect();
    hex::decode(digits).context(InvalidHexSnafu)
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(text: &str) -> Result<u32, ConfigError> {
    let clean = text.trim().replace('_', "");
    let parsed = match clean.strip_prefix("0x").or_else(|| clean.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => clean.parse(),
    };
    parsed.ok().context(InvalidNumberSnafu { text })
}

/// Parses bank capacities: one number for every zone, or a comma
/// separated list with one number per zone.
pub fn parse_capacity(text: &str) -> Result<BankCapacity, ConfigError> {
    let capacities = text
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_number(part).map(|n| n as usize))
        .collect::<Result<Vec<_>, _>>()?;
    ensure!(!capacities.is_empty(), EmptyCapacitySnafu);

    if capacities.len() == 1 {
        Ok(BankCapacity::Uniform(capacities[0]))
    } else {
        Ok(BankCapacity::PerZone(capacities))
    }
}

/// A chunk argument: a 16-bit id when it parses as a number, a map name
/// otherwise.
#[must_use]
pub fn parse_chunk_ref(text: &str) -> ChunkRef<'_> {
    parse_number(text)
        .ok()
        .and_then(|n| u16::try_from(n).ok())
        .map_or(ChunkRef::Name(text), ChunkRef::Id)
}

fn strip_hex_prefix(text: &str) -> &str {
    text.strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text)
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("failed to read chunk-id map '{}'", path.display()))]
    ReadMap {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("chunk-id map is not a JSON object"))]
    ParseJson { source: serde_json::Error },

    #[snafu(display("invalid value for map entry '{name}'"))]
    InvalidEntry {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("invalid chunk-id map"))]
    BuildMap { source: MapError },

    #[snafu(display("invalid hex string"))]
    InvalidHex { source: hex::FromHexError },

    #[snafu(display("AES key must be 16 bytes, got {length}"))]
    KeyLength { length: usize },

    #[snafu(display("'{text}' is not a number"))]
    InvalidNumber { text: String },

    #[snafu(display("no bank capacity given"))]
    EmptyCapacity,
}
