//! Library for inspecting and editing NVS flash images from disk.
//!
//! This crate loads images and chunk-id maps for [`nvs_parser`], and
//! renders parsers, chunk histories and diffs as text.
//!
//! # Example
//!
//! ```no_run
//! use nvs_parser::{BankCapacity, Mode, NvsParser};
//! use nvs_util::{load_map, open_image, print_nvs};
//!
//! let map = load_map("nvs_map.json".as_ref()).expect("failed to load map");
//! let image = unsafe { open_image("nvs.bin".as_ref(), 0x0007_8000) }.expect("failed to open image");
//! let (parser, _) = NvsParser::from_hex_image(&image, &BankCapacity::Uniform(0x1000), map, None)
//!     .expect("failed to decode NVS");
//!
//! print_nvs(&parser, Some(Mode::Receiver), std::io::stdout().lock()).expect("failed to print");
//! ```

pub mod config;
pub mod dump;

pub use self::config::{
    ConfigError, load_map, map_from_json, parse_bytes, parse_capacity, parse_chunk_ref, parse_key,
    parse_number,
};
pub use self::dump::{print_diff, print_history, print_layout, print_nvs};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nvs_parser::{HexError, MemoryImage};
use snafu::{ResultExt, Snafu};

/// On-disk format of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Intel HEX text.
    Hex,
    /// Raw memory dump.
    Bin,
}

impl ImageFormat {
    /// Guesses the format from the file extension: `.hex` and `.ihex` are
    /// Intel HEX, anything else is a raw dump.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex") => {
                Self::Hex
            }
            _ => Self::Bin,
        }
    }
}

/// Errors that can occur when loading or saving an image.
#[derive(Debug, Snafu)]
pub enum ImageFileError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to read file"))]
    ReadFile { source: std::io::Error },

    #[snafu(display("failed to parse Intel HEX"))]
    ParseHex { source: HexError },

    #[snafu(display("failed to write file"))]
    WriteFile { source: std::io::Error },
}

/// Opens an image from disk.
///
/// Intel HEX files are read as text. Raw dumps are memory mapped and
/// placed at `base`.
///
/// # Safety
///
/// Raw dumps are read through a memory map. The caller must ensure the file
/// is not modified or truncated while this function runs.
pub unsafe fn open_image(path: &Path, base: u32) -> Result<MemoryImage, ImageFileError> {
    match ImageFormat::from_path(path) {
        ImageFormat::Hex => {
            let text = std::fs::read_to_string(path).context(ReadFileSnafu)?;
            MemoryImage::parse(&text).context(ParseHexSnafu)
        }
        ImageFormat::Bin => {
            let file = File::open(path).context(OpenFileSnafu)?;
            let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };
            Ok(MemoryImage::from_slice(base, &raw))
        }
    }
}

/// Writes an image as Intel HEX.
pub fn save_image(path: &Path, image: &MemoryImage) -> Result<(), ImageFileError> {
    let file = File::create(path).context(OpenFileSnafu)?;
    let mut out = BufWriter::new(file);
    image.write_ihex(&mut out).context(WriteFileSnafu)?;
    out.flush().context(WriteFileSnafu)
}
