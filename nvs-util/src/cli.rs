use clap::{Args, Parser, Subcommand, ValueEnum};
use nvs_parser::{AesKey, BankCapacity, Mode};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "nvs-util")]
#[command(about = "NVS flash image utility", long_about = None)]
pub struct Cli {
    /// Log decoding decisions to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// How to read an image.
#[derive(Debug, Args)]
pub struct ImageArgs {
    /// Chunk-id map of the firmware (JSON)
    #[arg(short, long, value_name = "JSON")]
    pub map: PathBuf,

    /// Bank size, or a comma separated list with one size per zone
    #[arg(short, long, value_name = "BYTES", value_parser = nvs_util::parse_capacity)]
    pub capacity: BankCapacity,

    /// Load address of raw `.bin` dumps
    #[arg(short, long, value_name = "ADDRESS", default_value = "0", value_parser = nvs_util::parse_number)]
    pub base: u32,

    /// AES-128 key of encrypted chunks, as 32 hex digits
    #[arg(short, long, value_name = "HEX", value_parser = nvs_util::parse_key)]
    pub key: Option<AesKey>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display the zone and bank layout of an image
    Info {
        /// Path to the image (.hex or .bin)
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        #[command(flatten)]
        image: ImageArgs,
    },

    /// Print every chunk of an image
    Dump {
        /// Path to the image (.hex or .bin)
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        #[command(flatten)]
        image: ImageArgs,

        /// Decode known chunks as seen by this owner
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Write to a log file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// List every occurrence of a chunk
    History {
        /// Path to the image (.hex or .bin)
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        /// Chunk name or id
        #[arg(value_name = "CHUNK")]
        chunk: String,

        #[command(flatten)]
        image: ImageArgs,

        /// Decode the chunk as seen by this owner
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Keep the copy carried over by a bank switch
        #[arg(long)]
        duplicates: bool,

        /// Only look at the active bank
        #[arg(long)]
        active_only: bool,
    },

    /// Compare two images
    Diff {
        /// Path to the reference image
        #[arg(value_name = "OLD")]
        old_path: PathBuf,

        /// Path to the image to compare
        #[arg(value_name = "NEW")]
        new_path: PathBuf,

        #[command(flatten)]
        image: ImageArgs,

        /// Compare active banks only, accounting for bank switches
        #[arg(long)]
        active_only: bool,

        /// The change under test was a delete
        #[arg(long)]
        delete: bool,
    },

    /// Write a new occurrence of a chunk
    Add {
        /// Path to the image (.hex or .bin)
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        /// Chunk name or id
        #[arg(value_name = "CHUNK")]
        chunk: String,

        /// Payload as hex digits
        #[arg(value_name = "DATA")]
        data: String,

        #[command(flatten)]
        image: ImageArgs,

        /// IV of the AES envelope, as 32 hex digits
        #[arg(long, value_name = "HEX", value_parser = nvs_util::parse_key)]
        iv: Option<[u8; 16]>,

        /// Output Intel HEX file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Delete a chunk
    Delete {
        /// Path to the image (.hex or .bin)
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,

        /// Chunk name or id
        #[arg(value_name = "CHUNK")]
        chunk: String,

        #[command(flatten)]
        image: ImageArgs,

        /// Delete every occurrence instead of the last one
        #[arg(long)]
        all: bool,

        /// Output Intel HEX file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Device,
    Receiver,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Device => Self::Device,
            ModeArg::Receiver => Self::Receiver,
        }
    }
}
