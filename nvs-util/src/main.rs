mod cli;

use clap::Parser;
use cli::{Cli, Command, ImageArgs};
use nvs_parser::{HistoryOptions, NvsParser};
use snafu::{ResultExt, Snafu};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Top-level application errors for nvs-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to load chunk-id map"))]
    LoadMap { source: nvs_util::ConfigError },

    #[snafu(display("failed to open image '{}'", path.display()))]
    OpenImage {
        path: PathBuf,
        source: nvs_util::ImageFileError,
    },

    #[snafu(display("failed to decode NVS in '{}'", path.display()))]
    Decode {
        path: PathBuf,
        source: nvs_parser::DecodeError,
    },

    #[snafu(display("failed to query chunk '{chunk}'"))]
    Query {
        chunk: String,
        source: nvs_parser::QueryError,
    },

    #[snafu(display("failed to update chunk '{chunk}'"))]
    Mutate {
        chunk: String,
        source: nvs_parser::MutateError,
    },

    #[snafu(display("invalid payload '{data}'"))]
    Payload {
        data: String,
        source: nvs_util::ConfigError,
    },

    #[snafu(display("failed to save image '{}'", path.display()))]
    SaveImage {
        path: PathBuf,
        source: nvs_util::ImageFileError,
    },

    #[snafu(display("failed to create '{}'", path.display()))]
    CreateOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write output"))]
    WriteOutput { source: std::io::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Info { image_path, image } => cmd_info(&image_path, &image),
        Command::Dump {
            image_path,
            image,
            mode,
            output,
        } => cmd_dump(&image_path, &image, mode.map(Into::into), output.as_deref()),
        Command::History {
            image_path,
            chunk,
            image,
            mode,
            duplicates,
            active_only,
        } => cmd_history(
            &image_path,
            &chunk,
            &image,
            mode.map(Into::into),
            HistoryOptions {
                include_duplicates: duplicates,
                active_only,
            },
        ),
        Command::Diff {
            old_path,
            new_path,
            image,
            active_only,
            delete,
        } => cmd_diff(&old_path, &new_path, &image, active_only, delete),
        Command::Add {
            image_path,
            chunk,
            data,
            image,
            iv,
            output,
        } => cmd_add(&image_path, &chunk, &data, &image, iv, &output),
        Command::Delete {
            image_path,
            chunk,
            image,
            all,
            output,
        } => cmd_delete(&image_path, &chunk, &image, all, &output),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path, args: &ImageArgs) -> Result<NvsParser> {
    let map = nvs_util::load_map(&args.map).context(LoadMapSnafu)?;
    let image = unsafe { nvs_util::open_image(path, args.base).context(OpenImageSnafu { path })? };

    // Corruption warnings are already logged by the parser.
    let (parser, _report) = NvsParser::from_hex_image(&image, &args.capacity, map, args.key)
        .context(DecodeSnafu { path })?;
    Ok(parser)
}

fn cmd_info(path: &Path, args: &ImageArgs) -> Result<()> {
    let parser = load(path, args)?;

    println!("NVS: {}", path.display());
    println!();
    nvs_util::print_layout(&parser, std::io::stdout().lock()).context(WriteOutputSnafu)
}

fn cmd_dump(
    path: &Path,
    args: &ImageArgs,
    mode: Option<nvs_parser::Mode>,
    output: Option<&Path>,
) -> Result<()> {
    let parser = load(path, args)?;

    match output {
        Some(log_path) => {
            let file = File::create(log_path).context(CreateOutputSnafu { path: log_path })?;
            let mut out = BufWriter::new(file);
            nvs_util::print_nvs(&parser, mode, &mut out).context(WriteOutputSnafu)?;
            out.flush().context(WriteOutputSnafu)
        }
        None => nvs_util::print_nvs(&parser, mode, std::io::stdout().lock()).context(WriteOutputSnafu),
    }
}

fn cmd_history(
    path: &Path,
    chunk: &str,
    args: &ImageArgs,
    mode: Option<nvs_parser::Mode>,
    options: HistoryOptions,
) -> Result<()> {
    let parser = load(path, args)?;
    let views = parser
        .get_chunk_history(nvs_util::parse_chunk_ref(chunk), mode, options)
        .context(QuerySnafu { chunk })?;

    println!("History of {chunk} in {}:", path.display());
    nvs_util::print_history(&views, std::io::stdout().lock()).context(WriteOutputSnafu)
}

fn cmd_diff(
    old_path: &Path,
    new_path: &Path,
    args: &ImageArgs,
    active_only: bool,
    delete: bool,
) -> Result<()> {
    let old = load(old_path, args)?;
    let new = load(new_path, args)?;

    match old.diff(&new, active_only, delete) {
        Some(diff) => {
            nvs_util::print_diff(&diff, std::io::stdout().lock()).context(WriteOutputSnafu)?;
            println!();
            println!("Changed chunks: {}", old.get_changed_chunks(&new, delete).len());
        }
        None => println!("No difference."),
    }

    Ok(())
}

fn cmd_add(
    path: &Path,
    chunk: &str,
    data: &str,
    args: &ImageArgs,
    iv: Option<[u8; 16]>,
    output: &Path,
) -> Result<()> {
    let payload = nvs_util::parse_bytes(data).context(PayloadSnafu { data })?;
    let mut parser = load(path, args)?;

    parser
        .add_new_chunk(nvs_util::parse_chunk_ref(chunk), &payload, iv)
        .context(MutateSnafu { chunk })?;

    if let Some(status) = parser
        .get_active_bank_status(nvs_util::parse_chunk_ref(chunk))
        .context(QuerySnafu { chunk })?
    {
        println!(
            "Bank {} now uses {} of {} bytes.",
            status.bank_index, status.used, status.capacity
        );
    }

    nvs_util::save_image(output, &parser.to_hex_image()).context(SaveImageSnafu { path: output })
}

fn cmd_delete(path: &Path, chunk: &str, args: &ImageArgs, all: bool, output: &Path) -> Result<()> {
    let mut parser = load(path, args)?;
    let target = nvs_util::parse_chunk_ref(chunk);

    if all {
        parser.delete_all_chunks(target)
    } else {
        parser.delete_chunk(target, None)
    }
    .context(MutateSnafu { chunk })?;

    nvs_util::save_image(output, &parser.to_hex_image()).context(SaveImageSnafu { path: output })
}
