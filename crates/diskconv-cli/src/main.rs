//! diskconv CLI - Convert qcow2 and raw disk images to sparse raw images.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diskconv_core::units::{format_bytes, parse_size};
use diskconv_core::{
    inspect_image, ConvertOptions, ConvertPhase, ConvertProgress, Converter, TracingLogger,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

/// Convert qcow2 and raw disk images into sparse raw images.
#[derive(Parser)]
#[command(name = "diskconv")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an image to a sparse raw image.
    Convert {
        /// Path to the source image.
        source: PathBuf,

        /// Output raw image path. Defaults to converting the source in place.
        dest: Option<PathBuf>,

        /// Final size of the raw image, e.g. 20G or 512MiB.
        #[arg(short, long, value_parser = parse_size_arg)]
        size: Option<u64>,

        /// Accept qcow2 images that reference a backing file and flatten the chain.
        #[arg(long)]
        allow_backing_file: bool,

        /// Block size in KiB used when scanning for zero blocks.
        #[arg(long, default_value = "1024")]
        block_size_kib: usize,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Display information about a disk image.
    Info {
        /// Path to the image.
        image: PathBuf,
    },
}

fn parse_size_arg(value: &str) -> std::result::Result<u64, String> {
    parse_size(value).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Convert {
            source,
            dest,
            size,
            allow_backing_file,
            block_size_kib,
            quiet,
        } => {
            let dest = dest.unwrap_or_else(|| source.clone());
            run_convert(
                &source,
                &dest,
                size,
                allow_backing_file,
                block_size_kib,
                quiet,
            )?;
        }
        Commands::Info { image } => {
            show_info(&image)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_convert(
    source: &Path,
    dest: &Path,
    size: Option<u64>,
    allow_backing_file: bool,
    block_size_kib: usize,
    quiet: bool,
) -> Result<()> {
    let block_size = block_size_bytes(block_size_kib)?;

    let info = inspect_image(source)
        .with_context(|| format!("Failed to inspect '{}'", source.display()))?;

    if !quiet {
        println!("Disk Conversion");
        println!("---------------");
        println!("Source:    {} ({})", source.display(), info.format);
        println!("Virtual:   {}", format_bytes(info.virtual_size));
        if let Some(backing) = &info.backing_file {
            println!("Backing:   {}", backing);
        }
        println!("Output:    {}", dest.display());
        if let Some(size) = size {
            println!("Size:      {}", format_bytes(size));
        }
        println!();
    }

    let options =
        ConvertOptions::new(size, allow_backing_file).with_block_size(block_size);
    tracing::debug!(?options, "Conversion options");
    let mut converter = Converter::new(options).with_logger(Arc::new(TracingLogger));

    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(info.virtual_size);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    if let Some(pb) = progress_bar.clone() {
        converter = converter.with_progress(Box::new(move |progress: ConvertProgress| {
            if progress.bytes_total > 0 {
                pb.set_length(progress.bytes_total);
            }
            pb.set_position(progress.bytes_processed);

            let phase_msg = match progress.phase {
                ConvertPhase::Inspecting => "Inspecting...",
                ConvertPhase::Copying => "Copying...",
                ConvertPhase::Resizing => "Resizing...",
                ConvertPhase::Complete => "Complete!",
            };
            pb.set_message(phase_msg);
        }));
    }

    let result = converter.convert_to_raw(source, dest);

    if let Some(pb) = progress_bar {
        if result.is_ok() {
            pb.finish_with_message("Complete!");
        } else {
            pb.abandon_with_message("Failed");
        }
    }
    result.with_context(|| format!("Failed to convert '{}'", source.display()))?;

    if !quiet {
        println!();
        println!("Conversion completed successfully: {}", dest.display());

        if let Ok(metadata) = std::fs::metadata(dest) {
            println!("Output size: {}", format_bytes(metadata.len()));
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                println!("Allocated:   {}", format_bytes(metadata.blocks() * 512));
            }
        }
    }

    Ok(())
}

/// Converts `--block-size-kib` to bytes.
fn block_size_bytes(kib: usize) -> Result<usize> {
    if kib == 0 {
        anyhow::bail!("--block-size-kib must be greater than zero");
    }
    match kib.checked_mul(1024) {
        Some(bytes) => Ok(bytes),
        None => anyhow::bail!("--block-size-kib {} is too large", kib),
    }
}

fn show_info(image: &Path) -> Result<()> {
    let info = inspect_image(image)
        .with_context(|| format!("Failed to inspect '{}'", image.display()))?;

    println!("Image Information");
    println!("=================");
    println!();
    println!("Path:         {}", info.path.display());
    println!("Format:       {}", info.format);
    println!("Virtual size: {}", format_bytes(info.virtual_size));
    println!("File size:    {}", format_bytes(info.file_size));

    match (&info.backing_file, &info.backing_file_format) {
        (Some(file), Some(format)) => println!("Backing file: {} ({})", file, format),
        (Some(file), None) => println!("Backing file: {}", file),
        _ => println!("Backing file: None"),
    }

    match &info.unreadable_reason {
        None => println!("Readable:     yes"),
        Some(reason) => println!("Readable:     no ({})", reason),
    }

    Ok(())
}
