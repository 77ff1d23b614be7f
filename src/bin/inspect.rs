//! FrameKV Inspect Binary
//!
//! Read-only diagnostics for record store files (plus tail recovery).

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use framekv::record::FrameReader;
use framekv::store::recover;
use framekv::{Result, StorageOptions};
use tracing_subscriber::{fmt, EnvFilter};

/// FrameKV file inspector
#[derive(Parser, Debug)]
#[command(name = "framekv-inspect")]
#[command(about = "Inspect and repair FrameKV record store files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan every record, checking lengths, CRCs and generation order
    Verify {
        /// Store file
        file: PathBuf,
    },

    /// Print the record starting at a byte offset
    Dump {
        /// Store file
        file: PathBuf,

        /// Offset of the record's first frame
        #[arg(short, long, default_value = "0")]
        position: u64,

        /// Payload bytes to print
        #[arg(short, long, default_value = "64")]
        bytes: usize,
    },

    /// Truncate the file after its last complete generation
    Recover {
        /// Store file
        file: PathBuf,

        /// Write the recovered descriptor here
        #[arg(short, long)]
        descriptor_out: Option<PathBuf>,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,framekv=debug"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    tracing::debug!("FrameKV Inspect v{}", framekv::VERSION);

    let outcome = match args.command {
        Commands::Verify { file } => verify(file),
        Commands::Dump {
            file,
            position,
            bytes,
        } => dump(file, position, bytes),
        Commands::Recover {
            file,
            descriptor_out,
        } => recover_file(file, descriptor_out),
    };

    if let Err(e) = outcome {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn verify(file: PathBuf) -> Result<()> {
    let mut reader = FrameReader::open(&file)?;
    let mut position = 0u64;
    let mut records = 0u64;
    let mut frames = 0u64;
    let mut closing = 0u64;
    let mut last_generation: Option<i64> = None;

    while position < reader.file_len() {
        let record = reader.read_raw_record_at(position)?;
        if let Some(last) = last_generation {
            if record.generation < last {
                tracing::warn!(
                    position,
                    generation = record.generation,
                    previous = last,
                    "Generation decreased"
                );
            }
        }
        records += 1;
        frames += record.frame_count as u64;
        if record.closes_generation {
            closing += 1;
        }
        last_generation = Some(record.generation);
        position = record.location.end_position();
    }

    println!("file:               {}", file.display());
    println!("size:               {} bytes", reader.file_len());
    println!("records:            {}", records);
    println!("frames:             {}", frames);
    println!("index fragments:    {}", closing);
    match last_generation {
        Some(generation) => println!("last generation:    {}", generation),
        None => println!("last generation:    -"),
    }
    Ok(())
}

fn dump(file: PathBuf, position: u64, bytes: usize) -> Result<()> {
    let mut reader = FrameReader::open(&file)?;
    let header = reader.read_header(position)?;
    let record = reader.read_record_at(position)?;
    let payload = record.payload.unwrap_or_default();

    println!("position:           {}", record.location.starting_position);
    println!("length:             {}", record.location.length);
    println!("generation:         {}", record.generation);
    println!("closes generation:  {}", record.closes_generation);
    println!("control (first):    0b{:04b}", header.control.bits());
    println!("payload:            {} bytes", payload.len());

    let preview: Vec<String> = payload
        .iter()
        .take(bytes)
        .map(|b| format!("{:02x}", b))
        .collect();
    for line in preview.chunks(16) {
        println!("  {}", line.join(" "));
    }
    Ok(())
}

fn recover_file(file: PathBuf, descriptor_out: Option<PathBuf>) -> Result<()> {
    let (report, descriptor) = recover(&file, &StorageOptions::default())?;

    println!("frames scanned:     {}", report.frames_scanned);
    println!("truncated bytes:    {}", report.truncated_bytes);
    match report.last_generation {
        Some(generation) => println!("last generation:    {}", generation),
        None => println!("last generation:    -"),
    }

    match (descriptor, descriptor_out) {
        (Some(descriptor), Some(out)) => {
            fs::write(&out, descriptor.to_bytes()?)?;
            println!("descriptor written: {}", out.display());
        }
        (Some(descriptor), None) => {
            println!(
                "index fragment:     {} (+{} bytes), {} records",
                descriptor.location.starting_position,
                descriptor.location.length,
                descriptor.record_count
            );
        }
        (None, _) => println!("no complete generation found"),
    }
    Ok(())
}
