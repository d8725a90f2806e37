use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctrload::crypto::SlotState;
use ctrload::loader::ncch::NcchLoader;
use ctrload::prelude::*;
use std::{
    fs,
    io::{Read, Seek},
    path::PathBuf,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the container type, NCCH headers and RomFS location
    Info {
        input_file: PathBuf,
    },
    /// Load the key sources from a sysdata directory and list the slots
    Keys {
        #[arg(short, long)]
        sysdata: PathBuf,
    },
    /// Write a section of the executable NCCH to a file
    Extract {
        input_file: PathBuf,
        #[arg(short, long, value_enum, default_value = "code")]
        section: Section,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Section {
    Code,
    Banner,
    Icon,
    Logo,
    Romfs,
}

fn print_ncch<R: Read + Seek>(ncch: &NcchLoader<R>) {
    if let Some(header) = ncch.header() {
        println!("{:#x?}", header);
    }
    if let Some(exheader) = ncch.exheader() {
        println!("{:#x?}", exheader);
    }
    if let Some(exefs) = ncch.exefs() {
        for file in exefs.file_headers_used() {
            println!(
                "  {:<8} offset {:#08x} size {:#08x}",
                String::from_utf8_lossy(file.name()),
                file.offset(),
                file.size()
            );
        }
    }
}

fn info(input_file: PathBuf) -> Result<()> {
    let mut loader = ctrload::loader::open_loader(&input_file)
        .with_context(|| format!("Failed to open {}", input_file.display()))?;

    println!("type: {}", loader.file_type());
    println!("ncch offset: {:#x}", loader.ncch_offset());
    let program_id = loader.read_program_id().context("Failed to read program id")?;
    println!("program id: {:016X}", program_id);

    match loader.load_kernel_system_mode() {
        Ok(mode) => println!("system mode: {:?}", mode),
        Err(e) => println!("system mode: {}", e),
    }
    match loader.read_romfs() {
        Ok(region) => println!("romfs: {:#x}+{:#x}", region.offset, region.size),
        Err(e) => println!("romfs: {}", e),
    }

    print_ncch(loader.ncch());
    Ok(())
}

fn keys(sysdata: PathBuf) -> Result<()> {
    let mut keys = KeyStore::new();
    let report = keys
        .init_keys(&KeySources::from_sysdata_dir(&sysdata))
        .with_context(|| format!("Failed to load keys from {}", sysdata.display()))?;
    info!(sysdata = %sysdata.display(), loaded = report.loaded, skipped = report.skipped, "loaded key sources");
    if report.skipped != 0 {
        warn!(skipped = report.skipped, "some key entries were skipped");
    }
    println!("generator: {}", keys.generator_constant().is_some());

    for slot in KeySlotId::all() {
        let state = keys.slot(slot).state();
        if state != SlotState::Empty {
            println!("{}: {:?}", slot, state);
        }
    }
    Ok(())
}

fn extract(input_file: PathBuf, section: Section, output: PathBuf) -> Result<()> {
    let mut loader = ctrload::loader::open_loader(&input_file)
        .with_context(|| format!("Failed to open {}", input_file.display()))?;

    let data = match section {
        Section::Code => loader.read_code()?,
        Section::Banner => loader.read_banner()?,
        Section::Icon => loader.read_icon()?,
        Section::Logo => loader.read_logo()?,
        Section::Romfs => {
            let mut data = Vec::new();
            loader.read_romfs()?.open()?.read_to_end(&mut data)?;
            data
        }
    };

    fs::write(&output, data).with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match args.cmd {
        Commands::Info { input_file } => info(input_file),
        Commands::Keys { sysdata } => keys(sysdata),
        Commands::Extract {
            input_file,
            section,
            output,
        } => extract(input_file, section, output),
    }
}
