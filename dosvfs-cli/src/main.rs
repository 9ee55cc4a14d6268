//! DOS virtual drive CLI - inspect and modify ZIP-backed DOS drives.
//!
//! Usage:
//!   dosvfs [--config mount.json] [--trace] <command>
//!
//! Examples:
//!   dosvfs ls game.zip                        # List the root of an archive
//!   dosvfs ls game.zip SOUNDS --patches p.zip # List through a patch archive
//!   dosvfs cat game.zip README.TXT            # Print a file
//!   dosvfs patch game.exe fix.ips -o new.exe  # Apply a patch on host files
//!   dosvfs fat game.zip -o game.img           # Write a FAT disk image
//!   dosvfs shell game.zip --save save.zip     # Edit the drive interactively

use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dosvfs_core::fs::{list_dir, read_file, write_file, FoundEntry, ATTR_DIRECTORY, SEARCH_ALL_FILES};
use dosvfs_core::{apply_patch, canonical_path, Drive, FatConfig, LayerConfig, MountConfig, UnionDrive};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// DOS virtual drive tool
#[derive(Parser, Debug)]
#[command(name = "dosvfs")]
#[command(about = "Inspect and modify DOS drives backed by ZIP archives")]
struct Args {
    /// Mount configuration (JSON); its layers go on top of the archive
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        archive: PathBuf,
        #[arg(default_value = "")]
        dir: String,
        /// Archive of patches applied to the base archive
        #[arg(short, long)]
        patches: Option<PathBuf>,
    },
    /// Write a file to stdout
    Cat {
        archive: PathBuf,
        path: String,
        #[arg(short, long)]
        patches: Option<PathBuf>,
    },
    /// Apply an XOR, IPS, BPS or VCDIFF patch to a host file
    Patch {
        source: PathBuf,
        patch: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write the drive as a partitioned FAT disk image
    Fat {
        archive: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Free space added to the volume
        #[arg(long, default_value_t = 0)]
        free_mb: u32,
    },
    /// Interactive commands on a writable view of the drive
    Shell {
        archive: PathBuf,
        /// Save file keeping the changes
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

fn init_logging(trace: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if trace { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Mount configuration with `archive` as the bottom layer.
fn mount_config(args: &Args, archive: &Path, patches: Option<&PathBuf>) -> CliResult<MountConfig> {
    let mut config = match &args.config {
        Some(path) => MountConfig::from_json_file(path)?,
        None => MountConfig::default(),
    };
    config.layers.insert(
        0,
        LayerConfig {
            archive: archive.to_path_buf(),
            patches: patches.cloned(),
        },
    );
    Ok(config)
}

fn format_entry(e: &FoundEntry) -> String {
    let (base, ext) = e.name.split_once('.').unwrap_or((e.name.as_str(), ""));
    let size = if e.attr as u16 & ATTR_DIRECTORY != 0 {
        "<DIR>".to_string()
    } else {
        e.size.to_string()
    };
    let (year, month, day) = (1980 + (e.date >> 9), (e.date >> 5) & 0x0f, e.date & 0x1f);
    let (hour, minute) = (e.time >> 11, (e.time >> 5) & 0x3f);
    format!("{base:<8} {ext:<3} {size:>10}  {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}")
}

fn print_dir(drive: &mut dyn Drive, dir: &str) -> CliResult<()> {
    let dir = canonical_path(dir);
    let entries = list_dir(drive, &dir, SEARCH_ALL_FILES)?;
    let mut out = std::io::stdout().lock();
    for e in &entries {
        writeln!(out, "{}", format_entry(e))?;
    }
    let total: u64 = entries.iter().map(|e| e.size as u64).sum();
    writeln!(out, "{:>9} file(s) {:>12} bytes", entries.len(), total)?;
    Ok(())
}

fn nth_arg<'a>(args: &[&'a str], i: usize, cmd: &str) -> CliResult<&'a str> {
    args.get(i)
        .copied()
        .ok_or_else(|| format!("{cmd}: missing argument").into())
}

/// Run one shell line. Returns false on `exit`.
fn shell_command(drive: &mut UnionDrive, line: &str) -> CliResult<bool> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(true);
    };
    let args: Vec<&str> = words.collect();
    let arg = |i: usize| nth_arg(&args, i, cmd);
    match cmd.to_ascii_lowercase().as_str() {
        "dir" => print_dir(drive, args.first().copied().unwrap_or(""))?,
        "type" => {
            let data = read_file(drive, &canonical_path(arg(0)?))?;
            let mut out = std::io::stdout().lock();
            out.write_all(&data)?;
            out.flush()?;
        }
        "copy" => {
            let data = read_file(drive, &canonical_path(arg(0)?))?;
            write_file(drive, &canonical_path(arg(1)?), &data)?;
        }
        "del" => drive.file_unlink(&canonical_path(arg(0)?))?,
        "ren" => drive.rename(&canonical_path(arg(0)?), &canonical_path(arg(1)?))?,
        "md" => drive.make_dir(&canonical_path(arg(0)?))?,
        "rd" => drive.remove_dir(&canonical_path(arg(0)?))?,
        "save" => match drive.save_now()? {
            Some(stats) => println!("saved {} files, {} bytes written", stats.members, stats.bytes_written),
            None => println!("no save file"),
        },
        "exit" => return Ok(false),
        _ => println!("unknown command: {cmd}"),
    }
    Ok(true)
}

async fn run_shell(drive: UnionDrive) -> CliResult<()> {
    let drive = Arc::new(Mutex::new(drive));
    let (shutdown_tx, mut shutdown_rx) = tokio_mpsc::channel::<()>(1);

    // Pump the save timer while the blocking task owns the console
    let timer_drive = Arc::clone(&drive);
    let timer_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    if let Ok(mut d) = timer_drive.lock() {
                        d.poll_save(Instant::now());
                    }
                }
            }
        }
    });

    let shell_drive = Arc::clone(&drive);
    let shell_handle = tokio::task::spawn_blocking(move || -> CliResult<()> {
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("C:\\> ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next() else {
                break;
            };
            let line = line?;
            let mut d = shell_drive.lock().map_err(|_| "drive lock poisoned")?;
            match shell_command(&mut d, &line) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("{e}"),
            }
        }
        Ok(())
    });

    let result = shell_handle.await?;
    let _ = shutdown_tx.send(()).await;
    let _ = timer_handle.await;

    let mut d = drive.lock().map_err(|_| "drive lock poisoned")?;
    d.unmount()?;
    result
}

async fn run(args: Args) -> CliResult<()> {
    match &args.command {
        Command::Ls { archive, dir, patches } => {
            let mut drive = mount_config(&args, archive, patches.as_ref())?.mount_layers()?;
            print_dir(&mut drive, dir)?;
        }
        Command::Cat { archive, path, patches } => {
            let mut drive = mount_config(&args, archive, patches.as_ref())?.mount_layers()?;
            let data = read_file(&mut drive, &canonical_path(path))?;
            let mut out = std::io::stdout().lock();
            out.write_all(&data)?;
            out.flush()?;
        }
        Command::Patch { source, patch, output } => {
            let source = std::fs::read(source)?;
            let patch = std::fs::read(patch)?;
            let target = apply_patch(&source, &patch)?;
            std::fs::write(output, &target)?;
            info!(bytes = target.len(), "patched");
        }
        Command::Fat { archive, output, free_mb } => {
            let mut config = mount_config(&args, archive, None)?;
            let fat = config.fat.get_or_insert_with(FatConfig::default);
            fat.free_space_mb = *free_mb;
            let mut dev = config.mount_fat()?;
            let mut out = BufWriter::new(std::fs::File::create(output)?);
            dev.write_image(&mut out)?;
            out.flush()?;
            let (cylinders, heads, sectors) = dev.geometry();
            eprintln!(
                "FAT{} image: {} sectors (CHS {}/{}/{})",
                dev.layout().fat_bits(),
                dev.sector_count(),
                cylinders,
                heads,
                sectors
            );
        }
        Command::Shell { archive, save } => {
            let mut config = mount_config(&args, archive, None)?;
            if save.is_some() {
                config.union.save_path = save.clone();
            }
            run_shell(config.mount_union()?).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.trace);
    if let Err(e) = run(args).await {
        error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
