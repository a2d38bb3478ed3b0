//! # CLI - EmberKV Interactive Shell
//!
//! A REPL-style command-line interface for poking at an EmberKV store
//! backed by an in-memory fake flash device. Reads commands from stdin,
//! executes them against the store, and prints results to stdout;
//! suitable for interactive use and scripted testing (pipe commands via
//! stdin).
//!
//! ## Commands
//!
//! ```text
//! init               Re-initialize the store (rescans the flash)
//! put KEY VALUE      Set a key to a value
//! get KEY            Look up a key
//! delete KEY         Delete a key (writes a tombstone)
//! stats              Print storage statistics
//! maintenance        Run full maintenance (GC + redundancy repair)
//! save               Write the flash image (requires EMBER_IMAGE)
//! help               Show this text
//! quit               Save (if configured) and exit
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! EMBER_IMAGE        Flash image file; omitted = volatile (default: none)
//! EMBER_SECTOR_SIZE  Sector size in bytes        (default: 4096)
//! EMBER_SECTORS      Number of sectors           (default: 8)
//! RUST_LOG           Log filter for the store    (default: off)
//! ```

mod image;

use anyhow::{Context, Result};
use flash::{FakeFlashMemory, FlashPartition};
use kvs::{ChecksumCrc16, EntryFormat, Error, KeyValueStore, Options};
use std::io::{self, BufRead, Write};

/// Magic of the shell's on-flash entry format ("EMBR").
const MAGIC: u32 = 0x454d_4252;

const ALIGNMENT: usize = 16;

type ShellKvs<'a> = KeyValueStore<'a, FakeFlashMemory, 256, 64>;

/// Reads a configuration value from the environment, falling back to
/// `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

const HELP: &str = "\
Commands:
  init             re-initialize the store
  put KEY VALUE    set a key
  get KEY          look up a key
  delete KEY       delete a key
  stats            print storage statistics
  maintenance      run garbage collection and repair
  save             write the flash image to EMBER_IMAGE
  help             show this text
  quit             exit";

fn print_stats(kvs: &ShellKvs<'_>) {
    let stats = kvs.storage_stats();
    println!("keys:                        {}", kvs.len());
    println!("in_use_bytes:                {}", stats.in_use_bytes);
    println!("reclaimable_bytes:           {}", stats.reclaimable_bytes);
    println!("writable_bytes:              {}", stats.writable_bytes);
    println!("corrupt_sectors_recovered:   {}", stats.corrupt_sectors_recovered);
    println!(
        "missing_redundant_recovered: {}",
        stats.missing_redundant_entries_recovered
    );
    println!("error_detected:              {}", kvs.error_detected());
}

fn main() -> Result<()> {
    env_logger::init();

    let sector_size: usize = env_or("EMBER_SECTOR_SIZE", "4096")
        .parse()
        .context("EMBER_SECTOR_SIZE must be a number")?;
    let sector_count: usize = env_or("EMBER_SECTORS", "8")
        .parse()
        .context("EMBER_SECTORS must be a number")?;
    let image_path = std::env::var("EMBER_IMAGE").ok();

    let flash = match &image_path {
        Some(path) => image::load(path, sector_size, sector_count, ALIGNMENT)?,
        None => FakeFlashMemory::new(sector_size, sector_count, ALIGNMENT),
    };

    let mut checksum = ChecksumCrc16::new();
    let mut kvs = ShellKvs::new(
        FlashPartition::new(flash),
        [EntryFormat::new(MAGIC, Some(&mut checksum))],
        Options::default(),
    );

    match kvs.init() {
        Ok(()) => {}
        Err(error) => println!("init -> {error}"),
    }
    println!(
        "EmberKV started ({} keys, {}x{} byte sectors, image={})",
        kvs.len(),
        sector_count,
        sector_size,
        image_path.as_deref().unwrap_or("volatile"),
    );

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break;
        }
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");

        match command {
            "" => {}
            "init" => match kvs.init() {
                Ok(()) => println!("ok"),
                Err(error) => println!("init -> {error}"),
            },
            "put" | "p" => match kvs.put(key.as_bytes(), value.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(error) => println!("put {key:?} -> {error}"),
            },
            "get" | "g" => {
                let mut buffer = [0u8; 1024];
                match kvs.get(key.as_bytes(), &mut buffer) {
                    Ok(length) => {
                        println!("{}", String::from_utf8_lossy(&buffer[..length]))
                    }
                    Err(Error::NotFound) => println!("(nil)"),
                    Err(error) => println!("get {key:?} -> {error}"),
                }
            }
            "delete" | "d" => match kvs.delete(key.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(error) => println!("delete {key:?} -> {error}"),
            },
            "stats" => print_stats(&kvs),
            "maintenance" | "m" => match kvs.full_maintenance() {
                Ok(()) => println!("ok"),
                Err(error) => println!("maintenance -> {error}"),
            },
            "save" => match &image_path {
                Some(path) => {
                    image::save(path, kvs.partition().flash())?;
                    println!("saved {path}");
                }
                None => println!("set EMBER_IMAGE to enable saving"),
            },
            "help" | "h" => println!("{HELP}"),
            "quit" | "q" | "exit" => break,
            other => {
                println!("unrecognized command: {other}");
                println!("type 'help' for options");
            }
        }
    }

    if let Some(path) = &image_path {
        image::save(path, kvs.partition().flash())?;
        println!("saved {path}");
    }
    println!("bye");
    Ok(())
}
