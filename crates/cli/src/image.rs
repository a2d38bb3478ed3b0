//! Flash-image persistence for the shell.
//!
//! The shell runs over an in-memory fake flash; pointing `EMBER_IMAGE`
//! at a file makes the device contents survive across runs. An image is
//! simply the raw device bytes.

use anyhow::{ensure, Context, Result};
use flash::{FakeFlashMemory, FlashMemory};
use std::fs;
use std::path::Path;

/// Creates a device of the given geometry, loading `path` if it exists.
///
/// A missing file yields a fully erased device; an existing file must
/// match the geometry exactly.
pub fn load<P: AsRef<Path>>(
    path: P,
    sector_size: usize,
    sector_count: usize,
    alignment: usize,
) -> Result<FakeFlashMemory> {
    let mut flash = FakeFlashMemory::new(sector_size, sector_count, alignment);
    let path = path.as_ref();
    if !path.exists() {
        return Ok(flash);
    }

    let bytes = fs::read(path)
        .with_context(|| format!("failed to read flash image {}", path.display()))?;
    ensure!(
        bytes.len() == flash.size_bytes(),
        "flash image {} is {} bytes, expected {} ({}x{} sectors)",
        path.display(),
        bytes.len(),
        flash.size_bytes(),
        sector_count,
        sector_size,
    );
    flash.buffer_mut().copy_from_slice(&bytes);
    Ok(flash)
}

/// Writes the device bytes back to `path`.
pub fn save<P: AsRef<Path>>(path: P, flash: &FakeFlashMemory) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, flash.buffer())
        .with_context(|| format!("failed to write flash image {}", path.display()))
}
