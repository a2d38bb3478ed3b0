//! Shared fixtures: reference entry builders, checksum functions, and
//! preloaded fake-flash constructors used across the store tests.

use crate::{ChecksumAlgorithm, Error, GarbageCollectOnWrite, ErrorRecovery, KeyValueStore, Options};
use flash::{FakeFlashMemory, FlashMemory};

pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_COUNT: usize = 4;
pub const ALIGNMENT: usize = 16;

pub const MAGIC: u32 = 0xc001_beef;
pub const ALT_MAGIC: u32 = 0x0bad_d00d;
pub const NO_CHECKSUM_MAGIC: u32 = 0x6000_061e;

pub type TestKvs<'a> = KeyValueStore<'a, FakeFlashMemory, 256, 256>;
pub type RedundantKvs<'a> = KeyValueStore<'a, FakeFlashMemory, 256, 256, 2>;
pub type MultiFormatKvs<'a> = KeyValueStore<'a, FakeFlashMemory, 256, 256, 2, 3>;
pub type MigrationKvs<'a> = KeyValueStore<'a, FakeFlashMemory, 256, 256, 1, 2>;
pub type TinyKvs<'a> = KeyValueStore<'a, FakeFlashMemory, 4, 256>;

/// Byte-wise additive checksum used by the reference entries.
pub fn sum_checksum(data: &[u8], mut state: u32) -> u32 {
    for &b in data {
        state = state.wrapping_add(u32::from(b));
    }
    state
}

/// A second, order-sensitive checksum for the alternate format.
pub fn alt_checksum(data: &[u8], mut state: u32) -> u32 {
    for &b in data {
        state = (state << 8) | u32::from((state >> 24) as u8 ^ b);
    }
    state
}

/// Adapts a plain `fn(data, state) -> state` into the capability object
/// the codec consumes.
pub struct ChecksumFn {
    function: fn(&[u8], u32) -> u32,
    state: u32,
}

impl ChecksumFn {
    pub fn new(function: fn(&[u8], u32) -> u32) -> Self {
        Self { function, state: 0 }
    }
}

impl ChecksumAlgorithm for ChecksumFn {
    fn reset(&mut self) {
        self.state = 0;
    }

    fn update(&mut self, data: &[u8]) {
        self.state = (self.function)(data, self.state);
    }

    fn finish(&mut self) -> u32 {
        self.state
    }
}

/// Builds a reference entry by hand for the given format: header with a
/// zeroed checksum, key, value, erased-byte padding, checksum patched in
/// at offset 4.
pub fn make_entry_for(
    magic: u32,
    checksum: fn(&[u8], u32) -> u32,
    id: u32,
    key: &str,
    value: &[u8],
) -> Vec<u8> {
    let content = 16 + key.len() + value.len();
    let size = content.div_ceil(ALIGNMENT) * ALIGNMENT;

    let mut bytes = Vec::with_capacity(size);
    bytes.extend_from_slice(&magic.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    bytes.push((ALIGNMENT / 16 - 1) as u8);
    bytes.push(key.len() as u8);
    bytes.extend_from_slice(&(value.len() as u16).to_le_bytes());
    bytes.extend_from_slice(&id.to_le_bytes());
    bytes.extend_from_slice(key.as_bytes());
    bytes.extend_from_slice(value);
    bytes.resize(size, 0xFF);

    let sum = checksum(&bytes, 0);
    bytes[4..8].copy_from_slice(&sum.to_le_bytes());
    bytes
}

/// Reference entry in the primary format with the additive checksum.
pub fn make_entry(id: u32, key: &str, value: &[u8]) -> Vec<u8> {
    make_entry_for(MAGIC, sum_checksum, id, key, value)
}

/// A 512 × 4 fake flash, alignment 16, with `entries` laid back to back
/// from the start of sector 0.
pub fn preloaded(entries: &[&[u8]]) -> FakeFlashMemory {
    let mut flash = FakeFlashMemory::new(SECTOR_SIZE, SECTOR_COUNT, ALIGNMENT);
    let mut offset = 0;
    for entry in entries {
        flash.buffer_mut()[offset..offset + entry.len()].copy_from_slice(entry);
        offset += entry.len();
    }
    flash
}

pub fn erased_flash() -> FakeFlashMemory {
    FakeFlashMemory::new(SECTOR_SIZE, SECTOR_COUNT, ALIGNMENT)
}

/// Manual recovery, no GC on write, full verification (the strict
/// error-handling configuration).
pub fn manual_no_gc() -> Options {
    Options {
        gc_on_write: GarbageCollectOnWrite::Disabled,
        recovery: ErrorRecovery::Manual,
        verify_on_read: true,
        verify_on_write: true,
    }
}

/// Lazy recovery, no GC on write.
pub fn lazy_no_gc() -> Options {
    Options {
        gc_on_write: GarbageCollectOnWrite::Disabled,
        recovery: ErrorRecovery::Lazy,
        verify_on_read: true,
        verify_on_write: true,
    }
}

/// Lazy recovery with one-sector GC on write.
pub fn lazy_one_sector() -> Options {
    Options {
        gc_on_write: GarbageCollectOnWrite::OneSector,
        recovery: ErrorRecovery::Lazy,
        verify_on_read: true,
        verify_on_write: true,
    }
}

/// Reads a key into an owned buffer.
pub fn get_value<
    F: FlashMemory,
    const MAX_ENTRIES: usize,
    const MAX_SECTORS: usize,
    const REDUNDANCY: usize,
    const FORMAT_COUNT: usize,
>(
    kvs: &mut KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>,
    key: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut buffer = [0u8; 512];
    let length = kvs.get(key, &mut buffer)?;
    Ok(buffer[..length].to_vec())
}

/// Asserts a key reads back with exactly `value`.
pub fn assert_contains<
    F: FlashMemory,
    const MAX_ENTRIES: usize,
    const MAX_SECTORS: usize,
    const REDUNDANCY: usize,
    const FORMAT_COUNT: usize,
>(
    kvs: &mut KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>,
    key: &[u8],
    value: &[u8],
) {
    let read = get_value(kvs, key).unwrap_or_else(|e| {
        panic!(
            "key {:?} unreadable: {e}",
            String::from_utf8_lossy(key)
        )
    });
    assert_eq!(
        read,
        value,
        "wrong value for key {:?}",
        String::from_utf8_lossy(key)
    );
}
