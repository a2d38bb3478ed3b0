//! # Flash — device abstraction for sector-erased memory
//!
//! Provides the storage contract consumed by the EmberKV engine:
//!
//! - [`FlashMemory`] — a sector-addressable device: erase whole sectors,
//!   read and write aligned byte ranges, query geometry and the erased
//!   byte value.
//! - [`FlashPartition`] — a bounds-checked view over a contiguous run of
//!   sectors, enforcing permission (`ReadOnly`/`ReadWrite`) and sector
//!   boundaries. All engine I/O goes through a partition.
//! - [`FakeFlashMemory`] — an in-memory device with error injection, used
//!   by unit tests, benches, and the debug CLI.
//!
//! Addresses are partition-relative byte offsets (`u32`). Writes must be
//! aligned to the device alignment in both address and length; erase
//! operates on whole sectors only.

use log::error;
use thiserror::Error;

/// A byte offset into a flash device or partition.
pub type Address = u32;

/// Errors surfaced by flash devices and partitions.
///
/// The first three are produced by the partition layer itself; the rest
/// model device-level failures and are what the fake flash injects.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// An address or length extends beyond the device or partition.
    #[error("address or length out of bounds")]
    OutOfRange,

    /// A mutating operation was attempted on a read-only partition.
    #[error("partition is read-only")]
    PermissionDenied,

    /// A misaligned address or length, or an otherwise malformed request.
    #[error("misaligned or invalid flash request")]
    InvalidArgument,

    /// The device did not respond.
    #[error("flash device unavailable")]
    Unavailable,

    /// The device reported an internal failure.
    #[error("internal flash device error")]
    Internal,

    /// The device rejected the access as unauthenticated.
    #[error("flash access not authenticated")]
    Unauthenticated,
}

/// A sector-erased flash device.
///
/// Reads and writes report the number of bytes actually transferred.
/// Implementations may require aligned writes; the partition layer only
/// issues requests that respect `alignment_bytes()`.
pub trait FlashMemory {
    /// Size of one erasable sector in bytes.
    fn sector_size_bytes(&self) -> usize;

    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Required alignment for write addresses and lengths.
    fn alignment_bytes(&self) -> usize;

    /// The value every byte holds after an erase (commonly `0xFF`).
    fn erased_byte(&self) -> u8;

    /// Total device size in bytes.
    fn size_bytes(&self) -> usize {
        self.sector_size_bytes() * self.sector_count()
    }

    /// Erases `num_sectors` sectors starting at `address`, which must be
    /// sector-aligned.
    fn erase(&mut self, address: Address, num_sectors: usize) -> Result<(), FlashError>;

    /// Reads `out.len()` bytes starting at `address`.
    fn read(&mut self, address: Address, out: &mut [u8]) -> Result<usize, FlashError>;

    /// Writes `data` starting at `address`. Address and length must be
    /// multiples of `alignment_bytes()`.
    fn write(&mut self, address: Address, data: &[u8]) -> Result<usize, FlashError>;
}

/// Access permission for a [`FlashPartition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPermission {
    ReadOnly,
    ReadWrite,
}

/// A bounds-checked window over a contiguous run of sectors.
///
/// The partition owns its device and translates partition-relative
/// addresses to device addresses. Out-of-bounds access returns
/// [`FlashError::OutOfRange`]; mutating a read-only partition returns
/// [`FlashError::PermissionDenied`].
pub struct FlashPartition<F> {
    flash: F,
    start_sector: usize,
    sector_count: usize,
    permission: PartitionPermission,
}

impl<F: FlashMemory> FlashPartition<F> {
    /// Creates a read-write partition spanning the whole device.
    pub fn new(flash: F) -> Self {
        let sectors = flash.sector_count();
        Self::with_range(flash, 0, sectors, PartitionPermission::ReadWrite)
    }

    /// Creates a partition over `sector_count` sectors starting at
    /// `start_sector`.
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit on the device or is empty.
    pub fn with_range(
        flash: F,
        start_sector: usize,
        sector_count: usize,
        permission: PartitionPermission,
    ) -> Self {
        assert!(sector_count > 0, "partition must contain at least one sector");
        assert!(
            start_sector + sector_count <= flash.sector_count(),
            "partition range exceeds the device"
        );
        Self {
            flash,
            start_sector,
            sector_count,
            permission,
        }
    }

    /// Size of one sector in bytes.
    pub fn sector_size_bytes(&self) -> usize {
        self.flash.sector_size_bytes()
    }

    /// Number of sectors in this partition.
    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    /// Total partition size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.sector_size_bytes() * self.sector_count
    }

    /// Write alignment inherited from the device.
    pub fn alignment_bytes(&self) -> usize {
        self.flash.alignment_bytes()
    }

    /// The erased byte value of the underlying device.
    pub fn erased_byte(&self) -> u8 {
        self.flash.erased_byte()
    }

    /// Shared access to the underlying device.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Exclusive access to the underlying device. Tests use this to
    /// corrupt bytes or inject errors beneath a live store.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Reads `out.len()` bytes at the partition-relative `address`.
    pub fn read(&mut self, address: Address, out: &mut [u8]) -> Result<usize, FlashError> {
        self.check_bounds(address, out.len())?;
        self.flash.read(self.to_device(address), out)
    }

    /// Writes `data` at the partition-relative `address`. The address and
    /// length must be multiples of `alignment_bytes()`.
    pub fn write(&mut self, address: Address, data: &[u8]) -> Result<usize, FlashError> {
        if self.permission == PartitionPermission::ReadOnly {
            return Err(FlashError::PermissionDenied);
        }
        let alignment = self.alignment_bytes();
        if address as usize % alignment != 0 || data.len() % alignment != 0 {
            return Err(FlashError::InvalidArgument);
        }
        self.check_bounds(address, data.len())?;
        self.flash.write(self.to_device(address), data)
    }

    /// Erases `num_sectors` sectors starting at the sector-aligned
    /// partition-relative `address`.
    pub fn erase(&mut self, address: Address, num_sectors: usize) -> Result<(), FlashError> {
        if self.permission == PartitionPermission::ReadOnly {
            return Err(FlashError::PermissionDenied);
        }
        if address as usize % self.sector_size_bytes() != 0 {
            return Err(FlashError::InvalidArgument);
        }
        self.check_bounds(address, num_sectors * self.sector_size_bytes())?;
        self.flash.erase(self.to_device(address), num_sectors)
    }

    /// Erases the entire partition.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        self.erase(0, self.sector_count)
    }

    /// Returns whether every byte in `[address, address + length)` holds
    /// the erased value.
    pub fn is_region_erased(&mut self, address: Address, length: usize) -> Result<bool, FlashError> {
        let erased = self.erased_byte();
        let mut buffer = [0u8; 64];
        let mut offset = 0;
        while offset < length {
            let chunk = (length - offset).min(buffer.len());
            self.read(address + offset as Address, &mut buffer[..chunk])?;
            if buffer[..chunk].iter().any(|&b| b != erased) {
                return Ok(false);
            }
            offset += chunk;
        }
        Ok(true)
    }

    /// Returns whether `data` consists entirely of the erased byte value.
    pub fn appears_erased(&self, data: &[u8]) -> bool {
        let erased = self.erased_byte();
        data.iter().all(|&b| b == erased)
    }

    fn to_device(&self, address: Address) -> Address {
        address + (self.start_sector * self.sector_size_bytes()) as Address
    }

    fn check_bounds(&self, address: Address, length: usize) -> Result<(), FlashError> {
        if address as usize + length > self.size_bytes() {
            error!(
                "out-of-bounds flash access (address: {}, length: {})",
                address, length
            );
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }
}

/// How an injected error decides which operations fail.
enum InjectionKind {
    /// Fail the next `remaining` operations, after skipping `delay`.
    Count { remaining: usize, delay: usize },
    /// Fail every operation touching `[begin, begin + length)`.
    Range { begin: Address, length: usize },
}

/// A programmable failure for [`FakeFlashMemory`] reads or writes.
pub struct FlashErrorInjection {
    status: FlashError,
    kind: InjectionKind,
}

impl FlashErrorInjection {
    /// Fails the next `count` operations with `status`.
    pub fn unconditional(status: FlashError, count: usize) -> Self {
        Self {
            status,
            kind: InjectionKind::Count {
                remaining: count,
                delay: 0,
            },
        }
    }

    /// Skips `delay` operations, then fails the following `count`.
    pub fn after(status: FlashError, count: usize, delay: usize) -> Self {
        Self {
            status,
            kind: InjectionKind::Count {
                remaining: count,
                delay,
            },
        }
    }

    /// Fails every operation that touches `[begin, begin + length)`.
    pub fn in_range(status: FlashError, begin: Address, length: usize) -> Self {
        Self {
            status,
            kind: InjectionKind::Range { begin, length },
        }
    }

    fn apply(&mut self, address: Address, length: usize) -> Option<FlashError> {
        match &mut self.kind {
            InjectionKind::Count { remaining, delay } => {
                if *delay > 0 {
                    *delay -= 1;
                    None
                } else if *remaining > 0 {
                    *remaining -= 1;
                    Some(self.status)
                } else {
                    None
                }
            }
            InjectionKind::Range { begin, length: len } => {
                let end = *begin as usize + *len;
                if (address as usize) < end && address as usize + length > *begin as usize {
                    Some(self.status)
                } else {
                    None
                }
            }
        }
    }
}

/// In-memory flash device for tests, benches, and the debug CLI.
///
/// Backed by a byte buffer initialized to the erased value. Read and
/// write failures can be injected per operation count or per address
/// range; erase is never injected (a failed erase is modeled by
/// injecting the subsequent write).
pub struct FakeFlashMemory {
    buffer: Vec<u8>,
    sector_size: usize,
    sector_count: usize,
    alignment: usize,
    read_errors: Vec<FlashErrorInjection>,
    write_errors: Vec<FlashErrorInjection>,
}

/// Erased value of the fake device.
pub const FAKE_ERASED_BYTE: u8 = 0xFF;

impl FakeFlashMemory {
    /// Creates a device of `sector_count` sectors of `sector_size` bytes
    /// with the given write alignment, fully erased.
    ///
    /// # Panics
    ///
    /// Panics if the geometry is degenerate (zero sizes, alignment not
    /// dividing the sector size).
    pub fn new(sector_size: usize, sector_count: usize, alignment: usize) -> Self {
        assert!(sector_size > 0 && sector_count > 0, "degenerate geometry");
        assert!(
            alignment > 0 && sector_size % alignment == 0,
            "alignment must divide the sector size"
        );
        Self {
            buffer: vec![FAKE_ERASED_BYTE; sector_size * sector_count],
            sector_size,
            sector_count,
            alignment,
            read_errors: Vec::new(),
            write_errors: Vec::new(),
        }
    }

    /// The raw backing bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable backing bytes, for preloading images or flipping bits.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Queues an error for upcoming read operations.
    pub fn inject_read_error(&mut self, injection: FlashErrorInjection) {
        self.read_errors.push(injection);
    }

    /// Queues an error for upcoming write operations.
    pub fn inject_write_error(&mut self, injection: FlashErrorInjection) {
        self.write_errors.push(injection);
    }

    /// Drops all pending injections.
    pub fn clear_injected_errors(&mut self) {
        self.read_errors.clear();
        self.write_errors.clear();
    }

    fn check_injected(
        injections: &mut [FlashErrorInjection],
        address: Address,
        length: usize,
    ) -> Result<(), FlashError> {
        for injection in injections {
            if let Some(status) = injection.apply(address, length) {
                return Err(status);
            }
        }
        Ok(())
    }
}

impl FlashMemory for FakeFlashMemory {
    fn sector_size_bytes(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> usize {
        self.sector_count
    }

    fn alignment_bytes(&self) -> usize {
        self.alignment
    }

    fn erased_byte(&self) -> u8 {
        FAKE_ERASED_BYTE
    }

    fn erase(&mut self, address: Address, num_sectors: usize) -> Result<(), FlashError> {
        let start = address as usize;
        if start % self.sector_size != 0 {
            return Err(FlashError::InvalidArgument);
        }
        let end = start + num_sectors * self.sector_size;
        if end > self.buffer.len() {
            return Err(FlashError::OutOfRange);
        }
        self.buffer[start..end].fill(FAKE_ERASED_BYTE);
        Ok(())
    }

    fn read(&mut self, address: Address, out: &mut [u8]) -> Result<usize, FlashError> {
        let start = address as usize;
        if start + out.len() > self.buffer.len() {
            return Err(FlashError::OutOfRange);
        }
        Self::check_injected(&mut self.read_errors, address, out.len())?;
        out.copy_from_slice(&self.buffer[start..start + out.len()]);
        Ok(out.len())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> Result<usize, FlashError> {
        let start = address as usize;
        if start % self.alignment != 0 || data.len() % self.alignment != 0 {
            return Err(FlashError::InvalidArgument);
        }
        if start + data.len() > self.buffer.len() {
            return Err(FlashError::OutOfRange);
        }
        Self::check_injected(&mut self.write_errors, address, data.len())?;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}
