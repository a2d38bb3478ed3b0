//! # KVS — log-structured key-value store for sector-erased flash
//!
//! EmberKV persists small key/value records on NOR/NAND-style flash where
//! writes are expensive, erase granularity is a sector, and power can be
//! lost at any point.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!   |
//!   v
//! ┌─────────────────────────────────────────────────┐
//! │               KeyValueStore                     │
//! │                                                 │
//! │ write.rs → encode → reserve sectors → write R   │
//! │            copies → update key descriptor       │
//! │                                                 │
//! │ read.rs  → key descriptor → parse → verify →    │
//! │            copy value (fall back per copy)      │
//! │                                                 │
//! │ recovery.rs → scan every sector on init,        │
//! │               rebuild both tables, repair       │
//! │                                                 │
//! │ gc.rs    → pick victim → relocate live entries  │
//! │            → erase → reset descriptor           │
//! └─────────────────────────────────────────────────┘
//!          |                        |
//!          v                        v
//!   SectorTable (sectors.rs)  KeyTable (keys.rs)
//! ```
//!
//! The store is append-only: a `put` writes a fresh entry with a higher
//! transaction id and the old one becomes reclaimable; bytes are only
//! recovered by erasing a whole sector after garbage collection has
//! relocated its live entries. One erased sector is always kept in
//! reserve so GC can relocate any other sector's contents.
//!
//! ## Crash safety
//!
//! Sector bytes are reserved in the descriptor table *before* they are
//! programmed, so an interrupted write can never be handed out again.
//! All redundant copies of an entry hit flash before the key descriptor
//! is updated; init reconciles whatever mixture of old and new copies a
//! power loss left behind, the highest transaction id winning.
//!
//! ## Memory discipline
//!
//! Both tables and the codec scratch buffer are fixed-size, parameterized
//! by `MAX_ENTRIES`, `MAX_SECTORS`, `REDUNDANCY`, and `FORMAT_COUNT`;
//! steady-state operation performs no allocation.

mod gc;
mod keys;
mod read;
mod recovery;
mod sectors;
mod write;

use flash::{Address, FlashError, FlashMemory, FlashPartition};
use format::{round_up, EntryHeader, FormatError, HEADER_SIZE, MIN_ALIGNMENT};
use keys::{key_hash, KeyTable, ProbeResult};
use sectors::SectorTable;

pub use format::{
    ChecksumAlgorithm, ChecksumCrc16, ChecksumCrc32, EntryFormat, NullChecksum,
    MAX_KEY_LENGTH,
};

/// Capacity of the in-store scratch buffer, and therefore the largest
/// encodable entry (header + key + value + padding).
pub const MAX_ENTRY_SIZE: usize = 2048;

/// Largest supported entry alignment.
const MAX_ALIGNMENT: usize = 512;

/// Stack buffer size for header+key reads; holds the longest key at the
/// largest alignment.
const KEY_SCRATCH_SIZE: usize = 512;

/// Errors surfaced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The key is absent or deleted.
    #[error("key not found")]
    NotFound,

    /// No intact copy of the requested data survives, or init found
    /// corruption under manual recovery.
    #[error("data loss detected")]
    DataLoss,

    /// The store is not initialized, is read-only, or has no writable
    /// sector left.
    #[error("operation cannot proceed in the current store state")]
    FailedPrecondition,

    /// The key descriptor table is full, or an output buffer was too
    /// small for the stored value.
    #[error("capacity exhausted")]
    ResourceExhausted,

    /// Bad key length, oversized value, or unusable geometry.
    #[error("invalid argument")]
    InvalidArgument,

    /// The partition is read-only.
    #[error("permission denied by the flash partition")]
    PermissionDenied,

    /// An address or length beyond the partition bounds.
    #[error("address out of partition range")]
    OutOfRange,

    /// Garbage collection could not relocate a victim's live entries;
    /// the victim was left intact.
    #[error("garbage collection aborted")]
    Aborted,

    /// The flash device did not respond.
    #[error("flash device unavailable")]
    Unavailable,

    /// The flash device reported an internal failure.
    #[error("internal flash device error")]
    Internal,

    /// The flash device rejected the access as unauthenticated.
    #[error("flash access not authenticated")]
    Unauthenticated,
}

pub type Result<T> = core::result::Result<T, Error>;

impl From<FlashError> for Error {
    fn from(error: FlashError) -> Self {
        match error {
            FlashError::OutOfRange => Error::OutOfRange,
            FlashError::PermissionDenied => Error::PermissionDenied,
            FlashError::InvalidArgument => Error::InvalidArgument,
            FlashError::Unavailable => Error::Unavailable,
            FlashError::Internal => Error::Internal,
            FlashError::Unauthenticated => Error::Unauthenticated,
        }
    }
}

impl From<FormatError> for Error {
    fn from(error: FormatError) -> Self {
        match error {
            FormatError::UnknownMagic => Error::NotFound,
            FormatError::ChecksumMismatch
            | FormatError::Truncated
            | FormatError::AlignmentMismatch
            | FormatError::ZeroKeyLength
            | FormatError::ValueTooLong => Error::DataLoss,
            FormatError::BufferTooSmall | FormatError::InvalidLength => Error::InvalidArgument,
        }
    }
}

/// Garbage-collection policy applied when a `put` finds no room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GarbageCollectOnWrite {
    /// Fail the write with `FailedPrecondition`.
    Disabled,
    /// Collect one sector and retry the write once.
    OneSector,
}

/// How init reacts to corruption found during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorRecovery {
    /// Report `DataLoss` and leave corrupt sectors untouched (and
    /// unwritable) until the caller intervenes.
    Manual,
    /// Repair automatically: collect corrupt sectors and rewrite missing
    /// redundant copies.
    Lazy,
}

/// Store behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub gc_on_write: GarbageCollectOnWrite,
    pub recovery: ErrorRecovery,
    /// Verify the whole record's checksum on every `get`.
    pub verify_on_read: bool,
    /// Read every written copy back and compare after each `put`.
    pub verify_on_write: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            gc_on_write: GarbageCollectOnWrite::OneSector,
            recovery: ErrorRecovery::Lazy,
            verify_on_read: true,
            verify_on_write: true,
        }
    }
}

/// Byte accounting and recovery counters, computed from the descriptor
/// tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Bytes held by current entries, all redundant copies counted.
    pub in_use_bytes: usize,
    /// Bytes recoverable by erasing their sectors.
    pub reclaimable_bytes: usize,
    /// Bytes available for new entries, excluding the reserved empty
    /// sector.
    pub writable_bytes: usize,
    /// Corrupt sectors erased by recovery or maintenance so far.
    pub corrupt_sectors_recovered: usize,
    /// Redundant copies rewritten by recovery or maintenance so far.
    pub missing_redundant_entries_recovered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    NotInitialized,
    /// Init found problems it was not allowed to repair; reads work,
    /// repairs are up to the caller.
    NeedsCleanup,
    Ready,
}

/// A log-structured key-value store over one flash partition.
///
/// Const parameters bound the in-memory tables: `MAX_ENTRIES` key
/// descriptors, `MAX_SECTORS` sector descriptors, `REDUNDANCY` flash
/// copies per entry, and `FORMAT_COUNT` accepted entry formats (reads
/// accept any of them, writes always use the first).
///
/// The store owns its partition; tests reach the underlying device
/// through [`partition_mut`](Self::partition_mut).
pub struct KeyValueStore<
    'a,
    F: FlashMemory,
    const MAX_ENTRIES: usize,
    const MAX_SECTORS: usize,
    const REDUNDANCY: usize = 1,
    const FORMAT_COUNT: usize = 1,
> {
    partition: FlashPartition<F>,
    formats: [EntryFormat<'a>; FORMAT_COUNT],
    options: Options,
    sectors: SectorTable<MAX_SECTORS>,
    keys: KeyTable<MAX_ENTRIES, REDUNDANCY>,
    /// Entry alignment: the partition alignment, raised to at least 16.
    alignment: usize,
    /// Highest transaction id seen on flash; the next write uses +1.
    last_transaction_id: u32,
    init_state: InitState,
    error_detected: bool,
    read_only: bool,
    corrupt_sectors_recovered: usize,
    missing_redundant_entries_recovered: usize,
    scratch: [u8; MAX_ENTRY_SIZE],
}

impl<
        'a,
        F: FlashMemory,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const REDUNDANCY: usize,
        const FORMAT_COUNT: usize,
    > KeyValueStore<'a, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>
{
    /// Creates an uninitialized store over `partition`.
    ///
    /// Nothing touches flash until [`init`](Self::init). Reads accept
    /// every format in `formats`; writes use `formats[0]`.
    ///
    /// # Panics
    ///
    /// Panics if `REDUNDANCY` or `FORMAT_COUNT` is zero.
    pub fn new(
        partition: FlashPartition<F>,
        formats: [EntryFormat<'a>; FORMAT_COUNT],
        options: Options,
    ) -> Self {
        assert!(REDUNDANCY >= 1, "at least one copy per entry is required");
        assert!(FORMAT_COUNT >= 1, "at least one entry format is required");
        let alignment = round_up(
            partition.alignment_bytes().max(MIN_ALIGNMENT),
            MIN_ALIGNMENT,
        );
        Self {
            partition,
            formats,
            options,
            sectors: SectorTable::new(),
            keys: KeyTable::new(),
            alignment,
            last_transaction_id: 0,
            init_state: InitState::NotInitialized,
            error_detected: false,
            read_only: false,
            corrupt_sectors_recovered: 0,
            missing_redundant_entries_recovered: 0,
            scratch: [0; MAX_ENTRY_SIZE],
        }
    }

    /// Whether the last [`init`](Self::init) fully succeeded.
    pub fn initialized(&self) -> bool {
        self.init_state == InitState::Ready
    }

    /// Latched true once any operation observes or creates corruption.
    pub fn error_detected(&self) -> bool {
        self.error_detected
    }

    /// Number of flash copies kept per entry.
    pub fn redundancy(&self) -> usize {
        REDUNDANCY
    }

    /// Number of live (non-deleted) keys.
    pub fn len(&self) -> usize {
        self.keys.valid_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest value accepted by [`put`](Self::put) on this geometry.
    pub fn max_value_size(&self) -> usize {
        let usable = MAX_ENTRY_SIZE.min(self.partition.sector_size_bytes());
        usable
            .saturating_sub(HEADER_SIZE + 1)
            .min(format::MAX_VALUE_LENGTH)
    }

    /// The partition this store writes to.
    pub fn partition(&self) -> &FlashPartition<F> {
        &self.partition
    }

    /// Exclusive access to the partition; tests use this to corrupt
    /// flash or inject device errors beneath the store.
    pub fn partition_mut(&mut self) -> &mut FlashPartition<F> {
        &mut self.partition
    }

    /// Computes the current byte accounting from the sector descriptors.
    ///
    /// `writable_bytes` skips the first empty sector, which is the GC
    /// reserve.
    pub fn storage_stats(&self) -> StorageStats {
        let mut stats = StorageStats {
            corrupt_sectors_recovered: self.corrupt_sectors_recovered,
            missing_redundant_entries_recovered: self.missing_redundant_entries_recovered,
            ..StorageStats::default()
        };
        let mut reserve_skipped = false;
        for sector in 0..self.sectors.len() {
            stats.in_use_bytes += self.sectors.in_use_bytes(sector) as usize;
            stats.reclaimable_bytes += self.sectors.reclaimable_bytes(sector) as usize;
            if !reserve_skipped && self.sectors.is_empty_sector(sector) {
                reserve_skipped = true;
            } else {
                stats.writable_bytes += self.sectors.writable_bytes(sector) as usize;
            }
        }
        stats
    }

    // ---- internal helpers shared by the operation modules ----

    pub(crate) fn check_initialized(&self) -> Result<()> {
        if self.init_state == InitState::NotInitialized {
            return Err(Error::FailedPrecondition);
        }
        Ok(())
    }

    pub(crate) fn note_error(&mut self) {
        self.error_detected = true;
    }

    pub(crate) fn format_index(&self, magic: u32) -> Option<usize> {
        self.formats.iter().position(|f| f.magic == magic)
    }

    /// Bytes from `address` to the end of its sector.
    pub(crate) fn sector_remaining(&self, address: Address) -> usize {
        let sector_size = self.partition.sector_size_bytes();
        sector_size - (address as usize % sector_size)
    }

    /// Reads the entry at `address` into the scratch buffer, validating
    /// its header against the store geometry and, when `verify` is set,
    /// its checksum. Returns the header and the encoded size; the bytes
    /// stay in `self.scratch[..size]`.
    pub(crate) fn load_entry(
        &mut self,
        address: Address,
        verify: bool,
    ) -> Result<(EntryHeader, usize)> {
        let remaining = self.sector_remaining(address);
        let probe = round_up(HEADER_SIZE, self.alignment);
        if probe > remaining {
            return Err(Error::DataLoss);
        }
        let max_value = self.max_value_size();
        let alignment = self.alignment;

        let Self {
            partition, scratch, ..
        } = self;
        partition.read(address, &mut scratch[..probe])?;
        let header = EntryHeader::decode(&scratch[..probe])?;

        let format_index = self.format_index(header.magic).ok_or(Error::NotFound)?;
        header.validate(alignment, remaining, max_value)?;
        let size = header.encoded_size();
        if size > MAX_ENTRY_SIZE {
            return Err(Error::DataLoss);
        }

        let Self {
            partition,
            formats,
            scratch,
            ..
        } = self;
        partition.read(address, &mut scratch[..size])?;
        if verify {
            formats[format_index].verify(&scratch[..size])?;
        }
        Ok((header, size))
    }

    /// Reads the header and key bytes of the entry at `address` into a
    /// caller-provided buffer, leaving the scratch buffer untouched.
    pub(crate) fn read_key_into(
        &mut self,
        address: Address,
        buf: &mut [u8; KEY_SCRATCH_SIZE],
    ) -> Result<(EntryHeader, usize)> {
        let remaining = self.sector_remaining(address);
        let probe = round_up(HEADER_SIZE, self.alignment);
        if probe > remaining {
            return Err(Error::DataLoss);
        }
        self.partition.read(address, &mut buf[..probe])?;
        let header = EntryHeader::decode(&buf[..probe])?;
        // Erased or rotted headers must read as "no entry here", not as a
        // confident answer about the key bytes.
        if self.format_index(header.magic).is_none() {
            return Err(Error::NotFound);
        }
        if header.key_length == 0 {
            return Err(Error::DataLoss);
        }
        let key_length = usize::from(header.key_length);
        let need = round_up(HEADER_SIZE + key_length, self.alignment);
        if need > remaining || need > KEY_SCRATCH_SIZE {
            return Err(Error::DataLoss);
        }
        if need > probe {
            self.partition.read(address, &mut buf[..need])?;
        }
        Ok((header, key_length))
    }

    /// Whether the entry at `address` stores exactly `key`.
    pub(crate) fn key_at_matches(&mut self, address: Address, key: &[u8]) -> Result<bool> {
        let mut buf = [0u8; KEY_SCRATCH_SIZE];
        let (_, key_length) = self.read_key_into(address, &mut buf)?;
        Ok(&buf[HEADER_SIZE..HEADER_SIZE + key_length] == key)
    }

    /// Locates the descriptor slot for `key`, probing by hash and
    /// confirming candidates by reading their key bytes from flash.
    ///
    /// A candidate none of whose copies can be read is remembered: if no
    /// better match exists it is returned, so a key whose every copy was
    /// destroyed reports `DataLoss` on read rather than `NotFound`.
    pub(crate) fn find_slot(&mut self, key: &[u8]) -> Result<Option<usize>> {
        let hash = key_hash(key);
        let mut unconfirmed = None;
        for step in 0..self.keys.capacity() {
            let candidate = match self.keys.probe(hash, step) {
                ProbeResult::Miss => break,
                ProbeResult::Skip => continue,
                ProbeResult::Candidate(slot) => slot,
            };
            let descriptor = match self.keys.get(candidate) {
                Some(d) => *d,
                None => continue,
            };
            // Any copy may confirm the key; a damaged copy must not veto
            // a healthy one.
            let mut matched = false;
            let mut any_readable = false;
            for &address in descriptor.addresses() {
                match self.key_at_matches(address, key) {
                    Ok(true) => {
                        matched = true;
                        break;
                    }
                    Ok(false) => any_readable = true,
                    Err(_) => {}
                }
            }
            if matched {
                return Ok(Some(candidate));
            }
            if !any_readable {
                unconfirmed = Some(candidate);
            }
        }
        Ok(unconfirmed)
    }

    /// Compares the flash contents at `address` against `expected`,
    /// reading in aligned chunks. Any read failure counts as a mismatch.
    pub(crate) fn entry_bytes_match(
        partition: &mut FlashPartition<F>,
        alignment: usize,
        address: Address,
        expected: &[u8],
    ) -> bool {
        let chunk_cap = (KEY_SCRATCH_SIZE / alignment) * alignment;
        let mut chunk = [0u8; KEY_SCRATCH_SIZE];
        let mut offset = 0;
        while offset < expected.len() {
            let n = chunk_cap.min(expected.len() - offset);
            if partition
                .read(address + offset as Address, &mut chunk[..n])
                .is_err()
            {
                return false;
            }
            if chunk[..n] != expected[offset..offset + n] {
                return false;
            }
            offset += n;
        }
        true
    }
}

impl<
        F: FlashMemory,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const REDUNDANCY: usize,
        const FORMAT_COUNT: usize,
    > std::fmt::Debug for KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("initialized", &self.initialized())
            .field("error_detected", &self.error_detected)
            .field("read_only", &self.read_only)
            .field("keys", &self.keys.len())
            .field("live_keys", &self.keys.valid_count())
            .field("sectors", &self.sectors.len())
            .field("alignment", &self.alignment)
            .field("last_transaction_id", &self.last_transaction_id)
            .field("redundancy", &REDUNDANCY)
            .finish()
    }
}

#[cfg(test)]
mod tests;
