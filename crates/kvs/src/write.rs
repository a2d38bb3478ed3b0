//! Write path: `put()`, `delete()`, and the shared entry-write machinery.
//!
//! A write encodes the entry once, reserves room for all `REDUNDANCY`
//! copies in distinct sectors (`mark_written` *before* any flash write),
//! programs the copies, optionally verifies them by read-back, and only
//! then updates the key descriptor. On any failure every reserved byte
//! is declared reclaimable and the key is left untouched: a failed write
//! shrinks writable space, never corrupts the key state, and its range
//! can never be handed out again.

use log::warn;

use crate::keys::{key_hash, KeyDescriptor, KeyState};
use crate::read::check_key;
use crate::{Error, FlashMemory, GarbageCollectOnWrite, KeyValueStore, Result};
use format::{encode_entry, TOMBSTONE_VALUE_LENGTH};

impl<
        F: FlashMemory,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const REDUNDANCY: usize,
        const FORMAT_COUNT: usize,
    > KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>
{
    /// Stores `value` under `key`, superseding any previous version.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] — empty/oversized key or value.
    /// - [`Error::ResourceExhausted`] — the key table is full.
    /// - [`Error::FailedPrecondition`] — no writable sector remains (and
    ///   GC-on-write is disabled or could not help), the store is
    ///   read-only, or it is not initialized.
    /// - Flash errors and [`Error::DataLoss`] (failed read-back verify)
    ///   roll the write back as described above.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_initialized()?;
        check_key(key)?;
        if value.len() > self.max_value_size() {
            return Err(Error::InvalidArgument);
        }
        let existing = self.find_slot(key)?;
        self.write_entry(key, Some(value), existing)
    }

    /// Deletes `key` by writing a tombstone through the normal write
    /// path. The key reads as absent afterwards; its bytes are recovered
    /// by maintenance.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the key is absent or already deleted;
    /// otherwise the same errors as [`put`](Self::put).
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_initialized()?;
        check_key(key)?;
        let slot = self.find_slot(key)?.ok_or(Error::NotFound)?;
        let descriptor = self.keys.get(slot).ok_or(Error::NotFound)?;
        if descriptor.state == KeyState::Deleted {
            return Err(Error::NotFound);
        }
        self.write_entry(key, None, Some(slot))
    }

    /// Encodes and writes one logical entry (`value: None` = tombstone),
    /// then updates the descriptor table.
    fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>, existing: Option<usize>) -> Result<()> {
        if self.read_only {
            return Err(Error::FailedPrecondition);
        }
        if existing.is_none() && self.keys.len() == self.keys.capacity() {
            return Err(Error::ResourceExhausted);
        }

        let transaction_id = self
            .last_transaction_id
            .checked_add(1)
            .ok_or(Error::ResourceExhausted)?;

        let alignment = self.alignment;
        let erased_byte = self.partition.erased_byte();
        let size = {
            let Self {
                formats, scratch, ..
            } = self;
            encode_entry(
                &mut formats[0],
                alignment,
                erased_byte,
                transaction_id,
                key,
                value,
                scratch,
            )?
        };
        // An entry never spans sectors, so key + value must fit in one.
        if size > self.partition.sector_size_bytes() {
            return Err(Error::InvalidArgument);
        }

        // Reserve room for every copy before touching flash; retry once
        // behind a single GC pass if configured.
        let mut retried = false;
        let addresses = loop {
            match self.reserve_copies(size) {
                Ok(addresses) => break addresses,
                Err(Error::FailedPrecondition)
                    if !retried && self.options.gc_on_write == GarbageCollectOnWrite::OneSector =>
                {
                    retried = true;
                    self.gc_one_sector().map_err(|error| match error {
                        Error::NotFound => Error::FailedPrecondition,
                        other => other,
                    })?;
                }
                Err(error) => return Err(error),
            }
        };

        let mut failure = None;
        for &address in &addresses {
            let Self {
                partition, scratch, ..
            } = self;
            if let Err(error) = partition.write(address, &scratch[..size]) {
                failure = Some(Error::from(error));
                break;
            }
        }

        if failure.is_none() && self.options.verify_on_write {
            for &address in &addresses {
                if !Self::entry_bytes_match(
                    &mut self.partition,
                    alignment,
                    address,
                    &self.scratch[..size],
                ) {
                    failure = Some(Error::DataLoss);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            // The reserved ranges hold garbage now; they stay accounted
            // as written so nothing ever overlaps them, and become
            // reclaimable so GC can recover the space.
            for &address in &addresses {
                let sector = self.sectors.sector_of(address);
                self.sectors.mark_reclaimable(sector, size);
            }
            self.note_error();
            warn!("write of {} byte entry failed: {error}", size);
            return Err(error);
        }

        let value_length = match value {
            Some(v) => v.len() as u16,
            None => TOMBSTONE_VALUE_LENGTH,
        };
        let state = if value.is_some() {
            KeyState::Valid
        } else {
            KeyState::Deleted
        };

        match existing {
            Some(slot) => {
                if let Some(descriptor) = self.keys.get(slot).copied() {
                    let old_size = descriptor.encoded_size(self.alignment);
                    for &old in descriptor.addresses() {
                        let old_sector = self.sectors.sector_of(old);
                        self.sectors.mark_reclaimable(old_sector, old_size);
                    }
                }
                if let Some(descriptor) = self.keys.get_mut(slot) {
                    descriptor.reset_to(transaction_id, state, value_length, addresses[0]);
                    for &address in &addresses[1..] {
                        descriptor.add_address(address);
                    }
                }
            }
            None => {
                let mut descriptor = KeyDescriptor::new(
                    key_hash(key),
                    transaction_id,
                    state,
                    key.len() as u8,
                    value_length,
                    addresses[0],
                );
                for &address in &addresses[1..] {
                    descriptor.add_address(address);
                }
                if self.keys.insert(descriptor).is_none() {
                    // Checked above; a full table here means the bytes
                    // were written for nothing, so reclaim them.
                    for &address in &addresses {
                        let sector = self.sectors.sector_of(address);
                        self.sectors.mark_reclaimable(sector, size);
                    }
                    return Err(Error::ResourceExhausted);
                }
            }
        }

        self.last_transaction_id = transaction_id;
        Ok(())
    }

    /// Picks `REDUNDANCY` distinct sectors with room for `size` bytes
    /// and reserves the ranges. On failure, reservations already made
    /// are rolled back as reclaimable and `FailedPrecondition` is
    /// returned so the caller can garbage collect and retry.
    fn reserve_copies(&mut self, size: usize) -> Result<[u32; REDUNDANCY]> {
        let mut addresses = [0u32; REDUNDANCY];
        let mut chosen = [0usize; REDUNDANCY];
        for copy in 0..REDUNDANCY {
            match self.sectors.pick_writable(size, &chosen[..copy], false) {
                Some(sector) => {
                    chosen[copy] = sector;
                    addresses[copy] =
                        self.sectors.base_address(sector) + self.sectors.write_offset(sector);
                    self.sectors.mark_written(sector, size);
                }
                None => {
                    for &sector in &chosen[..copy] {
                        self.sectors.mark_reclaimable(sector, size);
                    }
                    return Err(Error::FailedPrecondition);
                }
            }
        }
        Ok(addresses)
    }
}
