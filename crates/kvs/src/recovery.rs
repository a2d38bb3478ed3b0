//! Cold-start path: scan every sector, rebuild both descriptor tables,
//! and reconcile whatever a power loss or bit rot left behind.
//!
//! Each sector is walked from its base at alignment steps. Erased bytes
//! are gaps (a failed write leaves one); a known magic is parsed and
//! checksum-verified in full; anything else flags the sector corrupt and
//! the walk resynchronizes at the next alignment boundary, so valid
//! entries behind a damaged one are still recovered.
//!
//! What happens to a corrupt sector depends on the recovery option:
//! `Manual` reports `DataLoss` and leaves it unwritable; `Lazy` garbage
//! collects it during init and rewrites missing redundant copies.

use log::{debug, warn};

use crate::keys::{key_hash, KeyDescriptor, KeyState};
use crate::{
    Error, ErrorRecovery, FlashMemory, InitState, KeyValueStore, Result, MAX_ALIGNMENT,
};
use format::{round_up, EntryHeader, HEADER_SIZE};

impl<
        F: FlashMemory,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const REDUNDANCY: usize,
        const FORMAT_COUNT: usize,
    > KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>
{
    /// Initializes the store by scanning the partition.
    ///
    /// Re-initializing is allowed and rebuilds the tables from flash;
    /// recovery counters accumulate across calls.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] — the partition geometry cannot be
    ///   managed by this store instance.
    /// - [`Error::DataLoss`] — corruption was found under `Manual`
    ///   recovery, or a flash read error interrupted the scan. With
    ///   corruption the store still serves reads of the surviving data;
    ///   after a scan failure it stays uninitialized.
    /// - [`Error::ResourceExhausted`] — flash holds more keys than
    ///   `MAX_ENTRIES`.
    pub fn init(&mut self) -> Result<()> {
        self.validate_geometry()?;

        self.init_state = InitState::NotInitialized;
        self.error_detected = false;
        self.read_only = false;
        self.last_transaction_id = 0;
        self.keys.reset();
        let sector_count = self.partition.sector_count();
        let sector_size = self.partition.sector_size_bytes() as u32;
        self.sectors.reset(sector_count, sector_size);

        let mut corruption = false;
        for sector in 0..sector_count {
            corruption |= self.scan_sector(sector)?;
        }

        let missing_redundancy = self
            .keys
            .iter()
            .any(|(_, d)| d.address_count() < REDUNDANCY);

        debug!(
            "init scan: {} keys, {} sectors, last transaction id {}",
            self.keys.len(),
            sector_count,
            self.last_transaction_id
        );

        if corruption || missing_redundancy {
            self.error_detected = true;
            self.init_state = InitState::NeedsCleanup;
            match self.options.recovery {
                ErrorRecovery::Manual => {
                    warn!("init found corruption; manual recovery requested");
                    return Err(Error::DataLoss);
                }
                ErrorRecovery::Lazy => {
                    self.fix_errors()?;
                    self.error_detected = false;
                }
            }
        }

        self.init_state = InitState::Ready;
        self.ensure_empty_sector();
        Ok(())
    }

    fn validate_geometry(&self) -> Result<()> {
        let sector_size = self.partition.sector_size_bytes();
        let sector_count = self.partition.sector_count();
        if sector_count < 2 || sector_count > MAX_SECTORS {
            return Err(Error::InvalidArgument);
        }
        if sector_size > usize::from(u16::MAX) || sector_size % self.alignment != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.alignment > MAX_ALIGNMENT {
            return Err(Error::InvalidArgument);
        }
        // One sector stays in reserve, so all copies must fit elsewhere.
        if REDUNDANCY >= sector_count {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Scans one sector, registering every parseable entry. Returns
    /// whether the sector was found corrupt.
    fn scan_sector(&mut self, sector: usize) -> Result<bool> {
        let sector_size = self.partition.sector_size_bytes();
        let base = self.sectors.base_address(sector);
        let alignment = self.alignment;
        let probe_len = round_up(HEADER_SIZE, alignment);

        let mut position = 0;
        let mut corrupt = false;
        let mut last_entry_end = 0;

        while position + probe_len <= sector_size {
            let address = base + position as u32;

            let probe = {
                let read = self
                    .partition
                    .read(address, &mut self.scratch[..probe_len]);
                match read {
                    Ok(_) => &self.scratch[..probe_len],
                    Err(error) => {
                        if self.options.recovery == ErrorRecovery::Manual {
                            warn!("read error while scanning sector {sector}: {error}");
                            return Err(Error::DataLoss);
                        }
                        corrupt = true;
                        position += alignment;
                        continue;
                    }
                }
            };

            if self.partition.appears_erased(probe) {
                // A gap: either the unwritten tail or a reserved range
                // whose write never happened.
                position += alignment;
                continue;
            }

            let header = EntryHeader::decode(probe)?;
            if self.format_index(header.magic).is_none() {
                corrupt = true;
                position += alignment;
                continue;
            }

            match self.load_entry(address, true) {
                Ok((header, size)) => {
                    let sector_corrupt = self.register_entry(sector, address, &header, size)?;
                    corrupt |= sector_corrupt;
                    position += size;
                    last_entry_end = position;
                }
                Err(Error::ResourceExhausted) => return Err(Error::ResourceExhausted),
                Err(error) => {
                    if matches!(
                        error,
                        Error::Unavailable | Error::Internal | Error::Unauthenticated
                    ) && self.options.recovery == ErrorRecovery::Manual
                    {
                        warn!("read error while scanning sector {sector}: {error}");
                        return Err(Error::DataLoss);
                    }
                    corrupt = true;
                    position += alignment;
                }
            }
        }

        if corrupt {
            warn!("sector {sector} is corrupt");
            self.sectors.mark_corrupt(sector);
        } else {
            // Account gaps before the last entry as written-and-dead so
            // the write head lands after everything the sector holds.
            let accounted = self.sectors.write_offset(sector) as usize;
            if last_entry_end > accounted {
                let gap = last_entry_end - accounted;
                self.sectors.mark_written(sector, gap);
                self.sectors.mark_reclaimable(sector, gap);
            }
        }
        Ok(corrupt)
    }

    /// Feeds one parsed entry (bytes in the scratch buffer) into the key
    /// table. Returns whether this entry revealed corruption in its
    /// sector.
    fn register_entry(
        &mut self,
        sector: usize,
        address: u32,
        header: &EntryHeader,
        size: usize,
    ) -> Result<bool> {
        self.sectors.mark_written(sector, size);
        self.last_transaction_id = self.last_transaction_id.max(header.transaction_id);

        let key_length = usize::from(header.key_length);
        let mut key_buf = [0u8; format::MAX_KEY_LENGTH];
        key_buf[..key_length].copy_from_slice(&self.scratch[HEADER_SIZE..HEADER_SIZE + key_length]);
        let key = &key_buf[..key_length];

        let state = if header.is_tombstone() {
            KeyState::Deleted
        } else {
            KeyState::Valid
        };

        let slot = match self.find_slot(key)? {
            Some(slot) => slot,
            None => {
                let descriptor = KeyDescriptor::new(
                    key_hash(key),
                    header.transaction_id,
                    state,
                    header.key_length,
                    header.value_length,
                    address,
                );
                if self.keys.insert(descriptor).is_none() {
                    warn!("key descriptor table full during init scan");
                    return Err(Error::ResourceExhausted);
                }
                return Ok(false);
            }
        };

        let descriptor = match self.keys.get(slot) {
            Some(d) => *d,
            None => return Ok(false),
        };

        if header.transaction_id > descriptor.transaction_id {
            // This entry supersedes everything seen so far for the key.
            let old_size = descriptor.encoded_size(self.alignment);
            for &old in descriptor.addresses() {
                let old_sector = self.sectors.sector_of(old);
                self.sectors.mark_reclaimable(old_sector, old_size);
            }
            if let Some(d) = self.keys.get_mut(slot) {
                d.reset_to(header.transaction_id, state, header.value_length, address);
            }
            return Ok(false);
        }

        if header.transaction_id < descriptor.transaction_id {
            // A stale version; reclaimable immediately.
            self.sectors.mark_reclaimable(sector, size);
            return Ok(false);
        }

        // Same transaction id: a legitimate redundant copy must be
        // byte-identical to the copy already registered.
        let first = descriptor.addresses()[0];
        let identical = descriptor.value_length == header.value_length
            && Self::entry_bytes_match(
                &mut self.partition,
                self.alignment,
                first,
                &self.scratch[..size],
            );

        if !identical {
            warn!(
                "conflicting copies of transaction {} in sector {sector}",
                header.transaction_id
            );
            self.sectors.mark_reclaimable(sector, size);
            return Ok(true);
        }

        let added = match self.keys.get_mut(slot) {
            Some(d) => d.add_address(address),
            None => false,
        };

        if added {
            Ok(false)
        } else {
            // More copies than the configured redundancy.
            warn!(
                "excess copy of transaction {} in sector {sector}",
                header.transaction_id
            );
            self.sectors.mark_reclaimable(sector, size);
            Ok(true)
        }
    }

    /// Lazy-recovery repair: collect every corrupt sector, then restore
    /// missing redundant copies.
    ///
    /// Sectors with the least live data go first: when every sector is
    /// damaged, erasing the pure-garbage ones frees the room the live
    /// entries of the others relocate into.
    fn fix_errors(&mut self) -> Result<()> {
        loop {
            let victim = (0..self.sectors.len())
                .filter(|&s| self.sectors.is_corrupt(s))
                .min_by_key(|&s| (self.sectors.in_use_bytes(s), s));
            match victim {
                Some(sector) => self.gc_sector(sector)?,
                None => break,
            }
        }
        self.restore_redundancy(false)?;
        Ok(())
    }
}
