//! Garbage collection and full maintenance.
//!
//! Collecting a sector walks its entries with the codec, relocates the
//! ones still referenced by a key descriptor, erases the sector, and
//! resets its descriptor. Relocation rewrites entries in the first
//! configured format, which is how older formats migrate out of the
//! store over time. Any relocation failure leaves the victim intact and
//! reports `Aborted`; the partially written replacement is rolled back
//! to reclaimable bytes.
//!
//! Full maintenance additionally re-verifies every tracked copy, rewrites
//! missing redundant copies, collects until no reclaimable bytes remain,
//! and purges tombstones once nothing older survives that they could be
//! shadowing.

use log::{debug, warn};

use crate::keys::KeyState;
use crate::{Error, FlashMemory, KeyValueStore, Result};
use format::{restamp_entry, round_up, EntryHeader, HEADER_SIZE};

impl<
        F: FlashMemory,
        const MAX_ENTRIES: usize,
        const MAX_SECTORS: usize,
        const REDUNDANCY: usize,
        const FORMAT_COUNT: usize,
    > KeyValueStore<'_, F, MAX_ENTRIES, MAX_SECTORS, REDUNDANCY, FORMAT_COUNT>
{
    /// Collects the sector with the most reclaimable space.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no sector has reclaimable bytes;
    /// [`Error::Aborted`] when a live entry could not be relocated (the
    /// victim is left intact).
    pub fn gc_one_sector(&mut self) -> Result<()> {
        self.check_initialized()?;
        let victim = self.sectors.pick_gc_victim().ok_or(Error::NotFound)?;
        self.gc_sector(victim)
    }

    /// Repairs redundancy, collects every reclaimable sector, purges
    /// tombstones, and restores the reserved-empty-sector invariant.
    pub fn full_maintenance(&mut self) -> Result<()> {
        self.check_initialized()?;

        self.restore_redundancy(true)?;

        while let Some(victim) = self.sectors.pick_gc_victim() {
            self.gc_sector(victim)?;
        }

        // Every surviving on-flash entry now belongs to a current key, so
        // a deleted key's tombstones are its only records and can go
        // without resurrecting older versions on the next init.
        let mut purged = false;
        for slot in 0..self.keys.capacity() {
            let descriptor = match self.keys.get(slot) {
                Some(d) if d.state == KeyState::Deleted => *d,
                _ => continue,
            };
            let size = descriptor.encoded_size(self.alignment);
            for &address in descriptor.addresses() {
                let sector = self.sectors.sector_of(address);
                self.sectors.mark_reclaimable(sector, size);
            }
            self.keys.remove(slot);
            purged = true;
        }
        if purged {
            while let Some(victim) = self.sectors.pick_gc_victim() {
                self.gc_sector(victim)?;
            }
        }

        self.ensure_empty_sector();
        Ok(())
    }

    /// Collects one specific sector: relocates its live entries, erases
    /// it, and resets its descriptor.
    pub(crate) fn gc_sector(&mut self, victim: usize) -> Result<()> {
        let sector_size = self.partition.sector_size_bytes();
        let base = self.sectors.base_address(victim);
        let alignment = self.alignment;
        let probe_len = round_up(HEADER_SIZE, alignment);
        let was_corrupt = self.sectors.is_corrupt(victim);
        debug!(
            "collecting sector {victim} ({} reclaimable of {} written bytes)",
            self.sectors.reclaimable_bytes(victim),
            self.sectors.write_offset(victim),
        );

        let mut position = 0;
        while position + probe_len <= sector_size {
            let address = base + position as u32;

            let readable = self
                .partition
                .read(address, &mut self.scratch[..probe_len])
                .is_ok();
            if !readable {
                self.drop_lost_copy(address);
                position += alignment;
                continue;
            }
            if self.partition.appears_erased(&self.scratch[..probe_len]) {
                position += alignment;
                continue;
            }
            let header = EntryHeader::decode(&self.scratch[..probe_len])?;
            if self.format_index(header.magic).is_none() {
                self.drop_lost_copy(address);
                position += alignment;
                continue;
            }

            let (header, size) = match self.load_entry(address, true) {
                Ok(loaded) => loaded,
                Err(_) => {
                    self.drop_lost_copy(address);
                    position += alignment;
                    continue;
                }
            };

            match self.owner_of(address, header.transaction_id) {
                Some(slot) => self.relocate_entry(slot, victim, address, size, header.magic)?,
                // Superseded or unreferenced: dies with the sector.
                None => {}
            }
            position += size;
        }

        self.partition.erase(base, 1)?;
        self.sectors.reset_erased(victim);
        if was_corrupt {
            self.corrupt_sectors_recovered += 1;
        }
        Ok(())
    }

    /// Slot of the descriptor that references the entry at `address`
    /// with the given transaction id, if any.
    fn owner_of(&self, address: u32, transaction_id: u32) -> Option<usize> {
        self.keys.iter().find_map(|(slot, descriptor)| {
            (descriptor.transaction_id == transaction_id && descriptor.has_address(address))
                .then_some(slot)
        })
    }

    /// Moves the entry currently in the scratch buffer out of `victim`,
    /// re-stamping it in the write format, and repoints its descriptor.
    fn relocate_entry(
        &mut self,
        slot: usize,
        victim: usize,
        address: u32,
        size: usize,
        magic: u32,
    ) -> Result<()> {
        if magic != self.formats[0].magic {
            let Self {
                formats, scratch, ..
            } = self;
            restamp_entry(&mut formats[0], &mut scratch[..size]);
        }

        // The replacement must land outside the victim and away from the
        // key's other copies; the reserved empty sector is fair game
        // because the victim is about to become the new reserve.
        let mut exclude = [0usize; REDUNDANCY];
        exclude[0] = victim;
        let mut excluded = 1;
        if let Some(descriptor) = self.keys.get(slot) {
            for &other in descriptor.addresses() {
                if other == address {
                    continue;
                }
                let sector = self.sectors.sector_of(other);
                if !exclude[..excluded].contains(&sector) && excluded < REDUNDANCY {
                    exclude[excluded] = sector;
                    excluded += 1;
                }
            }
        }

        let destination = match self
            .sectors
            .pick_writable(size, &exclude[..excluded], true)
        {
            Some(sector) => sector,
            None => {
                warn!("no destination for a live entry; aborting collection of sector {victim}");
                return Err(Error::Aborted);
            }
        };
        let new_address =
            self.sectors.base_address(destination) + self.sectors.write_offset(destination);
        self.sectors.mark_written(destination, size);

        let write = {
            let Self {
                partition, scratch, ..
            } = self;
            partition.write(new_address, &scratch[..size])
        };
        if let Err(error) = write {
            self.sectors.mark_reclaimable(destination, size);
            self.note_error();
            warn!("relocation write failed: {error}; aborting collection of sector {victim}");
            return Err(Error::Aborted);
        }

        if let Some(descriptor) = self.keys.get_mut(slot) {
            descriptor.replace_address(address, new_address);
        }
        // The old copy is dead where it lies until the victim is erased.
        self.sectors.mark_reclaimable(victim, size);
        Ok(())
    }

    /// Forgets a descriptor copy whose bytes can no longer be read. A
    /// key losing its last copy is removed entirely.
    fn drop_lost_copy(&mut self, address: u32) {
        let slot = self
            .keys
            .iter()
            .find_map(|(slot, d)| d.has_address(address).then_some(slot));
        let Some(slot) = slot else { return };

        self.note_error();
        if let Some(descriptor) = self.keys.get_mut(slot) {
            descriptor.remove_address(address);
            if descriptor.address_count() == 0 {
                warn!("last copy of a key was unreadable; the key is lost");
                self.keys.remove(slot);
            }
        }
    }

    /// Re-verifies every tracked copy (`reverify`), drops the dead ones,
    /// and rewrites missing copies from a survivor until each key is
    /// back at full redundancy. Keys with no surviving copy are dropped.
    pub(crate) fn restore_redundancy(&mut self, reverify: bool) -> Result<()> {
        let alignment = self.alignment;
        for slot in 0..self.keys.capacity() {
            let descriptor = match self.keys.get(slot) {
                Some(d) => *d,
                None => continue,
            };
            let size = descriptor.encoded_size(alignment);

            if reverify {
                for &address in descriptor.addresses() {
                    let intact = matches!(
                        self.load_entry(address, true),
                        Ok((header, _)) if header.transaction_id == descriptor.transaction_id
                    );
                    if !intact {
                        let sector = self.sectors.sector_of(address);
                        self.sectors.mark_reclaimable(sector, size);
                        if let Some(d) = self.keys.get_mut(slot) {
                            d.remove_address(address);
                        }
                        self.note_error();
                    }
                }
                if self
                    .keys
                    .get(slot)
                    .map_or(true, |d| d.address_count() == 0)
                {
                    warn!("no copy of a key survived; dropping it");
                    self.keys.remove(slot);
                    continue;
                }
            }

            while self
                .keys
                .get(slot)
                .is_some_and(|d| d.address_count() < REDUNDANCY)
            {
                let Some(descriptor) = self.keys.get(slot).copied() else {
                    break;
                };
                let survivor = descriptor.addresses()[0];
                if self.load_entry(survivor, true).is_err() {
                    warn!("surviving copy became unreadable during repair");
                    self.note_error();
                    break;
                }

                let mut exclude = [0usize; REDUNDANCY];
                let mut excluded = 0;
                for &existing in descriptor.addresses() {
                    let sector = self.sectors.sector_of(existing);
                    if !exclude[..excluded].contains(&sector) {
                        exclude[excluded] = sector;
                        excluded += 1;
                    }
                }

                let Some(destination) = self.sectors.pick_writable(size, &exclude[..excluded], false)
                else {
                    warn!("no room to restore redundancy for a key");
                    break;
                };
                let new_address = self.sectors.base_address(destination)
                    + self.sectors.write_offset(destination);
                self.sectors.mark_written(destination, size);

                let write = {
                    let Self {
                        partition, scratch, ..
                    } = self;
                    partition.write(new_address, &scratch[..size])
                };
                if let Err(error) = write {
                    self.sectors.mark_reclaimable(destination, size);
                    self.note_error();
                    warn!("redundancy repair write failed: {error}");
                    break;
                }

                if let Some(d) = self.keys.get_mut(slot) {
                    d.add_address(new_address);
                }
                self.missing_redundant_entries_recovered += 1;
            }
        }
        Ok(())
    }

    /// Keeps one fully erased sector available for future collections,
    /// collecting to create one if necessary. If none can be freed the
    /// store degrades to read-only.
    pub(crate) fn ensure_empty_sector(&mut self) {
        while self.sectors.first_empty_sector().is_none() {
            let Some(victim) = self.sectors.pick_gc_victim() else {
                break;
            };
            if self.gc_sector(victim).is_err() {
                break;
            }
        }
        self.read_only = self.sectors.first_empty_sector().is_none();
        if self.read_only {
            warn!("no empty sector could be reserved; the store is read-only");
        }
    }
}
