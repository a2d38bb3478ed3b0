//! Sector descriptor table.
//!
//! One fixed descriptor per partition sector tracks how many bytes have
//! been written (`tx_bytes`) and how many of those belong to superseded
//! or corrupt records (`reclaimable_bytes`). From these two counters:
//!
//! - in-use bytes   = `tx_bytes - reclaimable_bytes`
//! - writable bytes = `sector_size - tx_bytes`
//! - empty          = `tx_bytes == 0`
//!
//! The write head of a sector is `tx_bytes`: bytes are reserved by
//! `mark_written` *before* they are programmed, so a failed write never
//! leaves its range looking free. A corrupt sector is accounted as fully
//! written with everything but its live entries reclaimable, which both
//! removes it from allocation and makes it an attractive GC victim.

use flash::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SectorDescriptor {
    tx_bytes: u16,
    reclaimable_bytes: u16,
    corrupt: bool,
}

impl SectorDescriptor {
    const ERASED: Self = Self {
        tx_bytes: 0,
        reclaimable_bytes: 0,
        corrupt: false,
    };
}

/// Fixed-capacity table of sector descriptors.
///
/// `MAX_SECTORS` bounds the partition size this store instance can
/// manage; the number of sectors actually in service is set at init.
pub(crate) struct SectorTable<const MAX_SECTORS: usize> {
    sectors: [SectorDescriptor; MAX_SECTORS],
    in_service: usize,
    sector_size: u32,
}

impl<const MAX_SECTORS: usize> SectorTable<MAX_SECTORS> {
    pub fn new() -> Self {
        Self {
            sectors: [SectorDescriptor::ERASED; MAX_SECTORS],
            in_service: 0,
            sector_size: 0,
        }
    }

    /// Clears all descriptors and adopts the partition geometry.
    pub fn reset(&mut self, sector_count: usize, sector_size: u32) {
        debug_assert!(sector_count <= MAX_SECTORS);
        self.sectors = [SectorDescriptor::ERASED; MAX_SECTORS];
        self.in_service = sector_count;
        self.sector_size = sector_size;
    }

    pub fn len(&self) -> usize {
        self.in_service
    }

    /// Sector index containing `address`.
    pub fn sector_of(&self, address: Address) -> usize {
        (address / self.sector_size) as usize
    }

    /// First address of `sector`.
    pub fn base_address(&self, sector: usize) -> Address {
        sector as Address * self.sector_size
    }

    /// Next append position within `sector`, relative to its base.
    pub fn write_offset(&self, sector: usize) -> u32 {
        u32::from(self.sectors[sector].tx_bytes)
    }

    pub fn writable_bytes(&self, sector: usize) -> u32 {
        self.sector_size - u32::from(self.sectors[sector].tx_bytes)
    }

    pub fn in_use_bytes(&self, sector: usize) -> u32 {
        let d = &self.sectors[sector];
        u32::from(d.tx_bytes) - u32::from(d.reclaimable_bytes)
    }

    pub fn reclaimable_bytes(&self, sector: usize) -> u32 {
        u32::from(self.sectors[sector].reclaimable_bytes)
    }

    pub fn is_empty_sector(&self, sector: usize) -> bool {
        self.sectors[sector].tx_bytes == 0
    }

    pub fn is_corrupt(&self, sector: usize) -> bool {
        self.sectors[sector].corrupt
    }

    /// Reserves `bytes` at the sector's write head.
    ///
    /// Callers guarantee the sector has room; the counter saturates at
    /// the sector size rather than wrapping on a bookkeeping bug.
    pub fn mark_written(&mut self, sector: usize, bytes: usize) {
        let d = &mut self.sectors[sector];
        debug_assert!(u32::from(d.tx_bytes) + bytes as u32 <= self.sector_size);
        d.tx_bytes = (u32::from(d.tx_bytes) + bytes as u32).min(self.sector_size) as u16;
    }

    /// Declares `bytes` of previously written data dead.
    ///
    /// Never exceeds `tx_bytes`.
    pub fn mark_reclaimable(&mut self, sector: usize, bytes: usize) {
        let d = &mut self.sectors[sector];
        debug_assert!(
            u32::from(d.reclaimable_bytes) + bytes as u32 <= u32::from(d.tx_bytes)
        );
        d.reclaimable_bytes =
            (u32::from(d.reclaimable_bytes) + bytes as u32).min(u32::from(d.tx_bytes)) as u16;
    }

    /// Flags a sector as corrupt: the whole sector counts as written and
    /// everything except its live entries becomes reclaimable. The
    /// sector stays unwritable until garbage collection erases it.
    pub fn mark_corrupt(&mut self, sector: usize) {
        let live = self.in_use_bytes(sector);
        let d = &mut self.sectors[sector];
        d.tx_bytes = self.sector_size as u16;
        d.reclaimable_bytes = (self.sector_size - live) as u16;
        d.corrupt = true;
    }

    /// Resets a descriptor after the underlying sector has been erased.
    pub fn reset_erased(&mut self, sector: usize) {
        self.sectors[sector] = SectorDescriptor::ERASED;
    }

    pub fn empty_sector_count(&self) -> usize {
        (0..self.in_service)
            .filter(|&s| self.is_empty_sector(s))
            .count()
    }

    pub fn first_empty_sector(&self) -> Option<usize> {
        (0..self.in_service).find(|&s| self.is_empty_sector(s))
    }

    /// Picks a sector with at least `need` writable bytes.
    ///
    /// Sectors already holding data are preferred (lowest index first) so
    /// writes append to partially filled sectors. An empty sector is
    /// handed out only while another empty sector remains, since the last
    /// empty sector is the GC reserve. `allow_reserve` lifts that rule
    /// for garbage collection when it relocates a victim's entries.
    pub fn pick_writable(
        &self,
        need: usize,
        exclude: &[usize],
        allow_reserve: bool,
    ) -> Option<usize> {
        let mut empty_choice = None;
        for sector in 0..self.in_service {
            if exclude.contains(&sector) || self.writable_bytes(sector) < need as u32 {
                continue;
            }
            if !self.is_empty_sector(sector) {
                return Some(sector);
            }
            if empty_choice.is_none() {
                empty_choice = Some(sector);
            }
        }
        match empty_choice {
            Some(sector) if allow_reserve || self.empty_sector_count() > 1 => Some(sector),
            _ => None,
        }
    }

    /// Picks the garbage-collection victim: the non-empty sector with
    /// the highest `reclaimable / tx` ratio (compared without division),
    /// ties broken toward the lowest index. `None` when no sector has
    /// reclaimable bytes.
    pub fn pick_gc_victim(&self) -> Option<usize> {
        let mut best: Option<(usize, u64, u64)> = None;
        for sector in 0..self.in_service {
            let reclaimable = u64::from(self.reclaimable_bytes(sector));
            let tx = u64::from(self.sectors[sector].tx_bytes);
            if reclaimable == 0 {
                continue;
            }
            match best {
                Some((_, best_reclaimable, best_tx))
                    if reclaimable * best_tx <= best_reclaimable * tx => {}
                _ => best = Some((sector, reclaimable, tx)),
            }
        }
        best.map(|(sector, _, _)| sector)
    }
}
