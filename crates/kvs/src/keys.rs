//! Key descriptor table.
//!
//! A bounded, open-addressed map from key hash to the current state of a
//! logical key: its latest transaction id, value length, presence flag,
//! and the flash address of every redundant copy. Key bytes are never
//! held in RAM; a hash hit is only a candidate, and the store confirms
//! it by reading the key bytes from flash.
//!
//! Collision handling is linear probing. Distinct keys that happen to
//! share a hash occupy separate slots; removed descriptors leave an
//! erased marker so probe chains stay intact.

use flash::Address;
use format::TOMBSTONE_VALUE_LENGTH;

/// FNV-1a, 32-bit. Deterministic across runs, which the on-flash scan
/// relies on.
pub(crate) fn key_hash(key: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in key {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Presence flag of a logical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyState {
    Valid,
    Deleted,
}

/// The tracked state of one logical key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyDescriptor<const R: usize> {
    pub hash: u32,
    pub transaction_id: u32,
    pub state: KeyState,
    /// Length of the key bytes; with `value_length` this sizes the
    /// on-flash entry without re-reading it.
    pub key_length: u8,
    /// Raw on-flash value length; [`TOMBSTONE_VALUE_LENGTH`] for deleted
    /// keys.
    pub value_length: u16,
    addresses: [Address; R],
    address_count: u8,
}

impl<const R: usize> KeyDescriptor<R> {
    pub fn new(
        hash: u32,
        transaction_id: u32,
        state: KeyState,
        key_length: u8,
        value_length: u16,
        address: Address,
    ) -> Self {
        let mut addresses = [0; R];
        addresses[0] = address;
        Self {
            hash,
            transaction_id,
            state,
            key_length,
            value_length,
            addresses,
            address_count: 1,
        }
    }

    /// Addresses of the copies currently known for this key.
    pub fn addresses(&self) -> &[Address] {
        &self.addresses[..usize::from(self.address_count)]
    }

    pub fn address_count(&self) -> usize {
        usize::from(self.address_count)
    }

    pub fn has_address(&self, address: Address) -> bool {
        self.addresses().contains(&address)
    }

    /// Records another copy. Returns `false` when all `R` address slots
    /// are taken.
    pub fn add_address(&mut self, address: Address) -> bool {
        if usize::from(self.address_count) == R {
            return false;
        }
        self.addresses[usize::from(self.address_count)] = address;
        self.address_count += 1;
        true
    }

    /// Replaces the copy at `old` with one at `new`. Returns `false` if
    /// `old` is not tracked.
    pub fn replace_address(&mut self, old: Address, new: Address) -> bool {
        for slot in &mut self.addresses[..usize::from(self.address_count)] {
            if *slot == old {
                *slot = new;
                return true;
            }
        }
        false
    }

    /// Forgets the copy at `address`. Returns `false` if it is not
    /// tracked.
    pub fn remove_address(&mut self, address: Address) -> bool {
        let count = usize::from(self.address_count);
        for i in 0..count {
            if self.addresses[i] == address {
                self.addresses.copy_within(i + 1..count, i);
                self.address_count -= 1;
                return true;
            }
        }
        false
    }

    /// Supersedes this descriptor with a newer version of the key.
    pub fn reset_to(
        &mut self,
        transaction_id: u32,
        state: KeyState,
        value_length: u16,
        address: Address,
    ) {
        self.transaction_id = transaction_id;
        self.state = state;
        self.value_length = value_length;
        self.addresses[0] = address;
        self.address_count = 1;
    }

    /// Value size in bytes for sizing the on-flash entry; `None` for a
    /// tombstone.
    pub fn value_size(&self) -> Option<usize> {
        if self.value_length == TOMBSTONE_VALUE_LENGTH {
            None
        } else {
            Some(usize::from(self.value_length))
        }
    }

    /// On-flash size of each copy of this key's current entry.
    pub fn encoded_size(&self, alignment: usize) -> usize {
        format::entry_size(alignment, usize::from(self.key_length), self.value_size())
    }
}

#[derive(Clone, Copy)]
enum Slot<const R: usize> {
    /// Never used; terminates probe chains.
    Vacant,
    /// Previously held a descriptor; probes continue past it.
    Erased,
    Occupied(KeyDescriptor<R>),
}

impl<const R: usize> Slot<R> {
    const VACANT: Self = Self::Vacant;
}

/// One step of a probe sequence.
pub(crate) enum ProbeResult {
    /// A never-used slot: the key is not in the table.
    Miss,
    /// Occupied by a different hash, or an erased marker; keep probing.
    Skip,
    /// Occupied with a matching hash; the caller confirms the key bytes.
    Candidate(usize),
}

/// Fixed-capacity open-addressed descriptor table.
pub(crate) struct KeyTable<const MAX_ENTRIES: usize, const R: usize> {
    slots: [Slot<R>; MAX_ENTRIES],
    occupied: usize,
}

impl<const MAX_ENTRIES: usize, const R: usize> KeyTable<MAX_ENTRIES, R> {
    pub fn new() -> Self {
        Self {
            slots: [Slot::VACANT; MAX_ENTRIES],
            occupied: 0,
        }
    }

    pub fn reset(&mut self) {
        self.slots = [Slot::VACANT; MAX_ENTRIES];
        self.occupied = 0;
    }

    pub fn capacity(&self) -> usize {
        MAX_ENTRIES
    }

    /// Number of descriptors, deleted keys included.
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Number of live (non-deleted) keys.
    pub fn valid_count(&self) -> usize {
        self.iter()
            .filter(|(_, d)| d.state == KeyState::Valid)
            .count()
    }

    /// Inspects the slot `step` probes away from `hash`'s home slot.
    pub fn probe(&self, hash: u32, step: usize) -> ProbeResult {
        let index = (hash as usize % MAX_ENTRIES + step) % MAX_ENTRIES;
        match &self.slots[index] {
            Slot::Vacant => ProbeResult::Miss,
            Slot::Erased => ProbeResult::Skip,
            Slot::Occupied(descriptor) if descriptor.hash == hash => {
                ProbeResult::Candidate(index)
            }
            Slot::Occupied(_) => ProbeResult::Skip,
        }
    }

    /// Inserts a descriptor, probing from its hash's home slot. Returns
    /// the slot index, or `None` when the table is full.
    pub fn insert(&mut self, descriptor: KeyDescriptor<R>) -> Option<usize> {
        let home = descriptor.hash as usize % MAX_ENTRIES;
        for step in 0..MAX_ENTRIES {
            let index = (home + step) % MAX_ENTRIES;
            match self.slots[index] {
                Slot::Vacant | Slot::Erased => {
                    self.slots[index] = Slot::Occupied(descriptor);
                    self.occupied += 1;
                    return Some(index);
                }
                Slot::Occupied(_) => {}
            }
        }
        None
    }

    pub fn get(&self, slot: usize) -> Option<&KeyDescriptor<R>> {
        match &self.slots[slot] {
            Slot::Occupied(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut KeyDescriptor<R>> {
        match &mut self.slots[slot] {
            Slot::Occupied(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    /// Frees a descriptor, leaving an erased marker in its slot.
    pub fn remove(&mut self, slot: usize) {
        if matches!(self.slots[slot], Slot::Occupied(_)) {
            self.slots[slot] = Slot::Erased;
            self.occupied -= 1;
        }
    }

    /// Iterates occupied slots as `(slot_index, descriptor)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &KeyDescriptor<R>)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied(descriptor) => Some((i, descriptor)),
            _ => None,
        })
    }
}
