//! Garbage collection and full maintenance: victim selection, live-entry
//! relocation, tombstone purging, and the reserved-empty-sector
//! invariant.

use super::helpers::*;
use crate::{Error, EntryFormat};
use flash::{FlashError, FlashErrorInjection, FlashPartition};

// -------------------- Single-sector collection --------------------

#[test]
fn gc_with_nothing_reclaimable_returns_not_found() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_no_gc(),
    );
    kvs.init().unwrap();
    assert_eq!(kvs.gc_one_sector(), Err(Error::NotFound));

    kvs.put(b"key", b"value").unwrap();
    assert_eq!(kvs.gc_one_sector(), Err(Error::NotFound));
}

#[test]
fn gc_relocates_live_entries_and_erases_the_victim() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    kvs.put(b"key", b"first").unwrap();
    kvs.put(b"key", b"second").unwrap();
    assert_eq!(kvs.storage_stats().reclaimable_bytes, 32);

    kvs.gc_one_sector().unwrap();

    let stats = kvs.storage_stats();
    assert_eq!(stats.in_use_bytes, 32);
    assert_eq!(stats.reclaimable_bytes, 0);
    assert_contains(&mut kvs, b"key", b"second");

    // The victim is fully erased again.
    assert!(
        kvs.partition().flash().buffer()[..512].iter().all(|&b| b == 0xFF),
        "victim sector should be erased"
    );
}

#[test]
fn aborted_gc_leaves_the_victim_intact() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    kvs.put(b"key", b"first").unwrap();
    kvs.put(b"key", b"second").unwrap();

    kvs.partition_mut()
        .flash_mut()
        .inject_write_error(FlashErrorInjection::unconditional(FlashError::Internal, 1));

    assert_eq!(kvs.gc_one_sector(), Err(Error::Aborted));
    assert!(kvs.error_detected());

    // The live entry is still served from the untouched victim; only the
    // rolled-back replacement bytes were lost.
    assert_contains(&mut kvs, b"key", b"second");
    let stats = kvs.storage_stats();
    assert_eq!(stats.in_use_bytes, 32);
    assert_eq!(stats.reclaimable_bytes, 64);

    // With the fault gone, maintenance cleans up both the victim and the
    // rolled-back replacement bytes.
    kvs.full_maintenance().unwrap();
    assert_contains(&mut kvs, b"key", b"second");
    assert_eq!(kvs.storage_stats().reclaimable_bytes, 0);
}

// -------------------- Full maintenance --------------------

#[test]
fn full_maintenance_reclaims_every_dead_byte() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    for round in 0..4u8 {
        for key in 0..8u8 {
            kvs.put(&[b'k', key], &[round; 8]).unwrap();
        }
    }
    assert!(kvs.storage_stats().reclaimable_bytes > 0);

    kvs.full_maintenance().unwrap();

    let stats = kvs.storage_stats();
    assert_eq!(stats.reclaimable_bytes, 0);
    assert_eq!(stats.in_use_bytes, 8 * 32);
    for key in 0..8u8 {
        assert_contains(&mut kvs, &[b'k', key], &[3; 8]);
    }

    // The reserve invariant holds: at least one sector fully erased.
    let buffer = kvs.partition().flash().buffer();
    assert!(
        (0..4).any(|s| buffer[s * 512..(s + 1) * 512].iter().all(|&b| b == 0xFF)),
        "one sector must remain erased"
    );
}

#[test]
fn full_maintenance_purges_tombstones() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    kvs.put(b"a", b"gone soon").unwrap();
    kvs.put(b"b", b"stays").unwrap();
    kvs.delete(b"a").unwrap();

    kvs.full_maintenance().unwrap();

    let stats = kvs.storage_stats();
    assert_eq!(stats.in_use_bytes, 32);
    assert_eq!(stats.reclaimable_bytes, 0);
    assert_eq!(kvs.len(), 1);

    // After re-reading flash from scratch the tombstone is really gone,
    // and the old value did not resurrect.
    kvs.init().unwrap();
    assert_eq!(kvs.len(), 1);
    assert!(matches!(get_value(&mut kvs, b"a"), Err(Error::NotFound)));
    assert_contains(&mut kvs, b"b", b"stays");
}

// -------------------- GC on write --------------------

#[test]
fn gc_on_write_rotates_through_full_sectors() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_one_sector(),
    );
    kvs.init().unwrap();

    // 100 rewrites of one key need far more than the raw capacity, so
    // writes must rotate through collected sectors.
    for i in 0..100u32 {
        kvs.put(b"spinner", &i.to_le_bytes()).unwrap();
    }

    assert_contains(&mut kvs, b"spinner", &99u32.to_le_bytes());
    assert_eq!(kvs.len(), 1);
    assert_eq!(kvs.storage_stats().in_use_bytes, 32);
}

#[test]
fn gc_on_write_disabled_fails_once_full() {
    let mut cs = ChecksumFn::new(sum_checksum);
    let mut kvs = TestKvs::new(
        FlashPartition::new(erased_flash()),
        [EntryFormat::new(MAGIC, Some(&mut cs))],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    // 16 entries of 32 bytes per sector; three writable sectors fill
    // after 48 distinct keys (the fourth is the reserve).
    for i in 0..48u8 {
        kvs.put(&[b'k', i], &[i]).unwrap();
    }
    assert_eq!(kvs.put(b"straw", b"camel"), Err(Error::FailedPrecondition));

    for i in 0..48u8 {
        assert_contains(&mut kvs, &[b'k', i], &[i]);
    }
}
