//! Multi-format stores: reading a mixture of formats, writing always in
//! the first format (byte-compared against reference serializations),
//! and format migration through relocation.

use super::helpers::*;
use crate::EntryFormat;
use flash::{FakeFlashMemory, FlashPartition};

/// Sector 0 preload for the three-format fixture: a checksum-less entry,
/// two additive-checksum entries, an alternate-checksum entry, and one
/// more additive entry (160 bytes total, highest transaction id 64).
fn multi_format_flash() -> FakeFlashMemory {
    let no_checksum = make_entry_for(NO_CHECKSUM_MAGIC, |_, _| 0, 64, "kee", b"O_o");
    let entry1 = make_entry(1, "key1", b"value1");
    let alt = make_entry_for(ALT_MAGIC, alt_checksum, 32, "A Key", b"XD");
    let entry2 = make_entry(3, "k2", b"value2");
    let entry3 = make_entry(4, "k3y", b"value3");
    preloaded(&[&no_checksum, &entry1, &alt, &entry2, &entry3])
}

// -------------------- Reading every accepted format --------------------

#[test]
fn all_formats_are_readable() {
    let mut sum_cs = ChecksumFn::new(sum_checksum);
    let mut alt_cs = ChecksumFn::new(alt_checksum);
    let mut kvs = MultiFormatKvs::new(
        FlashPartition::new(multi_format_flash()),
        [
            EntryFormat::new(MAGIC, Some(&mut sum_cs)),
            EntryFormat::new(ALT_MAGIC, Some(&mut alt_cs)),
            EntryFormat::new(NO_CHECKSUM_MAGIC, None),
        ],
        lazy_no_gc(),
    );

    kvs.init().unwrap();
    assert_contains(&mut kvs, b"key1", b"value1");
    assert_contains(&mut kvs, b"k2", b"value2");
    assert_contains(&mut kvs, b"k3y", b"value3");
    assert_contains(&mut kvs, b"A Key", b"XD");
    assert_contains(&mut kvs, b"kee", b"O_o");

    let stats = kvs.storage_stats();
    assert_eq!(stats.missing_redundant_entries_recovered, 5);
    assert_eq!(stats.in_use_bytes, 160 * 2);
}

// -------------------- Writes use the first format --------------------

#[test]
fn put_new_entry_uses_the_first_format() {
    let mut sum_cs = ChecksumFn::new(sum_checksum);
    let mut alt_cs = ChecksumFn::new(alt_checksum);
    let mut kvs = MultiFormatKvs::new(
        FlashPartition::new(multi_format_flash()),
        [
            EntryFormat::new(MAGIC, Some(&mut sum_cs)),
            EntryFormat::new(ALT_MAGIC, Some(&mut alt_cs)),
            EntryFormat::new(NO_CHECKSUM_MAGIC, None),
        ],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    kvs.put(b"new key", b"abcd?").unwrap();

    // The highest preloaded id is 64, so the new entry is stamped 65 and
    // appended right after the preloaded contents of sector 0.
    let expected = make_entry(65, "new key", b"abcd?");
    let buffer = kvs.partition().flash().buffer();
    assert_eq!(&buffer[160..160 + expected.len()], expected.as_slice());

    assert_contains(&mut kvs, b"new key", b"abcd?");
}

#[test]
fn put_existing_entry_rewrites_in_the_first_format() {
    let mut sum_cs = ChecksumFn::new(sum_checksum);
    let mut alt_cs = ChecksumFn::new(alt_checksum);
    let mut kvs = MultiFormatKvs::new(
        FlashPartition::new(multi_format_flash()),
        [
            EntryFormat::new(MAGIC, Some(&mut sum_cs)),
            EntryFormat::new(ALT_MAGIC, Some(&mut alt_cs)),
            EntryFormat::new(NO_CHECKSUM_MAGIC, None),
        ],
        lazy_no_gc(),
    );
    kvs.init().unwrap();

    // "A Key" currently lives in the alternate format; its rewrite must
    // come out in the primary one.
    kvs.put(b"A Key", b"New value!").unwrap();

    let expected = make_entry(65, "A Key", b"New value!");
    let buffer = kvs.partition().flash().buffer();
    assert_eq!(&buffer[160..160 + expected.len()], expected.as_slice());

    assert_contains(&mut kvs, b"A Key", b"New value!");
}

// -------------------- Migration through relocation --------------------

#[test]
fn gc_restamps_relocated_entries_into_the_first_format() {
    let alt = make_entry_for(ALT_MAGIC, alt_checksum, 32, "A Key", b"XD");
    let stale = make_entry(1, "other", b"old");
    let fresh = make_entry(2, "other", b"new");

    let mut sum_cs = ChecksumFn::new(sum_checksum);
    let mut alt_cs = ChecksumFn::new(alt_checksum);
    let mut kvs = MigrationKvs::new(
        FlashPartition::new(preloaded(&[&alt, &stale, &fresh])),
        [
            EntryFormat::new(MAGIC, Some(&mut sum_cs)),
            EntryFormat::new(ALT_MAGIC, Some(&mut alt_cs)),
        ],
        lazy_no_gc(),
    );
    kvs.init().unwrap();
    assert_eq!(kvs.storage_stats().reclaimable_bytes, 32);

    kvs.gc_one_sector().unwrap();

    // Relocation rewrote the alternate-format entry as a primary-format
    // image with the same transaction id, key, and value.
    let expected = make_entry(32, "A Key", b"XD");
    let buffer = kvs.partition().flash().buffer();
    assert_eq!(&buffer[512..512 + 32], expected.as_slice());

    assert_contains(&mut kvs, b"A Key", b"XD");
    assert_contains(&mut kvs, b"other", b"new");

    // A fresh scan parses the migrated entries without the old format.
    kvs.init().unwrap();
    assert_contains(&mut kvs, b"A Key", b"XD");
}
