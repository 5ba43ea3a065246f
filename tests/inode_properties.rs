//! Inode store properties: read/write round-trip, length monotonicity,
//! deny-write bounds, and removal reclaiming blocks.

mod support;

use std::sync::Arc;

use fscore::cache::BufferCache;
use fscore::device::Sector;
use fscore::inode::InodeStore;
use proptest::prelude::*;

use support::{init_logging, MemDevice, MemFreeMap};

const DEVICE_SECTORS: u32 = 4096;
const INODE_SECTOR: Sector = Sector(DEVICE_SECTORS - 1);

fn new_store() -> (InodeStore<MemDevice, MemFreeMap>, Arc<MemFreeMap>) {
    let device = MemDevice::new(DEVICE_SECTORS as usize);
    let cache = Arc::new(BufferCache::new(device));
    let freemap = Arc::new(MemFreeMap::new(1..(DEVICE_SECTORS - 1)));
    (InodeStore::new(cache, Arc::clone(&freemap)), freemap)
}

/// P4: any split of a byte string into overlapping/disjoint (offset, size)
/// writes, applied in order, is recoverable by a single read of the whole
/// file; untouched bytes below the final length read back as zero.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn p4_read_write_round_trip(
        writes in prop::collection::vec(
            (0u64..1536, prop::collection::vec(any::<u8>(), 1..64)),
            1..20,
        )
    ) {
        init_logging();
        let (store, _freemap) = new_store();
        store.create(INODE_SECTOR, 0).unwrap();
        let handle = store.open(INODE_SECTOR, false);

        let mut model = Vec::new();
        for (offset, bytes) in &writes {
            let offset = *offset as usize;
            let end = offset + bytes.len();
            if model.len() < end {
                model.resize(end, 0u8);
            }
            model[offset..end].copy_from_slice(bytes);

            let n = store.write_at(&handle, bytes, offset as u64);
            prop_assert_eq!(n, bytes.len());
        }

        prop_assert_eq!(handle.length() as usize, model.len());
        let mut actual = vec![0u8; model.len()];
        let n = store.read_at(&handle, &mut actual, 0);
        prop_assert_eq!(n, model.len());
        prop_assert_eq!(actual, model);

        store.close(handle);
    }
}

/// P5: `length` never decreases over the lifetime of an open inode.
#[test]
fn p5_length_monotonicity() {
    init_logging();
    let (store, _freemap) = new_store();
    store.create(INODE_SECTOR, 0).unwrap();
    let handle = store.open(INODE_SECTOR, false);

    let mut last_length = handle.length();
    for (offset, len) in [(0u64, 10usize), (5, 3), (200, 50), (100, 5), (1000, 1)] {
        let buf = vec![1u8; len];
        store.write_at(&handle, &buf, offset);
        let now = handle.length();
        assert!(now >= last_length, "length decreased: {} -> {}", last_length, now);
        last_length = now;
    }

    store.close(handle);
}

/// P6: after any sequence of deny_write/allow_write/reopen/close calls,
/// `0 <= deny_write_cnt <= open_cnt` holds.
#[test]
fn p6_deny_write_bounds() {
    init_logging();
    let (store, _freemap) = new_store();
    store.create(INODE_SECTOR, 0).unwrap();

    let h1 = store.open(INODE_SECTOR, false);
    assert_counts_hold(&h1);

    let h2 = store.reopen(&h1);
    assert_counts_hold(&h2);

    store.deny_write(&h1);
    assert_counts_hold(&h1);
    store.deny_write(&h2);
    assert_counts_hold(&h2);

    store.allow_write(&h1);
    assert_counts_hold(&h1);

    store.close(h2);
    store.allow_write(&h1);
    assert_counts_hold(&h1);

    store.close(h1);
}

fn assert_counts_hold(handle: &fscore::inode::InodeHandle) {
    let open = handle.open_count();
    let deny = handle.deny_write_count();
    assert!(deny <= open, "deny_write_cnt {} exceeded open_cnt {}", deny, open);
}

/// P7: creating, removing and closing every opener of a file returns the
/// free-map to exactly the state it was in before the file's sectors (data
/// blocks and the inode sector itself) were allocated.
#[test]
fn p7_removal_reclaims_blocks() {
    init_logging();
    let device = MemDevice::new(DEVICE_SECTORS as usize);
    let cache = Arc::new(BufferCache::new(device));
    let freemap = Arc::new(MemFreeMap::new(1..DEVICE_SECTORS));
    let store = InodeStore::new(Arc::clone(&cache), Arc::clone(&freemap));

    let baseline = freemap.free_count();

    let inode_sector = freemap.allocate_one().unwrap();
    store.create(inode_sector, 101 * 512).unwrap();
    let handle = store.open(inode_sector, false);
    store.remove(&handle);
    store.close(handle);

    assert_eq!(freemap.free_count(), baseline);
}
