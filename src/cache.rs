//! Buffer Cache (BC).
//!
//! A fixed pool of slots caching recently used sectors, sitting between the
//! inode store and the raw block device. Implements the modified-clock
//! eviction policy and the pinning discipline described below.
//!
//! Locking follows a two-tier discipline: a single `Mutex<Inner>` protects
//! the slot metadata array and the clock hand, while each slot's pin count
//! lives in its own `AtomicU32` so `release` never has to take the big lock
//! to record that a pinner is done. Payload bytes live behind an
//! `UnsafeCell`: a pin licenses unsynchronized access to a slot's payload by
//! the pinning thread, so there is no third lock guarding the data itself.

use array_macro::array;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::device::{BlockDevice, Sector, SectorData, SECTOR_SIZE};

/// Number of slots in the pool.
pub const CACHE_SLOTS: usize = 64;

/// How long `lookup` waits on the eviction condvar between sweep pairs
/// before retrying.
const EVICT_RETRY_WAIT: Duration = Duration::from_millis(10);

/// An opaque handle to a pinned slot, returned by `cache_lookup`. Carries no
/// public fields; the only valid operations on it are the other
/// `BufferCache` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHandle(usize);

/// Metadata for one slot, guarded by the cache's global mutex.
struct SlotMeta {
    valid: bool,
    sector: Sector,
    dirty: bool,
    accessed: bool,
}

impl SlotMeta {
    const fn invalid() -> Self {
        Self {
            valid: false,
            sector: Sector::NONE,
            dirty: false,
            accessed: false,
        }
    }
}

/// One cache slot: pin count plus payload, both outside the global mutex.
struct Slot {
    /// Non-negative pin ("users") count. Incremented only while holding the
    /// global mutex (on hit or fill); decremented by `cache_release` without
    /// it.
    users: AtomicU32,
    data: UnsafeCell<SectorData>,
}

impl Slot {
    fn new() -> Self {
        Self {
            users: AtomicU32::new(0),
            data: UnsafeCell::new([0u8; SECTOR_SIZE]),
        }
    }
}

// SAFETY: `data` is only ever read or written by a thread holding a pin on
// the slot (`users > 0`); a caller-side file-system mutex is responsible for
// ensuring two pinners of the same slot never race on overlapping ranges.
// The global mutex additionally serializes all transitions where `users`
// could be zero.
unsafe impl Sync for Slot {}

struct Inner {
    metas: [SlotMeta; CACHE_SLOTS],
    hand: usize,
}

/// The buffer cache itself. Backs all inode I/O.
pub struct BufferCache<D> {
    inner: Mutex<Inner>,
    slots: [Slot; CACHE_SLOTS],
    /// Signalled whenever any slot's `users` count reaches zero.
    evictable: Condvar,
    device: D,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Prepares the pool; all slots invalid, `hand = 0`.
    pub fn new(device: D) -> Self {
        Self {
            inner: Mutex::new(Inner {
                metas: array![_ => SlotMeta::invalid(); CACHE_SLOTS],
                hand: 0,
            }),
            slots: array![_ => Slot::new(); CACHE_SLOTS],
            evictable: Condvar::new(),
            device,
        }
    }

    /// Returns a handle for `sector`, pinning it. Blocks if every slot is
    /// pinned; never fails.
    pub fn lookup(&self, sector: Sector) -> CacheHandle {
        let mut inner = self.inner.lock().unwrap();

        if let Some(i) = Self::find(&inner.metas, sector) {
            self.slots[i].users.fetch_add(1, Ordering::AcqRel);
            inner.metas[i].accessed = true;
            return CacheHandle(i);
        }

        let (mut inner, victim) = self.pick_victim(inner);

        if inner.metas[victim].valid && inner.metas[victim].dirty {
            log::trace!(
                "evicting dirty slot {} (sector {})",
                victim,
                inner.metas[victim].sector
            );
            // SAFETY: `victim` was selected with `users == 0` under `inner`;
            // no pinner can be touching its payload.
            let data = unsafe { &*self.slots[victim].data.get() };
            self.device.write(inner.metas[victim].sector, data);
        }

        self.device
            .read(sector, unsafe { &mut *self.slots[victim].data.get() });
        inner.metas[victim] = SlotMeta {
            valid: true,
            sector,
            dirty: false,
            accessed: true,
        };
        self.slots[victim].users.store(1, Ordering::Release);

        CacheHandle(victim)
    }

    fn find(metas: &[SlotMeta; CACHE_SLOTS], sector: Sector) -> Option<usize> {
        metas.iter().position(|m| m.valid && m.sector == sector)
    }

    /// Picks a slot to (re)fill: the first invalid slot, or the result of
    /// the clock sweep.
    fn pick_victim<'a>(
        &'a self,
        inner: std::sync::MutexGuard<'a, Inner>,
    ) -> (std::sync::MutexGuard<'a, Inner>, usize) {
        if let Some(i) = inner.metas.iter().position(|m| !m.valid) {
            return (inner, i);
        }
        self.evict(inner)
    }

    /// Runs the modified-clock eviction policy. Two full sweeps looking for
    /// an unpinned, unaccessed slot; on two fruitless sweeps, drops the lock,
    /// waits on `evictable`, and starts over.
    fn evict<'a>(
        &'a self,
        mut inner: std::sync::MutexGuard<'a, Inner>,
    ) -> (std::sync::MutexGuard<'a, Inner>, usize) {
        loop {
            for _ in 0..2 {
                if let Some(victim) = self.sweep_once(&mut inner) {
                    return (inner, victim);
                }
            }

            log::debug!("evict: two fruitless sweeps, waiting for a release");
            let (guard, _timeout) = self.evictable.wait_timeout(inner, EVICT_RETRY_WAIT).unwrap();
            inner = guard;
        }
    }

    /// One clock sweep starting at `hand`. Returns the victim index if the
    /// sweep finds one, advancing the hand to one past it; otherwise
    /// advances the hand all the way around and returns `None`.
    fn sweep_once(&self, inner: &mut Inner) -> Option<usize> {
        for _ in 0..CACHE_SLOTS {
            let i = inner.hand;
            inner.hand = (inner.hand + 1) % CACHE_SLOTS;

            if self.slots[i].users.load(Ordering::Acquire) > 0 {
                continue;
            }
            if inner.metas[i].accessed {
                inner.metas[i].accessed = false;
                continue;
            }
            return Some(i);
        }
        None
    }

    /// A mutable view of the slot's payload. The caller must hold a pin on
    /// `handle` (returned by `lookup` and not yet released). Writes through
    /// this view must be followed by `mark_dirty`.
    pub fn data(&self, handle: CacheHandle) -> &mut SectorData {
        debug_assert!(self.slots[handle.0].users.load(Ordering::Relaxed) > 0);
        // SAFETY: caller holds a pin; see the `unsafe impl Sync for Slot`
        // comment above.
        unsafe { &mut *self.slots[handle.0].data.get() }
    }

    /// Marks a pinned slot dirty. Idempotent.
    pub fn mark_dirty(&self, handle: CacheHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.metas[handle.0].dirty = true;
    }

    /// The caller is done with `handle`. Do not touch the slot afterward.
    pub fn release(&self, handle: CacheHandle) {
        let prev = self.slots[handle.0].users.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cache_release: slot was not pinned");
        if prev == 1 {
            self.evictable.notify_all();
        }
    }

    /// Writes every valid, dirty slot to the device and clears its dirty
    /// flag. Slot validity is preserved.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..CACHE_SLOTS {
            if inner.metas[i].valid && inner.metas[i].dirty {
                let data = unsafe { &*self.slots[i].data.get() };
                self.device.write(inner.metas[i].sector, data);
                inner.metas[i].dirty = false;
            }
        }
    }
}
