//! The open-inode table and the in-memory inode.
//!
//! Keyed on `Sector` alone, since this crate has a single device. Opening
//! the same sector twice returns the same shared object with `open_cnt`
//! incremented.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::Sector;
use crate::inode::disk::Dinode;

/// Mutable state of an in-memory inode, protected by `Inode::state` — a
/// plain `Mutex` since there is nothing to sleep-wait on beyond the cache's
/// own blocking.
pub(crate) struct InodeState {
    pub(crate) disk: Dinode,
    pub(crate) open_cnt: u32,
    pub(crate) deny_write_cnt: u32,
    pub(crate) removed: bool,
}

/// An in-memory inode. Shared by every opener of the same sector via `Arc`;
/// `InodeHandle` is a cloneable reference to one of these.
pub struct Inode {
    pub(crate) sector: Sector,
    pub(crate) isdir: bool,
    pub(crate) state: Mutex<InodeState>,
}

impl Inode {
    pub(crate) fn new(sector: Sector, isdir: bool, disk: Dinode) -> Arc<Self> {
        Arc::new(Self {
            sector,
            isdir,
            state: Mutex::new(InodeState {
                disk,
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
            }),
        })
    }
}

/// Process-wide mapping from inode sector to in-memory inode.
#[derive(Default)]
pub(crate) struct OpenTable {
    entries: HashMap<Sector, Arc<Inode>>,
}

impl OpenTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Returns the existing entry for `sector` with `open_cnt` incremented,
    /// or `None` if `sector` is not currently open.
    pub(crate) fn find_and_reopen(&self, sector: Sector) -> Option<Arc<Inode>> {
        let inode = self.entries.get(&sector)?;
        inode.state.lock().unwrap().open_cnt += 1;
        Some(Arc::clone(inode))
    }

    pub(crate) fn insert(&mut self, inode: Arc<Inode>) {
        let prev = self.entries.insert(inode.sector, inode);
        debug_assert!(prev.is_none(), "sector opened twice without going through the table");
    }

    pub(crate) fn remove(&mut self, sector: Sector) {
        self.entries.remove(&sector);
    }
}
