//! In-memory `BlockDevice`/`FreeMap` test doubles shared by the integration
//! tests.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Mutex, Once};

use fscore::{BlockDevice, FreeMap, Sector, SectorData, SECTOR_SIZE};

/// A `BlockDevice` backed by a `Vec` of sectors, entirely in memory.
pub struct MemDevice {
    sectors: Mutex<Vec<SectorData>>,
}

impl MemDevice {
    pub fn new(capacity: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; capacity]),
        }
    }

    /// Reads the raw, uncached content of `sector` as the device sees it.
    pub fn snapshot(&self, sector: Sector) -> SectorData {
        self.sectors.lock().unwrap()[sector.0 as usize]
    }
}

impl BlockDevice for MemDevice {
    fn read(&self, sector: Sector, out: &mut SectorData) {
        out.copy_from_slice(&self.sectors.lock().unwrap()[sector.0 as usize]);
    }

    fn write(&self, sector: Sector, data: &SectorData) {
        self.sectors.lock().unwrap()[sector.0 as usize] = *data;
    }
}

/// A `FreeMap` backed by a `HashSet` of free sector numbers.
pub struct MemFreeMap {
    free: Mutex<HashSet<u32>>,
}

impl MemFreeMap {
    pub fn new(range: Range<u32>) -> Self {
        Self {
            free: Mutex::new(range.collect()),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl FreeMap for MemFreeMap {
    fn allocate_one(&self) -> Option<Sector> {
        let mut free = self.free.lock().unwrap();
        let s = *free.iter().next()?;
        free.remove(&s);
        Some(Sector(s))
    }

    fn release(&self, sector: Sector) {
        assert!(
            self.free.lock().unwrap().insert(sector.0),
            "released a sector that was already free"
        );
    }
}

static LOG_INIT: Once = Once::new();

/// Initializes `env_logger` once per test process.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
