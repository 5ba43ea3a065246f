//! Byte-to-sector mapping, read, write-with-growth, create and close.
//!
//! Attachment during growth proceeds by the next block index `k`: direct
//! while `k < D`, single-indirect while `k - D < I*A` (allocating the
//! indirect block and zero-initializing it on first use), otherwise
//! doubly-indirect (allocating the doubly-indirect block and each
//! single-indirect child on first use).

use std::sync::{Arc, Mutex};

use crate::cache::BufferCache;
use crate::device::{BlockDevice, Sector, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::freemap::FreeMap;
use crate::inode::disk::{
    ptr_at, set_ptr_at, Dinode, DIRECT_BLOCKS, INDIRECT_BLOCKS, MAX_FILE_SIZE, PTRS_PER_BLOCK,
};
use crate::inode::table::{Inode, OpenTable};

/// A shared reference to an open in-memory inode. Obtained from
/// `InodeStore::open`/`reopen`, consumed by `InodeStore::close`.
#[derive(Clone)]
pub struct InodeHandle(pub(crate) Arc<Inode>);

impl InodeHandle {
    pub fn inumber(&self) -> Sector {
        self.0.sector
    }

    pub fn is_dir(&self) -> bool {
        self.0.isdir
    }

    pub fn length(&self) -> u32 {
        self.0.state.lock().unwrap().disk.length
    }

    /// The current open count, for callers (and tests) that need to verify
    /// `0 <= deny_write_cnt <= open_cnt` directly.
    pub fn open_count(&self) -> u32 {
        self.0.state.lock().unwrap().open_cnt
    }

    pub fn deny_write_count(&self) -> u32 {
        self.0.state.lock().unwrap().deny_write_cnt
    }
}

fn div_ceil(x: u64, d: u64) -> u64 {
    (x + d - 1) / d
}

/// The inode store: the on-disk inode format plus the open-inode table.
pub struct InodeStore<D, F> {
    cache: Arc<BufferCache<D>>,
    freemap: Arc<F>,
    table: Mutex<OpenTable>,
}

impl<D: BlockDevice, F: FreeMap> InodeStore<D, F> {
    pub fn new(cache: Arc<BufferCache<D>>, freemap: Arc<F>) -> Self {
        Self {
            cache,
            freemap,
            table: Mutex::new(OpenTable::new()),
        }
    }

    /// Formats a new on-disk inode at `sector` holding `length` zeroed
    /// bytes. Allocates and zero-fills every data block up front (direct,
    /// then indirect, then doubly-indirect). On allocation failure,
    /// releases every sector this call allocated and returns
    /// `Err(AllocationFailure)`.
    ///
    /// Caller must hold the enclosing file-system mutex; `sector` must not
    /// be concurrently in use by another `create`/`open`.
    pub fn create(&self, sector: Sector, length: u32) -> Result<()> {
        let mut dinode = Dinode::new(length);
        let sectors_needed = div_ceil(length as u64, SECTOR_SIZE as u64) as usize;

        let mut allocated = Vec::new();
        for k in 0..sectors_needed {
            match grow_one(&mut dinode, k, &self.cache, &*self.freemap) {
                Ok(s) => allocated.push(s),
                Err(e) => {
                    log::debug!(
                        "create: allocation failed at block {} of {}, rolling back {} sectors",
                        k,
                        sectors_needed,
                        allocated.len()
                    );
                    for s in allocated {
                        self.freemap.release(s);
                    }
                    return Err(e);
                }
            }
        }

        let h = self.cache.lookup(sector);
        dinode.write_to_sector(self.cache.data(h));
        self.cache.mark_dirty(h);
        self.cache.release(h);
        Ok(())
    }

    /// Returns the shared in-memory inode for `sector`, reading it from
    /// disk on first open.
    ///
    /// Caller must hold the enclosing file-system mutex.
    pub fn open(&self, sector: Sector, isdir: bool) -> InodeHandle {
        let mut table = self.table.lock().unwrap();
        if let Some(inode) = table.find_and_reopen(sector) {
            return InodeHandle(inode);
        }

        let h = self.cache.lookup(sector);
        let dinode = Dinode::read_from_sector(self.cache.data(h))
            .expect("open: sector does not hold a valid inode");
        self.cache.release(h);

        let inode = Inode::new(sector, isdir, dinode);
        table.insert(Arc::clone(&inode));
        InodeHandle(inode)
    }

    /// Caller must hold the enclosing file-system mutex.
    pub fn reopen(&self, handle: &InodeHandle) -> InodeHandle {
        handle.0.state.lock().unwrap().open_cnt += 1;
        InodeHandle(Arc::clone(&handle.0))
    }

    /// Marks `handle` for deletion on final close.
    ///
    /// Caller must hold the enclosing file-system mutex.
    pub fn remove(&self, handle: &InodeHandle) {
        handle.0.state.lock().unwrap().removed = true;
    }

    /// Caller must hold the enclosing file-system mutex.
    pub fn deny_write(&self, handle: &InodeHandle) {
        let mut state = handle.0.state.lock().unwrap();
        state.deny_write_cnt += 1;
        debug_assert!(
            state.deny_write_cnt <= state.open_cnt,
            "deny_write_cnt exceeded open_cnt"
        );
    }

    /// Caller must hold the enclosing file-system mutex.
    pub fn allow_write(&self, handle: &InodeHandle) {
        let mut state = handle.0.state.lock().unwrap();
        debug_assert!(state.deny_write_cnt > 0, "allow_write without a matching deny_write");
        state.deny_write_cnt -= 1;
    }

    /// Decrements `open_cnt`; on the last close, writes the in-memory copy
    /// back and, if `removed`, frees every data sector and the inode
    /// sector itself.
    ///
    /// Caller must hold the enclosing file-system mutex.
    pub fn close(&self, handle: InodeHandle) {
        let inode = handle.0;
        let mut state = inode.state.lock().unwrap();
        state.open_cnt -= 1;

        // Write-through on every close for durability, not only the last.
        let h = self.cache.lookup(inode.sector);
        state.disk.write_to_sector(self.cache.data(h));
        self.cache.mark_dirty(h);
        self.cache.release(h);

        if state.open_cnt > 0 {
            return;
        }

        let removed = state.removed;
        let dinode = state.disk;
        drop(state);

        self.table.lock().unwrap().remove(inode.sector);

        if removed {
            free_all_blocks(&dinode, &self.cache, &*self.freemap);
            self.freemap.release(inode.sector);
        }
    }

    /// Returns the number of bytes actually read, which is short if
    /// `offset + size` runs past the current length (running out of file
    /// is not an error).
    ///
    /// Caller must hold the enclosing file-system mutex.
    pub fn read_at(&self, handle: &InodeHandle, out: &mut [u8], offset: u64) -> usize {
        let dinode = handle.0.state.lock().unwrap().disk;
        let length = dinode.length as u64;

        let mut bytes_read = 0usize;
        let mut offset = offset;
        let mut remaining = out.len();

        while remaining > 0 {
            if offset >= length {
                break;
            }
            let sector_idx = byte_to_sector(&dinode, offset, &self.cache);
            let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;
            let in_file = (length - offset) as usize;
            let in_sector = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(in_file).min(in_sector);
            if chunk == 0 {
                break;
            }

            let h = self.cache.lookup(sector_idx);
            out[bytes_read..bytes_read + chunk]
                .copy_from_slice(&self.cache.data(h)[sector_ofs..sector_ofs + chunk]);
            self.cache.release(h);

            bytes_read += chunk;
            offset += chunk as u64;
            remaining -= chunk;
        }

        bytes_read
    }

    /// Extends the file if `offset + size > length`. Returns the number of
    /// bytes actually written, short if an allocation fails partway
    /// through growth.
    ///
    /// Caller must hold the enclosing file-system mutex.
    pub fn write_at(&self, handle: &InodeHandle, input: &[u8], offset: u64) -> usize {
        let mut state = handle.0.state.lock().unwrap();
        if state.deny_write_cnt > 0 {
            return 0;
        }

        let mut allocated_bytes =
            div_ceil(state.disk.length as u64, SECTOR_SIZE as u64) * SECTOR_SIZE as u64;

        let mut bytes_written = 0usize;
        let mut offset = offset;
        let mut remaining = input.len();

        'outer: while remaining > 0 {
            while offset >= allocated_bytes {
                let k = (allocated_bytes / SECTOR_SIZE as u64) as usize;
                let new_sector = match grow_one(&mut state.disk, k, &self.cache, &*self.freemap) {
                    Ok(s) => s,
                    Err(_) => {
                        log::debug!(
                            "write_at: growth failed at block {}, returning short count {}",
                            k,
                            bytes_written
                        );
                        break 'outer;
                    }
                };
                let h = self.cache.lookup(new_sector);
                for b in self.cache.data(h).iter_mut() {
                    *b = 0;
                }
                self.cache.mark_dirty(h);
                self.cache.release(h);
                allocated_bytes += SECTOR_SIZE as u64;
            }

            let sector_idx = byte_to_sector(&state.disk, offset, &self.cache);
            let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(sector_left);
            if chunk == 0 {
                break;
            }

            if offset + chunk as u64 > state.disk.length as u64 {
                state.disk.length = (offset + chunk as u64) as u32;
            }

            let h = self.cache.lookup(sector_idx);
            self.cache.data(h)[sector_ofs..sector_ofs + chunk]
                .copy_from_slice(&input[bytes_written..bytes_written + chunk]);
            self.cache.mark_dirty(h);
            self.cache.release(h);

            bytes_written += chunk;
            offset += chunk as u64;
            remaining -= chunk;
        }

        bytes_written
    }
}

/// Maps a byte offset to the physical data sector that holds it, reading
/// indirection blocks through the cache on demand rather than
/// materializing a persistent in-memory tree.
fn byte_to_sector<D: BlockDevice>(dinode: &Dinode, pos: u64, cache: &BufferCache<D>) -> Sector {
    let mut b = (pos / SECTOR_SIZE as u64) as usize;

    if b < DIRECT_BLOCKS {
        return dinode.direct_at(b);
    }
    b -= DIRECT_BLOCKS;

    if b < INDIRECT_BLOCKS * PTRS_PER_BLOCK {
        let indirect_block = dinode.indirect_at(b / PTRS_PER_BLOCK);
        return read_ptr(cache, indirect_block, b % PTRS_PER_BLOCK);
    }
    b -= INDIRECT_BLOCKS * PTRS_PER_BLOCK;

    let doubly = dinode.doubly_indirect();
    let indirect_block = read_ptr(cache, doubly, b / PTRS_PER_BLOCK);
    read_ptr(cache, indirect_block, b % PTRS_PER_BLOCK)
}

fn read_ptr<D: BlockDevice>(cache: &BufferCache<D>, block: Sector, idx: usize) -> Sector {
    let h = cache.lookup(block);
    let v = ptr_at(cache.data(h), idx);
    cache.release(h);
    v
}

fn write_ptr<D: BlockDevice>(cache: &BufferCache<D>, block: Sector, idx: usize, value: Sector) {
    let h = cache.lookup(block);
    set_ptr_at(cache.data(h), idx, value);
    cache.mark_dirty(h);
    cache.release(h);
}

/// Zero-fills a freshly allocated indirection block (all pointers
/// `Sector::NONE`) or data block.
fn zero_fill<D: BlockDevice>(cache: &BufferCache<D>, sector: Sector) {
    let h = cache.lookup(sector);
    for b in cache.data(h).iter_mut() {
        *b = 0;
    }
    cache.mark_dirty(h);
    cache.release(h);
}

/// Allocates and attaches exactly one new data sector at linear block index
/// `k`, allocating and zero-initializing indirection blocks on first use.
/// Rolls back any sector this call allocated before returning `Err`.
fn grow_one<D: BlockDevice, F: FreeMap>(
    dinode: &mut Dinode,
    k: usize,
    cache: &BufferCache<D>,
    freemap: &F,
) -> Result<Sector> {
    assert!(
        (k as u64) * SECTOR_SIZE as u64 < MAX_FILE_SIZE,
        "grow_one: block index beyond maximum file size"
    );

    if k < DIRECT_BLOCKS {
        let data = freemap.allocate_one().ok_or(Error::AllocationFailure)?;
        zero_fill(cache, data);
        dinode.set_direct_at(k, data);
        return Ok(data);
    }

    let k = k - DIRECT_BLOCKS;
    if k < INDIRECT_BLOCKS * PTRS_PER_BLOCK {
        let indirect_idx = k / PTRS_PER_BLOCK;
        let off = k % PTRS_PER_BLOCK;

        let mut allocated_indirect = None;
        let mut indirect_block = dinode.indirect_at(indirect_idx);
        if indirect_block.is_none() {
            indirect_block = match freemap.allocate_one() {
                Some(s) => s,
                None => return Err(Error::AllocationFailure),
            };
            zero_fill(cache, indirect_block);
            allocated_indirect = Some(indirect_block);
        }

        let data = match freemap.allocate_one() {
            Some(s) => s,
            None => {
                if let Some(s) = allocated_indirect {
                    freemap.release(s);
                }
                return Err(Error::AllocationFailure);
            }
        };
        zero_fill(cache, data);
        write_ptr(cache, indirect_block, off, data);
        dinode.set_indirect_at(indirect_idx, indirect_block);
        return Ok(data);
    }

    let k = k - INDIRECT_BLOCKS * PTRS_PER_BLOCK;
    let dbl_idx = k / PTRS_PER_BLOCK;
    let off = k % PTRS_PER_BLOCK;

    let mut allocated_doubly = None;
    let mut doubly = dinode.doubly_indirect();
    if doubly.is_none() {
        doubly = match freemap.allocate_one() {
            Some(s) => s,
            None => return Err(Error::AllocationFailure),
        };
        zero_fill(cache, doubly);
        allocated_doubly = Some(doubly);
    }

    let mut allocated_indirect = None;
    let mut indirect_block = read_ptr(cache, doubly, dbl_idx);
    if indirect_block.is_none() {
        indirect_block = match freemap.allocate_one() {
            Some(s) => s,
            None => {
                if let Some(s) = allocated_doubly {
                    freemap.release(s);
                }
                return Err(Error::AllocationFailure);
            }
        };
        zero_fill(cache, indirect_block);
        write_ptr(cache, doubly, dbl_idx, indirect_block);
        allocated_indirect = Some(indirect_block);
    }

    let data = match freemap.allocate_one() {
        Some(s) => s,
        None => {
            if let Some(s) = allocated_indirect {
                freemap.release(s);
                write_ptr(cache, doubly, dbl_idx, Sector::NONE);
            }
            if let Some(s) = allocated_doubly {
                freemap.release(s);
            }
            return Err(Error::AllocationFailure);
        }
    };
    zero_fill(cache, data);
    write_ptr(cache, indirect_block, off, data);
    dinode.set_doubly_indirect(doubly);
    Ok(data)
}

/// Releases every data sector held by `dinode` back to the free-map,
/// walking direct, single-indirect and doubly-indirect blocks.
fn free_all_blocks<D: BlockDevice, F: FreeMap>(dinode: &Dinode, cache: &BufferCache<D>, freemap: &F) {
    let sectors = div_ceil(dinode.length as u64, SECTOR_SIZE as u64) as usize;
    let mut remaining = sectors;

    for i in 0..DIRECT_BLOCKS {
        if remaining == 0 {
            return;
        }
        let s = dinode.direct_at(i);
        if s.is_some() {
            freemap.release(s);
        }
        remaining -= 1;
    }

    for i in 0..INDIRECT_BLOCKS {
        if remaining == 0 {
            return;
        }
        let indirect_block = dinode.indirect_at(i);
        if indirect_block.is_none() {
            continue;
        }
        let take = remaining.min(PTRS_PER_BLOCK);
        for off in 0..take {
            let s = read_ptr(cache, indirect_block, off);
            if s.is_some() {
                freemap.release(s);
            }
        }
        freemap.release(indirect_block);
        remaining -= take;
    }

    if remaining == 0 {
        return;
    }
    let doubly = dinode.doubly_indirect();
    if doubly.is_none() {
        return;
    }
    for dbl_idx in 0..PTRS_PER_BLOCK {
        if remaining == 0 {
            break;
        }
        let indirect_block = read_ptr(cache, doubly, dbl_idx);
        if indirect_block.is_none() {
            continue;
        }
        let take = remaining.min(PTRS_PER_BLOCK);
        for off in 0..take {
            let s = read_ptr(cache, indirect_block, off);
            if s.is_some() {
                freemap.release(s);
            }
        }
        freemap.release(indirect_block);
        remaining -= take;
    }
    freemap.release(doubly);
}
