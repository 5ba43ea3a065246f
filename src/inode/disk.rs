//! On-disk inode layout: the indirect-block addressing contract.
//!
//! The on-disk inode reserves exactly `SECTOR_SIZE` bytes:
//! `length`(4) + `magic`(4) + `direct[100]`(400) + `indirect[25]`(100) +
//! `doubly_indirect`(4) = 512. `Dinode` is `repr(C)` and zerocopy-derived so
//! it round-trips through a sector buffer with a plain byte copy.

use static_assertions::const_assert_eq;
use std::mem;
use zerocopy::{AsBytes, FromBytes};

use crate::device::{Sector, SectorData, SECTOR_SIZE};

/// Direct data-block pointers per inode.
pub const DIRECT_BLOCKS: usize = 100;
/// Single-indirect block pointers per inode.
pub const INDIRECT_BLOCKS: usize = 25;
/// Sector-index pointers per indirect block (`SECTOR_SIZE / 4`).
pub const PTRS_PER_BLOCK: usize = SECTOR_SIZE / 4;

/// Maximum addressable file size in bytes: `(D + I*A + A*A) * S`.
pub const MAX_FILE_SIZE: u64 = ((DIRECT_BLOCKS
    + INDIRECT_BLOCKS * PTRS_PER_BLOCK
    + PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u64)
    * SECTOR_SIZE as u64;

/// Tag marking a valid on-disk inode.
pub const INODE_MAGIC: u32 = 0x494E_4F44;

/// The on-disk inode. Fits exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    pub length: u32,
    pub magic: u32,
    pub direct: [u32; DIRECT_BLOCKS],
    pub indirect: [u32; INDIRECT_BLOCKS],
    pub doubly_indirect: u32,
}

const_assert_eq!(mem::size_of::<Dinode>(), SECTOR_SIZE);

impl Dinode {
    /// A freshly-zeroed inode of the given byte length, with no blocks
    /// allocated yet.
    pub fn new(length: u32) -> Self {
        Self {
            length,
            magic: INODE_MAGIC,
            direct: [0; DIRECT_BLOCKS],
            indirect: [0; INDIRECT_BLOCKS],
            doubly_indirect: 0,
        }
    }

    /// Parses a `Dinode` out of a raw sector buffer. Returns
    /// `InvariantViolation` if the magic tag does not match — the sector
    /// does not hold a valid inode.
    pub fn read_from_sector(data: &SectorData) -> crate::error::Result<Self> {
        let dinode = Self::read_from(&data[..]).expect("Dinode is FromBytes for a full sector");
        if dinode.magic != INODE_MAGIC {
            return Err(crate::error::Error::InvariantViolation(
                "inode magic mismatch",
            ));
        }
        Ok(dinode)
    }

    pub fn write_to_sector(&self, data: &mut SectorData) {
        self.write_to(&mut data[..])
            .expect("Dinode is AsBytes for a full sector");
    }

    pub fn direct_at(&self, i: usize) -> Sector {
        Sector(self.direct[i])
    }

    pub fn set_direct_at(&mut self, i: usize, sector: Sector) {
        self.direct[i] = sector.0;
    }

    pub fn indirect_at(&self, i: usize) -> Sector {
        Sector(self.indirect[i])
    }

    pub fn set_indirect_at(&mut self, i: usize, sector: Sector) {
        self.indirect[i] = sector.0;
    }

    pub fn doubly_indirect(&self) -> Sector {
        Sector(self.doubly_indirect)
    }

    pub fn set_doubly_indirect(&mut self, sector: Sector) {
        self.doubly_indirect = sector.0;
    }
}

/// Reads the `idx`-th sector pointer out of an indirect/doubly-indirect
/// block's raw bytes (little-endian).
pub fn ptr_at(data: &SectorData, idx: usize) -> Sector {
    let off = idx * 4;
    Sector(u32::from_le_bytes(
        data[off..off + 4].try_into().expect("4-byte slice"),
    ))
}

/// Writes the `idx`-th sector pointer into an indirect/doubly-indirect
/// block's raw bytes.
pub fn set_ptr_at(data: &mut SectorData, idx: usize, sector: Sector) {
    let off = idx * 4;
    data[off..off + 4].copy_from_slice(&sector.0.to_le_bytes());
}
