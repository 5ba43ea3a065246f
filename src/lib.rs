//! A storage core: a pinned buffer cache with modified-clock eviction
//! sitting under an inode store with direct/indirect/doubly-indirect block
//! addressing.
//!
//! This crate implements the two subsystems on top of two small traits
//! representing collaborators it does not itself provide: [`device::BlockDevice`],
//! the raw sector store, and [`freemap::FreeMap`], the free-sector allocator.
//! Path resolution, directory entries and the syscall boundary are not part
//! of this crate.

pub mod cache;
pub mod device;
pub mod error;
pub mod freemap;
pub mod inode;

pub use cache::BufferCache;
pub use device::{BlockDevice, Sector, SectorData, SECTOR_SIZE};
pub use error::{Error, Result};
pub use freemap::FreeMap;
pub use inode::{InodeHandle, InodeStore};
