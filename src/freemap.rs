//! Free-sector allocator interface.
//!
//! Treated as an external collaborator: this crate only consumes
//! `allocate_one`/`release`. Boot/format entry points (`init`, `open`,
//! `close`, `create`) belong to the allocator's own implementation, not to
//! the inode store, and are not part of this trait.

use crate::device::Sector;

/// The free-sector allocator consumed by `inode_create` and by file growth.
pub trait FreeMap: Send + Sync {
    /// Allocates and returns one free sector, or `None` if the map is
    /// exhausted.
    fn allocate_one(&self) -> Option<Sector>;

    /// Returns `sector` to the free map. `sector` must have come from a
    /// prior `allocate_one` call on the same map.
    fn release(&self, sector: Sector);
}
