// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor types, used to statically define the threads present at boot and
//! the memory they may touch.

/// Description of one memory region.
///
/// A memory region can be shared by several threads; a spawned thread gets a
/// copy of its parent's regions plus one for its own stack.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    /// Address of start of region.
    pub base: usize,
    /// Size of region, in bytes.
    pub size: usize,
    /// Flags describing what can be done with this region.
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    /// Checks whether this region could exist at all: its end must not wrap
    /// around the address space.
    pub fn is_well_formed(&self) -> bool {
        kerncore::checked_end(self.base, self.size).is_some()
    }

    /// Checks whether two regions share any byte.
    pub fn overlaps(&self, other: &Self) -> bool {
        use kerncore::MemoryRegion;

        self.size != 0
            && other.size != 0
            && self.base_addr() < other.end_addr()
            && other.base_addr() < self.end_addr()
    }
}

impl kerncore::MemoryRegion for RegionDesc {
    #[inline(always)]
    fn base_addr(&self) -> usize {
        self.base
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        // Regions are checked for wraparound before they reach a thread, so
        // saturating here only matters for descriptors nobody will use.
        self.base.saturating_add(self.size)
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by threads that include it.
        const READ = 1 << 0;
        /// Region can be written by threads that include it.
        const WRITE = 1 << 1;
        /// Region can contain executable code for threads that include it.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers. The kernel will never copy
        /// into or out of such a region on a thread's behalf, since the access
        /// could have side effects.
        const DEVICE = 1 << 3;
    }
}

/// Record describing a single thread that exists at boot.
#[derive(Copy, Clone, Debug)]
pub struct ThreadDesc<'a> {
    /// Address of the thread's `Thread` kernel object. It must appear in the
    /// kernel object table.
    pub object: usize,
    /// Memory this thread may access. Need not be sorted, but must not
    /// overlap.
    pub regions: &'a [RegionDesc],
    /// Number of bytes of kernel memory that may be allocated on behalf of
    /// this thread and its descendants.
    pub pool_size: usize,
}
