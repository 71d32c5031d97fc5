// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable address-range algorithms used by the kernel's user memory bridge.
//!
//! Nothing in here touches memory. Everything operates on addresses as plain
//! numbers and on abstract region tables, which keeps these routines easy to
//! test on the host and impossible to trick into dereferencing anything.

// Allow std-y things to be used in test. Note that rust-analyzer builds with
// test set by default, so it's easy to introduce code incompatible with no_std
// without your editor noticing.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

use core::cmp::Ordering;

/// Computes the address one past the end of `len` bytes starting at `base`.
///
/// Returns `None` if that computation wraps. A range whose end wraps is never
/// valid; callers must not fall back to a truncated length.
#[inline(always)]
pub fn checked_end(base: usize, len: usize) -> Option<usize> {
    base.checked_add(len)
}

/// Computes the byte size of an array of `count` elements of `elem_size`
/// bytes each, or `None` if the product overflows.
#[inline(always)]
pub fn checked_array_size(count: usize, elem_size: usize) -> Option<usize> {
    count.checked_mul(elem_size)
}

/// A range of addresses a user thread has asked the kernel to touch.
///
/// Having one of these proves nothing about whether the thread may touch it.
///
/// # Invariants
///
/// `base_addr() <= end_addr()`, and `is_empty()` iff they are equal.
pub trait UserRange {
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ in the range.
    fn end_addr(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.base_addr() == self.end_addr()
    }
}

impl<T: UserRange> UserRange for &T {
    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

/// One entry of a thread's memory region table.
///
/// Attributes are not part of this trait; callers pass a predicate that
/// decides whether a given region confers the access they need.
///
/// # Invariants
///
/// `base_addr() <= end_addr()`. An empty region is legal but useless.
pub trait MemoryRegion {
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;

    fn contains(&self, addr: usize) -> bool {
        self.base_addr() <= addr && addr < self.end_addr()
    }
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }

    #[inline(always)]
    fn contains(&self, addr: usize) -> bool {
        (**self).contains(addr)
    }
}

/// Orders a region relative to an address, for binary search: `Equal` if the
/// region holds the address, `Greater` if the region lies above it, `Less` if
/// below.
#[inline(always)]
fn locate(region: &impl MemoryRegion, addr: usize) -> Ordering {
    if addr < region.base_addr() {
        Ordering::Greater
    } else if addr >= region.end_addr() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Counts how many bytes, starting at `base` and looking no further than
/// `limit` bytes, are covered without a gap by regions of `table` that satisfy
/// `region_ok`.
///
/// The result is always `<= limit`. It stops early at the first hole, the
/// first region rejected by `region_ok`, or the top of the address space.
///
/// # Preconditions
///
/// `table` is sorted by base address and its regions do not overlap.
pub fn accessible_prefix<R>(
    base: usize,
    limit: usize,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> usize
where
    R: MemoryRegion,
{
    // Bytes past the top of the address space simply aren't there, so the
    // limit is clipped before it can be reported back.
    let limit = limit.min(usize::MAX - base);
    if limit == 0 {
        return 0;
    }
    let want_end = base + limit;

    let Ok(first) = table.binary_search_by(|r| locate(r, base)) else {
        return 0;
    };

    let mut covered_to = base;
    for region in &table[first..] {
        if !region.contains(covered_to) || !region_ok(region) {
            break;
        }
        covered_to = region.end_addr();
        if covered_to >= want_end {
            return limit;
        }
    }
    covered_to - base
}

/// Decides whether a thread may access every byte of `range`, according to
/// its region `table` and the `region_ok` predicate.
///
/// The range may span several regions as long as they are perfectly
/// contiguous and every one of them passes `region_ok`. Empty ranges confer no
/// authority and are always accepted.
///
/// # Preconditions
///
/// `table` is sorted by base address and its regions do not overlap.
#[must_use]
pub fn can_access<S, R>(
    range: S,
    table: &[R],
    region_ok: impl Fn(&R) -> bool,
) -> bool
where
    S: UserRange,
    R: MemoryRegion,
{
    if range.is_empty() {
        return true;
    }
    let len = range.end_addr() - range.base_addr();
    accessible_prefix(range.base_addr(), len, table, region_ok) == len
}
