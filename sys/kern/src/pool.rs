// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-thread resource pools.
//!
//! Kernel memory allocated on a thread's behalf (copies of its buffers,
//! dynamic objects, pipe storage) is charged to that thread's pool, which it
//! shares with every thread it spawns. A pool is a budget, not an arena: the
//! bytes themselves come from the kernel heap, but no thread family can take
//! more of it than its budget allows.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct ResourcePool {
    limit: usize,
    used: AtomicUsize,
}

impl ResourcePool {
    pub const fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Takes `n` bytes out of the budget, if they're there.
    #[must_use]
    pub fn try_charge(&self, n: usize) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(n).filter(|&total| total <= self.limit)
            })
            .is_ok()
    }

    /// Returns `n` bytes to the budget.
    pub fn release(&self, n: usize) {
        let prev = self.used.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "pool released more than it charged");
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Kernel-owned bytes charged to a pool. The charge is returned when the
/// buffer is dropped, on every path.
#[derive(Debug)]
pub struct OwnedBuffer {
    data: Box<[u8]>,
    pool: Arc<ResourcePool>,
}

impl OwnedBuffer {
    /// Allocates `len` zeroed bytes against `pool`. Returns `None` if the
    /// budget or the heap can't cover it; nothing stays charged in that case.
    pub fn alloc_zeroed(pool: &Arc<ResourcePool>, len: usize) -> Option<Self> {
        if !pool.try_charge(len) {
            return None;
        }
        let mut v = Vec::new();
        if v.try_reserve_exact(len).is_err() {
            pool.release(len);
            return None;
        }
        v.resize(len, 0);
        Some(Self {
            data: v.into_boxed_slice(),
            pool: Arc::clone(pool),
        })
    }

    /// Address of the first byte. Stable for the life of the buffer.
    pub fn addr(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl Deref for OwnedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for OwnedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        self.pool.release(self.data.len());
    }
}

/// A NUL-terminated string in a pool-charged buffer.
#[derive(Debug)]
pub struct OwnedCString {
    buf: OwnedBuffer,
}

impl OwnedCString {
    /// Wraps `buf`, which must end in a NUL.
    pub(crate) fn from_terminated(buf: OwnedBuffer) -> Option<Self> {
        match buf.last() {
            Some(0) => Some(Self { buf }),
            _ => None,
        }
    }

    /// The string's bytes, up to (not including) the first NUL.
    pub fn as_bytes(&self) -> &[u8] {
        let n = self.buf.iter().position(|&b| b == 0).unwrap_or(0);
        &self.buf[..n]
    }

    /// The string's bytes including the terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..self.as_bytes().len() + 1]
    }
}
