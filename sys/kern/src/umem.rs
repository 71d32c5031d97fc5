// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! Every routine here starts from an address a thread handed us and proves,
//! against that thread's region table, that the bytes in question are memory
//! the thread may read (or write) before the kernel touches any of them. Copies
//! go through raw pointers, never through references into user memory, since
//! the thread (or a sibling sharing its regions) can change that memory while
//! we look at it.

use core::marker::PhantomData;

use abi::{FaultInfo, MemFault, ResponseCode};

use crate::err::UserError;
use crate::pool::{OwnedBuffer, OwnedCString};
use crate::thread::{NextThread, Thread};

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` is passed into the kernel by a thread, and is intended to refer
/// to memory that thread controls. However, the `USlice` type itself simply
/// represents an _allegation_ from the thread that a section of address space
/// is suitable; it does _not_ demonstrate that the thread has access to that
/// memory. It could point into the kernel, to peripherals, etc.
///
/// Having a `USlice<T>` tells you the following:
///
/// - Some thread has claimed it has access to a section of address space
///   (delimited by the `USlice`).
/// - The base of the section is correctly aligned for type `T`.
/// - The section does not wrap around the end of the address space.
///
/// To actually find out whether the memory may be used, hand it to
/// `Thread::can_read` or `Thread::can_write`.
pub struct USlice<T> {
    /// Base address of the slice.
    base_address: usize,
    /// Number of `T` elements in the slice.
    length: usize,
    /// since we don't actually use T...
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` given a base address and length passed from
    /// untrusted code.
    ///
    /// This will only succeed if such a slice would not wrap around the top of
    /// the address space, and if `base_address` is correctly aligned for `T`.
    /// A length whose byte size overflows is reported as `Overflow`, never
    /// truncated.
    ///
    /// Zero-sized `T` is rejected at compile time.
    pub fn from_raw(
        base_address: usize,
        length: usize,
    ) -> Result<Self, FaultInfo> {
        // NOTE: the properties checked here are critical for the correctness of
        // this type. Think carefully before loosening any of them, or adding a
        // second way to construct a USlice.
        const { assert!(core::mem::size_of::<T>() != 0) };

        if !base_address.is_multiple_of(core::mem::align_of::<T>()) {
            return Err(memory_fault(MemFault::RangeInvalid, base_address));
        }
        let size_in_bytes =
            kerncore::checked_array_size(length, core::mem::size_of::<T>())
                .ok_or(memory_fault(MemFault::Overflow, base_address))?;
        if kerncore::checked_end(base_address, size_in_bytes).is_none() {
            return Err(memory_fault(MemFault::Overflow, base_address));
        }
        Ok(Self {
            base_address,
            length,
            _marker: PhantomData,
        })
    }

    /// Returns `true` if this slice is zero-length, `false` otherwise.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the number of `T`s in this slice.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns the bottom address of this slice as a `usize`.
    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    /// Returns the end address of the slice, which is the address one past its
    /// final byte -- or its base address if it's empty.
    pub fn end_addr(&self) -> usize {
        // Wrapping is fine here: construction proved neither operation
        // overflows.
        let size_in_bytes = self.length.wrapping_mul(core::mem::size_of::<T>());
        self.base_address.wrapping_add(size_in_bytes)
    }
}

impl USlice<u8> {
    /// Copies the bytes this slice names into `dst`, which must be the same
    /// length.
    ///
    /// # Safety
    ///
    /// The caller must have established that the slice is readable memory of
    /// the thread on whose behalf we're working, e.g. with `Thread::can_read`,
    /// and that it doesn't overlap `dst`.
    unsafe fn read_into(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.length);
        if self.length != 0 {
            // Safety: validity of the source is our caller's promise; `dst` is
            // a live exclusive borrow of the right length.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.base_address as *const u8,
                    dst.as_mut_ptr(),
                    self.length,
                );
            }
        }
    }

    /// Copies `src`, which must be the same length, into the bytes this slice
    /// names.
    ///
    /// # Safety
    ///
    /// The caller must have established that the slice is writable memory of
    /// the thread on whose behalf we're working, e.g. with `Thread::can_write`,
    /// and that it doesn't overlap `src`.
    unsafe fn write_from(&self, src: &[u8]) {
        debug_assert_eq!(src.len(), self.length);
        if self.length != 0 {
            // Safety: as for `read_into`, with the roles swapped.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    self.base_address as *mut u8,
                    self.length,
                );
            }
        }
    }
}

impl<T> Clone for USlice<T> {
    fn clone(&self) -> Self {
        Self {
            base_address: self.base_address,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

/// Can't `derive(Debug)` for `USlice` because that puts a `Debug` requirement
/// on `T`, and that's silly.
impl<T> core::fmt::Debug for USlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("USlice")
            .field("base_address", &self.base_address)
            .field("length", &self.length)
            .finish()
    }
}

/// Compatibility with the generic portable algorithms in `kerncore`.
impl<T> kerncore::UserRange for USlice<T> {
    fn base_addr(&self) -> usize {
        self.base_addr()
    }

    fn end_addr(&self) -> usize {
        self.end_addr()
    }

    fn is_empty(&self) -> bool {
        self.is_empty()
    }
}

fn memory_fault(fault: MemFault, address: usize) -> FaultInfo {
    FaultInfo::Memory { fault, address }
}

/// Failure of one of the allocating copy primitives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CopyError {
    /// The user buffer was bad. This is the thread's fault.
    Fault(FaultInfo),
    /// The thread's resource pool couldn't cover the copy. This is an
    /// ordinary condition the thread can recover from.
    NoMemory,
}

impl From<FaultInfo> for CopyError {
    fn from(f: FaultInfo) -> Self {
        Self::Fault(f)
    }
}

impl From<CopyError> for UserError {
    fn from(e: CopyError) -> Self {
        match e {
            CopyError::Fault(f) => Self::Unrecoverable(f),
            CopyError::NoMemory => {
                Self::Recoverable(ResponseCode::NoMemory.into(), NextThread::Same)
            }
        }
    }
}

/// Proves that `[ptr, ptr + len)` is memory `thread` may read, or write if
/// `write` is set.
///
/// Wraparound is reported as `Overflow`; anything else outside the thread's
/// regions is `RangeInvalid`.
pub fn validate_range(
    thread: &Thread,
    ptr: usize,
    len: usize,
    write: bool,
) -> Result<USlice<u8>, FaultInfo> {
    let slice = USlice::<u8>::from_raw(ptr, len)?;
    let ok = if write {
        thread.can_write(&slice)
    } else {
        thread.can_read(&slice)
    };
    if ok {
        Ok(slice)
    } else {
        Err(memory_fault(MemFault::RangeInvalid, ptr))
    }
}

/// As `validate_range`, for `nmemb` elements of `elem_size` bytes each. An
/// overflowing product is refused on its own, whatever the wrapped value
/// would have described.
pub fn validate_array_range(
    thread: &Thread,
    ptr: usize,
    nmemb: usize,
    elem_size: usize,
    write: bool,
) -> Result<USlice<u8>, FaultInfo> {
    let len = kerncore::checked_array_size(nmemb, elem_size)
        .ok_or(memory_fault(MemFault::Overflow, ptr))?;
    validate_range(thread, ptr, len, write)
}

/// Checks whether all of `[ptr, ptr + len)` is accessible to `thread`.
#[must_use]
pub fn check_range(thread: &Thread, ptr: usize, len: usize, write: bool) -> bool {
    validate_range(thread, ptr, len, write).is_ok()
}

/// Checks whether an array of `nmemb` elements of `elem_size` bytes at `ptr`
/// is accessible to `thread`.
#[must_use]
pub fn check_array_range(
    thread: &Thread,
    ptr: usize,
    nmemb: usize,
    elem_size: usize,
    write: bool,
) -> bool {
    validate_array_range(thread, ptr, nmemb, elem_size, write).is_ok()
}

/// Finds the length of the NUL-terminated string at `src`, looking at no more
/// than `max_len` bytes.
///
/// Returns `max_len` if no terminator turned up in that many readable bytes.
/// If the scan runs into memory the thread can't read before either of those
/// happens, that's an `AccessFault`, not the end of the string.
///
/// The result only says where the terminator was when we looked. Callers that
/// go on to copy the string must validate the range again.
pub fn bounded_strlen(
    thread: &Thread,
    src: usize,
    max_len: usize,
) -> Result<usize, FaultInfo> {
    let readable = thread.readable_prefix(src, max_len);
    for i in 0..readable {
        let p = src.wrapping_add(i) as *const u8;
        // Safety: every byte below `src + readable` lies in a region the
        // thread may read. Volatile because the thread may be changing it.
        let b = unsafe { core::ptr::read_volatile(p) };
        if b == 0 {
            return Ok(i);
        }
    }
    if readable == max_len {
        Ok(max_len)
    } else {
        Err(memory_fault(MemFault::AccessFault, src.wrapping_add(readable)))
    }
}

/// Copies `dst.len()` bytes from the thread's memory at `src`.
///
/// On failure `dst` is untouched.
pub fn copy_in(
    thread: &Thread,
    dst: &mut [u8],
    src: usize,
) -> Result<(), FaultInfo> {
    let slice = validate_range(thread, src, dst.len(), false)?;
    // Safety: validated for read on the previous line; `dst` is kernel memory
    // and so not in any thread region.
    unsafe { slice.read_into(dst) };
    Ok(())
}

/// Copies `src` into the thread's memory at `dst`.
///
/// On failure nothing is written.
pub fn copy_out(
    thread: &Thread,
    dst: usize,
    src: &[u8],
) -> Result<(), FaultInfo> {
    let slice = validate_range(thread, dst, src.len(), true)?;
    // Safety: validated for write on the previous line.
    unsafe { slice.write_from(src) };
    Ok(())
}

/// Copies `len` bytes at `src` into a new kernel buffer charged to the
/// thread's pool.
///
/// The range is validated before anything is allocated. If the copy fails
/// after allocation, the buffer is dropped and its charge returned.
pub fn alloc_copy_in(
    thread: &Thread,
    src: usize,
    len: usize,
) -> Result<OwnedBuffer, CopyError> {
    validate_range(thread, src, len, false)?;
    let mut buf = OwnedBuffer::alloc_zeroed(thread.pool(), len)
        .ok_or(CopyError::NoMemory)?;
    copy_in(thread, &mut buf, src)?;
    Ok(buf)
}

/// Copies the NUL-terminated string at `src` into a new kernel buffer charged
/// to the thread's pool. `max_len` bounds the string *including* its
/// terminator.
///
/// The allocation is sized from the measured length, never from anything the
/// thread said. A string with no terminator within `max_len` bytes is
/// `RangeInvalid`. The copy always ends in a NUL, even if the thread rewrote
/// its string between measurement and copy.
pub fn alloc_copy_in_cstring(
    thread: &Thread,
    src: usize,
    max_len: usize,
) -> Result<OwnedCString, CopyError> {
    let len = bounded_strlen(thread, src, max_len)?;
    if len >= max_len {
        return Err(memory_fault(MemFault::RangeInvalid, src).into());
    }
    // Can't overflow: len < max_len.
    let mut buf = alloc_copy_in(thread, src, len + 1)?;
    if let Some(last) = buf.last_mut() {
        *last = 0;
    }
    OwnedCString::from_terminated(buf)
        .ok_or(memory_fault(MemFault::RangeInvalid, src).into())
}
