// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault reporting, and support for recording kernel failures such that they
//! can be found by tooling.
//!
//! A thread that trips a boundary check doesn't get an error code back. The
//! dispatcher hands the fault to [`report`], which logs it, records it in the
//! trace, and then either terminates the thread or, if the kernel is
//! configured to treat any fault as fatal, takes the whole system down with
//! [`die`].
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `KERNEL_HAS_FAILED` is set when the kernel reaches `die`.
//!
//! - `KERNEL_EPITAPH` is an array of `EPITAPH_LEN` bytes. `die` writes as much
//!   of the failure reason into it (as UTF-8) as fits, truncating if the buffer
//!   fills. The number of bytes written isn't recorded anywhere; instead, for
//!   printing, trim off any trailing NUL bytes.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{FaultInfo, ThreadId};

use crate::startup::Kernel;
use crate::thread::NextThread;
use crate::trace::TraceEvent;

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

pub const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that caused the kernel to fail, padded with NULs.
static KERNEL_EPITAPH: spin::Mutex<[u8; EPITAPH_LEN]> =
    spin::Mutex::new([0; EPITAPH_LEN]);

/// Whether the kernel has died.
pub fn has_failed() -> bool {
    KERNEL_HAS_FAILED.load(Ordering::Acquire)
}

/// A copy of the epitaph, NUL padded.
pub fn epitaph() -> [u8; EPITAPH_LEN] {
    *KERNEL_EPITAPH.lock()
}

/// Records a fault against `caller` and carries out the consequences.
///
/// With `fatal_on_any_fault` this does not return. Otherwise the thread is
/// marked faulted, its permissions and objects are cleaned up as for an exit,
/// and the scheduler is told to pick someone else.
pub fn report(kernel: &Kernel, caller: ThreadId, fault: FaultInfo) -> NextThread {
    kernel.trace(line!(), TraceEvent::Fault {
        thread: caller,
        fault,
    });
    let config = kernel.config();
    if config.verbose_faults {
        log::warn!(target: "kern", "thread {caller} faulted: {fault}");
    } else {
        log::warn!(target: "kern", "thread {caller} faulted");
    }

    if config.fatal_on_any_fault {
        if config.verbose_faults {
            die(format_args!("fault in thread {caller}: {fault}"));
        } else {
            die(format_args!("fault in thread {caller}"));
        }
    }

    kernel.fault_thread(caller, fault)
}

fn begin_epitaph() -> spin::MutexGuard<'static, [u8; EPITAPH_LEN]> {
    if KERNEL_HAS_FAILED.swap(true, Ordering::AcqRel) {
        // Welp, we've been here before, suggesting a recursive failure. We
        // can't very well report it, since that'll just make the problem
        // worse.
        halt();
    }
    KERNEL_EPITAPH.lock()
}

/// Brings the system down, leaving `msg` in the epitaph.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    {
        let mut buf = begin_epitaph();
        let mut writer = Eulogist { dest: &mut buf[..] };
        write!(writer, "{msg}").ok();
    }
    log::error!(target: "kern", "kernel died: {msg}");
    halt()
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        fn halt() -> ! {
            loop {
                // Platform-independent NOP
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        #[panic_handler]
        fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
            die(info)
        }
    } else {
        /// Hosted builds unwind instead of spinning, so that whoever is
        /// driving the kernel can see it go.
        fn halt() -> ! {
            let epitaph = epitaph();
            let end = epitaph.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            panic!(
                "kernel died: {}",
                core::str::from_utf8(&epitaph[..end]).unwrap_or("<garbled>")
            )
        }
    }
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}
