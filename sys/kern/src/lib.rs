// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel syscall validation and object permissions.
//!
//! This is the part of the kernel that stands between user threads and
//! everything else. Every syscall argument that names a kernel object is
//! checked against a registry of real objects and a per-object set of threads
//! allowed to use it; every pointer is checked against the memory regions the
//! calling thread owns before the kernel reads or writes through it. Only
//! arguments that survive are handed to the kernel services behind
//! [`services::KernelServices`].
//!
//! # Design principles
//!
//! 1. Static configuration. The objects and threads present at boot are fixed
//!    at build time and handed to [`startup::Kernel::new`] as tables.
//! 2. Fail closed. Anything the kernel can't prove is fine is a fault against
//!    the thread that asked for it.
//! 3. A strong preference for safe code where reasonable. The only `unsafe` is
//!    the actual movement of bytes to and from validated user memory.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

/// Kernel debug logging. Compiles to nothing unless a `log` backend is
/// installed and listening on the `kern` target.
macro_rules! klog {
    ($($arg:tt)*) => {
        log::debug!(target: "kern", $($arg)*)
    };
}

// Provides MAX_THREADS and TRACE_DEPTH.
include!(concat!(env!("OUT_DIR"), "/consts.rs"));

static_assertions::const_assert!(MAX_THREADS > 0 && MAX_THREADS <= 1024);

pub mod config;
pub mod descs;
pub mod err;
pub mod fail;
pub mod kobj;
pub mod perms;
pub mod pool;
pub mod services;
pub mod startup;
pub mod syscalls;
pub mod thread;
pub mod trace;
pub mod umem;
pub mod validate;

pub use startup::Kernel;
