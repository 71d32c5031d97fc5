// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`.

use abi::{DenyReason, FaultInfo, ResponseCode, UsageError};

use crate::thread::NextThread;

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// thread by returning a response code (the `u32` field). They may still
    /// cause a context switch, however, as indicated by the `NextThread`.
    Recoverable(u32, NextThread),
    /// An unrecoverable error. Unrecoverable errors are translated to faults
    /// against the errant thread, which is terminated.
    Unrecoverable(FaultInfo),
}

impl UserError {
    /// Shorthand for a recoverable error that doesn't affect scheduling.
    pub fn code(rc: ResponseCode) -> Self {
        Self::Recoverable(rc.into(), NextThread::Same)
    }

    /// Wraps a validator denial for the object at `address`.
    pub fn denied(reason: DenyReason, address: usize) -> Self {
        Self::Unrecoverable(FaultInfo::Object { reason, address })
    }
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}

/// Recoverable response codes pass straight through to the caller.
impl From<ResponseCode> for UserError {
    fn from(rc: ResponseCode) -> Self {
        Self::code(rc)
    }
}
