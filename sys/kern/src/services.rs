// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary between the validation layer and the kernel services behind
//! it.
//!
//! Everything that reaches a `KernelServices` method has already been checked:
//! object handles are registered, of the right kind, initialized as the
//! operation requires and held by the caller, and any user memory has been
//! copied into kernel buffers. Implementations never see raw user addresses
//! and never need to re-check anything.
//!
//! Failures reported here are ordinary operating conditions and reach the
//! caller as response codes.

use abi::{PollType, ResponseCode, ThreadId, Timeout};

use crate::kobj::ObjectRef;
use crate::pool::OwnedBuffer;
use crate::thread::NextThread;

/// One validated entry of a `Poll` request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PollItem {
    pub kind: PollType,
    pub object: ObjectRef,
    /// Written by the service: non-zero if the event fired.
    pub state: u32,
}

/// Synchronization, IPC and console services, as seen from the dispatcher.
///
/// Operations that may block return the `NextThread` hint the scheduler
/// should act on; `NextThread::Same` means the caller keeps running.
pub trait KernelServices {
    fn mutex_init(&mut self, obj: &ObjectRef) -> Result<(), ResponseCode>;

    fn mutex_lock(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        timeout: Timeout,
    ) -> Result<NextThread, ResponseCode>;

    fn mutex_unlock(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
    ) -> Result<NextThread, ResponseCode>;

    /// Sets up a semaphore. Unacceptable counts (a zero limit, or an initial
    /// count above the limit) are `Invalid`.
    fn sem_init(
        &mut self,
        obj: &ObjectRef,
        initial: u32,
        limit: u32,
    ) -> Result<(), ResponseCode>;

    fn sem_take(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        timeout: Timeout,
    ) -> Result<NextThread, ResponseCode>;

    fn sem_give(&mut self, obj: &ObjectRef) -> Result<NextThread, ResponseCode>;

    /// Sets up a pipe around `buffer`, which was charged to the caller's
    /// resource pool. A pipe with no buffer only hands data directly between
    /// a waiting reader and writer.
    fn pipe_init(
        &mut self,
        obj: &ObjectRef,
        buffer: Option<OwnedBuffer>,
    ) -> Result<(), ResponseCode>;

    /// Writes as much of `data` as the pipe accepts and returns the count.
    fn pipe_write(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        data: &[u8],
    ) -> Result<usize, ResponseCode>;

    /// Fills as much of `dest` as the pipe can and returns the count.
    fn pipe_read(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        dest: &mut [u8],
    ) -> Result<usize, ResponseCode>;

    /// Waits for any of `items` to fire, recording which did in their `state`
    /// fields.
    fn poll(
        &mut self,
        caller: ThreadId,
        items: &mut [PollItem],
        timeout: Timeout,
    ) -> Result<NextThread, ResponseCode>;

    fn console_out(&mut self, caller: ThreadId, text: &[u8]);

    /// Called once a dynamic object has been released, after it has left the
    /// registry. Services holding state for it should drop that state here.
    fn object_released(&mut self, _obj: &ObjectRef) {}
}
