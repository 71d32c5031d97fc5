// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! # Syscall implementations
//!
//! Syscalls are implemented by functions with the signature:
//!
//! ```ignore
//! fn syscall(
//!     kernel: &Kernel,
//!     services: &mut dyn KernelServices,
//!     caller: ThreadId,
//!     frame: &mut dyn ArchState,
//! ) -> Result<NextThread, UserError>;
//! ```
//!
//! Each one decodes its arguments through an argument proxy on `frame`, runs
//! every object handle through the validator and every user buffer through the
//! memory bridge, and only then calls into `services`. On success it writes
//! its result into `frame` and returns a scheduling hint; on failure it
//! returns a `UserError`, which a common wrapper turns into either a response
//! code or a fault against the caller.
//!
//! Nothing the thread passed in is used before it has been checked, and
//! nothing is checked twice: handles are resolved once into `ObjectRef`s and
//! user memory is copied once into kernel buffers.

use core::convert::TryFrom;
use core::mem::size_of;

use alloc::sync::Arc;
use alloc::vec::Vec;

use abi::{
    FaultInfo, InitRequirement, KindMatch, ObjectKind, PollEvent, PollType,
    ResponseCode, Sysnum, ThreadId, UsageError,
};
use zerocopy::{FromBytes, IntoBytes};

use crate::err::UserError;
use crate::fail;
use crate::kobj::ObjectRef;
use crate::pool::OwnedBuffer;
use crate::services::{KernelServices, PollItem};
use crate::startup::Kernel;
use crate::thread::{ArchState, NextThread, Thread};
use crate::umem;

/// Longest panic message the kernel will bother to look at.
const PANIC_MSG_LEN: usize = 128;

/// Entry point for a syscall made by `caller`, whose saved registers are
/// `frame`.
///
/// Returns the scheduling hint for the architecture layer to act on. Faults
/// have already been dealt with by the time this returns.
pub fn syscall_entry(
    kernel: &Kernel,
    services: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> NextThread {
    let nr = frame.syscall_descriptor();
    let res = if kernel.with_thread(caller, Thread::is_running) != Some(true) {
        Err(UsageError::IllegalThread.into())
    } else {
        dispatch(kernel, services, caller, frame, nr)
    };
    let next = match res {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            frame.set_error_response(code);
            hint
        }
        Err(UserError::Unrecoverable(fault)) => {
            fail::report(kernel, caller, fault)
        }
    };

    // Anything released along the way, including by a fault cleanup, is
    // passed on to the services before anyone else runs.
    for obj in kernel.take_released() {
        services.object_released(&obj);
    }
    next
}

fn dispatch(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
    nr: u32,
) -> Result<NextThread, UserError> {
    let Ok(sysnum) = Sysnum::try_from(nr) else {
        // Bogus syscall number! That's a fault.
        return Err(UsageError::BadSyscallNumber.into());
    };
    match sysnum {
        Sysnum::ObjectAlloc => object_alloc(k, caller, frame),
        Sysnum::ObjectRelease => object_release(k, caller, frame),
        Sysnum::ObjectAccessGrant => object_access_grant(k, caller, frame),
        Sysnum::MutexInit => mutex_init(k, svc, caller, frame),
        Sysnum::MutexLock => mutex_lock(k, svc, caller, frame),
        Sysnum::MutexUnlock => mutex_unlock(k, svc, caller, frame),
        Sysnum::SemInit => sem_init(k, svc, caller, frame),
        Sysnum::SemTake => sem_take(k, svc, caller, frame),
        Sysnum::SemGive => sem_give(k, svc, caller, frame),
        Sysnum::PipeAllocInit => pipe_alloc_init(k, svc, caller, frame),
        Sysnum::PipeWrite => pipe_write(k, svc, caller, frame),
        Sysnum::PipeRead => pipe_read(k, svc, caller, frame),
        Sysnum::Poll => poll(k, svc, caller, frame),
        Sysnum::ThreadSpawn => thread_spawn(k, caller, frame),
        Sysnum::ThreadAbort => thread_abort(k, caller, frame),
        Sysnum::ThreadNameSet => thread_name_set(k, caller, frame),
        Sysnum::ThreadNameCopy => thread_name_copy(k, caller, frame),
        Sysnum::StrOut => str_out(k, svc, caller, frame),
        Sysnum::Panic => explicit_panic(k, caller, frame),
    }
}

/// Validates the object at `address` for an operation wanting `kind` in state
/// `init`. Any denial is a fault.
fn object(
    k: &Kernel,
    caller: ThreadId,
    address: usize,
    kind: ObjectKind,
    init: InitRequirement,
) -> Result<ObjectRef, UserError> {
    k.validate(caller, address, KindMatch::Exactly(kind), init)
        .map_err(|reason| UserError::denied(reason, address))
}

/// Runs `body` against the calling thread.
fn on_caller<R>(
    k: &Kernel,
    caller: ThreadId,
    body: impl FnOnce(&Thread) -> R,
) -> Result<R, UserError> {
    k.with_thread(caller, body)
        .ok_or(UsageError::IllegalThread.into())
}

/// Unwraps an argument the frame couldn't narrow to its real width.
fn narrow<T>(arg: Option<T>) -> Result<T, UserError> {
    arg.ok_or(UsageError::ArgumentTooWide.into())
}

/// Finds the thread bound to a validated thread object.
fn bound_thread(k: &Kernel, obj: &ObjectRef) -> Result<ThreadId, UserError> {
    k.thread_for_object(obj.address())
        .ok_or(UsageError::IllegalThread.into())
}

fn object_alloc(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_alloc_args();
    let kind = args
        .kind
        .and_then(|k| ObjectKind::try_from(k).ok())
        .ok_or(UsageError::BadObjectKind)?;
    let obj = k.alloc_object(caller, kind)?;
    frame.set_response(obj.address());
    Ok(NextThread::Same)
}

fn object_release(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let address = frame.as_object_args().object;
    let deny = |reason| UserError::denied(reason, address);
    let obj = k
        .validate(caller, address, KindMatch::Any, InitRequirement::DontCare)
        .map_err(deny)?;
    k.release_object(caller, &obj).map_err(deny)?;
    frame.set_response(0);
    Ok(NextThread::Same)
}

fn object_access_grant(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_grant_args();
    let obj = k
        .validate(caller, args.object, KindMatch::Any, InitRequirement::DontCare)
        .map_err(|reason| UserError::denied(reason, args.object))?;
    let target_obj = object(
        k,
        caller,
        args.thread_object,
        ObjectKind::Thread,
        InitRequirement::MustBeInitialized,
    )?;
    let target = bound_thread(k, &target_obj)?;
    k.grant(&obj, target)
        .map_err(|reason| UserError::denied(reason, args.object))?;
    frame.set_response(0);
    Ok(NextThread::Same)
}

/// Common tail of the constructors: the object goes live for the caller, and
/// only then does the service set it up.
fn finish_init(
    k: &Kernel,
    caller: ThreadId,
    obj: &ObjectRef,
    frame: &mut dyn ArchState,
    construct: impl FnOnce() -> Result<(), ResponseCode>,
) -> Result<NextThread, UserError> {
    k.construct_object(obj, caller, construct)?;
    frame.set_response(0);
    Ok(NextThread::Same)
}

fn mutex_init(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let address = frame.as_object_args().object;
    let obj = object(
        k,
        caller,
        address,
        ObjectKind::Mutex,
        InitRequirement::MustNotBeInitialized,
    )?;
    finish_init(k, caller, &obj, frame, || svc.mutex_init(&obj))
}

fn mutex_lock(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_timed_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Mutex,
        InitRequirement::MustBeInitialized,
    )?;
    let next = svc.mutex_lock(caller, &obj, narrow(args.timeout)?)?;
    frame.set_response(0);
    Ok(next)
}

fn mutex_unlock(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let address = frame.as_object_args().object;
    let obj = object(
        k,
        caller,
        address,
        ObjectKind::Mutex,
        InitRequirement::MustBeInitialized,
    )?;
    let next = svc.mutex_unlock(caller, &obj)?;
    frame.set_response(0);
    Ok(next)
}

fn sem_init(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_sem_init_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Semaphore,
        InitRequirement::MustNotBeInitialized,
    )?;
    let (initial, limit) = (narrow(args.initial)?, narrow(args.limit)?);
    finish_init(k, caller, &obj, frame, || svc.sem_init(&obj, initial, limit))
}

fn sem_take(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_timed_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Semaphore,
        InitRequirement::MustBeInitialized,
    )?;
    let next = svc.sem_take(caller, &obj, narrow(args.timeout)?)?;
    frame.set_response(0);
    Ok(next)
}

fn sem_give(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let address = frame.as_object_args().object;
    let obj = object(
        k,
        caller,
        address,
        ObjectKind::Semaphore,
        InitRequirement::MustBeInitialized,
    )?;
    let next = svc.sem_give(&obj)?;
    frame.set_response(0);
    Ok(next)
}

fn pipe_alloc_init(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_pipe_init_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Pipe,
        InitRequirement::MustNotBeInitialized,
    )?;
    let buffer = if args.size == 0 {
        None
    } else {
        let pool = on_caller(k, caller, |t| Arc::clone(t.pool()))?;
        Some(
            OwnedBuffer::alloc_zeroed(&pool, args.size)
                .ok_or(UserError::code(ResponseCode::NoMemory))?,
        )
    };
    finish_init(k, caller, &obj, frame, || svc.pipe_init(&obj, buffer))
}

fn pipe_write(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_transfer_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Pipe,
        InitRequirement::MustBeInitialized,
    )?;
    let data =
        on_caller(k, caller, |t| umem::alloc_copy_in(t, args.buffer, args.len))??;
    let n = svc.pipe_write(caller, &obj, &data)?;
    frame.set_response(n);
    Ok(NextThread::Same)
}

fn pipe_read(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_transfer_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Pipe,
        InitRequirement::MustBeInitialized,
    )?;
    // Check the destination before the service consumes anything.
    let pool = on_caller(k, caller, |t| {
        umem::validate_range(t, args.buffer, args.len, true)
            .map(|_| Arc::clone(t.pool()))
    })??;
    let mut staging = OwnedBuffer::alloc_zeroed(&pool, args.len)
        .ok_or(UserError::code(ResponseCode::NoMemory))?;
    let n = svc.pipe_read(caller, &obj, &mut staging)?.min(args.len);
    on_caller(k, caller, |t| umem::copy_out(t, args.buffer, &staging[..n]))??;
    frame.set_response(n);
    Ok(NextThread::Same)
}

fn poll(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_poll_args();
    let timeout = narrow(args.timeout)?;
    let stride = size_of::<PollEvent>();

    // The array is written back at the end, so it has to be writable now.
    let mut raw = on_caller(k, caller, |t| {
        umem::validate_array_range(t, args.events, args.count, stride, true)?;
        umem::alloc_copy_in(t, args.events, args.count * stride)
    })??;

    let mut items = Vec::new();
    items
        .try_reserve_exact(args.count)
        .map_err(|_| UserError::code(ResponseCode::NoMemory))?;
    for chunk in raw.chunks_exact(stride) {
        let event = PollEvent::read_from_bytes(chunk)
            .map_err(|_| UsageError::BadPollType)?;
        let kind = PollType::try_from(event.poll_type)
            .map_err(|_| UsageError::BadPollType)?;
        let obj = object(
            k,
            caller,
            event.object,
            kind.object_kind(),
            InitRequirement::MustBeInitialized,
        )?;
        items.push(PollItem {
            kind,
            object: obj,
            state: 0,
        });
    }

    let next = svc.poll(caller, &mut items, timeout)?;

    for (chunk, item) in raw.chunks_exact_mut(stride).zip(&items) {
        let mut event = PollEvent::read_from_bytes(chunk)
            .map_err(|_| UsageError::BadPollType)?;
        event.state = item.state;
        chunk.copy_from_slice(event.as_bytes());
    }
    on_caller(k, caller, |t| umem::copy_out(t, args.events, &raw))??;
    frame.set_response(items.iter().filter(|i| i.state != 0).count());
    Ok(next)
}

fn thread_spawn(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_spawn_args();
    let flags = args.flags.ok_or(UserError::code(ResponseCode::Invalid))?;
    let thread_obj = object(
        k,
        caller,
        args.thread_object,
        ObjectKind::Thread,
        InitRequirement::MustNotBeInitialized,
    )?;
    let stack_obj = object(
        k,
        caller,
        args.stack_object,
        ObjectKind::Stack,
        InitRequirement::MustNotBeInitialized,
    )?;
    let child = k.spawn(caller, &thread_obj, &stack_obj, flags)?;
    frame.set_response(child.index());
    Ok(NextThread::Same)
}

fn thread_abort(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let address = frame.as_object_args().object;
    let obj = object(
        k,
        caller,
        address,
        ObjectKind::Thread,
        InitRequirement::MustBeInitialized,
    )?;
    let target = bound_thread(k, &obj)?;
    k.exit_thread(target);
    if target == caller {
        Ok(NextThread::Other)
    } else {
        frame.set_response(0);
        Ok(NextThread::Same)
    }
}

fn thread_name_set(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_name_set_args();
    let obj = object(
        k,
        caller,
        args.thread_object,
        ObjectKind::Thread,
        InitRequirement::MustBeInitialized,
    )?;
    let target = bound_thread(k, &obj)?;
    let max = k.config().max_name_len;
    let name = on_caller(k, caller, |t| {
        umem::alloc_copy_in_cstring(t, args.string, max)
    })??;
    if !k.set_thread_name(target, name) {
        return Err(UsageError::IllegalThread.into());
    }
    frame.set_response(0);
    Ok(NextThread::Same)
}

fn thread_name_copy(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_transfer_args();
    let obj = object(
        k,
        caller,
        args.object,
        ObjectKind::Thread,
        InitRequirement::MustBeInitialized,
    )?;
    let target = bound_thread(k, &obj)?;
    let n = k.with_thread_table(|threads| -> Result<usize, UserError> {
        let me = threads.get(caller).ok_or(UsageError::IllegalThread)?;
        let them = threads.get(target).ok_or(UsageError::IllegalThread)?;
        let name = them.name().map_or(&b"\0"[..], |n| n.as_bytes_with_nul());
        if name.len() > args.len {
            return Err(UserError::code(ResponseCode::NoSpace));
        }
        umem::copy_out(me, args.buffer, name)?;
        Ok(name.len())
    })?;
    frame.set_response(n);
    Ok(NextThread::Same)
}

fn str_out(
    k: &Kernel,
    svc: &mut dyn KernelServices,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_message_args();
    let text =
        on_caller(k, caller, |t| umem::alloc_copy_in(t, args.buffer, args.len))??;
    svc.console_out(caller, &text);
    frame.set_response(0);
    Ok(NextThread::Same)
}

/// The thread wants out. Whatever it had to say is logged if we can read it;
/// either way, it gets the fault it asked for.
fn explicit_panic(
    k: &Kernel,
    caller: ThreadId,
    frame: &mut dyn ArchState,
) -> Result<NextThread, UserError> {
    let args = frame.as_message_args();
    let msg = k
        .with_thread(caller, |t| {
            umem::alloc_copy_in(t, args.buffer, args.len.min(PANIC_MSG_LEN))
                .ok()
        })
        .flatten();
    if let Some(msg) = msg {
        log::warn!(
            target: "kern",
            "thread {caller} panicked: {}",
            core::str::from_utf8(&msg).unwrap_or("<not utf-8>")
        );
    }
    Err(FaultInfo::Panic.into())
}
