// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the syscall dispatcher.

mod support;

use abi::{
    DenyReason, FaultInfo, InitRequirement, KindMatch, MemFault, ObjectKind,
    PollEvent, ResponseCode, SpawnFlags, Sysnum, ThreadId, Timeout, UsageError,
};
use kern::config::KernelConfig;
use kern::thread::{NextThread, ThreadState};
use kern::trace::TraceEvent;
use zerocopy::{FromBytes, IntoBytes};

use support::*;

fn fault_of(w: &World, t: ThreadId) -> Option<FaultInfo> {
    match w.kernel.thread_state(t) {
        Some(ThreadState::Faulted(f)) => Some(f),
        _ => None,
    }
}

fn denied(reason: DenyReason, address: usize) -> Option<FaultInfo> {
    Some(FaultInfo::Object { reason, address })
}

fn alloc(w: &mut World, t: ThreadId, kind: ObjectKind) -> usize {
    w.ok(t, Sysnum::ObjectAlloc, &[kind as usize])
}

#[test]
fn ungranted_thread_is_terminated_before_reaching_the_mutex() {
    let mut w = World::new();
    let m = alloc(&mut w, A, ObjectKind::Mutex);
    w.ok(A, Sysnum::MutexInit, &[m]);
    assert_eq!(w.svc.calls, vec![Call::MutexInit(m)]);

    let (next, _) =
        w.call(B, Sysnum::MutexLock, &[m, Timeout::FOREVER.0 as usize]);
    assert_eq!(next, NextThread::Other);
    assert_eq!(fault_of(&w, B), denied(DenyReason::NotPermitted, m));
    // The mutex never heard about it.
    assert_eq!(w.svc.calls, vec![Call::MutexInit(m)]);
    // And B can't come back.
    let (_, frame) = w.call(B, Sysnum::MutexUnlock, &[m]);
    assert_eq!(frame.ret0, 0);
    assert_eq!(w.svc.calls.len(), 1);
}

#[test]
fn granted_thread_may_take_the_mutex() {
    let mut w = World::new();
    let m = alloc(&mut w, A, ObjectKind::Mutex);
    w.ok(A, Sysnum::MutexInit, &[m]);

    // Naming B takes a grant on B's thread object.
    w.give(T_B, A);
    w.ok(A, Sysnum::ObjectAccessGrant, &[m, T_B]);
    w.ok(B, Sysnum::MutexLock, &[m, 10]);
    w.ok(B, Sysnum::MutexUnlock, &[m]);
    assert_eq!(
        w.svc.calls,
        vec![
            Call::MutexInit(m),
            Call::MutexLock(B, m),
            Call::MutexUnlock(B, m),
        ]
    );
}

#[test]
fn garbage_handle_is_unknown_and_never_reaches_services() {
    let mut w = World::new();
    for nr in [Sysnum::MutexLock, Sysnum::SemGive, Sysnum::ObjectRelease] {
        let mut w2 = World::new();
        w2.call(A, nr, &[0xDEAD_BEEF]);
        assert_eq!(fault_of(&w2, A), denied(DenyReason::UnknownObject, 0xDEAD_BEEF));
        assert!(w2.svc.calls.is_empty());
    }

    w.call(A, Sysnum::MutexLock, &[0xDEAD_BEEF]);
    assert!(w.kernel.trace_entries().iter().any(|e| e.payload
        == TraceEvent::Denied {
            thread: A,
            address: 0xDEAD_BEEF,
            reason: DenyReason::UnknownObject,
        }));
}

#[test]
fn bad_syscall_numbers_and_dead_callers_fault() {
    let mut w = World::new();
    let mut frame = kern::thread::SyscallFrame::new(99, &[]);
    let next = kern::syscalls::syscall_entry(&w.kernel, &mut w.svc, A, &mut frame);
    assert_eq!(next, NextThread::Other);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::SyscallUsage(UsageError::BadSyscallNumber))
    );

    // A thread id with nothing behind it.
    w.call(ThreadId(40), Sysnum::StrOut, &[0, 0]);
    assert!(w.svc.calls.is_empty());
}

#[test]
fn wrong_type_and_init_state_are_faults() {
    let mut w = World::new();
    let s = alloc(&mut w, A, ObjectKind::Semaphore);
    w.call(A, Sysnum::MutexInit, &[s]);
    assert_eq!(fault_of(&w, A), denied(DenyReason::WrongType, s));

    let mut w = World::new();
    let s = alloc(&mut w, A, ObjectKind::Semaphore);
    w.call(A, Sysnum::SemTake, &[s, 0]);
    assert_eq!(fault_of(&w, A), denied(DenyReason::Uninitialized, s));

    let mut w = World::new();
    w.call(A, Sysnum::SemInit, &[PUBLIC_SEM, 0, 1]);
    assert_eq!(
        fault_of(&w, A),
        denied(DenyReason::AlreadyInitialized, PUBLIC_SEM)
    );
}

#[test]
fn recoverable_errors_come_back_as_codes() {
    let mut w = World::new();
    let s = alloc(&mut w, A, ObjectKind::Semaphore);
    let (_, frame) = w.call(A, Sysnum::SemInit, &[s, 3, 1]);
    assert_eq!(frame.ret0, ResponseCode::Invalid as u32);
    // Still uninitialized, so a well-formed retry works.
    w.ok(A, Sysnum::SemInit, &[s, 0, 1]);

    let (next, frame) = w.call(A, Sysnum::SemTake, &[s, 0]);
    assert_eq!(next, NextThread::Same);
    assert_eq!(frame.ret0, ResponseCode::WouldBlock as u32);

    // Everyone may use the public semaphore.
    let (next, frame) = w.call(B, Sysnum::SemTake, &[PUBLIC_SEM, 5]);
    assert_eq!((next, frame.ret0), (NextThread::Other, 0));
    w.ok(B, Sysnum::SemGive, &[PUBLIC_SEM]);
}

#[test]
fn refused_construction_leaves_the_object_as_it_was() {
    let mut w = World::new();
    let s = alloc(&mut w, A, ObjectKind::Semaphore);
    let obj = w.kernel.find(s).unwrap();
    w.kernel.make_public(&obj).unwrap();

    // B only gets in because the semaphore is public.
    let (_, frame) = w.call(B, Sysnum::SemInit, &[s, 0, 0]);
    assert_eq!(frame.ret0, ResponseCode::Invalid as u32);
    assert!(!w.kernel.permissions_view(B).contains(&s));
    let untouched = w.kernel.validate(
        A,
        s,
        KindMatch::Exactly(ObjectKind::Semaphore),
        InitRequirement::MustNotBeInitialized,
    );
    assert_eq!(untouched.map(|o| o.address()), Ok(s));
    assert!(w.svc.calls.is_empty());

    w.ok(B, Sysnum::SemInit, &[s, 1, 2]);
    assert!(w.kernel.permissions_view(B).contains(&s));

    // A second constructor is turned away before the service hears of it.
    w.call(A, Sysnum::SemInit, &[s, 0, 1]);
    assert_eq!(fault_of(&w, A), denied(DenyReason::AlreadyInitialized, s));
    assert_eq!(w.svc.calls, vec![Call::SemInit(s, 1, 2)]);
}

#[test]
fn allocation_respects_configuration() {
    let mut w = World::with_config(KernelConfig {
        dynamic_objects: false,
        ..KernelConfig::DEFAULT
    });
    let (_, frame) = w.call(A, Sysnum::ObjectAlloc, &[ObjectKind::Mutex as usize]);
    assert_eq!(frame.ret0, ResponseCode::NotSupported as u32);

    let mut w = World::new();
    w.call(A, Sysnum::ObjectAlloc, &[ObjectKind::Stack as usize]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::SyscallUsage(UsageError::BadObjectKind))
    );

    let mut w = World::new();
    w.call(A, Sysnum::ObjectAlloc, &[77]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::SyscallUsage(UsageError::BadObjectKind))
    );
}

#[cfg(target_pointer_width = "64")]
#[test]
fn high_bits_in_narrow_arguments_fault() {
    let wide = (1usize << 32) | ObjectKind::Mutex as usize;

    let mut w = World::new();
    w.call(A, Sysnum::ObjectAlloc, &[wide]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::SyscallUsage(UsageError::BadObjectKind))
    );

    let mut w = World::new();
    let s = alloc(&mut w, A, ObjectKind::Semaphore);
    w.call(A, Sysnum::SemInit, &[s, 0, wide]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::SyscallUsage(UsageError::ArgumentTooWide))
    );
    assert!(w.svc.calls.is_empty());

    let mut w = World::new();
    w.call(B, Sysnum::SemTake, &[PUBLIC_SEM, 1usize << 32]);
    assert_eq!(
        fault_of(&w, B),
        Some(FaultInfo::SyscallUsage(UsageError::ArgumentTooWide))
    );
    assert!(w.svc.calls.is_empty());
}

#[test]
fn pipe_moves_bytes_and_returns_its_memory() {
    let mut w = World::new();
    let pool_used = |w: &World| {
        w.kernel.with_thread(A, |t| t.pool().used()).unwrap()
    };

    let p = alloc(&mut w, A, ObjectKind::Pipe);
    w.ok(A, Sysnum::PipeAllocInit, &[p, 8]);
    assert_eq!(pool_used(&w), 64 + 8);

    w.ram_a.write(0, b"0123456789");
    let n = w.ok(A, Sysnum::PipeWrite, &[p, w.ram_a.addr(0), 10]);
    assert_eq!(n, 8);

    let n = w.ok(A, Sysnum::PipeRead, &[p, w.ram_a.addr(0x100), 5]);
    assert_eq!(n, 5);
    assert_eq!(w.ram_a.read(0x100, 5), b"01234");

    // Transient copies have been given back.
    assert_eq!(pool_used(&w), 64 + 8);

    w.ok(A, Sysnum::ObjectRelease, &[p]);
    assert_eq!(w.svc.calls.last(), Some(&Call::Released(p)));
    assert_eq!(pool_used(&w), 0);

    // The handle is dead now.
    w.call(A, Sysnum::PipeRead, &[p, w.ram_a.addr(0), 1]);
    assert_eq!(fault_of(&w, A), denied(DenyReason::UnknownObject, p));
}

#[test]
fn pipe_read_checks_destination_before_consuming() {
    let mut w = World::new();
    let p = alloc(&mut w, A, ObjectKind::Pipe);
    w.ok(A, Sysnum::PipeAllocInit, &[p, 8]);
    w.ram_a.write(0, b"abc");
    w.ok(A, Sysnum::PipeWrite, &[p, w.ram_a.addr(0), 3]);

    // B's memory isn't A's to write.
    let bad = w.ram_b.addr(0);
    w.call(A, Sysnum::PipeRead, &[p, bad, 3]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::Memory {
            fault: MemFault::RangeInvalid,
            address: bad,
        })
    );
    assert!(!w.svc.calls.iter().any(|c| matches!(c, Call::PipeRead(..))));
}

#[test]
fn console_output_is_copied_in() {
    let mut w = World::new();
    w.ram_a.write(0x10, b"hello");
    w.ok(A, Sysnum::StrOut, &[w.ram_a.addr(0x10), 5]);
    assert_eq!(w.svc.calls, vec![Call::ConsoleOut(A, b"hello".to_vec())]);

    // Running off the end of the region.
    let start = w.ram_a.addr(RAM_SIZE - 2);
    w.call(A, Sysnum::StrOut, &[start, 4]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::Memory {
            fault: MemFault::RangeInvalid,
            address: start,
        })
    );
}

#[test]
fn thread_names_round_trip() {
    let mut w = World::new();
    w.ram_a.write(0, b"alpha\0");
    w.ok(A, Sysnum::ThreadNameSet, &[T_A, w.ram_a.addr(0)]);

    let (_, frame) = w.call(A, Sysnum::ThreadNameCopy, &[T_A, w.ram_a.addr(0x40), 3]);
    assert_eq!(frame.ret0, ResponseCode::NoSpace as u32);

    let n = w.ok(A, Sysnum::ThreadNameCopy, &[T_A, w.ram_a.addr(0x40), 16]);
    assert_eq!(n, 6);
    assert_eq!(w.ram_a.read(0x40, 6), b"alpha\0");
}

#[test]
fn unterminated_name_is_refused() {
    let mut w = World::new();
    let name = [b'x'; 64];
    w.ram_a.write(0, &name);
    w.call(A, Sysnum::ThreadNameSet, &[T_A, w.ram_a.addr(0)]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::Memory {
            fault: MemFault::RangeInvalid,
            address: w.ram_a.addr(0),
        })
    );
}

#[test]
fn poll_validates_every_event_and_writes_states_back() {
    let mut w = World::new();
    let s = alloc(&mut w, A, ObjectKind::Semaphore);
    w.ok(A, Sysnum::SemInit, &[s, 1, 1]);
    let p = alloc(&mut w, A, ObjectKind::Pipe);
    w.ok(A, Sysnum::PipeAllocInit, &[p, 0]);
    w.svc.ready.push(s);

    let events = [
        PollEvent {
            object: s,
            poll_type: abi::PollType::SemAvailable as u32,
            state: 0,
        },
        PollEvent {
            object: p,
            poll_type: abi::PollType::PipeData as u32,
            state: 0,
        },
    ];
    w.ram_a.write(0, events.as_bytes());
    let fired = w.ok(A, Sysnum::Poll, &[w.ram_a.addr(0), 2, 0]);
    assert_eq!(fired, 1);
    assert!(w.svc.calls.contains(&Call::Poll(A, vec![s, p])));

    let size = core::mem::size_of::<PollEvent>();
    let back = w.ram_a.read(0, 2 * size);
    let first = PollEvent::read_from_bytes(&back[..size]).ok().unwrap();
    let second = PollEvent::read_from_bytes(&back[size..]).ok().unwrap();
    assert_eq!(first.state, 1);
    assert_eq!(second.state, 0);
}

#[test]
fn poll_rejects_bad_types_and_mismatched_objects() {
    let mut w = World::new();
    let bogus = PollEvent {
        object: PUBLIC_SEM,
        poll_type: 9,
        state: 0,
    };
    w.ram_a.write(0, bogus.as_bytes());
    w.call(A, Sysnum::Poll, &[w.ram_a.addr(0), 1, 0]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::SyscallUsage(UsageError::BadPollType))
    );

    let mut w = World::new();
    let mismatched = PollEvent {
        object: PUBLIC_SEM,
        poll_type: abi::PollType::PipeData as u32,
        state: 0,
    };
    w.ram_a.write(0, mismatched.as_bytes());
    w.call(A, Sysnum::Poll, &[w.ram_a.addr(0), 1, 0]);
    assert_eq!(fault_of(&w, A), denied(DenyReason::WrongType, PUBLIC_SEM));
    assert!(w.svc.calls.is_empty());
}

#[test]
fn poll_count_overflow_is_refused() {
    let mut w = World::new();
    let base = w.ram_a.addr(0);
    // Wraps to a tiny product on any address width.
    let count = usize::MAX / core::mem::size_of::<PollEvent>() + 2;
    w.call(A, Sysnum::Poll, &[base, count, 0]);
    assert_eq!(
        fault_of(&w, A),
        Some(FaultInfo::Memory {
            fault: MemFault::Overflow,
            address: base,
        })
    );
}

#[test]
fn spawn_with_inheritance_copies_permissions() {
    let mut w = World::new();
    w.give(T_SPARE, A);
    w.give(STACK, A);
    let m = alloc(&mut w, A, ObjectKind::Mutex);
    w.ok(A, Sysnum::MutexInit, &[m]);

    let child = w.ok(
        A,
        Sysnum::ThreadSpawn,
        &[T_SPARE, STACK, SpawnFlags::INHERIT_PERMS.bits() as usize],
    );
    let child = ThreadId(child as u16);
    assert_eq!(w.kernel.thread_state(child), Some(ThreadState::Running));

    let mut parent_view = w.kernel.permissions_view(A);
    let mut child_view = w.kernel.permissions_view(child);
    parent_view.sort_unstable();
    child_view.sort_unstable();
    assert_eq!(child_view, parent_view);

    // The child can use what it inherited, and its parent's memory.
    w.ok(child, Sysnum::MutexLock, &[m, 0]);
    w.ram_a.write(0, b"hi");
    w.ok(child, Sysnum::StrOut, &[w.ram_a.addr(0), 2]);

    // Neither object can be spawned on again while the child lives.
    w.call(A, Sysnum::ThreadSpawn, &[T_SPARE, STACK, 0]);
    assert_eq!(
        fault_of(&w, A),
        denied(DenyReason::AlreadyInitialized, T_SPARE)
    );
}

#[test]
fn spawn_without_inheritance_starts_bare() {
    let mut w = World::new();
    w.give(T_SPARE, A);
    w.give(STACK, A);
    let m = alloc(&mut w, A, ObjectKind::Mutex);
    w.ok(A, Sysnum::MutexInit, &[m]);

    let child = ThreadId(w.ok(A, Sysnum::ThreadSpawn, &[T_SPARE, STACK, 0]) as u16);
    let mut view = w.kernel.permissions_view(child);
    view.sort_unstable();
    assert_eq!(view, vec![T_SPARE, STACK]);

    w.call(child, Sysnum::MutexLock, &[m, 0]);
    assert_eq!(fault_of(&w, child), denied(DenyReason::NotPermitted, m));
}

#[test]
fn undefined_spawn_flags_are_invalid() {
    let mut w = World::new();
    w.give(T_SPARE, A);
    w.give(STACK, A);
    let (_, frame) = w.call(A, Sysnum::ThreadSpawn, &[T_SPARE, STACK, 0x80]);
    assert_eq!(frame.ret0, ResponseCode::Invalid as u32);
    assert_eq!(w.kernel.thread_state(A), Some(ThreadState::Running));
}

#[test]
fn abort_cleans_up_and_frees_objects_for_reuse() {
    let mut w = World::new();
    w.give(T_SPARE, A);
    w.give(STACK, A);
    let child = ThreadId(w.ok(A, Sysnum::ThreadSpawn, &[T_SPARE, STACK, 0]) as u16);

    // A dynamic object only the child holds.
    let e = alloc(&mut w, child, ObjectKind::Event);

    let (next, _) = w.call(A, Sysnum::ThreadAbort, &[T_SPARE]);
    assert_eq!(next, NextThread::Same);
    assert_eq!(w.kernel.thread_state(child), Some(ThreadState::Exited));
    assert!(w.kernel.permissions_view(child).is_empty());
    assert!(w.svc.calls.contains(&Call::Released(e)));

    // Thread and stack objects are back to uninitialized, so they can carry a
    // new thread.
    let again = ThreadId(w.ok(A, Sysnum::ThreadSpawn, &[T_SPARE, STACK, 0]) as u16);
    assert_eq!(w.kernel.thread_state(again), Some(ThreadState::Running));
}

#[test]
fn spawning_on_fresh_objects_outlasts_the_thread_table() {
    let rounds = 2 * kern::MAX_THREADS + 8;
    let mut w = World::with_pools(
        KernelConfig {
            max_dynamic_objects: 4 * kern::MAX_THREADS + 16,
            ..KernelConfig::DEFAULT
        },
        1 << 20,
    );
    w.give(STACK, A);

    let mut spawned = 0;
    let mut pads = Vec::new();
    for _ in 0..rounds {
        let t = alloc(&mut w, A, ObjectKind::Thread);
        let child = ThreadId(w.ok(A, Sysnum::ThreadSpawn, &[t, STACK, 0]) as u16);
        spawned += 1;

        let (next, _) = w.call(child, Sysnum::ThreadAbort, &[t]);
        assert_eq!(next, NextThread::Other);
        w.ok(A, Sysnum::ObjectRelease, &[t]);

        // Keeps the next thread object from landing on the released one.
        pads.push(alloc(&mut w, A, ObjectKind::Thread));
    }
    assert_eq!(spawned, rounds);

    // Whoever ends up in a recycled slot starts with nothing of its
    // predecessor's.
    let t = alloc(&mut w, A, ObjectKind::Thread);
    let child = ThreadId(w.ok(A, Sysnum::ThreadSpawn, &[t, STACK, 0]) as u16);
    let mut view = w.kernel.permissions_view(child);
    view.sort_unstable();
    let mut expected = vec![t, STACK];
    expected.sort_unstable();
    assert_eq!(view, expected);
}

#[test]
fn self_abort_switches_away() {
    let mut w = World::new();
    let (next, _) = w.call(B, Sysnum::ThreadAbort, &[T_B]);
    assert_eq!(next, NextThread::Other);
    assert_eq!(w.kernel.thread_state(B), Some(ThreadState::Exited));
    assert!(w.kernel.reap(B));
    assert_eq!(w.kernel.thread_state(B), None);
}

#[test]
fn panic_always_faults() {
    let mut w = World::new();
    w.ram_b.write(0, b"oh no");
    let (next, _) = w.call(B, Sysnum::Panic, &[w.ram_b.addr(0), 5]);
    assert_eq!(next, NextThread::Other);
    assert_eq!(fault_of(&w, B), Some(FaultInfo::Panic));

    // Even with a message it can't read.
    let mut w = World::new();
    w.call(B, Sysnum::Panic, &[0x10, 5]);
    assert_eq!(fault_of(&w, B), Some(FaultInfo::Panic));
}

#[test]
fn exit_releases_objects_granted_only_to_the_dead() {
    let mut w = World::new();
    let s = alloc(&mut w, B, ObjectKind::Semaphore);
    w.ok(B, Sysnum::SemInit, &[s, 0, 1]);
    w.give(T_A, B);
    w.ok(B, Sysnum::ObjectAccessGrant, &[s, T_A]);

    w.call(B, Sysnum::MutexLock, &[s, 0]);
    assert_eq!(fault_of(&w, B), denied(DenyReason::WrongType, s));
    // A still holds it, so it survives.
    w.ok(A, Sysnum::SemGive, &[s]);
    assert!(!w.svc.calls.contains(&Call::Released(s)));

    w.ok(A, Sysnum::ObjectRelease, &[s]);
    assert!(w.svc.calls.contains(&Call::Released(s)));
}
