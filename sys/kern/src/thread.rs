// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads, as far as the validation layer cares about them.
//!
//! A thread here is an identity (its slot), the kernel object that represents
//! it, the memory regions it may touch, the resource pool it allocates from,
//! and a coarse lifecycle state. Scheduling lives elsewhere.

use alloc::sync::Arc;
use alloc::vec::Vec;

use abi::{FaultInfo, ResponseCode, SpawnFlags, ThreadId, Timeout, UsageError};

use crate::descs::{RegionAttributes, RegionDesc};
use crate::err::UserError;
use crate::kobj::ObjectRef;
use crate::pool::{OwnedCString, ResourcePool};
use crate::startup::Kernel;
use crate::trace::TraceEvent;
use crate::umem::USlice;
use crate::MAX_THREADS;

/// Coarse lifecycle state of a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Being set up by the kernel; may not make syscalls yet.
    Initializing,
    /// Running (or runnable; the difference isn't our concern).
    Running,
    /// Terminated by the kernel for the recorded reason.
    Faulted(FaultInfo),
    /// Terminated by its own request or a peer's.
    Exited,
}

impl ThreadState {
    /// Whether the thread is gone and its slot can be reclaimed.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Faulted(_) | Self::Exited)
    }
}

/// Reasons a region table can't be given to a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionError {
    /// The region at this base wraps around the top of the address space.
    Wraps(usize),
    /// The region at this base overlaps another.
    Overlaps(usize),
}

/// Internal representation of a thread.
#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    /// Address of the `Thread` kernel object standing for this thread.
    object: usize,
    /// Address of the `Stack` object this thread runs on, if the kernel gave
    /// it one at spawn.
    stack: Option<usize>,
    state: ThreadState,
    /// Sorted by base address, non-overlapping.
    regions: Vec<RegionDesc>,
    pool: Arc<ResourcePool>,
    name: Option<OwnedCString>,
}

impl Thread {
    /// Creates a thread in the `Initializing` state. The region table is
    /// sorted and checked here.
    pub fn new(
        id: ThreadId,
        object: usize,
        stack: Option<usize>,
        mut regions: Vec<RegionDesc>,
        pool: Arc<ResourcePool>,
    ) -> Result<Self, RegionError> {
        regions.sort_unstable_by_key(|r| r.base);
        for r in &regions {
            if !r.is_well_formed() {
                return Err(RegionError::Wraps(r.base));
            }
        }
        for pair in regions.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(RegionError::Overlaps(pair[1].base));
            }
        }
        Ok(Self {
            id,
            object,
            stack,
            state: ThreadState::Initializing,
            regions,
            pool,
            name: None,
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn object(&self) -> usize {
        self.object
    }

    pub fn stack(&self) -> Option<usize> {
        self.stack
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub fn is_running(&self) -> bool {
        self.state == ThreadState::Running
    }

    pub fn regions(&self) -> &[RegionDesc] {
        &self.regions
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn name(&self) -> Option<&OwnedCString> {
        self.name.as_ref()
    }

    pub fn set_name(&mut self, name: OwnedCString) {
        self.name = Some(name);
    }

    /// Tests whether this thread can read every byte of `slice` as normal
    /// memory.
    ///
    /// This function is `must_use` because calling it without checking its
    /// return value is incredibly suspicious.
    #[must_use]
    pub fn can_read<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access(slice, RegionAttributes::READ)
    }

    /// Tests whether this thread can write every byte of `slice` as normal
    /// memory.
    #[must_use]
    pub fn can_write<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access(slice, RegionAttributes::WRITE)
    }

    /// Tests whether this thread has access to `slice` through regions that
    /// carry all of the `desired` attributes.
    ///
    /// Memory marked `DEVICE` is always refused, because touching it may have
    /// side effects.
    ///
    /// Note that all threads can "access" any empty slice.
    #[must_use]
    fn can_access<T>(
        &self,
        slice: &USlice<T>,
        desired: RegionAttributes,
    ) -> bool {
        kerncore::can_access(slice, &self.regions, |region| {
            region.attributes.contains(desired)
                && !region.attributes.contains(RegionAttributes::DEVICE)
        })
    }

    /// Counts the readable bytes starting at `base`, looking at no more than
    /// `limit` of them.
    pub fn readable_prefix(&self, base: usize, limit: usize) -> usize {
        kerncore::accessible_prefix(base, limit, &self.regions, |region| {
            region.attributes.contains(RegionAttributes::READ)
                && !region.attributes.contains(RegionAttributes::DEVICE)
        })
    }
}

/// The thread table. A thread's position in it is its `ThreadId`.
#[derive(Debug, Default)]
pub struct ThreadTable {
    slots: Vec<Option<Thread>>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Picks the lowest free slot, without claiming it.
    pub fn vacant(&self) -> Option<ThreadId> {
        let i = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
        if i < MAX_THREADS {
            u16::try_from(i).ok().map(ThreadId)
        } else {
            None
        }
    }

    /// Installs `thread` at its own slot, which must be vacant.
    pub fn insert(&mut self, thread: Thread) -> Result<(), Thread> {
        let i = thread.id.index();
        if i >= MAX_THREADS {
            return Err(thread);
        }
        if self.slots.len() <= i {
            self.slots.resize_with(i + 1, || None);
        }
        match &self.slots[i] {
            None => {
                self.slots[i] = Some(thread);
                Ok(())
            }
            Some(_) => Err(thread),
        }
    }

    /// Frees the slot of a dead thread. Living threads are left in place.
    pub fn reap(&mut self, id: ThreadId) -> Option<Thread> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.as_ref().is_some_and(|t| t.state.is_dead()) {
            slot.take()
        } else {
            None
        }
    }

    /// Frees every slot held by a dead thread. Returns how many were freed.
    pub fn reap_dead(&mut self) -> usize {
        let mut freed = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|t| t.state.is_dead()) {
                *slot = None;
                freed += 1;
            }
        }
        freed
    }

    /// Finds the thread represented by the kernel object at `object`.
    pub fn by_object(&self, object: usize) -> Option<ThreadId> {
        self.iter().find(|t| t.object == object).map(|t| t.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> + '_ {
        self.slots.iter().flatten()
    }
}

/// Interface to a thread's saved syscall registers. This gives the dispatcher
/// access to syscall arguments and results independently of how a particular
/// architecture traps into the kernel.
///
/// Implementors provide the `argX` and `retX` functions plus
/// `syscall_descriptor`, and the rest of the trait (such as the argument proxy
/// types) will just work.
pub trait ArchState {
    /// Reads syscall argument register 0.
    fn arg0(&self) -> usize;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> usize;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> usize;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> usize;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> usize;
    /// Reads syscall argument register 5.
    fn arg5(&self) -> usize;

    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes syscall return argument 0, the response code.
    fn ret0(&mut self, _: u32);
    /// Writes syscall return argument 1, the value.
    fn ret1(&mut self, _: usize);

    /// Interprets arguments as for syscalls taking a single object handle.
    fn as_object_args(&self) -> ObjectArgs {
        ObjectArgs {
            object: self.arg0(),
        }
    }

    /// Interprets arguments as for the `OBJECT_ALLOC` syscall.
    fn as_alloc_args(&self) -> AllocArgs {
        AllocArgs {
            kind: u32::try_from(self.arg0()).ok(),
        }
    }

    /// Interprets arguments as for the `OBJECT_ACCESS_GRANT` syscall.
    fn as_grant_args(&self) -> GrantArgs {
        GrantArgs {
            object: self.arg0(),
            thread_object: self.arg1(),
        }
    }

    /// Interprets arguments as for blocking operations on one object.
    fn as_timed_args(&self) -> TimedArgs {
        TimedArgs {
            object: self.arg0(),
            timeout: u32::try_from(self.arg1()).ok().map(Timeout),
        }
    }

    /// Interprets arguments as for the `SEM_INIT` syscall.
    fn as_sem_init_args(&self) -> SemInitArgs {
        SemInitArgs {
            object: self.arg0(),
            initial: u32::try_from(self.arg1()).ok(),
            limit: u32::try_from(self.arg2()).ok(),
        }
    }

    /// Interprets arguments as for the `PIPE_ALLOC_INIT` syscall.
    fn as_pipe_init_args(&self) -> PipeInitArgs {
        PipeInitArgs {
            object: self.arg0(),
            size: self.arg1(),
        }
    }

    /// Interprets arguments as for syscalls moving a buffer to or from an
    /// object: pipe reads and writes, thread name copies.
    fn as_transfer_args(&self) -> TransferArgs {
        TransferArgs {
            object: self.arg0(),
            buffer: self.arg1(),
            len: self.arg2(),
        }
    }

    /// Interprets arguments as for the `POLL` syscall.
    fn as_poll_args(&self) -> PollArgs {
        PollArgs {
            events: self.arg0(),
            count: self.arg1(),
            timeout: u32::try_from(self.arg2()).ok().map(Timeout),
        }
    }

    /// Interprets arguments as for the `THREAD_SPAWN` syscall.
    fn as_spawn_args(&self) -> SpawnArgs {
        SpawnArgs {
            thread_object: self.arg0(),
            stack_object: self.arg1(),
            flags: u32::try_from(self.arg2())
                .ok()
                .and_then(SpawnFlags::from_bits),
        }
    }

    /// Interprets arguments as for the `THREAD_NAME_SET` syscall.
    fn as_name_set_args(&self) -> NameSetArgs {
        NameSetArgs {
            thread_object: self.arg0(),
            string: self.arg1(),
        }
    }

    /// Interprets arguments as for syscalls that take only a message buffer:
    /// `STR_OUT` and `PANIC`.
    fn as_message_args(&self) -> MessageArgs {
        MessageArgs {
            buffer: self.arg0(),
            len: self.arg1(),
        }
    }

    /// Sets a recoverable error code using the generic ABI.
    fn set_error_response(&mut self, resp: u32) {
        self.ret0(resp);
        self.ret1(0);
    }

    /// Sets a success code and a result value.
    fn set_response(&mut self, value: usize) {
        self.ret0(0);
        self.ret1(value);
    }
}

/// Decoded arguments for syscalls naming a single object.
#[derive(Clone, Debug)]
pub struct ObjectArgs {
    pub object: usize,
}

/// Decoded arguments for the `OBJECT_ALLOC` syscall.
#[derive(Clone, Debug)]
pub struct AllocArgs {
    /// Raw object kind, not yet checked. `None` if the word doesn't fit in
    /// 32 bits.
    pub kind: Option<u32>,
}

/// Decoded arguments for the `OBJECT_ACCESS_GRANT` syscall.
#[derive(Clone, Debug)]
pub struct GrantArgs {
    pub object: usize,
    pub thread_object: usize,
}

/// Decoded arguments for blocking single-object operations.
#[derive(Clone, Debug)]
pub struct TimedArgs {
    pub object: usize,
    /// `None` if the word doesn't fit in 32 bits.
    pub timeout: Option<Timeout>,
}

/// Decoded arguments for the `SEM_INIT` syscall.
#[derive(Clone, Debug)]
pub struct SemInitArgs {
    pub object: usize,
    pub initial: Option<u32>,
    pub limit: Option<u32>,
}

/// Decoded arguments for the `PIPE_ALLOC_INIT` syscall.
#[derive(Clone, Debug)]
pub struct PipeInitArgs {
    pub object: usize,
    pub size: usize,
}

/// Decoded arguments for buffer transfers.
#[derive(Clone, Debug)]
pub struct TransferArgs {
    pub object: usize,
    pub buffer: usize,
    pub len: usize,
}

/// Decoded arguments for the `POLL` syscall.
#[derive(Clone, Debug)]
pub struct PollArgs {
    pub events: usize,
    pub count: usize,
    pub timeout: Option<Timeout>,
}

/// Decoded arguments for the `THREAD_SPAWN` syscall.
#[derive(Clone, Debug)]
pub struct SpawnArgs {
    pub thread_object: usize,
    pub stack_object: usize,
    /// `None` if undefined flag bits were set.
    pub flags: Option<SpawnFlags>,
}

/// Decoded arguments for the `THREAD_NAME_SET` syscall.
#[derive(Clone, Debug)]
pub struct NameSetArgs {
    pub thread_object: usize,
    pub string: usize,
}

/// Decoded arguments for the `STR_OUT` and `PANIC` syscalls.
#[derive(Clone, Debug)]
pub struct MessageArgs {
    pub buffer: usize,
    pub len: usize,
}

/// Saved syscall registers in a portable layout, for trap entry sequences
/// that spill registers into memory and for driving the dispatcher on the
/// host.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyscallFrame {
    pub nr: u32,
    pub args: [usize; 6],
    pub ret0: u32,
    pub ret1: usize,
}

impl SyscallFrame {
    /// Builds a frame for syscall `nr`. Unused argument registers are zero.
    pub fn new(nr: u32, args: &[usize]) -> Self {
        let mut frame = Self {
            nr,
            ..Self::default()
        };
        for (slot, &a) in frame.args.iter_mut().zip(args) {
            *slot = a;
        }
        frame
    }
}

impl ArchState for SyscallFrame {
    fn arg0(&self) -> usize {
        self.args[0]
    }
    fn arg1(&self) -> usize {
        self.args[1]
    }
    fn arg2(&self) -> usize {
        self.args[2]
    }
    fn arg3(&self) -> usize {
        self.args[3]
    }
    fn arg4(&self) -> usize {
        self.args[4]
    }
    fn arg5(&self) -> usize {
        self.args[5]
    }

    fn syscall_descriptor(&self) -> u32 {
        self.nr
    }

    fn ret0(&mut self, x: u32) {
        self.ret0 = x;
    }
    fn ret1(&mut self, x: usize) {
        self.ret1 = x;
    }
}

/// Thread lifecycle, as far as object permissions are concerned.
impl Kernel {
    /// Creates a child of `parent` on `thread_obj`, running on `stack_obj`.
    ///
    /// Both objects must already have been validated as uninitialized and
    /// held by `parent`. The child sees the parent's memory plus its stack,
    /// draws on the parent's resource pool, and holds both objects, which are
    /// now initialized. With `INHERIT_PERMS` it also starts out holding
    /// everything the parent holds.
    pub fn spawn(
        &self,
        parent: ThreadId,
        thread_obj: &ObjectRef,
        stack_obj: &ObjectRef,
        flags: SpawnFlags,
    ) -> Result<ThreadId, UserError> {
        let mut threads = self.threads.write();
        let (mut regions, pool) = threads
            .get(parent)
            .map(|p| (p.regions().to_vec(), Arc::clone(p.pool())))
            .ok_or(UsageError::IllegalThread)?;
        regions.push(RegionDesc {
            base: stack_obj.address(),
            size: stack_obj.size(),
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        });

        // A dead thread may still be sitting on this thread object.
        if let Some(old) = threads.by_object(thread_obj.address()) {
            threads.reap(old);
        }
        // Dead threads keep their slots for inspection, but only until the
        // table fills up.
        let child = match threads.vacant() {
            Some(id) => id,
            None => {
                threads.reap_dead();
                threads
                    .vacant()
                    .ok_or(UserError::code(ResponseCode::Again))?
            }
        };
        let thread = Thread::new(
            child,
            thread_obj.address(),
            Some(stack_obj.address()),
            regions,
            pool,
        )
        .map_err(|e| {
            klog!("thread {parent}: can't spawn with stack: {e:?}");
            UserError::code(ResponseCode::Invalid)
        })?;
        threads
            .insert(thread)
            .map_err(|_| UserError::code(ResponseCode::Again))?;

        if let Err(e) = self.claim_for_child(child, thread_obj, stack_obj) {
            if let Some(t) = threads.get_mut(child) {
                t.set_state(ThreadState::Exited);
            }
            threads.reap(child);
            return Err(e);
        }
        if flags.contains(SpawnFlags::INHERIT_PERMS) {
            self.inherit(parent, child);
        }
        if let Some(t) = threads.get_mut(child) {
            t.set_state(ThreadState::Running);
        }
        drop(threads);

        self.trace(line!(), TraceEvent::Spawned { parent, child });
        Ok(child)
    }

    /// Initializes the thread and stack objects on behalf of `child`. If the
    /// stack can't be had, the thread object is put back the way it was.
    fn claim_for_child(
        &self,
        child: ThreadId,
        thread_obj: &ObjectRef,
        stack_obj: &ObjectRef,
    ) -> Result<(), UserError> {
        self.perms
            .claim_initialized(thread_obj, child)
            .map_err(|r| UserError::denied(r, thread_obj.address()))?;
        if let Err(r) = self.perms.claim_initialized(stack_obj, child) {
            let _ = self.perms.set_initialized(thread_obj, false);
            if let Ok(Some(orphan)) = self.perms.revoke(thread_obj, child) {
                self.release_orphan(orphan);
            }
            return Err(UserError::denied(r, stack_obj.address()));
        }
        Ok(())
    }

    /// Ends thread `id` at its own or a peer's request. Returns `false` if it
    /// was already dead.
    pub fn exit_thread(&self, id: ThreadId) -> bool {
        self.terminate(id, ThreadState::Exited)
    }

    /// Ends thread `id` for `fault`.
    pub fn fault_thread(&self, id: ThreadId, fault: FaultInfo) -> NextThread {
        self.terminate(id, ThreadState::Faulted(fault));
        NextThread::Other
    }

    /// Marks the thread dead, takes back its thread and stack objects, and
    /// revokes everything it held. The slot stays occupied until reaped, so
    /// its final state can still be inspected.
    ///
    /// The table stays locked until the thread's bits are gone, so a spawn
    /// can't hand its id to a new thread that would inherit them.
    fn terminate(&self, id: ThreadId, state: ThreadState) -> bool {
        let mut threads = self.threads.write();
        let Some(t) = threads.get_mut(id) else {
            return false;
        };
        if t.state().is_dead() {
            return false;
        }
        t.set_state(state);
        let (object, stack) = (t.object(), t.stack());

        for address in core::iter::once(object).chain(stack) {
            if let Some(obj) = self.registry.find(address) {
                // Dynamic objects may already be gone; that's fine.
                let _ = self.perms.set_initialized(&obj, false);
            }
        }
        self.revoke_all_for_thread(id);
        drop(threads);

        self.trace(line!(), TraceEvent::Exited(id));
        true
    }

    /// Frees the slot of dead thread `id`.
    pub fn reap(&self, id: ThreadId) -> bool {
        self.threads.write().reap(id).is_some()
    }

    pub fn set_thread_name(&self, id: ThreadId, name: OwnedCString) -> bool {
        match self.threads.write().get_mut(id) {
            Some(t) => {
                t.set_name(name);
                true
            }
            None => false,
        }
    }
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch threads, but this routine has not concluded which one
    /// should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch threads, and we already know which one should run
    /// next.
    Specific(ThreadId),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific thread recommendations that *don't* agree get
            // downgraded to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}
