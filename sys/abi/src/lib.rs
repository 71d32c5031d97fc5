// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user code.
//!
//! Everything in here is either a value that crosses the privilege boundary
//! (syscall numbers, response codes, the poll event layout) or a value that
//! the kernel records about a thread and that tooling may want to decode
//! (faults and their causes).

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a thread by its slot in the kernel thread table.
///
/// The slot number doubles as the bit index in every object's permission
/// bitmap, which is why it is small. Slots are reused after a thread is
/// reaped, but only after all of that thread's permissions have been cleared.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Extracts the slot index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Every kind of object the kernel is willing to expose to user code.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum ObjectKind {
    Thread = 1,
    Stack = 2,
    Mutex = 3,
    Semaphore = 4,
    CondVar = 5,
    Pipe = 6,
    MsgQueue = 7,
    Queue = 8,
    Event = 9,
    Timer = 10,
    MemSlab = 11,
    PollSignal = 12,
}

impl ObjectKind {
    /// Human-readable name, used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Stack => "stack",
            Self::Mutex => "mutex",
            Self::Semaphore => "semaphore",
            Self::CondVar => "condvar",
            Self::Pipe => "pipe",
            Self::MsgQueue => "msgq",
            Self::Queue => "queue",
            Self::Event => "event",
            Self::Timer => "timer",
            Self::MemSlab => "mem_slab",
            Self::PollSignal => "poll_signal",
        }
    }

    /// Number of bytes of kernel storage backing one object of this kind when
    /// it is allocated at run time.
    ///
    /// `Stack` has no fixed size and returns `None`; stacks can only come from
    /// the static object table.
    pub const fn storage_size(self) -> Option<usize> {
        match self {
            Self::Thread => Some(256),
            Self::Stack => None,
            Self::Mutex => Some(32),
            Self::Semaphore => Some(24),
            Self::CondVar => Some(16),
            Self::Pipe => Some(64),
            Self::MsgQueue => Some(64),
            Self::Queue => Some(32),
            Self::Event => Some(24),
            Self::Timer => Some(56),
            Self::MemSlab => Some(40),
            Self::PollSignal => Some(24),
        }
    }
}

/// We're using an explicit `TryFrom` impl here for the same reason as
/// `Sysnum`: this is decoded straight out of a syscall argument register.
impl core::convert::TryFrom<u32> for ObjectKind {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Thread),
            2 => Ok(Self::Stack),
            3 => Ok(Self::Mutex),
            4 => Ok(Self::Semaphore),
            5 => Ok(Self::CondVar),
            6 => Ok(Self::Pipe),
            7 => Ok(Self::MsgQueue),
            8 => Ok(Self::Queue),
            9 => Ok(Self::Event),
            10 => Ok(Self::Timer),
            11 => Ok(Self::MemSlab),
            12 => Ok(Self::PollSignal),
            _ => Err(()),
        }
    }
}

/// What kind of object a validation expects to find.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KindMatch {
    /// Any registered object will do.
    Any,
    /// Only an object of exactly this kind.
    Exactly(ObjectKind),
}

impl KindMatch {
    pub fn admits(self, kind: ObjectKind) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(k) => k == kind,
        }
    }
}

/// Initialization state an operation requires of its object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InitRequirement {
    /// Ordinary operations: the object must have been initialized.
    MustBeInitialized,
    /// Constructors: the object must not already be live.
    MustNotBeInitialized,
    /// Operations that don't care, like granting access.
    DontCare,
}

/// Static description of one kernel object, as emitted into the generated
/// object table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectDesc {
    /// Address of the object. This is its identity.
    pub address: usize,
    pub kind: ObjectKind,
    /// Size of the object in bytes. Only meaningful for `Stack`, where it
    /// bounds the memory region handed to a thread running on it.
    #[serde(default)]
    pub size: usize,
    /// Every thread may use this object.
    #[serde(default)]
    pub public: bool,
    /// Object is live at boot (initialized statically).
    #[serde(default)]
    pub initialized: bool,
}

/// Reasons the object validator refuses an object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DenyReason {
    /// The address is not a registered kernel object.
    UnknownObject,
    /// The object exists but is of a different kind.
    WrongType,
    /// The operation needs a live object and this one isn't.
    Uninitialized,
    /// The operation is a constructor and the object is already live.
    AlreadyInitialized,
    /// The calling thread has not been granted this object.
    NotPermitted,
}

impl core::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::UnknownObject => "unknown object",
            Self::WrongType => "wrong object type",
            Self::Uninitialized => "object not initialized",
            Self::AlreadyInitialized => "object already initialized",
            Self::NotPermitted => "access not permitted",
        })
    }
}

/// Reasons the memory bridge refuses a user buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemFault {
    /// Some part of the range isn't memory the thread may access this way,
    /// or the range is malformed (misaligned, unterminated string).
    RangeInvalid,
    /// Computing the extent of the range overflowed.
    Overflow,
    /// Touching the memory faulted.
    AccessFault,
}

impl core::fmt::Display for MemFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::RangeInvalid => "invalid memory range",
            Self::Overflow => "range size overflow",
            Self::AccessFault => "memory access fault",
        })
    }
}

/// A syscall was used in a way that can never be correct.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program asked for an object kind that doesn't exist, or that can't be
    /// used the way it asked.
    BadObjectKind,
    /// A poll event named an event type the kernel doesn't know.
    BadPollType,
    /// A thread object was valid but isn't bound to a thread, or a syscall
    /// arrived from a thread that isn't running.
    IllegalThread,
    /// An argument word had bits set above the width of the value it
    /// carries.
    ArgumentTooWide,
}

impl core::fmt::Display for UsageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::BadSyscallNumber => "bad syscall number",
            Self::BadObjectKind => "bad object kind",
            Self::BadPollType => "bad poll event type",
            Self::IllegalThread => "illegal thread",
            Self::ArgumentTooWide => "argument too wide",
        })
    }
}

/// Everything the kernel can hold against a thread when it terminates it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// A kernel object handle failed validation.
    Object { reason: DenyReason, address: usize },
    /// A user buffer failed validation or faulted while being copied.
    Memory { fault: MemFault, address: usize },
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
    /// The thread explicitly aborted itself.
    Panic,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

impl core::fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Object { reason, address } => {
                write!(f, "{reason} at {address:#x}")
            }
            Self::Memory { fault, address } => {
                write!(f, "{fault} at {address:#x}")
            }
            Self::SyscallUsage(e) => write!(f, "syscall usage: {e}"),
            Self::Panic => f.write_str("panicked"),
        }
    }
}

/// Response codes for recoverable syscall failures. These are ordinary
/// operating conditions, not trust-boundary violations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 0,
    /// A kernel-side allocation could not be satisfied from the caller's
    /// resource pool.
    NoMemory = 1,
    /// The operation could not complete without blocking and the timeout was
    /// `NO_WAIT`.
    WouldBlock = 2,
    /// Arguments were well-formed but not acceptable (e.g. a semaphore limit
    /// of zero).
    Invalid = 3,
    /// A user buffer was well-formed but too small for the result.
    NoSpace = 4,
    /// The feature is configured out.
    NotSupported = 5,
    /// No free thread slot.
    Again = 6,
}

impl From<ResponseCode> for u32 {
    fn from(rc: ResponseCode) -> Self {
        rc as u32
    }
}

/// Timeout argument in kernel ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Timeout(pub u32);

impl Timeout {
    pub const NO_WAIT: Self = Self(0);
    pub const FOREVER: Self = Self(u32::MAX);
}

/// Event types understood by the `Poll` syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum PollType {
    /// Fires when a semaphore becomes available.
    SemAvailable = 1,
    /// Fires when a pipe has data to read.
    PipeData = 2,
    /// Fires when a poll signal is raised.
    Signal = 3,
}

impl PollType {
    /// Object kind an event of this type must point at.
    pub const fn object_kind(self) -> ObjectKind {
        match self {
            Self::SemAvailable => ObjectKind::Semaphore,
            Self::PipeData => ObjectKind::Pipe,
            Self::Signal => ObjectKind::PollSignal,
        }
    }
}

impl core::convert::TryFrom<u32> for PollType {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::SemAvailable),
            2 => Ok(Self::PipeData),
            3 => Ok(Self::Signal),
            _ => Err(()),
        }
    }
}

/// One entry of the array passed to the `Poll` syscall.
///
/// User code fills in `object` and `poll_type`; the kernel writes `state`
/// back (non-zero if the event fired).
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes,
    Immutable, KnownLayout,
)]
#[repr(C)]
pub struct PollEvent {
    pub object: usize,
    pub poll_type: u32,
    pub state: u32,
}

bitflags::bitflags! {
    /// Flags accepted by the `ThreadSpawn` syscall.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct SpawnFlags: u32 {
        /// Child starts with a copy of the parent's object permissions.
        const INHERIT_PERMS = 1 << 0;
    }
}

/// Enumeration of syscall numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    ObjectAlloc = 0,
    ObjectRelease = 1,
    ObjectAccessGrant = 2,
    MutexInit = 3,
    MutexLock = 4,
    MutexUnlock = 5,
    SemInit = 6,
    SemTake = 7,
    SemGive = 8,
    PipeAllocInit = 9,
    PipeWrite = 10,
    PipeRead = 11,
    Poll = 12,
    ThreadSpawn = 13,
    ThreadAbort = 14,
    ThreadNameSet = 15,
    ThreadNameCopy = 16,
    StrOut = 17,
    Panic = 18,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::ObjectAlloc),
            1 => Ok(Self::ObjectRelease),
            2 => Ok(Self::ObjectAccessGrant),
            3 => Ok(Self::MutexInit),
            4 => Ok(Self::MutexLock),
            5 => Ok(Self::MutexUnlock),
            6 => Ok(Self::SemInit),
            7 => Ok(Self::SemTake),
            8 => Ok(Self::SemGive),
            9 => Ok(Self::PipeAllocInit),
            10 => Ok(Self::PipeWrite),
            11 => Ok(Self::PipeRead),
            12 => Ok(Self::Poll),
            13 => Ok(Self::ThreadSpawn),
            14 => Ok(Self::ThreadAbort),
            15 => Ok(Self::ThreadNameSet),
            16 => Ok(Self::ThreadNameCopy),
            17 => Ok(Self::StrOut),
            18 => Ok(Self::Panic),
            _ => Err(()),
        }
    }
}
