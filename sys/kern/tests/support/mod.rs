// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host harness: two boot threads with real memory, a recording stand-in for
//! the kernel services, and a way to make syscalls.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use abi::{ObjectDesc, ObjectKind, ResponseCode, Sysnum, ThreadId, Timeout};
use kern::config::KernelConfig;
use kern::descs::{RegionAttributes, RegionDesc, ThreadDesc};
use kern::kobj::ObjectRef;
use kern::pool::OwnedBuffer;
use kern::services::{KernelServices, PollItem};
use kern::syscalls::syscall_entry;
use kern::thread::{NextThread, SyscallFrame};
use kern::Kernel;

pub const A: ThreadId = ThreadId(0);
pub const B: ThreadId = ThreadId(1);

pub const T_A: usize = 0x1000;
pub const T_B: usize = 0x1100;
/// A spare thread object nobody holds at boot.
pub const T_SPARE: usize = 0x1200;
/// A spare stack object nobody holds at boot.
pub const STACK: usize = 0x2000;
pub const STACK_SIZE: usize = 0x400;
/// A public, initialized semaphore.
pub const PUBLIC_SEM: usize = 0x3000;

pub const RAM_SIZE: usize = 0x400;

/// A chunk of host memory standing in for a thread's RAM. The test only
/// touches it through raw pointers, never while the kernel is using it.
pub struct Ram {
    base: *mut u8,
    len: usize,
}

impl Ram {
    pub fn new(len: usize) -> Self {
        let b = vec![0u8; len].into_boxed_slice();
        Self {
            base: Box::into_raw(b).cast::<u8>(),
            len,
        }
    }

    pub fn addr(&self, offset: usize) -> usize {
        self.base as usize + offset
    }

    pub fn region(&self) -> RegionDesc {
        RegionDesc {
            base: self.base as usize,
            size: self.len,
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(offset),
                bytes.len(),
            );
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
            .to_vec()
    }
}

impl Drop for Ram {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base, self.len,
            )));
        }
    }
}

/// Everything the services were asked to do, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    MutexInit(usize),
    MutexLock(ThreadId, usize),
    MutexUnlock(ThreadId, usize),
    SemInit(usize, u32, u32),
    SemTake(ThreadId, usize),
    SemGive(usize),
    PipeInit(usize, usize),
    PipeWrite(ThreadId, usize, Vec<u8>),
    PipeRead(ThreadId, usize),
    Poll(ThreadId, Vec<usize>),
    ConsoleOut(ThreadId, Vec<u8>),
    Released(usize),
}

struct Pipe {
    buffer: Option<OwnedBuffer>,
    queued: VecDeque<u8>,
}

/// Kernel services that do the least possible and write everything down.
#[derive(Default)]
pub struct Recorder {
    pub calls: Vec<Call>,
    pipes: HashMap<usize, Pipe>,
    /// Objects whose poll events fire.
    pub ready: Vec<usize>,
}

impl KernelServices for Recorder {
    fn mutex_init(&mut self, obj: &ObjectRef) -> Result<(), ResponseCode> {
        self.calls.push(Call::MutexInit(obj.address()));
        Ok(())
    }

    fn mutex_lock(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        _timeout: Timeout,
    ) -> Result<NextThread, ResponseCode> {
        self.calls.push(Call::MutexLock(caller, obj.address()));
        Ok(NextThread::Same)
    }

    fn mutex_unlock(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
    ) -> Result<NextThread, ResponseCode> {
        self.calls.push(Call::MutexUnlock(caller, obj.address()));
        Ok(NextThread::Same)
    }

    fn sem_init(
        &mut self,
        obj: &ObjectRef,
        initial: u32,
        limit: u32,
    ) -> Result<(), ResponseCode> {
        if limit == 0 || initial > limit {
            return Err(ResponseCode::Invalid);
        }
        self.calls.push(Call::SemInit(obj.address(), initial, limit));
        Ok(())
    }

    fn sem_take(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        timeout: Timeout,
    ) -> Result<NextThread, ResponseCode> {
        self.calls.push(Call::SemTake(caller, obj.address()));
        if timeout == Timeout::NO_WAIT {
            Err(ResponseCode::WouldBlock)
        } else {
            Ok(NextThread::Other)
        }
    }

    fn sem_give(&mut self, obj: &ObjectRef) -> Result<NextThread, ResponseCode> {
        self.calls.push(Call::SemGive(obj.address()));
        Ok(NextThread::Same)
    }

    fn pipe_init(
        &mut self,
        obj: &ObjectRef,
        buffer: Option<OwnedBuffer>,
    ) -> Result<(), ResponseCode> {
        let size = buffer.as_ref().map_or(0, |b| b.len());
        self.calls.push(Call::PipeInit(obj.address(), size));
        self.pipes.insert(
            obj.address(),
            Pipe {
                buffer,
                queued: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn pipe_write(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        data: &[u8],
    ) -> Result<usize, ResponseCode> {
        self.calls
            .push(Call::PipeWrite(caller, obj.address(), data.to_vec()));
        let pipe = self
            .pipes
            .get_mut(&obj.address())
            .ok_or(ResponseCode::Invalid)?;
        let capacity = pipe.buffer.as_ref().map_or(0, |b| b.len());
        let n = data.len().min(capacity - pipe.queued.len());
        pipe.queued.extend(&data[..n]);
        Ok(n)
    }

    fn pipe_read(
        &mut self,
        caller: ThreadId,
        obj: &ObjectRef,
        dest: &mut [u8],
    ) -> Result<usize, ResponseCode> {
        self.calls.push(Call::PipeRead(caller, obj.address()));
        let pipe = self
            .pipes
            .get_mut(&obj.address())
            .ok_or(ResponseCode::Invalid)?;
        let n = dest.len().min(pipe.queued.len());
        for (d, b) in dest.iter_mut().zip(pipe.queued.drain(..n)) {
            *d = b;
        }
        Ok(n)
    }

    fn poll(
        &mut self,
        caller: ThreadId,
        items: &mut [PollItem],
        _timeout: Timeout,
    ) -> Result<NextThread, ResponseCode> {
        self.calls.push(Call::Poll(
            caller,
            items.iter().map(|i| i.object.address()).collect(),
        ));
        for item in items.iter_mut() {
            if self.ready.contains(&item.object.address()) {
                item.state = 1;
            }
        }
        Ok(NextThread::Same)
    }

    fn console_out(&mut self, caller: ThreadId, text: &[u8]) {
        self.calls.push(Call::ConsoleOut(caller, text.to_vec()));
    }

    fn object_released(&mut self, obj: &ObjectRef) {
        self.calls.push(Call::Released(obj.address()));
        self.pipes.remove(&obj.address());
    }
}

pub fn object(address: usize, kind: ObjectKind) -> ObjectDesc {
    ObjectDesc {
        address,
        kind,
        size: 0,
        public: false,
        initialized: false,
    }
}

/// A kernel with threads A and B, each owning one chunk of RAM.
pub struct World {
    pub kernel: Kernel,
    pub svc: Recorder,
    pub ram_a: Ram,
    pub ram_b: Ram,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::DEFAULT)
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self::with_pools(config, 4096)
    }

    /// Like `with_config`, but both threads get `pool_size` bytes of pool.
    pub fn with_pools(config: KernelConfig, pool_size: usize) -> Self {
        let ram_a = Ram::new(RAM_SIZE);
        let ram_b = Ram::new(RAM_SIZE);
        let objects = [
            object(T_A, ObjectKind::Thread),
            object(T_B, ObjectKind::Thread),
            object(T_SPARE, ObjectKind::Thread),
            ObjectDesc {
                size: STACK_SIZE,
                ..object(STACK, ObjectKind::Stack)
            },
            ObjectDesc {
                public: true,
                initialized: true,
                ..object(PUBLIC_SEM, ObjectKind::Semaphore)
            },
        ];
        let regions_a = [ram_a.region()];
        let regions_b = [ram_b.region()];
        let threads = [
            ThreadDesc {
                object: T_A,
                regions: &regions_a,
                pool_size,
            },
            ThreadDesc {
                object: T_B,
                regions: &regions_b,
                pool_size,
            },
        ];
        let kernel = Kernel::new(config, &objects, &threads).unwrap();
        Self {
            kernel,
            svc: Recorder::default(),
            ram_a,
            ram_b,
        }
    }

    /// Makes syscall `nr` from `caller`.
    pub fn call(
        &mut self,
        caller: ThreadId,
        nr: Sysnum,
        args: &[usize],
    ) -> (NextThread, SyscallFrame) {
        let mut frame = SyscallFrame::new(nr as u32, args);
        let next = syscall_entry(&self.kernel, &mut self.svc, caller, &mut frame);
        (next, frame)
    }

    /// Makes a syscall that is expected to succeed, returning its value.
    pub fn ok(&mut self, caller: ThreadId, nr: Sysnum, args: &[usize]) -> usize {
        let (_, frame) = self.call(caller, nr, args);
        assert_eq!(frame.ret0, 0, "{nr:?} from {caller} failed");
        assert!(self.kernel.thread_state(caller).is_some_and(|s| !s.is_dead()));
        frame.ret1
    }

    /// Hands `address` to `thread` from outside, as a loader would.
    pub fn give(&self, address: usize, thread: ThreadId) {
        let obj = self.kernel.find(address).unwrap();
        self.kernel.grant(&obj, thread).unwrap();
    }
}
