// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! All of the kernel's shared state hangs off one [`Kernel`] value, built from
//! the static object and thread tables. The locks inside it are always taken
//! in the same order (thread table, then registry, then permission store, then
//! the trace ring) and never held across a call that could take an earlier
//! one.

use alloc::sync::Arc;
use alloc::vec::Vec;

use abi::{ObjectDesc, ObjectKind, ThreadId};

use crate::config::KernelConfig;
use crate::descs::ThreadDesc;
use crate::kobj::{ObjectRef, Registry, RegistryError};
use crate::perms::{ObjectFlags, PermissionStore};
use crate::pool::ResourcePool;
use crate::thread::{RegionError, Thread, ThreadState, ThreadTable};
use crate::trace::{Ringbuf, RingbufEntry, TraceEvent};
use crate::TRACE_DEPTH;

/// Reasons the static tables can't be turned into a kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// Two objects share this address.
    DuplicateObject(usize),
    /// The object table is larger than the registry will hold.
    TooManyObjects,
    /// More boot threads than thread slots.
    TooManyThreads,
    /// A boot thread names an address that isn't a static `Thread` object.
    UnknownThreadObject(usize),
    /// Two boot threads claim the same thread object.
    DuplicateThreadObject(usize),
    /// A boot thread's region table is malformed.
    BadRegion(RegionError),
}

impl From<RegistryError> for ConfigError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Duplicate(a) => Self::DuplicateObject(a),
            RegistryError::Full => Self::TooManyObjects,
        }
    }
}

/// The kernel's shared state.
pub struct Kernel {
    config: KernelConfig,
    pub(crate) registry: Registry,
    pub(crate) perms: PermissionStore,
    pub(crate) threads: spin::RwLock<ThreadTable>,
    trace: spin::Mutex<Ringbuf<TraceEvent, TRACE_DEPTH>>,
    /// Dynamic objects released since the dispatcher last looked, waiting for
    /// the services layer to hear about them.
    released: spin::Mutex<Vec<ObjectRef>>,
}

impl Kernel {
    /// Builds a kernel from its static tables.
    ///
    /// Each boot thread starts out `Running`, holding (and having
    /// initialized) its own thread object, with a resource pool of the size
    /// its descriptor gives.
    pub fn new(
        config: KernelConfig,
        objects: &[ObjectDesc],
        threads: &[ThreadDesc<'_>],
    ) -> Result<Self, ConfigError> {
        let registry = Registry::new(objects, config.max_dynamic_objects)?;

        // Static slots in the permission store line up with the registry's
        // sorted order.
        let perms = PermissionStore::new(registry.statics().map(|d| {
            let mut flags = ObjectFlags::empty();
            flags.set(ObjectFlags::PUBLIC, d.public);
            flags.set(ObjectFlags::INITIALIZED, d.initialized);
            (d.address, flags)
        }));

        if threads.len() > crate::MAX_THREADS {
            return Err(ConfigError::TooManyThreads);
        }

        let mut table = ThreadTable::new();
        for (i, desc) in threads.iter().enumerate() {
            let id = u16::try_from(i)
                .map(ThreadId)
                .map_err(|_| ConfigError::TooManyThreads)?;
            let obj = registry
                .find(desc.object)
                .filter(|o| o.kind() == ObjectKind::Thread)
                .ok_or(ConfigError::UnknownThreadObject(desc.object))?;
            if table.by_object(desc.object).is_some() {
                return Err(ConfigError::DuplicateThreadObject(desc.object));
            }

            let mut thread = Thread::new(
                id,
                desc.object,
                None,
                desc.regions.to_vec(),
                Arc::new(ResourcePool::new(desc.pool_size)),
            )
            .map_err(ConfigError::BadRegion)?;

            perms
                .reinit_sole_owner(&obj, id)
                .map_err(|_| ConfigError::UnknownThreadObject(desc.object))?;
            thread.set_state(ThreadState::Running);
            table
                .insert(thread)
                .map_err(|_| ConfigError::TooManyThreads)?;
        }

        klog!(
            "kernel up: {} static objects, {} threads",
            objects.len(),
            threads.len()
        );

        Ok(Self {
            config,
            registry,
            perms,
            threads: spin::RwLock::new(table),
            trace: spin::Mutex::new(Ringbuf::new(TraceEvent::None)),
            released: spin::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Records `event` in the trace ring, tagged with a source line.
    pub(crate) fn trace(&self, line: u32, event: TraceEvent) {
        self.trace.lock().entry(line as u16, event);
    }

    /// Copies out the trace ring, oldest entry first.
    pub fn trace_entries(&self) -> Vec<RingbufEntry<TraceEvent>> {
        self.trace.lock().snapshot()
    }

    /// Runs `body` against thread `id`, if it exists.
    pub fn with_thread<R>(
        &self,
        id: ThreadId,
        body: impl FnOnce(&Thread) -> R,
    ) -> Option<R> {
        self.threads.read().get(id).map(body)
    }

    /// Runs `body` against the whole thread table.
    pub fn with_thread_table<R>(
        &self,
        body: impl FnOnce(&ThreadTable) -> R,
    ) -> R {
        body(&self.threads.read())
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.with_thread(id, |t| *t.state())
    }

    /// The living or dead thread represented by the object at `object`.
    pub fn thread_for_object(&self, object: usize) -> Option<ThreadId> {
        self.threads.read().by_object(object)
    }

    pub(crate) fn queue_released(&self, obj: ObjectRef) {
        self.released.lock().push(obj);
    }

    /// Takes the list of dynamic objects released since the last call.
    pub fn take_released(&self) -> Vec<ObjectRef> {
        core::mem::take(&mut *self.released.lock())
    }
}

/// Builds the kernel from the tables generated at compile time.
pub fn start_kernel() -> Result<Kernel, ConfigError> {
    Kernel::new(KERNEL_CONFIG, &KERNEL_OBJECT_DESCS, &KERNEL_THREAD_DESCS)
}

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));
