// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The permission store: which threads may use which kernel objects.
//!
//! Every registered object owns one *slot* in the store. A slot records the
//! object's state flags (initialized, public, dynamically allocated) and the
//! set of threads granted access to it. Slots are identified by index plus a
//! generation number; the generation changes whenever a slot is recycled, so a
//! handle obtained before the recycle can never act on the new occupant.
//!
//! All mutation happens under a single lock. That includes the system-wide
//! sweeps (`revoke_all_for_thread` and `inherit`), so every operation is
//! linearizable with respect to every other: no validator can observe a sweep
//! half done.

use alloc::vec::Vec;

use abi::{DenyReason, ThreadId};

use crate::kobj::ObjectRef;
use crate::MAX_THREADS;

const THREAD_WORDS: usize = MAX_THREADS.div_ceil(32);

/// Fixed-width set of thread slots.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ThreadSet([u32; THREAD_WORDS]);

impl ThreadSet {
    pub const EMPTY: Self = Self([0; THREAD_WORDS]);

    fn locate(t: ThreadId) -> Option<(usize, u32)> {
        let i = t.index();
        if i < MAX_THREADS {
            Some((i / 32, 1 << (i % 32)))
        } else {
            None
        }
    }

    /// Adds `t`. Thread ids beyond the table size are never members.
    pub fn insert(&mut self, t: ThreadId) {
        if let Some((word, bit)) = Self::locate(t) {
            self.0[word] |= bit;
        }
    }

    pub fn remove(&mut self, t: ThreadId) {
        if let Some((word, bit)) = Self::locate(t) {
            self.0[word] &= !bit;
        }
    }

    pub fn contains(&self, t: ThreadId) -> bool {
        match Self::locate(t) {
            Some((word, bit)) => self.0[word] & bit != 0,
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }
}

bitflags::bitflags! {
    /// Per-object state kept alongside its permission set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ObjectFlags: u8 {
        /// The object has been constructed and ordinary operations may use it.
        const INITIALIZED = 1 << 0;
        /// Every thread may use the object. This is a property of the object,
        /// not a grant, and permission sweeps never touch it.
        const PUBLIC = 1 << 1;
        /// The object was allocated at run time and is released when its last
        /// holder goes away.
        const DYNAMIC = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug)]
struct ObjState {
    address: usize,
    flags: ObjectFlags,
    holders: ThreadSet,
    generation: u32,
    live: bool,
}

impl ObjState {
    fn is_orphaned(&self) -> bool {
        self.flags.contains(ObjectFlags::DYNAMIC)
            && !self.flags.contains(ObjectFlags::PUBLIC)
            && self.holders.is_empty()
    }

    fn authorizes(&self, t: ThreadId) -> bool {
        self.flags.contains(ObjectFlags::PUBLIC) || self.holders.contains(t)
    }
}

/// A dynamic object whose last holder just lost access. The caller is
/// expected to release it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Orphan {
    pub address: usize,
    pub slot: usize,
    pub generation: u32,
}

/// What a validator needs to know about one object, read under one lock
/// acquisition so the two answers are consistent with each other.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Access {
    pub initialized: bool,
    pub authorized: bool,
}

pub struct PermissionStore {
    slots: spin::Mutex<Vec<ObjState>>,
}

impl PermissionStore {
    /// Creates a store whose first slots belong to the static objects, in the
    /// order given.
    pub fn new(statics: impl IntoIterator<Item = (usize, ObjectFlags)>) -> Self {
        let slots = statics
            .into_iter()
            .map(|(address, flags)| ObjState {
                address,
                flags,
                holders: ThreadSet::EMPTY,
                generation: 0,
                live: true,
            })
            .collect();
        Self {
            slots: spin::Mutex::new(slots),
        }
    }

    /// Applies `body` to the slot named by `obj`, provided that slot is still
    /// the one `obj` was issued for.
    fn with_slot<R>(
        &self,
        obj: &ObjectRef,
        body: impl FnOnce(&mut ObjState) -> R,
    ) -> Result<R, DenyReason> {
        let mut slots = self.slots.lock();
        match slots.get_mut(obj.slot()) {
            Some(s) if s.live && s.generation == obj.generation() => {
                Ok(body(s))
            }
            _ => Err(DenyReason::UnknownObject),
        }
    }

    /// Claims a slot for a newly allocated object at `address`. Dead slots are
    /// reused with a new generation. Returns `(slot, generation)`.
    pub fn alloc_slot(
        &self,
        address: usize,
        flags: ObjectFlags,
    ) -> Option<(usize, u32)> {
        let mut slots = self.slots.lock();
        let fresh = |generation| ObjState {
            address,
            flags,
            holders: ThreadSet::EMPTY,
            generation,
            live: true,
        };
        if let Some((i, s)) =
            slots.iter_mut().enumerate().find(|(_, s)| !s.live)
        {
            *s = fresh(s.generation.wrapping_add(1));
            return Some((i, s.generation));
        }
        slots.try_reserve(1).ok()?;
        slots.push(fresh(0));
        Some((slots.len() - 1, 0))
    }

    /// Retires a slot. Its flags and holders are wiped and the generation is
    /// bumped, so outstanding `ObjectRef`s to it become stale.
    pub fn free_slot(&self, slot: usize, generation: u32) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(slot) {
            Some(s) if s.live && s.generation == generation => {
                s.live = false;
                s.flags = ObjectFlags::empty();
                s.holders.clear();
                s.generation = s.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    /// Retires the slot of `orphan`, but only if nobody has been granted it
    /// since it was orphaned. Returns whether the slot was retired.
    pub fn retire_orphan(&self, orphan: &Orphan) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(orphan.slot) {
            Some(s)
                if s.live
                    && s.generation == orphan.generation
                    && s.is_orphaned() =>
            {
                s.live = false;
                s.flags = ObjectFlags::empty();
                s.generation = s.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    /// Adds `t` to the holders of `obj`. Granting twice is harmless.
    pub fn grant(&self, obj: &ObjectRef, t: ThreadId) -> Result<(), DenyReason> {
        self.with_slot(obj, |s| s.holders.insert(t))
    }

    /// Removes `t` from the holders of `obj`. Revoking an absent thread is
    /// harmless.
    ///
    /// Returns the orphan if this left a non-public dynamic object with no
    /// holders at all.
    pub fn revoke(
        &self,
        obj: &ObjectRef,
        t: ThreadId,
    ) -> Result<Option<Orphan>, DenyReason> {
        self.with_slot(obj, |s| {
            let was_held = s.holders.contains(t);
            s.holders.remove(t);
            if was_held && s.is_orphaned() {
                Some(Orphan {
                    address: s.address,
                    slot: obj.slot(),
                    generation: s.generation,
                })
            } else {
                None
            }
        })
    }

    pub fn is_authorized(&self, obj: &ObjectRef, t: ThreadId) -> bool {
        self.with_slot(obj, |s| s.authorizes(t)).unwrap_or(false)
    }

    /// Reads the initialization and authorization state of `obj` for `t`.
    pub fn access(
        &self,
        obj: &ObjectRef,
        t: ThreadId,
    ) -> Result<Access, DenyReason> {
        self.with_slot(obj, |s| Access {
            initialized: s.flags.contains(ObjectFlags::INITIALIZED),
            authorized: s.authorizes(t),
        })
    }

    /// Removes `t` from every object's holders. Public flags are left alone.
    ///
    /// Returns every dynamic object this orphaned.
    pub fn revoke_all_for_thread(&self, t: ThreadId) -> Vec<Orphan> {
        let mut slots = self.slots.lock();
        let mut orphans = Vec::new();
        for (i, s) in slots.iter_mut().enumerate().filter(|(_, s)| s.live) {
            if s.holders.contains(t) {
                s.holders.remove(t);
                if s.is_orphaned() {
                    orphans.push(Orphan {
                        address: s.address,
                        slot: i,
                        generation: s.generation,
                    });
                }
            }
        }
        orphans
    }

    /// Grants `child` every object `parent` currently holds. This copies
    /// membership; later changes to either thread don't affect the other.
    pub fn inherit(&self, parent: ThreadId, child: ThreadId) {
        let mut slots = self.slots.lock();
        for s in slots.iter_mut().filter(|s| s.live) {
            if s.holders.contains(parent) {
                s.holders.insert(child);
            }
        }
    }

    /// Clears every holder of `obj` (not its public flag) and then grants `t`
    /// alone, as one step.
    pub fn reset_and_grant_sole(
        &self,
        obj: &ObjectRef,
        t: ThreadId,
    ) -> Result<(), DenyReason> {
        self.with_slot(obj, |s| {
            s.holders.clear();
            s.holders.insert(t);
        })
    }

    /// Marks `obj` initialized and grants `owner`, failing if somebody got
    /// there first. Returns `true` if the grant is new.
    pub fn claim_initialized(
        &self,
        obj: &ObjectRef,
        owner: ThreadId,
    ) -> Result<bool, DenyReason> {
        self.with_slot(obj, |s| {
            if s.flags.contains(ObjectFlags::INITIALIZED) {
                Err(DenyReason::AlreadyInitialized)
            } else {
                let granted = !s.holders.contains(owner);
                s.flags.insert(ObjectFlags::INITIALIZED);
                s.holders.insert(owner);
                Ok(granted)
            }
        })?
    }

    pub fn set_initialized(
        &self,
        obj: &ObjectRef,
        initialized: bool,
    ) -> Result<(), DenyReason> {
        self.with_slot(obj, |s| {
            s.flags.set(ObjectFlags::INITIALIZED, initialized)
        })
    }

    /// Makes `owner` the only holder of `obj` and marks it initialized, under
    /// one acquisition of the slot lock.
    pub fn reinit_sole_owner(
        &self,
        obj: &ObjectRef,
        owner: ThreadId,
    ) -> Result<(), DenyReason> {
        self.with_slot(obj, |s| {
            s.holders.clear();
            s.holders.insert(owner);
            s.flags.insert(ObjectFlags::INITIALIZED);
        })
    }

    pub fn make_public(&self, obj: &ObjectRef) -> Result<(), DenyReason> {
        self.with_slot(obj, |s| s.flags.insert(ObjectFlags::PUBLIC))
    }

    pub fn flags(&self, obj: &ObjectRef) -> Result<ObjectFlags, DenyReason> {
        self.with_slot(obj, |s| s.flags)
    }

    /// Addresses of every live object `t` has been explicitly granted, in
    /// slot order. Public objects are only listed if `t` also holds them.
    pub fn permissions_view(&self, t: ThreadId) -> Vec<usize> {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.live && s.holders.contains(t))
            .map(|s| s.address)
            .collect()
    }
}
