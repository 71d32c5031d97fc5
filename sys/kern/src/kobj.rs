// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel object registry.
//!
//! The registry answers one question: is this address a kernel object, and if
//! so, what kind? It answers by looking the address up as a number, in a
//! sorted table of static objects and a map of dynamic ones. It never follows
//! the address, so any word a thread passes in is safe to ask about.
//!
//! Static objects come from the generated object table and live forever.
//! Dynamic objects are allocated at run time, own their backing storage, and
//! leave the registry when released.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use abi::{ObjectDesc, ObjectKind};

use crate::pool::OwnedBuffer;

/// A registry entry, as handed out by [`Registry::find`].
///
/// Holding one of these says only that the object existed when it was looked
/// up. It is not a license to use the object; for that, go through the
/// validator, which also checks that the slot it names hasn't been recycled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectRef {
    address: usize,
    kind: ObjectKind,
    size: usize,
    slot: usize,
    generation: u32,
}

impl ObjectRef {
    pub(crate) fn new(
        address: usize,
        kind: ObjectKind,
        size: usize,
        slot: usize,
        generation: u32,
    ) -> Self {
        Self {
            address,
            kind,
            size,
            slot,
            generation,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Size of the object's storage in bytes; for stacks, the size of the
    /// stack.
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Copy, Clone, Debug)]
struct StaticObject {
    desc: ObjectDesc,
}

/// A run-time allocated object. Dropping it returns its storage to the pool
/// that paid for it.
#[derive(Debug)]
pub struct DynamicObject {
    kind: ObjectKind,
    slot: usize,
    generation: u32,
    storage: OwnedBuffer,
}

impl DynamicObject {
    pub fn new(
        kind: ObjectKind,
        slot: usize,
        generation: u32,
        storage: OwnedBuffer,
    ) -> Self {
        Self {
            kind,
            slot,
            generation,
            storage,
        }
    }

    /// The object's address: that of its storage.
    pub fn address(&self) -> usize {
        self.storage.addr()
    }

    pub(crate) fn to_ref(&self) -> ObjectRef {
        ObjectRef::new(
            self.address(),
            self.kind,
            self.storage.len(),
            self.slot,
            self.generation,
        )
    }
}

/// Reasons the registry refuses a table or a new entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// Two objects claim the same address.
    Duplicate(usize),
    /// The dynamic object limit has been reached.
    Full,
}

pub struct Registry {
    /// Sorted by address. An object's slot in the permission store is its
    /// index here.
    statics: Box<[StaticObject]>,
    dynamics: spin::RwLock<BTreeMap<usize, DynamicObject>>,
    max_dynamic: usize,
}

impl Registry {
    /// Builds a registry over the static object table `descs`, which need not
    /// be sorted.
    pub fn new(
        descs: &[ObjectDesc],
        max_dynamic: usize,
    ) -> Result<Self, RegistryError> {
        let mut statics: Vec<StaticObject> =
            descs.iter().map(|&desc| StaticObject { desc }).collect();
        statics.sort_unstable_by_key(|s| s.desc.address);
        for pair in statics.windows(2) {
            if pair[0].desc.address == pair[1].desc.address {
                return Err(RegistryError::Duplicate(pair[0].desc.address));
            }
        }
        Ok(Self {
            statics: statics.into_boxed_slice(),
            dynamics: spin::RwLock::new(BTreeMap::new()),
            max_dynamic,
        })
    }

    /// The static objects, in slot order.
    pub fn statics(&self) -> impl Iterator<Item = &ObjectDesc> + '_ {
        self.statics.iter().map(|s| &s.desc)
    }

    /// Looks up `address`. Returns `None` for anything that isn't a live
    /// registered object, including garbage.
    pub fn find(&self, address: usize) -> Option<ObjectRef> {
        if let Ok(i) =
            self.statics.binary_search_by_key(&address, |s| s.desc.address)
        {
            let d = &self.statics[i].desc;
            return Some(ObjectRef::new(d.address, d.kind, d.size, i, 0));
        }
        self.dynamics.read().get(&address).map(DynamicObject::to_ref)
    }

    /// Adds a dynamic object, keyed by the address of its storage.
    pub fn register(
        &self,
        object: DynamicObject,
    ) -> Result<ObjectRef, (RegistryError, DynamicObject)> {
        let address = object.address();
        if self
            .statics
            .binary_search_by_key(&address, |s| s.desc.address)
            .is_ok()
        {
            return Err((RegistryError::Duplicate(address), object));
        }
        let mut dynamics = self.dynamics.write();
        if dynamics.len() >= self.max_dynamic {
            return Err((RegistryError::Full, object));
        }
        if dynamics.contains_key(&address) {
            return Err((RegistryError::Duplicate(address), object));
        }
        let r = object.to_ref();
        dynamics.insert(address, object);
        Ok(r)
    }

    /// Removes the dynamic object at `address`, provided it is still the one
    /// with the given slot generation. The caller decides when to drop it.
    pub fn unregister(
        &self,
        address: usize,
        generation: u32,
    ) -> Option<DynamicObject> {
        let mut dynamics = self.dynamics.write();
        match dynamics.get(&address) {
            Some(o) if o.generation == generation => dynamics.remove(&address),
            _ => None,
        }
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamics.read().len()
    }
}
