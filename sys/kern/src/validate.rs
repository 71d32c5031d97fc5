// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object validator, and the operations that change what it will say.
//!
//! Every syscall that names a kernel object runs the name through
//! [`Kernel::validate`] before anything else looks at it. The checks go in a
//! fixed order, and the first one to fail is the reason reported:
//!
//! 1. the address is a registered object,
//! 2. of the kind the operation wants,
//! 3. and its slot hasn't been recycled since it was looked up;
//! 4. its initialization state suits the operation;
//! 5. and the caller holds it, or it's public.
//!
//! Validation never touches the object itself and has no side effects beyond
//! the trace, so it is safe to run on any word a thread hands us.

use alloc::sync::Arc;
use alloc::vec::Vec;

use abi::{
    DenyReason, InitRequirement, KindMatch, ObjectKind, ResponseCode,
    ThreadId, UsageError,
};

use crate::err::UserError;
use crate::kobj::{DynamicObject, ObjectRef};
use crate::perms::{ObjectFlags, Orphan};
use crate::pool::OwnedBuffer;
use crate::startup::Kernel;
use crate::trace::TraceEvent;

impl Kernel {
    /// Looks up `address` in the registry. This says nothing about whether
    /// anyone may use it.
    pub fn find(&self, address: usize) -> Option<ObjectRef> {
        self.registry.find(address)
    }

    /// Decides whether `caller` may perform an operation needing an object of
    /// kind `kind` in state `init` on the object at `address`.
    pub fn validate(
        &self,
        caller: ThreadId,
        address: usize,
        kind: KindMatch,
        init: InitRequirement,
    ) -> Result<ObjectRef, DenyReason> {
        let result = self.check(caller, address, kind, init);
        if let Err(reason) = result {
            self.trace(line!(), TraceEvent::Denied {
                thread: caller,
                address,
                reason,
            });
            if self.config().verbose_faults {
                klog!("thread {caller}: {reason} at {address:#x}");
            }
        }
        result
    }

    fn check(
        &self,
        caller: ThreadId,
        address: usize,
        kind: KindMatch,
        init: InitRequirement,
    ) -> Result<ObjectRef, DenyReason> {
        let obj = self.registry.find(address).ok_or(DenyReason::UnknownObject)?;
        if !kind.admits(obj.kind()) {
            return Err(DenyReason::WrongType);
        }
        let access = self.perms.access(&obj, caller)?;
        match init {
            InitRequirement::MustBeInitialized if !access.initialized => {
                return Err(DenyReason::Uninitialized);
            }
            InitRequirement::MustNotBeInitialized if access.initialized => {
                return Err(DenyReason::AlreadyInitialized);
            }
            _ => (),
        }
        if !access.authorized {
            return Err(DenyReason::NotPermitted);
        }
        Ok(obj)
    }

    /// Marks a freshly constructed object live and grants it to `owner`. If
    /// two constructors race, the loser gets `AlreadyInitialized`.
    pub fn object_init(
        &self,
        obj: &ObjectRef,
        owner: ThreadId,
    ) -> Result<(), DenyReason> {
        self.perms.claim_initialized(obj, owner).map(drop)
    }

    /// Claims `obj` for `owner` and then runs `construct` on it. A losing
    /// racer is refused before `construct` runs. If `construct` fails, the
    /// object goes back to uninitialized and `owner` loses any grant the
    /// claim gave it.
    pub fn construct_object(
        &self,
        obj: &ObjectRef,
        owner: ThreadId,
        construct: impl FnOnce() -> Result<(), ResponseCode>,
    ) -> Result<(), UserError> {
        let granted = self
            .perms
            .claim_initialized(obj, owner)
            .map_err(|reason| UserError::denied(reason, obj.address()))?;
        if let Err(rc) = construct() {
            let _ = self.perms.set_initialized(obj, false);
            if granted {
                if let Ok(Some(orphan)) = self.perms.revoke(obj, owner) {
                    self.release_orphan(orphan);
                }
            }
            return Err(rc.into());
        }
        Ok(())
    }

    /// Marks `obj` no longer live. Permissions are untouched.
    pub fn uninit(&self, obj: &ObjectRef) -> Result<(), DenyReason> {
        self.perms.set_initialized(obj, false)
    }

    /// Reinitializes `obj` with `owner` as its only holder, in one step.
    pub fn reinit_sole_owner(
        &self,
        obj: &ObjectRef,
        owner: ThreadId,
    ) -> Result<(), DenyReason> {
        self.perms.reinit_sole_owner(obj, owner)
    }

    /// Hands a reused object to `owner` alone, so nothing granted to the
    /// previous user of that memory carries over. The public flag stays.
    pub fn reset_and_grant_sole(
        &self,
        obj: &ObjectRef,
        owner: ThreadId,
    ) -> Result<(), DenyReason> {
        self.perms.reset_and_grant_sole(obj, owner)?;
        self.trace(line!(), TraceEvent::Granted {
            address: obj.address(),
            thread: owner,
        });
        Ok(())
    }

    pub fn grant(
        &self,
        obj: &ObjectRef,
        thread: ThreadId,
    ) -> Result<(), DenyReason> {
        self.perms.grant(obj, thread)?;
        self.trace(line!(), TraceEvent::Granted {
            address: obj.address(),
            thread,
        });
        Ok(())
    }

    /// Takes `obj` away from `thread`. A dynamic object left with no holders
    /// is released.
    pub fn revoke(
        &self,
        obj: &ObjectRef,
        thread: ThreadId,
    ) -> Result<(), DenyReason> {
        let orphan = self.perms.revoke(obj, thread)?;
        self.trace(line!(), TraceEvent::Revoked {
            address: obj.address(),
            thread,
        });
        if let Some(orphan) = orphan {
            self.release_orphan(orphan);
        }
        Ok(())
    }

    pub fn is_authorized(&self, obj: &ObjectRef, thread: ThreadId) -> bool {
        self.perms.is_authorized(obj, thread)
    }

    /// Opens `obj` to every thread. Public objects are never released.
    pub fn make_public(&self, obj: &ObjectRef) -> Result<(), DenyReason> {
        self.perms.make_public(obj)
    }

    /// Takes every object away from `thread`, releasing any dynamic object
    /// that leaves without holders.
    pub fn revoke_all_for_thread(&self, thread: ThreadId) {
        let orphans = self.perms.revoke_all_for_thread(thread);
        self.trace(line!(), TraceEvent::RevokedAll(thread));
        for orphan in orphans {
            self.release_orphan(orphan);
        }
    }

    /// Grants `child` everything `parent` holds right now.
    pub fn inherit(&self, parent: ThreadId, child: ThreadId) {
        self.perms.inherit(parent, child);
        self.trace(line!(), TraceEvent::Inherited { parent, child });
    }

    /// Addresses of the objects explicitly granted to `thread`.
    pub fn permissions_view(&self, thread: ThreadId) -> Vec<usize> {
        self.perms.permissions_view(thread)
    }

    /// Allocates a new object of `kind` from the caller's resource pool and
    /// grants it to the caller. The object starts out uninitialized.
    pub fn alloc_object(
        &self,
        caller: ThreadId,
        kind: ObjectKind,
    ) -> Result<ObjectRef, UserError> {
        let size = kind.storage_size().ok_or(UsageError::BadObjectKind)?;
        if !self.config().dynamic_objects {
            return Err(ResponseCode::NotSupported.into());
        }
        let pool = self
            .with_thread(caller, |t| Arc::clone(t.pool()))
            .ok_or(UsageError::IllegalThread)?;

        let storage = OwnedBuffer::alloc_zeroed(&pool, size)
            .ok_or(UserError::code(ResponseCode::NoMemory))?;
        let (slot, generation) = self
            .perms
            .alloc_slot(storage.addr(), ObjectFlags::DYNAMIC)
            .ok_or(UserError::code(ResponseCode::NoMemory))?;

        let obj = match self
            .registry
            .register(DynamicObject::new(kind, slot, generation, storage))
        {
            Ok(obj) => obj,
            Err((e, _storage)) => {
                klog!("can't register new {}: {e:?}", kind.name());
                self.perms.free_slot(slot, generation);
                return Err(ResponseCode::NoMemory.into());
            }
        };
        // Nobody else knows the address yet, so the slot can't have changed.
        self.perms
            .grant(&obj, caller)
            .map_err(|reason| UserError::denied(reason, obj.address()))?;
        self.trace(line!(), TraceEvent::Allocated {
            address: obj.address(),
            kind,
        });
        Ok(obj)
    }

    /// Gives up the caller's own access to `obj`.
    pub fn release_object(
        &self,
        caller: ThreadId,
        obj: &ObjectRef,
    ) -> Result<(), DenyReason> {
        self.revoke(obj, caller)
    }

    /// Destroys an orphaned dynamic object: its slot is retired, so every
    /// outstanding handle goes stale, and then its storage is freed.
    pub(crate) fn release_orphan(&self, orphan: Orphan) {
        if !self.perms.retire_orphan(&orphan) {
            // Somebody was granted it in the meantime.
            return;
        }
        if let Some(object) =
            self.registry.unregister(orphan.address, orphan.generation)
        {
            self.trace(line!(), TraceEvent::Released(orphan.address));
            self.queue_released(object.to_ref());
            drop(object);
        }
    }
}
