// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-kernel event trace.
//!
//! A small ring of the kernel's recent access-control decisions: denials,
//! faults, grants and revocations, object lifecycle. It exists for post-mortem
//! debugging, so it's cheap to write and never allocates. When an event is
//! recorded from the same source line with the same payload as the most recent
//! entry, that entry's count is bumped instead.

use alloc::vec::Vec;

use abi::{DenyReason, FaultInfo, ObjectKind, ThreadId};

/// Everything the kernel writes into its trace.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    None,
    Denied {
        thread: ThreadId,
        address: usize,
        reason: DenyReason,
    },
    Fault {
        thread: ThreadId,
        fault: FaultInfo,
    },
    Granted {
        address: usize,
        thread: ThreadId,
    },
    Revoked {
        address: usize,
        thread: ThreadId,
    },
    RevokedAll(ThreadId),
    Inherited {
        parent: ThreadId,
        child: ThreadId,
    },
    Allocated {
        address: usize,
        kind: ObjectKind,
    },
    Released(usize),
    Spawned {
        parent: ThreadId,
        child: ThreadId,
    },
    Exited(ThreadId),
}

/// A single ring entry: the payload plus where it was recorded from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized type and size.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    /// Creates an empty ring, with every slot holding `init`.
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // If this is the first time this ringbuf has been poked, last will be
        // None. Treating that as an out-of-range index makes the first entry
        // land in slot 0 without reusing anything.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        // A zero-length ring records nothing.
        let Some(ent) = self.buffer.get_mut(ndx) else {
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Copies out the recorded entries, oldest first.
    pub fn snapshot(&self) -> Vec<RingbufEntry<T>> {
        let Some(last) = self.last else {
            return Vec::new();
        };
        let (newer, older) = self.buffer.split_at(last + 1);
        older
            .iter()
            .chain(newer)
            .filter(|e| e.count != 0)
            .copied()
            .collect()
    }
}
