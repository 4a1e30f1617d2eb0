// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The set of live queue pairs and the resource id allocator.
//!
//! A [`Registry`] only exists behind the queue pair manager's registry lock,
//! so holding a `&mut Registry` is proof that the lock is held.

use crate::entry::QueuePairEntry;
use crate::protocol::Handle;
use crate::protocol::RESERVED_RESOURCE_ID_MAX;
use std::collections::HashMap;
use std::collections::hash_map;

pub(crate) struct Registry {
    entries: HashMap<Handle, QueuePairEntry>,
    resource_ids: ResourceIdAllocator,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            resource_ids: ResourceIdAllocator::new(),
        }
    }

    /// Finds the entry for `handle`. The invalid handle never matches.
    pub fn find(&self, handle: Handle) -> Option<&QueuePairEntry> {
        if handle.is_invalid() {
            return None;
        }
        self.entries.get(&handle)
    }

    pub fn find_mut(&mut self, handle: Handle) -> Option<&mut QueuePairEntry> {
        if handle.is_invalid() {
            return None;
        }
        self.entries.get_mut(&handle)
    }

    /// Inserts `entry`, whose handle must not be in use.
    pub fn insert(&mut self, entry: QueuePairEntry) -> &mut QueuePairEntry {
        match self.entries.entry(entry.handle()) {
            hash_map::Entry::Vacant(slot) => slot.insert(entry),
            hash_map::Entry::Occupied(_) => {
                panic!("duplicate queue pair handle {}", entry.handle())
            }
        }
    }

    /// Unlinks the entry for `handle` without destroying it.
    pub fn remove(&mut self, handle: Handle) -> Option<QueuePairEntry> {
        self.entries.remove(&handle)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueuePairEntry> {
        self.entries.values_mut()
    }

    /// Unlinks every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = QueuePairEntry> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Picks a handle in `context_id` that no live entry uses, or `None` if
    /// the resource id space is exhausted.
    pub fn allocate_handle(&mut self, context_id: u32) -> Option<Handle> {
        let entries = &self.entries;
        self.resource_ids
            .allocate(context_id, |handle| entries.contains_key(&handle))
    }
}

/// Hands out resource ids above the reserved range, in increasing order,
/// wrapping back to the first unreserved id.
#[derive(Debug)]
pub(crate) struct ResourceIdAllocator {
    next: u32,
    first: u32,
    last: u32,
}

impl ResourceIdAllocator {
    pub fn new() -> Self {
        Self::with_range(RESERVED_RESOURCE_ID_MAX + 1, u32::MAX)
    }

    fn with_range(first: u32, last: u32) -> Self {
        assert!(first <= last);
        Self {
            next: first,
            first,
            last,
        }
    }

    fn advance(&mut self) {
        self.next = if self.next == self.last {
            self.first
        } else {
            self.next + 1
        };
    }

    /// Returns the first handle at or after the cursor for which `in_use`
    /// returns false. Gives up after one full cycle.
    pub fn allocate(&mut self, context_id: u32, in_use: impl Fn(Handle) -> bool) -> Option<Handle> {
        let start = self.next;
        loop {
            let handle = Handle::new(context_id, self.next);
            self.advance();
            if !in_use(handle) {
                return Some(handle);
            }
            if self.next == start {
                return None;
            }
        }
    }
}
