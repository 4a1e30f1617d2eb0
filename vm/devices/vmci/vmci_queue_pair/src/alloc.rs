// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue pair creation and local attach.

use crate::QueuePairManager;
use crate::entry::QueuePairEntry;
use crate::protocol::EventType;
use crate::protocol::Handle;
use crate::protocol::INVALID_ID;
use crate::protocol::PrivilegeFlags;
use crate::protocol::QueuePairFlags;
use crate::queue::Queue;
use crate::queue::new_pair;
use crate::registry::Registry;
use crate::status::Error;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// The result of a successful [`QueuePairManager::alloc`].
#[derive(Debug)]
pub struct AllocatedQueuePair {
    /// The queue pair's handle. Differs from the requested handle if that was
    /// [`Handle::INVALID`].
    pub handle: Handle,
    /// The queue this endpoint writes to.
    pub produce_q: Arc<Queue>,
    /// The queue this endpoint reads from.
    pub consume_q: Arc<Queue>,
}

struct AllocRequest {
    handle: Handle,
    produce_size: u64,
    consume_size: u64,
    peer: u32,
    flags: QueuePairFlags,
}

impl QueuePairManager {
    /// Creates the queue pair `handle`, or attaches to it if it is a local
    /// queue pair created earlier in this guest.
    ///
    /// Pass [`Handle::INVALID`] to create a queue pair with a fresh handle.
    /// `peer` is the context allowed to attach, or [`INVALID_ID`] for any.
    pub fn alloc(
        &self,
        handle: Handle,
        produce_size: u64,
        consume_size: u64,
        peer: u32,
        flags: QueuePairFlags,
    ) -> Result<AllocatedQueuePair, Error> {
        self.alloc_priv(
            handle,
            produce_size,
            consume_size,
            peer,
            flags,
            PrivilegeFlags::new(),
        )
    }

    /// Like [`Self::alloc`], with privilege flags for compatibility with the
    /// host interface. Guests cannot request privileges, so any flag fails
    /// with [`Error::NoAccess`].
    pub fn alloc_priv(
        &self,
        handle: Handle,
        produce_size: u64,
        consume_size: u64,
        peer: u32,
        flags: QueuePairFlags,
        privileges: PrivilegeFlags,
    ) -> Result<AllocatedQueuePair, Error> {
        if privileges != PrivilegeFlags::new() {
            return Err(Error::NoAccess);
        }
        if (produce_size == 0 && consume_size == 0) || flags.contains_unsupported_bits() {
            return Err(Error::InvalidArgs);
        }

        self.alloc_inner(AllocRequest {
            handle,
            produce_size,
            consume_size,
            peer,
            flags,
        })
    }

    fn alloc_inner(&self, req: AllocRequest) -> Result<AllocatedQueuePair, Error> {
        let mut registry = self.registry.lock();

        if self.device.is_shutdown() {
            return Err(Error::DeviceNotFound);
        }

        // Once existing queue pairs have been converted for hibernation, new
        // remote ones cannot be created until the guest wakes.
        if self.hibernating.load(Ordering::SeqCst) && !req.flags.local() {
            return Err(Error::Unavailable);
        }

        if registry.find(req.handle).is_some() {
            return self.attach_local(&mut registry, &req);
        }

        let entry = match self.create(&mut registry, &req) {
            Ok(entry) => entry,
            Err((err, entry)) => {
                drop(registry);
                if let Some(entry) = entry {
                    entry.destroy();
                }
                return Err(err);
            }
        };

        let entry = registry.insert(entry);
        let refs = entry.add_ref();
        if entry.is_local() && refs == 1 {
            entry.init_queue_headers();
        }
        Ok(AllocatedQueuePair {
            handle: entry.handle(),
            produce_q: entry.produce_q().clone(),
            consume_q: entry.consume_q().clone(),
        })
    }

    /// Attaches the second endpoint of an existing local queue pair. The
    /// attacher gets the creator's queues with their roles exchanged.
    fn attach_local(
        &self,
        registry: &mut Registry,
        req: &AllocRequest,
    ) -> Result<AllocatedQueuePair, Error> {
        let entry = registry
            .find_mut(req.handle)
            .expect("caller found the entry");

        // A remote queue pair admits a single endpoint in this guest.
        if !entry.is_local() {
            return Err(Error::AlreadyExists);
        }

        if entry.ref_count() > 1 {
            tracing::debug!(handle = %req.handle, "queue pair attached more than once");
            return Err(Error::Unavailable);
        }

        if entry.produce_size() != req.consume_size
            || entry.consume_size() != req.produce_size
            || entry.flags() != req.flags.with_attach_only(false)
        {
            tracing::debug!(
                handle = %req.handle,
                produce_size = req.produce_size,
                consume_size = req.consume_size,
                flags = u32::from(req.flags),
                "mismatched local queue pair attach"
            );
            return Err(Error::QueuePairMismatch);
        }

        self.notify_peer_local(EventType::QP_PEER_ATTACH, req.handle)?;

        entry.add_ref();
        Ok(AllocatedQueuePair {
            handle: entry.handle(),
            produce_q: entry.consume_q().clone(),
            consume_q: entry.produce_q().clone(),
        })
    }

    /// Builds a new, unregistered entry with its queues and PPN set, and
    /// registers remote queue pairs with the device.
    ///
    /// On failure, returns the entry built so far, which the caller must
    /// destroy after dropping the registry lock.
    fn create(
        &self,
        registry: &mut Registry,
        req: &AllocRequest,
    ) -> Result<QueuePairEntry, (Error, Option<QueuePairEntry>)> {
        let produce = self.memory.alloc_queue(req.produce_size).map_err(|err| {
            tracing::warn!(
                error = err.as_ref() as &dyn std::error::Error,
                "failed to allocate produce queue"
            );
            (Error::NoMemory, None)
        })?;
        let consume = self.memory.alloc_queue(req.consume_size).map_err(|err| {
            tracing::warn!(
                error = err.as_ref() as &dyn std::error::Error,
                "failed to allocate consume queue"
            );
            (Error::NoMemory, None)
        })?;
        let (produce_q, consume_q) =
            new_pair(produce, req.produce_size, consume, req.consume_size);

        let context_id = self.device.context_id();
        let mut entry = QueuePairEntry::create(
            registry,
            context_id,
            req.handle,
            req.peer,
            req.flags,
            req.produce_size,
            req.consume_size,
            produce_q,
            consume_q,
        )
        .map_err(|err| (err, None))?;

        if let Err(err) = entry.alloc_ppn_set(self.memory.as_ref()) {
            tracing::warn!(
                handle = %entry.handle(),
                error = err.as_ref() as &dyn std::error::Error,
                "failed to allocate ppn set"
            );
            return Err((Error::NoMemory, Some(entry)));
        }

        if entry.is_local() {
            // Both endpoints of a local queue pair are in this context.
            if entry.handle().context != context_id
                || (entry.peer() != INVALID_ID && entry.peer() != context_id)
            {
                return Err((Error::NoAccess, Some(entry)));
            }
            if entry.flags().attach_only() {
                return Err((Error::NotFound, Some(entry)));
            }
        } else if let Err(err) = self.alloc_hypercall(&entry) {
            tracing::warn!(
                handle = %entry.handle(),
                error = &err as &dyn std::error::Error,
                "queue pair alloc hypercall failed"
            );
            return Err((err, Some(entry)));
        }

        Ok(entry)
    }
}
