// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-side VMCI queue pair management.
//!
//! A queue pair is a pair of shared memory ring buffers identified by a
//! [`Handle`]. Remote queue pairs are shared with the hypervisor, which
//! connects them to a peer in another context. Local queue pairs connect two
//! endpoints in this guest and have no hypervisor state.
//!
//! [`QueuePairManager`] tracks the live queue pairs, drives the allocate,
//! attach and detach protocol with the device, and converts remote queue
//! pairs to local copies when the guest hibernates.
//!
//! # Locking
//!
//! Locks are acquired in this order:
//!
//! 1. The registry lock. Allocation, detach, conversion and teardown decide
//!    and act while holding it, including across datagrams to the device.
//! 2. A queue pair mutex, shared by the two queues of one queue pair. Held
//!    while that queue pair's memory is copied and swapped.
//! 3. The hibernate-failed set lock. It is taken without the registry lock
//!    when leaving hibernation.
//! 4. The event bus subscriber lock, inside [`EventDispatch`]. Detach events
//!    are dispatched while holding the hibernate-failed set lock, so event
//!    subscribers must not call back into the manager.

#![forbid(unsafe_code)]

mod alloc;
mod detach;
mod entry;
mod hibernate;
pub mod platform;
pub mod protocol;
mod queue;
mod registry;
mod status;

#[cfg(test)]
mod test_helpers;

pub use crate::alloc::AllocatedQueuePair;
pub use crate::entry::QueuePairInfo;
pub use crate::protocol::Handle;
pub use crate::protocol::PrivilegeFlags;
pub use crate::protocol::QueuePairFlags;
pub use crate::queue::Queue;
pub use crate::queue::QueueBuffer;
pub use crate::queue::QueueError;
pub use crate::status::Error;
pub use crate::status::VmciError;
pub use crate::status::VmciStatus;

use crate::entry::QueuePairEntry;
use crate::platform::DatagramTransport;
use crate::platform::EventDispatch;
use crate::platform::GuestDevice;
use crate::platform::QueueMemory;
use crate::protocol::DATAGRAM_HEADER_SIZE;
use crate::protocol::DatagramHeader;
use crate::protocol::EventType;
use crate::protocol::QUEUEPAIR_ALLOC;
use crate::protocol::QueuePairAllocMsg;
use crate::protocol::QueuePairDetachMsg;
use crate::protocol::QueuePairEventMsg;
use crate::registry::Registry;
use parking_lot::Mutex;
use std::mem::size_of;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use zerocopy::IntoBytes;

/// Owns every queue pair of one VMCI guest device.
pub struct QueuePairManager {
    device: Box<dyn GuestDevice>,
    memory: Box<dyn QueueMemory>,
    transport: Box<dyn DatagramTransport>,
    events: Box<dyn EventDispatch>,
    registry: Mutex<Registry>,
    /// Set between entering and leaving hibernation. Blocks the creation of
    /// remote queue pairs.
    hibernating: AtomicBool,
    /// Handles of remote queue pairs that could not be converted to local
    /// ones on the way into hibernation.
    hibernate_failed: Mutex<Vec<Handle>>,
}

impl QueuePairManager {
    pub fn new(
        device: impl GuestDevice + 'static,
        memory: impl QueueMemory + 'static,
        transport: impl DatagramTransport + 'static,
        events: impl EventDispatch + 'static,
    ) -> Self {
        Self {
            device: Box::new(device),
            memory: Box::new(memory),
            transport: Box::new(transport),
            events: Box::new(events),
            registry: Mutex::new(Registry::new()),
            hibernating: AtomicBool::new(false),
            hibernate_failed: Mutex::new(Vec::new()),
        }
    }

    /// Destroys every queue pair, whatever its reference count.
    ///
    /// Remote queue pairs are detached from the device on a best-effort basis.
    /// Outstanding [`Queue`] handles see their memory as released.
    pub fn teardown(&self) {
        let mut registry = self.registry.lock();
        let mut count = 0;
        for mut entry in registry.drain() {
            if !entry.is_local() {
                if let Err(err) = self.detach_hypercall(entry.handle()) {
                    tracing::debug!(
                        handle = %entry.handle(),
                        error = &err as &dyn std::error::Error,
                        "detach failed during teardown"
                    );
                }
            }
            entry.clear_refs();
            entry.destroy();
            count += 1;
        }
        self.hibernating.store(false, Ordering::SeqCst);
        self.hibernate_failed.lock().clear();
        drop(registry);
        tracing::info!(count, "queue pairs torn down");
    }

    /// Waits for any in-flight allocation, detach or conversion to finish.
    ///
    /// Call this after changing state that those operations check, such as
    /// the device shutdown flag.
    pub fn sync(&self) {
        drop(self.registry.lock());
    }

    /// Returns the bookkeeping of the queue pair `handle`, if it exists.
    pub fn entry_info(&self, handle: Handle) -> Option<QueuePairInfo> {
        self.registry.lock().find(handle).map(|entry| entry.info())
    }

    /// The number of live queue pairs.
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_hibernating(&self) -> bool {
        self.hibernating.load(Ordering::SeqCst)
    }

    /// Handles of queue pairs whose conversion to local failed and which have
    /// not been resolved yet.
    pub fn hibernate_failed_handles(&self) -> Vec<Handle> {
        self.hibernate_failed.lock().clone()
    }

    /// Asks the device to create or attach to the remote queue pair described
    /// by `entry`, passing the pages of both queues.
    fn alloc_hypercall(&self, entry: &QueuePairEntry) -> Result<(), Error> {
        if entry.num_ppns() <= 2 {
            return Err(Error::InvalidArgs);
        }
        let ppns = entry.ppn_set().ppns();
        if ppns.len() as u64 != entry.num_ppns() {
            tracing::warn!(
                handle = %entry.handle(),
                expected = entry.num_ppns(),
                actual = ppns.len(),
                "ppn set does not cover the queue pair"
            );
            return Err(Error::InvalidArgs);
        }

        let msg_size = size_of::<QueuePairAllocMsg>() + ppns.as_bytes().len();
        let msg = QueuePairAllocMsg {
            hdr: DatagramHeader::hypervisor_request(
                QUEUEPAIR_ALLOC,
                msg_size - DATAGRAM_HEADER_SIZE,
            ),
            handle: entry.handle(),
            peer: entry.peer(),
            flags: entry.flags(),
            produce_size: entry.produce_size(),
            consume_size: entry.consume_size(),
            num_ppns: entry.num_ppns(),
        };

        let mut datagram = Vec::with_capacity(msg_size);
        datagram.extend_from_slice(msg.as_bytes());
        datagram.extend_from_slice(ppns.as_bytes());
        self.transport.send_datagram(&datagram).result()?;
        Ok(())
    }

    fn detach_hypercall(&self, handle: Handle) -> Result<(), VmciError> {
        self.transport
            .send_datagram(QueuePairDetachMsg::new(handle).as_bytes())
            .result()
    }

    /// Tells local subscribers that this guest's peer endpoint attached to or
    /// detached from `handle`.
    fn notify_peer_local(&self, event: EventType, handle: Handle) -> Result<(), VmciError> {
        let context_id = self.device.context_id();
        let msg = QueuePairEventMsg::new(context_id, event, context_id, handle);
        self.events.dispatch(msg.as_bytes()).result()
    }
}
