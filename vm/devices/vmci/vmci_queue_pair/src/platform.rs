// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces to the platform services the queue pair core depends on.
//!
//! Each guest OS provides one implementation of these traits. Nothing in the
//! allocation, detach or hibernation logic depends on which one is in use.

use crate::queue::QueueBuffer;
use crate::status::VmciStatus;

/// State of the VMCI guest device.
pub trait GuestDevice: Send + Sync {
    /// The context id the hypervisor assigned to this guest.
    fn context_id(&self) -> u32;

    /// Returns true once the device has started shutting down. No queue pairs
    /// may be created or attached after that point.
    fn is_shutdown(&self) -> bool;
}

/// Allocation of queue memory and of the page descriptors backing it.
pub trait QueueMemory: Send + Sync {
    /// Allocates a queue with room for `size` bytes of data plus one header
    /// page, backed by pages that can be shared with the hypervisor.
    fn alloc_queue(&self, size: u64) -> anyhow::Result<Box<dyn QueueBuffer>>;

    /// Allocates a queue of the same shape as [`Self::alloc_queue`] in memory
    /// private to the guest. Used to hold the contents of a queue pair that
    /// has been cut off from the hypervisor.
    fn alloc_local_queue(&self, size: u64) -> anyhow::Result<Box<dyn QueueBuffer>>;

    /// Collects the page numbers of both queues. `produce_pages` and
    /// `consume_pages` include each queue's header page.
    fn alloc_ppn_set(
        &self,
        produce: &dyn QueueBuffer,
        produce_pages: u64,
        consume: &dyn QueueBuffer,
        consume_pages: u64,
    ) -> anyhow::Result<PpnSet>;
}

/// Sends datagrams to the hypervisor.
pub trait DatagramTransport: Send + Sync {
    /// Sends `datagram`, which starts with a
    /// [`DatagramHeader`](crate::protocol::DatagramHeader), and waits for the
    /// hypervisor's status.
    fn send_datagram(&self, datagram: &[u8]) -> VmciStatus;
}

/// The guest's event bus.
pub trait EventDispatch: Send + Sync {
    /// Delivers `event` to local subscribers.
    fn dispatch(&self, event: &[u8]) -> VmciStatus;
}

/// The physical page numbers backing a queue pair, in the order the
/// hypervisor expects them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PpnSet {
    ppns: Vec<u64>,
}

impl PpnSet {
    pub fn new(ppns: Vec<u64>) -> Self {
        Self { ppns }
    }

    pub fn ppns(&self) -> &[u64] {
        &self.ppns
    }

    pub fn len(&self) -> usize {
        self.ppns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ppns.is_empty()
    }
}
