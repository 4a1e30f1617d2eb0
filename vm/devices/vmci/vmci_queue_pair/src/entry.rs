// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue pair entries and the resources they own.

use crate::platform::PpnSet;
use crate::platform::QueueMemory;
use crate::protocol::Handle;
use crate::protocol::QueuePairFlags;
use crate::protocol::data_pages;
use crate::protocol::num_ppns;
use crate::queue::Queue;
use crate::registry::Registry;
use crate::status::Error;
use std::sync::Arc;

/// The bookkeeping for one live queue pair.
///
/// An entry is in the registry exactly when its reference count is nonzero.
/// It owns both queues and the PPN set, which are freed by [`Self::destroy`].
pub(crate) struct QueuePairEntry {
    handle: Handle,
    peer: u32,
    flags: QueuePairFlags,
    produce_size: u64,
    consume_size: u64,
    num_ppns: u64,
    ppn_set: PpnSet,
    produce_q: Arc<Queue>,
    consume_q: Arc<Queue>,
    ref_count: u32,
    hibernate_failure: bool,
}

/// A copy of a queue pair's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePairInfo {
    pub handle: Handle,
    pub peer: u32,
    pub flags: QueuePairFlags,
    pub produce_size: u64,
    pub consume_size: u64,
    pub num_ppns: u64,
    pub ref_count: u32,
    /// The queue pair could not be converted to a local one when the guest
    /// last entered hibernation.
    pub hibernate_failure: bool,
}

impl QueuePairEntry {
    /// Builds an unregistered entry with no references around two freshly
    /// allocated queues.
    ///
    /// If `handle` is invalid, a free handle in `context_id` is assigned.
    /// Fails with [`Error::NoMemory`] if no resource id is free.
    #[expect(clippy::too_many_arguments)]
    pub fn create(
        registry: &mut Registry,
        context_id: u32,
        handle: Handle,
        peer: u32,
        flags: QueuePairFlags,
        produce_size: u64,
        consume_size: u64,
        produce_q: Arc<Queue>,
        consume_q: Arc<Queue>,
    ) -> Result<Self, Error> {
        assert!(produce_size != 0 || consume_size != 0);

        let handle = if handle.is_invalid() {
            registry.allocate_handle(context_id).ok_or_else(|| {
                tracing::warn!(context_id, "no free queue pair resource ids");
                Error::NoMemory
            })?
        } else {
            handle
        };
        assert!(registry.find(handle).is_none());

        Ok(Self {
            handle,
            peer,
            flags,
            produce_size,
            consume_size,
            num_ppns: num_ppns(produce_size, consume_size),
            ppn_set: PpnSet::default(),
            produce_q,
            consume_q,
            ref_count: 0,
            hibernate_failure: false,
        })
    }

    /// Frees the queue memory and the PPN set. Outstanding [`Queue`] handles
    /// see the memory as released.
    pub fn destroy(self) {
        assert_eq!(self.ref_count, 0, "destroying referenced queue pair");
        let _buffers = self.produce_q.lock_pair().release();
    }

    /// Collects the page numbers of both queues, including their header pages.
    pub fn alloc_ppn_set(&mut self, memory: &dyn QueueMemory) -> anyhow::Result<()> {
        let produce_pages = data_pages(self.produce_size) + 1;
        let consume_pages = data_pages(self.consume_size) + 1;
        self.ppn_set = self
            .produce_q
            .lock_pair()
            .ppn_set(memory, produce_pages, consume_pages)?;
        Ok(())
    }

    pub fn init_queue_headers(&self) {
        self.produce_q.lock_pair().init_headers(self.handle);
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn peer(&self) -> u32 {
        self.peer
    }

    pub fn flags(&self) -> QueuePairFlags {
        self.flags
    }

    pub fn is_local(&self) -> bool {
        self.flags.local()
    }

    /// Marks the queue pair as having no hypervisor state.
    pub fn set_local(&mut self) {
        self.flags.set_local(true);
    }

    pub fn produce_size(&self) -> u64 {
        self.produce_size
    }

    pub fn consume_size(&self) -> u64 {
        self.consume_size
    }

    pub fn num_ppns(&self) -> u64 {
        self.num_ppns
    }

    pub fn ppn_set(&self) -> &PpnSet {
        &self.ppn_set
    }

    pub fn produce_q(&self) -> &Arc<Queue> {
        &self.produce_q
    }

    pub fn consume_q(&self) -> &Arc<Queue> {
        &self.consume_q
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn add_ref(&mut self) -> u32 {
        assert!(self.ref_count < 2, "queue pair {} over-attached", self.handle);
        self.ref_count += 1;
        self.ref_count
    }

    pub fn release_ref(&mut self) -> u32 {
        assert!(self.ref_count > 0);
        self.ref_count -= 1;
        self.ref_count
    }

    /// Drops all references regardless of the attached endpoints.
    pub fn clear_refs(&mut self) {
        self.ref_count = 0;
    }

    pub fn hibernate_failure(&self) -> bool {
        self.hibernate_failure
    }

    pub fn set_hibernate_failure(&mut self, failed: bool) {
        self.hibernate_failure = failed;
    }

    pub fn info(&self) -> QueuePairInfo {
        QueuePairInfo {
            handle: self.handle,
            peer: self.peer,
            flags: self.flags,
            produce_size: self.produce_size,
            consume_size: self.consume_size,
            num_ppns: self.num_ppns,
            ref_count: self.ref_count,
            hibernate_failure: self.hibernate_failure,
        }
    }
}
