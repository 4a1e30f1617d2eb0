// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue handles and the memory behind them.
//!
//! Both queues of a queue pair share one mutex, which guards the buffers
//! while a queue pair's memory is swapped for a local copy. When both
//! endpoints of a local queue pair are attached, each one holds the same two
//! [`Queue`]s with their roles exchanged.

use crate::platform::PpnSet;
use crate::platform::QueueMemory;
use crate::protocol::Handle;
use crate::protocol::PAGE_SIZE;
use crate::protocol::QueueHeader;
use anyhow::Context as _;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Memory backing one queue: a header page followed by the data pages.
pub trait QueueBuffer: Send {
    /// The page numbers of the buffer, header page first. Empty for buffers
    /// that are not shared with the hypervisor.
    fn pfns(&self) -> &[u64];

    /// The size of the buffer in bytes.
    fn len(&self) -> usize;

    /// Reads `data.len()` bytes at `offset`. The range is within
    /// [`Self::len`].
    fn read_at(&self, offset: usize, data: &mut [u8]);

    /// Writes `data` at `offset`. The range is within [`Self::len`].
    fn write_at(&mut self, offset: usize, data: &[u8]);
}

/// Errors accessing a [`Queue`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue pair was destroyed and its memory freed.
    #[error("queue memory has been released")]
    Released,
    #[error("access of {len:#x} bytes at {offset:#x} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
}

/// One queue of a queue pair, from the creator's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Produce,
    Consume,
}

pub(crate) struct PairBuffers {
    produce: Option<Box<dyn QueueBuffer>>,
    consume: Option<Box<dyn QueueBuffer>>,
}

/// The buffers of a queue pair behind the queue pair mutex.
pub(crate) type PairLock = Arc<Mutex<PairBuffers>>;

impl PairBuffers {
    fn slot(&self, role: Role) -> Option<&dyn QueueBuffer> {
        match role {
            Role::Produce => self.produce.as_deref(),
            Role::Consume => self.consume.as_deref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> Option<&mut Box<dyn QueueBuffer>> {
        match role {
            Role::Produce => self.produce.as_mut(),
            Role::Consume => self.consume.as_mut(),
        }
    }

    /// Collects the page numbers of both queues.
    pub fn ppn_set(
        &self,
        memory: &dyn QueueMemory,
        produce_pages: u64,
        consume_pages: u64,
    ) -> anyhow::Result<PpnSet> {
        let produce = self.slot(Role::Produce).context("produce queue released")?;
        let consume = self.slot(Role::Consume).context("consume queue released")?;
        memory.alloc_ppn_set(produce, produce_pages, consume, consume_pages)
    }

    /// Writes a fresh header into both queues.
    pub fn init_headers(&mut self, handle: Handle) {
        let header = QueueHeader::new(handle);
        for buf in [&mut self.produce, &mut self.consume].into_iter().flatten() {
            buf.write_at(0, header.as_bytes());
        }
    }

    /// Copies the queue in `role` into a newly allocated local buffer. Only
    /// the header page is copied unless `keep_content` is set.
    ///
    /// The current buffer is left untouched; the copy takes effect once it is
    /// passed to [`Self::replace`].
    pub fn snapshot(
        &self,
        role: Role,
        size: u64,
        keep_content: bool,
        memory: &dyn QueueMemory,
    ) -> anyhow::Result<Box<dyn QueueBuffer>> {
        let source = self.slot(role).context("queue memory released")?;
        let mut local = memory
            .alloc_local_queue(size)
            .context("failed to allocate local queue")?;

        if local.len() < source.len() {
            anyhow::bail!(
                "local queue too small: {:#x} < {:#x}",
                local.len(),
                source.len()
            );
        }

        let len = if keep_content {
            source.len()
        } else {
            source.len().min(PAGE_SIZE as usize)
        };
        copy_buffer(source, &mut *local, len);
        Ok(local)
    }

    /// Installs new buffers for both queues, returning the old ones.
    pub fn replace(
        &mut self,
        produce: Box<dyn QueueBuffer>,
        consume: Box<dyn QueueBuffer>,
    ) -> [Option<Box<dyn QueueBuffer>>; 2] {
        [self.produce.replace(produce), self.consume.replace(consume)]
    }

    /// Takes both buffers out of the pair. Any further access through a
    /// [`Queue`] fails with [`QueueError::Released`].
    pub fn release(&mut self) -> [Option<Box<dyn QueueBuffer>>; 2] {
        [self.produce.take(), self.consume.take()]
    }
}

fn copy_buffer(source: &dyn QueueBuffer, dest: &mut dyn QueueBuffer, len: usize) {
    let mut page = [0; PAGE_SIZE as usize];
    let mut offset = 0;
    while offset < len {
        let n = (len - offset).min(page.len());
        source.read_at(offset, &mut page[..n]);
        dest.write_at(offset, &page[..n]);
        offset += n;
    }
}

/// A handle to one queue of a queue pair.
///
/// The memory is owned by the queue pair. After the last detach the memory is
/// freed and accesses through outstanding handles fail.
pub struct Queue {
    size: u64,
    role: Role,
    pair: PairLock,
}

impl Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("size", &self.size)
            .field("role", &self.role)
            .finish()
    }
}

/// Creates the two queues of a new queue pair around freshly allocated
/// buffers. Both queues share one queue pair mutex.
pub(crate) fn new_pair(
    produce: Box<dyn QueueBuffer>,
    produce_size: u64,
    consume: Box<dyn QueueBuffer>,
    consume_size: u64,
) -> (Arc<Queue>, Arc<Queue>) {
    let pair = Arc::new(Mutex::new(PairBuffers {
        produce: Some(produce),
        consume: Some(consume),
    }));
    (
        Arc::new(Queue {
            size: produce_size,
            role: Role::Produce,
            pair: pair.clone(),
        }),
        Arc::new(Queue {
            size: consume_size,
            role: Role::Consume,
            pair,
        }),
    )
}

impl Queue {
    /// The data capacity of the queue in bytes, excluding the header page.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_released(&self) -> bool {
        self.pair.lock().slot(self.role).is_none()
    }

    /// Reads the queue header.
    pub fn read_header(&self) -> Result<QueueHeader, QueueError> {
        let mut header = QueueHeader::new_zeroed();
        self.read_at(0, header.as_mut_bytes())?;
        Ok(header)
    }

    /// Reads raw queue memory. Offset zero is the start of the header page.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) -> Result<(), QueueError> {
        let pair = self.pair.lock();
        let buf = pair.slot(self.role).ok_or(QueueError::Released)?;
        check_bounds(buf.len(), offset, data.len())?;
        buf.read_at(offset, data);
        Ok(())
    }

    /// Writes raw queue memory. Offset zero is the start of the header page.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), QueueError> {
        let mut pair = self.pair.lock();
        let buf = pair.slot_mut(self.role).ok_or(QueueError::Released)?;
        check_bounds(buf.len(), offset, data.len())?;
        buf.write_at(offset, data);
        Ok(())
    }

    pub(crate) fn pair(&self) -> &PairLock {
        &self.pair
    }

    pub(crate) fn lock_pair(&self) -> MutexGuard<'_, PairBuffers> {
        self.pair.lock()
    }

    /// Returns true if `self` and `other` are the same queue.
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.pair, &other.pair) && self.role == other.role
    }
}

fn check_bounds(buf_len: usize, offset: usize, len: usize) -> Result<(), QueueError> {
    if offset.checked_add(len).is_some_and(|end| end <= buf_len) {
        Ok(())
    } else {
        Err(QueueError::OutOfBounds { offset, len })
    }
}
