// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory implementations of the platform interfaces for tests.

use crate::AllocatedQueuePair;
use crate::QueuePairManager;
use crate::platform::DatagramTransport;
use crate::platform::EventDispatch;
use crate::platform::GuestDevice;
use crate::platform::PpnSet;
use crate::platform::QueueMemory;
use crate::protocol::DATAGRAM_HEADER_SIZE;
use crate::protocol::DatagramHeader;
use crate::protocol::EventType;
use crate::protocol::Handle;
use crate::protocol::INVALID_ID;
use crate::protocol::PAGE_SIZE;
use crate::protocol::QUEUEPAIR_ALLOC;
use crate::protocol::QUEUEPAIR_DETACH;
use crate::protocol::QueuePairAllocMsg;
use crate::protocol::QueuePairDetachMsg;
use crate::protocol::QueuePairEventMsg;
use crate::protocol::QueuePairFlags;
use crate::protocol::data_pages;
use crate::queue::QueueBuffer;
use crate::status::Error;
use crate::status::VmciStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use tracing::metadata::LevelFilter;
use zerocopy::FromBytes;

/// The context id of the guest in tests.
pub const CONTEXT_ID: u32 = 7;

/// Initializes `tracing` output for tests.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .try_init();
    });
}

#[derive(Clone)]
pub struct TestDevice {
    context_id: u32,
    shutdown: Arc<AtomicBool>,
}

impl TestDevice {
    pub fn new(context_id: u32) -> Self {
        Self {
            context_id,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl GuestDevice for TestDevice {
    fn context_id(&self) -> u32 {
        self.context_id
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Fails the nth request from the time it is armed, once.
#[derive(Default)]
struct FailAt(Mutex<Option<usize>>);

impl FailAt {
    fn arm(&self, n: usize) {
        *self.0.lock() = Some(n);
    }

    fn should_fail(&self) -> bool {
        let mut remaining = self.0.lock();
        let Some(n) = *remaining else {
            return false;
        };
        *remaining = n.checked_sub(1);
        n == 0
    }
}

#[derive(Default)]
struct MemoryState {
    live: AtomicUsize,
    live_shared: AtomicUsize,
    local_allocs: AtomicUsize,
    next_pfn: AtomicU64,
    fail_queue: FailAt,
    fail_local_queue: FailAt,
    fail_ppn_set: FailAt,
    short_ppn_set: AtomicBool,
}

/// Queue memory backed by heap buffers, with a count of live buffers.
#[derive(Clone, Default)]
pub struct TestMemory {
    state: Arc<MemoryState>,
}

impl TestMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Live buffers that are shared with the hypervisor.
    pub fn live_shared_buffers(&self) -> usize {
        self.state.live_shared.load(Ordering::SeqCst)
    }

    /// The number of local queue allocations so far, successful or not.
    pub fn local_allocs(&self) -> usize {
        self.state.local_allocs.load(Ordering::SeqCst)
    }

    /// Fails the `n`th shared queue allocation from now, counting from zero.
    pub fn fail_queue_at(&self, n: usize) {
        self.state.fail_queue.arm(n);
    }

    /// Fails the `n`th local queue allocation from now, counting from zero.
    pub fn fail_local_queue_at(&self, n: usize) {
        self.state.fail_local_queue.arm(n);
    }

    pub fn fail_next_ppn_set(&self) {
        self.state.fail_ppn_set.arm(0);
    }

    /// Makes PPN sets leave out the last page.
    pub fn short_ppn_sets(&self) {
        self.state.short_ppn_set.store(true, Ordering::SeqCst);
    }

    fn alloc(&self, size: u64, shared: bool) -> Box<dyn QueueBuffer> {
        let pages = data_pages(size) + 1;
        let pfns = if shared {
            let base = self.state.next_pfn.fetch_add(pages, Ordering::SeqCst);
            (base..base + pages).collect()
        } else {
            Vec::new()
        };
        self.state.live.fetch_add(1, Ordering::SeqCst);
        if shared {
            self.state.live_shared.fetch_add(1, Ordering::SeqCst);
        }
        Box::new(TestBuffer {
            data: vec![0; (pages * PAGE_SIZE) as usize],
            pfns,
            shared,
            state: self.state.clone(),
        })
    }
}

impl QueueMemory for TestMemory {
    fn alloc_queue(&self, size: u64) -> anyhow::Result<Box<dyn QueueBuffer>> {
        if self.state.fail_queue.should_fail() {
            anyhow::bail!("out of queue memory");
        }
        Ok(self.alloc(size, true))
    }

    fn alloc_local_queue(&self, size: u64) -> anyhow::Result<Box<dyn QueueBuffer>> {
        self.state.local_allocs.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_local_queue.should_fail() {
            anyhow::bail!("out of local queue memory");
        }
        Ok(self.alloc(size, false))
    }

    fn alloc_ppn_set(
        &self,
        produce: &dyn QueueBuffer,
        produce_pages: u64,
        consume: &dyn QueueBuffer,
        consume_pages: u64,
    ) -> anyhow::Result<PpnSet> {
        if self.state.fail_ppn_set.should_fail() {
            anyhow::bail!("out of memory for ppn set");
        }
        if produce.pfns().len() as u64 != produce_pages
            || consume.pfns().len() as u64 != consume_pages
        {
            anyhow::bail!("queue is not shared");
        }
        let mut ppns: Vec<u64> = produce.pfns().iter().chain(consume.pfns()).copied().collect();
        if self.state.short_ppn_set.load(Ordering::SeqCst) {
            ppns.pop();
        }
        Ok(PpnSet::new(ppns))
    }
}

struct TestBuffer {
    data: Vec<u8>,
    pfns: Vec<u64>,
    shared: bool,
    state: Arc<MemoryState>,
}

impl QueueBuffer for TestBuffer {
    fn pfns(&self) -> &[u64] {
        &self.pfns
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) {
        data.copy_from_slice(&self.data[offset..offset + data.len()]);
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) {
        self.data[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Drop for TestBuffer {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        if self.shared {
            self.state.live_shared.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// An allocation request as the device received it.
#[derive(Debug, Clone)]
pub struct SentAlloc {
    pub msg: QueuePairAllocMsg,
    pub ppns: Vec<u64>,
}

struct TransportState {
    allocs: Vec<SentAlloc>,
    detaches: Vec<Handle>,
    alloc_status: VmciStatus,
    detach_status: HashMap<Handle, VmciStatus>,
}

/// A device that records queue pair datagrams and answers with scripted
/// statuses.
#[derive(Clone)]
pub struct TestTransport {
    state: Arc<Mutex<TransportState>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                allocs: Vec::new(),
                detaches: Vec::new(),
                alloc_status: VmciStatus::SUCCESS_QUEUEPAIR_CREATE,
                detach_status: HashMap::new(),
            })),
        }
    }

    pub fn allocs(&self) -> Vec<SentAlloc> {
        self.state.lock().allocs.clone()
    }

    /// Handles of all detach requests, including failed ones.
    pub fn detaches(&self) -> Vec<Handle> {
        self.state.lock().detaches.clone()
    }

    pub fn set_alloc_status(&self, status: VmciStatus) {
        self.state.lock().alloc_status = status;
    }

    pub fn set_detach_status(&self, handle: Handle, status: VmciStatus) {
        self.state.lock().detach_status.insert(handle, status);
    }

    pub fn clear_detach_status(&self, handle: Handle) {
        self.state.lock().detach_status.remove(&handle);
    }
}

impl DatagramTransport for TestTransport {
    fn send_datagram(&self, datagram: &[u8]) -> VmciStatus {
        let (hdr, _) = DatagramHeader::read_from_prefix(datagram).unwrap();
        assert_eq!(hdr.src, DatagramHeader::ANON_SRC);
        assert_eq!(hdr.dst.context, 0);
        assert_eq!(
            hdr.payload_size as usize,
            datagram.len() - DATAGRAM_HEADER_SIZE
        );

        let mut state = self.state.lock();
        match hdr.dst.resource {
            QUEUEPAIR_ALLOC => {
                let (msg, rest) = QueuePairAllocMsg::read_from_prefix(datagram).unwrap();
                let ppns: Vec<u64> = rest
                    .chunks_exact(8)
                    .map(|ppn| u64::read_from_bytes(ppn).unwrap())
                    .collect();
                assert_eq!(ppns.len() as u64, msg.num_ppns);
                state.allocs.push(SentAlloc { msg, ppns });
                state.alloc_status
            }
            QUEUEPAIR_DETACH => {
                let msg = QueuePairDetachMsg::read_from_bytes(datagram).unwrap();
                state.detaches.push(msg.handle);
                state
                    .detach_status
                    .get(&msg.handle)
                    .copied()
                    .unwrap_or(VmciStatus::SUCCESS)
            }
            resource => panic!("unexpected datagram to resource {resource}"),
        }
    }
}

struct EventState {
    events: Vec<(EventType, Handle)>,
    status: VmciStatus,
}

/// An event bus that records delivered queue pair events.
#[derive(Clone)]
pub struct TestEvents {
    state: Arc<Mutex<EventState>>,
}

impl TestEvents {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EventState {
                events: Vec::new(),
                status: VmciStatus::SUCCESS,
            })),
        }
    }

    /// Delivered events, oldest first.
    pub fn events(&self) -> Vec<(EventType, Handle)> {
        self.state.lock().events.clone()
    }

    /// Makes every following delivery fail with `status`.
    pub fn fail_with(&self, status: VmciStatus) {
        self.state.lock().status = status;
    }
}

impl EventDispatch for TestEvents {
    fn dispatch(&self, event: &[u8]) -> VmciStatus {
        let msg = QueuePairEventMsg::read_from_bytes(event).unwrap();
        assert_eq!(msg.hdr.dst, Handle::new(CONTEXT_ID, 0));
        assert_eq!(msg.payload.peer_id, CONTEXT_ID);

        let mut state = self.state.lock();
        if state.status.is_ok() {
            state
                .events
                .push((msg.event_data.event, msg.payload.handle));
        }
        state.status
    }
}

/// A manager wired to test doubles that stay reachable from the test.
pub struct TestEnv {
    pub manager: QueuePairManager,
    pub device: TestDevice,
    pub memory: TestMemory,
    pub transport: TestTransport,
    pub events: TestEvents,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let device = TestDevice::new(CONTEXT_ID);
        let memory = TestMemory::new();
        let transport = TestTransport::new();
        let events = TestEvents::new();
        let manager = QueuePairManager::new(
            device.clone(),
            memory.clone(),
            transport.clone(),
            events.clone(),
        );
        Self {
            manager,
            device,
            memory,
            transport,
            events,
        }
    }

    /// Creates a remote queue pair with a fresh handle.
    pub fn alloc_remote(
        &self,
        produce_size: u64,
        consume_size: u64,
    ) -> Result<AllocatedQueuePair, Error> {
        self.manager.alloc(
            Handle::INVALID,
            produce_size,
            consume_size,
            INVALID_ID,
            QueuePairFlags::new(),
        )
    }

    /// Creates a local queue pair with a fresh handle.
    pub fn alloc_local(
        &self,
        produce_size: u64,
        consume_size: u64,
    ) -> Result<AllocatedQueuePair, Error> {
        self.manager.alloc(
            Handle::INVALID,
            produce_size,
            consume_size,
            INVALID_ID,
            QueuePairFlags::new().with_local(true),
        )
    }
}
