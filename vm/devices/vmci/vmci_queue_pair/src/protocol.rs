// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VMCI wire definitions used by the queue pair core.
//!
//! All datagrams start with a [`DatagramHeader`]. Queue pair allocation and
//! detach requests are addressed to well-known hypervisor resources, and local
//! peer notifications are delivered as event datagrams addressed to the
//! guest's own event handler.

use bitfield_struct::bitfield;
use std::fmt;
use std::mem::size_of;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Queue memory is allocated in multiples of 4KB pages, plus one header page
/// per queue.
pub const PAGE_SIZE: u64 = 4096;

pub const INVALID_ID: u32 = u32::MAX;
pub const HYPERVISOR_CONTEXT_ID: u32 = 0;

/// Resource ids up to and including this value are never auto-assigned.
pub const RESERVED_RESOURCE_ID_MAX: u32 = 1023;

pub const CONTEXT_RESOURCE_ID: u32 = 0;
pub const EVENT_HANDLER: u32 = 0;

// Hypervisor resources.
pub const QUEUEPAIR_ALLOC: u32 = 10;
pub const QUEUEPAIR_DETACH: u32 = 11;

pub const DATAGRAM_HEADER_SIZE: usize = size_of::<DatagramHeader>();

/// Identifies a VMCI resource: a queue pair, a datagram endpoint, etc.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Handle {
    pub context: u32,
    pub resource: u32,
}

impl Handle {
    /// The invalid handle. Passing it to an allocation requests a fresh
    /// resource id.
    pub const INVALID: Self = Self::new(INVALID_ID, INVALID_ID);

    pub const fn new(context: u32, resource: u32) -> Self {
        Self { context, resource }
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{:#x}", self.context, self.resource)
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct QueuePairFlags {
    /// Only attach to an existing queue pair, never create one.
    pub attach_only: bool,
    /// Both endpoints live in this guest. No hypervisor state exists for the
    /// queue pair.
    pub local: bool,
    /// Queue operations must not block.
    pub nonblock: bool,
    /// Queue memory must stay resident.
    pub pinned: bool,
    #[bits(28)]
    _reserved: u32,
}

impl QueuePairFlags {
    pub const fn all() -> Self {
        Self::new()
            .with_attach_only(true)
            .with_local(true)
            .with_nonblock(true)
            .with_pinned(true)
    }

    pub fn contains_unsupported_bits(&self) -> bool {
        u32::from(*self) & !u32::from(Self::all()) != 0
    }
}

/// Privileges a caller may request when allocating from the host side. Guests
/// cannot request any.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PrivilegeFlags {
    pub restricted: bool,
    pub trusted: bool,
    #[bits(30)]
    _reserved: u32,
}

/// The header of every datagram.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DatagramHeader {
    pub dst: Handle,
    pub src: Handle,
    /// Size of the datagram following this header.
    pub payload_size: u64,
}

impl DatagramHeader {
    /// The anonymous source handle used for requests to the hypervisor.
    pub const ANON_SRC: Handle = Handle::INVALID;

    /// Creates a header for a request to the hypervisor resource `resource`.
    pub fn hypervisor_request(resource: u32, payload_size: usize) -> Self {
        Self {
            dst: Handle::new(HYPERVISOR_CONTEXT_ID, resource),
            src: Self::ANON_SRC,
            payload_size: payload_size as u64,
        }
    }
}

/// Queue pair allocation request. The PPNs of both queues immediately follow
/// the message.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct QueuePairAllocMsg {
    pub hdr: DatagramHeader,
    pub handle: Handle,
    pub peer: u32,
    pub flags: QueuePairFlags,
    pub produce_size: u64,
    pub consume_size: u64,
    pub num_ppns: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct QueuePairDetachMsg {
    pub hdr: DatagramHeader,
    pub handle: Handle,
}

impl QueuePairDetachMsg {
    pub fn new(handle: Handle) -> Self {
        Self {
            hdr: DatagramHeader::hypervisor_request(QUEUEPAIR_DETACH, size_of::<Handle>()),
            handle,
        }
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct EventType(pub u32);

impl EventType {
    pub const CTX_ID_UPDATE: Self = Self(0);
    pub const CTX_REMOVED: Self = Self(1);
    pub const QP_RESUMED: Self = Self(2);
    pub const QP_PEER_ATTACH: Self = Self(3);
    pub const QP_PEER_DETACH: Self = Self(4);
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct EventData {
    pub event: EventType,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct QueuePairEventPayload {
    pub handle: Handle,
    pub peer_id: u32,
    pub reserved: u32,
}

/// A queue pair peer event, as delivered to local event subscribers.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct QueuePairEventMsg {
    pub hdr: DatagramHeader,
    pub event_data: EventData,
    pub payload: QueuePairEventPayload,
}

impl QueuePairEventMsg {
    /// Creates an event reporting that `peer_id` attached to or detached from
    /// `handle`. The event appears to come from the hypervisor.
    pub fn new(context_id: u32, event: EventType, peer_id: u32, handle: Handle) -> Self {
        Self {
            hdr: DatagramHeader {
                dst: Handle::new(context_id, EVENT_HANDLER),
                src: Handle::new(HYPERVISOR_CONTEXT_ID, CONTEXT_RESOURCE_ID),
                payload_size: (size_of::<Self>() - DATAGRAM_HEADER_SIZE) as u64,
            },
            event_data: EventData { event, reserved: 0 },
            payload: QueuePairEventPayload {
                handle,
                peer_id,
                reserved: 0,
            },
        }
    }
}

/// The header page at the start of every queue.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct QueueHeader {
    pub handle: Handle,
    pub producer_tail: u64,
    pub consumer_head: u64,
}

impl QueueHeader {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            producer_tail: 0,
            consumer_head: 0,
        }
    }
}

/// The number of data pages needed for a queue of `size` bytes.
pub fn data_pages(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE)
}

/// The number of PPNs describing a queue pair: the data pages of both queues
/// plus one header page each.
pub fn num_ppns(produce_size: u64, consume_size: u64) -> u64 {
    data_pages(produce_size) + data_pages(consume_size) + 2
}
