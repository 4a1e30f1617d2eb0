// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Conversion of remote queue pairs to local ones across hibernation.
//!
//! Before the guest hibernates, the device goes away and the hypervisor tears
//! down its side of every remote queue pair. To keep the data, each remote
//! queue pair is copied into guest-private memory and detached from the
//! device, after which it behaves like a local queue pair whose peer has
//! left. A conversion that fails is not fatal: the queue pair stays remote
//! and is recorded, and its local endpoint is told its peer is gone when the
//! guest wakes on a reset device.

use crate::QueuePairManager;
use crate::entry::QueuePairEntry;
use crate::protocol::EventType;
use crate::protocol::Handle;
use crate::queue::Role;
use crate::status::VmciError;
use std::sync::atomic::Ordering;
use thiserror::Error;

#[derive(Debug, Error)]
enum ConvertError {
    #[error("failed to create local consume queue")]
    ConsumeQueue(#[source] anyhow::Error),
    #[error("failed to create local produce queue")]
    ProduceQueue(#[source] anyhow::Error),
    #[error("failed to detach from the device")]
    Detach(#[source] VmciError),
}

impl QueuePairManager {
    /// Converts queue pairs for a power transition.
    ///
    /// With `to_local`, the guest is about to hibernate or sleep: see
    /// [`Self::enter_hibernation`]. Otherwise it has woken up, and
    /// `device_reset` tells whether the device lost its state in between: see
    /// [`Self::leave_hibernation`].
    pub fn convert(&self, to_local: bool, device_reset: bool) {
        if to_local {
            self.enter_hibernation();
        } else {
            self.leave_hibernation(device_reset);
        }
    }

    /// Converts every remote queue pair to a local one, then blocks the
    /// creation of remote queue pairs until [`Self::leave_hibernation`].
    ///
    /// This cannot fail. Queue pairs that cannot be converted are left as
    /// they are and recorded.
    pub fn enter_hibernation(&self) {
        let mut registry = self.registry.lock();
        let mut converted = 0;
        let mut failed = 0;
        for entry in registry.iter_mut().filter(|entry| !entry.is_local()) {
            match self.convert_to_local(entry) {
                Ok(()) => converted += 1,
                Err(err) => {
                    tracing::warn!(
                        handle = %entry.handle(),
                        error = &err as &dyn std::error::Error,
                        "failed to convert queue pair for hibernation"
                    );
                    self.mark_hibernate_failed(entry);
                    failed += 1;
                }
            }
        }
        self.hibernating.store(true, Ordering::SeqCst);
        drop(registry);
        tracing::info!(converted, failed, "entered hibernation");
    }

    /// Allows remote queue pairs again after a wake.
    ///
    /// If the device was reset, the queue pairs that could not be converted
    /// have lost their hypervisor side, so their local endpoints are told
    /// their peer detached.
    pub fn leave_hibernation(&self, device_reset: bool) {
        let mut failed = self.hibernate_failed.lock();
        let count = failed.len();
        while let Some(handle) = failed.pop() {
            if device_reset {
                self.notify_detached(handle);
            }
        }
        drop(failed);
        self.hibernating.store(false, Ordering::SeqCst);
        tracing::info!(count, device_reset, "left hibernation");
    }

    /// Copies a remote queue pair into local memory and detaches it from the
    /// device. On failure the queue pair is untouched.
    fn convert_to_local(&self, entry: &mut QueuePairEntry) -> Result<(), ConvertError> {
        let pair = entry.produce_q().pair().clone();
        let mut buffers = pair.lock();

        // The guest has yet to read the consume queue. The peer will never
        // read the produce queue, so only its header is kept.
        let consume = buffers
            .snapshot(
                Role::Consume,
                entry.consume_size(),
                true,
                self.memory.as_ref(),
            )
            .map_err(ConvertError::ConsumeQueue)?;
        let produce = buffers
            .snapshot(
                Role::Produce,
                entry.produce_size(),
                false,
                self.memory.as_ref(),
            )
            .map_err(ConvertError::ProduceQueue)?;

        self.detach_hypercall(entry.handle())
            .map_err(ConvertError::Detach)?;

        entry.set_local();
        let old = buffers.replace(produce, consume);
        drop(buffers);
        drop(old);

        if entry.hibernate_failure() {
            self.unmark_hibernate_failed(entry);
        }
        self.notify_detached(entry.handle());
        Ok(())
    }

    fn notify_detached(&self, handle: Handle) {
        if let Err(err) = self.notify_peer_local(EventType::QP_PEER_DETACH, handle) {
            tracing::debug!(
                %handle,
                error = &err as &dyn std::error::Error,
                "failed to deliver queue pair detach event"
            );
        }
    }

    /// Records that `entry` could not be converted to a local queue pair.
    pub(crate) fn mark_hibernate_failed(&self, entry: &mut QueuePairEntry) {
        entry.set_hibernate_failure(true);
        let mut failed = self.hibernate_failed.lock();
        if !failed.contains(&entry.handle()) {
            failed.push(entry.handle());
        }
    }

    pub(crate) fn unmark_hibernate_failed(&self, entry: &mut QueuePairEntry) {
        entry.set_hibernate_failure(false);
        self.hibernate_failed
            .lock()
            .retain(|&handle| handle != entry.handle());
    }
}
