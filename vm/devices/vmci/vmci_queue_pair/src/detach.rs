// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Queue pair detach.

use crate::QueuePairManager;
use crate::protocol::EventType;
use crate::protocol::Handle;
use crate::status::Error;
use crate::status::VmciError;

impl QueuePairManager {
    /// Detaches this endpoint from the queue pair `handle`.
    ///
    /// The queue pair is destroyed and its memory freed once both local
    /// endpoints, or the only endpoint of a remote queue pair, have detached.
    /// On failure nothing changes, and the detach may be retried.
    pub fn detach(&self, handle: Handle) -> Result<(), Error> {
        if handle.is_invalid() {
            return Err(Error::InvalidArgs);
        }

        let mut registry = self.registry.lock();
        let entry = registry.find_mut(handle).ok_or(Error::NotFound)?;
        assert!(entry.ref_count() >= 1);

        if entry.is_local() {
            if entry.ref_count() > 1 {
                self.notify_peer_local(EventType::QP_PEER_DETACH, handle)?;
            }
        } else {
            let mut result = self.detach_hypercall(handle);
            if entry.hibernate_failure() {
                if result == Err(VmciError::NOT_FOUND) {
                    // The device lost this queue pair while the guest was
                    // hibernating. Only this endpoint is left.
                    assert_eq!(entry.ref_count(), 1);
                    tracing::debug!(%handle, "detaching queue pair lost across hibernation");
                    result = Ok(());
                }
                if result.is_ok() {
                    self.unmark_hibernate_failed(entry);
                }
            }
            result?;
        }

        if entry.release_ref() > 0 {
            return Ok(());
        }
        let entry = registry.remove(handle).expect("entry is registered");
        drop(registry);
        entry.destroy();
        Ok(())
    }
}
