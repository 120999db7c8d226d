// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Global negotiation lock.
//!
//! The host stack serializes service discovery, so only one connection may
//! run discovery through port setup at a time. The lock is a single-permit
//! semaphore; waiters block until the permit is free or their wait bound
//! expires. The permit is an owned value so it can be parked in the active
//! negotiation and released from whichever callback ends it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::address::DeviceAddress;

/// Mutual exclusion across all negotiating connections.
#[derive(Debug)]
pub struct NegotiationLock {
    semaphore: Arc<Semaphore>,
    holder: Arc<Mutex<Option<DeviceAddress>>>,
}

/// Proof of holding the negotiation lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct NegotiationPermit {
    address: DeviceAddress,
    holder: Arc<Mutex<Option<DeviceAddress>>>,
    _permit: OwnedSemaphorePermit,
}

impl NegotiationPermit {
    /// Connection that owns the lock.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl Drop for NegotiationPermit {
    fn drop(&mut self) {
        // Runs before the semaphore permit field is released
        *self.holder.lock() = None;
        debug!("Negotiation lock released by {}", self.address);
    }
}

impl Default for NegotiationLock {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// Returns `None` if the wait bound expired.
    pub async fn acquire(
        &self,
        address: DeviceAddress,
        timeout: Duration,
    ) -> Option<NegotiationPermit> {
        let permit = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned())
            .await
            .ok()?
            // The semaphore is never closed
            .ok()?;

        *self.holder.lock() = Some(address);
        debug!("Negotiation lock acquired by {}", address);

        Some(NegotiationPermit {
            address,
            holder: self.holder.clone(),
            _permit: permit,
        })
    }

    /// Connection currently holding the lock.
    pub fn holder(&self) -> Option<DeviceAddress> {
        *self.holder.lock()
    }
}
