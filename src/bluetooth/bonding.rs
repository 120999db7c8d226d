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

//! Deferred central configuration while pairing is pending.
//!
//! Only one pairing can be pending. A new attempt replaces the old record;
//! the superseded connection keeps its sessions but they stay unconfigured
//! until it renegotiates.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::address::DeviceAddress;
use super::gatt::{BondState, GattClient};
use crate::midi::{MidiInputSession, MidiOutputSession};

/// Sessions waiting for the peer to finish pairing.
#[derive(Debug, Clone)]
pub struct BondingRecord {
    pub address: DeviceAddress,
    pub input: Option<Arc<MidiInputSession>>,
    pub output: Option<Arc<MidiOutputSession>>,
}

impl BondingRecord {
    /// Run the deferred central configuration.
    pub fn configure(&self) {
        if let Some(input) = &self.input {
            input.configure_as_central();
        }
        if let Some(output) = &self.output {
            output.configure_as_central();
        }
    }
}

/// What [`BondingWorkflow::begin`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondingOutcome {
    /// Peer is already bonded; configure right away.
    AlreadyBonded,
    /// Pairing started; configuration waits for a bond event.
    Pending,
}

/// Holds the single pending pairing.
#[derive(Debug, Default)]
pub struct BondingWorkflow {
    pending: Mutex<Option<BondingRecord>>,
    confirm_pairing: bool,
}

impl BondingWorkflow {
    /// `confirm_pairing` enables auto-confirmation of pairing requests.
    pub fn new(confirm_pairing: bool) -> Self {
        Self {
            pending: Mutex::new(None),
            confirm_pairing,
        }
    }

    /// Start pairing for `record`, or report that it is not needed.
    pub fn begin(&self, link: &dyn GattClient, record: BondingRecord) -> BondingOutcome {
        if link.bond_state() == BondState::Bonded {
            return BondingOutcome::AlreadyBonded;
        }

        let address = record.address;
        if let Some(previous) = self.pending.lock().replace(record) {
            if previous.address != address {
                info!(
                    "Pending pairing of {} superseded by {}",
                    previous.address, address
                );
            }
        }

        if !link.create_bond() {
            warn!("{}: pairing request refused", address);
        }
        if self.confirm_pairing {
            if let Err(e) = link.confirm_pairing() {
                debug!("{}: pairing confirmation skipped: {}", address, e);
            }
        }

        info!("{}: waiting for pairing", address);
        BondingOutcome::Pending
    }

    /// Bond state update for `address`.
    ///
    /// Returns the record to configure when it finishes pairing; events for
    /// other addresses or intermediate states leave the record in place.
    pub fn on_bond_state_changed(
        &self,
        address: DeviceAddress,
        state: BondState,
    ) -> Option<BondingRecord> {
        if state != BondState::Bonded {
            debug!("{}: bond state {:?}", address, state);
            return None;
        }

        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(record) if record.address == address => pending.take(),
            _ => None,
        }
    }

    /// Drop the pending record if it belongs to `address`.
    pub fn cancel(&self, address: DeviceAddress) -> bool {
        let mut pending = self.pending.lock();
        if pending.as_ref().map(|r| r.address) == Some(address) {
            *pending = None;
            true
        } else {
            false
        }
    }

    pub fn pending_address(&self) -> Option<DeviceAddress> {
        self.pending.lock().as_ref().map(|r| r.address)
    }

    pub fn clear(&self) {
        *self.pending.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::fake::FakeLink;
    use crate::bluetooth::GattError;

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new([0x20, 0, 0, 0, 0, n])
    }

    fn record(n: u8) -> BondingRecord {
        BondingRecord {
            address: addr(n),
            input: None,
            output: None,
        }
    }

    #[test]
    fn test_already_bonded_skips_pairing() {
        let workflow = BondingWorkflow::new(true);
        let link = FakeLink::midi(addr(1));
        link.set_bond_state(BondState::Bonded);

        assert_eq!(workflow.begin(&*link, record(1)), BondingOutcome::AlreadyBonded);
        assert_eq!(workflow.pending_address(), None);
        assert_eq!(link.bond_requests(), 0);
    }

    #[test]
    fn test_bonded_event_releases_record() {
        let workflow = BondingWorkflow::new(true);
        let link = FakeLink::midi(addr(1));

        assert_eq!(workflow.begin(&*link, record(1)), BondingOutcome::Pending);
        assert_eq!(link.bond_requests(), 1);

        assert!(workflow
            .on_bond_state_changed(addr(1), BondState::Bonding)
            .is_none());
        assert!(workflow
            .on_bond_state_changed(addr(2), BondState::Bonded)
            .is_none());

        let done = workflow.on_bond_state_changed(addr(1), BondState::Bonded);
        assert_eq!(done.map(|r| r.address), Some(addr(1)));
        assert_eq!(workflow.pending_address(), None);
    }

    #[test]
    fn test_new_attempt_supersedes() {
        let workflow = BondingWorkflow::new(true);
        let first = FakeLink::midi(addr(1));
        let second = FakeLink::midi(addr(2));

        workflow.begin(&*first, record(1));
        workflow.begin(&*second, record(2));
        assert_eq!(workflow.pending_address(), Some(addr(2)));

        // The superseded device never gets configured
        assert!(workflow
            .on_bond_state_changed(addr(1), BondState::Bonded)
            .is_none());
        assert!(workflow
            .on_bond_state_changed(addr(2), BondState::Bonded)
            .is_some());
    }

    #[test]
    fn test_confirmation_failure_is_skipped() {
        let workflow = BondingWorkflow::new(true);
        let link = FakeLink::midi(addr(1));
        link.set_confirm_result(Err(GattError::NotPermitted("no".into())));

        assert_eq!(workflow.begin(&*link, record(1)), BondingOutcome::Pending);
        assert_eq!(link.confirm_requests(), 1);
        assert_eq!(workflow.pending_address(), Some(addr(1)));

        let unprivileged = BondingWorkflow::new(false);
        let other = FakeLink::midi(addr(2));
        unprivileged.begin(&*other, record(2));
        assert_eq!(other.confirm_requests(), 0);
    }

    #[test]
    fn test_cancel_only_matching() {
        let workflow = BondingWorkflow::new(true);
        let link = FakeLink::midi(addr(1));
        workflow.begin(&*link, record(1));

        assert!(!workflow.cancel(addr(2)));
        assert!(workflow.cancel(addr(1)));
        assert_eq!(workflow.pending_address(), None);
    }
}
