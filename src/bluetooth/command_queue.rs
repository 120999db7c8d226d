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

//! Sequential GATT command queue.
//!
//! The host stack accepts a single outstanding GATT request per link. The
//! queue holds the remaining negotiation steps as typed commands and tracks
//! which one is in flight, so only the completion belonging to that command
//! moves the negotiation forward.

use std::collections::VecDeque;
use uuid::Uuid;

/// A deferred negotiation step. Parameters are captured when queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCommand {
    /// Read a characteristic; completes on a matching read callback.
    ReadCharacteristic { service: Uuid, characteristic: Uuid },
    /// Negotiate the MTU; completes on an MTU-change callback.
    RequestMtu { mtu: u16 },
    /// Build the MIDI port sessions; completes synchronously.
    SetupPorts,
}

/// Completion reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Read { characteristic: Uuid },
    Mtu,
}

impl GattCommand {
    fn completed_by(&self, completion: Completion) -> bool {
        match (self, completion) {
            (
                GattCommand::ReadCharacteristic { characteristic, .. },
                Completion::Read { characteristic: done },
            ) => *characteristic == done,
            (GattCommand::RequestMtu { .. }, Completion::Mtu) => true,
            _ => false,
        }
    }
}

/// FIFO of pending commands with at most one in flight.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<GattCommand>,
    in_flight: Option<GattCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn push(&mut self, command: GattCommand) {
        self.pending.push_back(command);
    }

    /// Take the next command for execution.
    ///
    /// Returns `None` while a command is still in flight.
    pub fn next(&mut self) -> Option<GattCommand> {
        if self.in_flight.is_some() {
            return None;
        }
        self.pending.pop_front()
    }

    /// Mark a command as waiting for its completion callback.
    pub fn set_in_flight(&mut self, command: GattCommand) {
        self.in_flight = Some(command);
    }

    /// Clear the in-flight command if `completion` belongs to it.
    ///
    /// Returns true when the queue may advance.
    pub fn complete(&mut self, completion: Completion) -> bool {
        match &self.in_flight {
            Some(command) if command.completed_by(completion) => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::*;

    fn read(characteristic: Uuid) -> GattCommand {
        GattCommand::ReadCharacteristic {
            service: DEVICE_INFORMATION_SERVICE_UUID,
            characteristic,
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = CommandQueue::new();
        queue.push(read(MANUFACTURER_NAME_UUID));
        queue.push(GattCommand::RequestMtu { mtu: 517 });
        queue.push(GattCommand::SetupPorts);

        assert_eq!(queue.next(), Some(read(MANUFACTURER_NAME_UUID)));
        assert_eq!(queue.next(), Some(GattCommand::RequestMtu { mtu: 517 }));
        assert_eq!(queue.next(), Some(GattCommand::SetupPorts));
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn test_one_in_flight() {
        let mut queue = CommandQueue::new();
        queue.push(read(MANUFACTURER_NAME_UUID));
        queue.push(read(MODEL_NUMBER_UUID));

        let first = queue.next().unwrap();
        queue.set_in_flight(first);

        // Nothing else can be dequeued until the read completes
        assert_eq!(queue.next(), None);

        assert!(queue.complete(Completion::Read {
            characteristic: MANUFACTURER_NAME_UUID
        }));
        assert_eq!(queue.next(), Some(read(MODEL_NUMBER_UUID)));
    }

    #[test]
    fn test_unmatched_completion_does_not_advance() {
        let mut queue = CommandQueue::new();
        queue.push(GattCommand::RequestMtu { mtu: 517 });
        queue.push(GattCommand::SetupPorts);

        let mtu = queue.next().unwrap();
        queue.set_in_flight(mtu);

        // A stray read completion must not release the MTU step
        assert!(!queue.complete(Completion::Read {
            characteristic: MIDI_CHARACTERISTIC_UUID
        }));
        assert_eq!(queue.next(), None);

        assert!(queue.complete(Completion::Mtu));
        // A second MTU notification for the same request is ignored
        assert!(!queue.complete(Completion::Mtu));
        assert_eq!(queue.next(), Some(GattCommand::SetupPorts));
    }
}
