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

//! Bluetooth communication module.
//!
//! GATT client abstraction, connection negotiation and the BlueZ backend.

mod address;
pub mod ble_constants;
mod bonding;
mod command_queue;
mod gatt;
mod lock;
mod locator;
mod negotiator;

#[cfg(feature = "bluez")]
mod bluez;

#[cfg(test)]
pub(crate) mod fake;

pub use address::DeviceAddress;
pub use bonding::{BondingOutcome, BondingRecord, BondingWorkflow};
pub use command_queue::{CommandQueue, Completion, GattCommand};
pub use gatt::{
    BondState, CharacteristicInfo, CharacteristicProperties, GattClient, GattError, GattEvent,
    LinkState, ServiceInfo,
};
pub use lock::{NegotiationLock, NegotiationPermit};
pub use locator::{MidiEndpoints, ServiceLocator, StandardMidiLocator};
pub use negotiator::{Negotiator, NegotiatorSettings, PlatformCapabilities};

#[cfg(feature = "bluez")]
pub use bluez::{BluezBackend, BluezLink};
