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

//! GATT client abstraction over the host Bluetooth stack.
//!
//! Operations are requests: each returns whether the stack accepted it, and
//! its completion arrives later as a [`GattEvent`] delivered to the
//! negotiator. A request that was refused produces no completion event.

use thiserror::Error;
use uuid::Uuid;

use super::address::DeviceAddress;

/// Link-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GattError {
    #[error("device is not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    UnknownCharacteristic(Uuid),
    #[error("operation not permitted: {0}")]
    NotPermitted(String),
    #[error("write queue is full")]
    Busy,
    #[error("bluetooth stack error: {0}")]
    Stack(String),
}

#[cfg(feature = "bluez")]
impl From<bluer::Error> for GattError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotPermitted | bluer::ErrorKind::NotAuthorized => {
                GattError::NotPermitted(err.message)
            }
            bluer::ErrorKind::NotReady => GattError::NotConnected,
            _ => GattError::Stack(err.to_string()),
        }
    }
}

/// Characteristic properties relevant to a MIDI central.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// A discovered primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Bond state of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Link state reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Events delivered by the stack for one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Physical link came up or went down.
    ConnectionStateChanged(LinkState),
    /// Service discovery finished.
    ServicesDiscovered { success: bool },
    /// A characteristic read finished.
    CharacteristicRead { characteristic: Uuid, value: Vec<u8> },
    /// A notification arrived.
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
    /// The ATT MTU changed (or the MTU request completed).
    MtuChanged { mtu: u16 },
    /// Pairing state of the peripheral changed.
    BondStateChanged(BondState),
}

/// One connected peripheral as seen through the host stack.
pub trait GattClient: Send + Sync {
    /// Connection identity.
    fn address(&self) -> DeviceAddress;

    /// Human readable name, falling back to the address.
    fn device_name(&self) -> String;

    /// Start service discovery. Completes with [`GattEvent::ServicesDiscovered`].
    fn discover_services(&self) -> bool;

    /// Services found by the last successful discovery.
    fn services(&self) -> Result<Vec<ServiceInfo>, GattError>;

    /// Start a read. Completes with [`GattEvent::CharacteristicRead`].
    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Ask for a larger MTU. Completes with [`GattEvent::MtuChanged`].
    fn request_mtu(&self, mtu: u16) -> bool;

    /// Subscribe to notifications (writes the CCC descriptor).
    fn enable_notifications(&self, service: Uuid, characteristic: Uuid) -> bool;

    /// Write without response.
    fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), GattError>;

    /// Current bond state.
    fn bond_state(&self) -> BondState;

    /// Start pairing. Completes with [`GattEvent::BondStateChanged`].
    fn create_bond(&self) -> bool;

    /// Auto-confirm the pairing request. Usually needs elevated privileges.
    fn confirm_pairing(&self) -> Result<(), GattError> {
        Err(GattError::NotPermitted("pairing confirmation".to_string()))
    }

    /// Ask for a short connection interval. Returns false when unsupported.
    fn request_high_priority(&self) -> bool {
        false
    }

    /// Drop the link and release its resources.
    fn disconnect(&self);
}
