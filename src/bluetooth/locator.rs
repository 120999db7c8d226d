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

//! Locating MIDI characteristics among discovered services.

use tracing::debug;
use uuid::Uuid;

use super::ble_constants::{MIDI_CHARACTERISTIC_UUID, MIDI_SERVICE_UUID};
use super::gatt::{GattClient, GattError, ServiceInfo};

/// Characteristics chosen for the input and output sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEndpoints {
    pub service: Uuid,
    /// Notifying characteristic backing the input session.
    pub input: Option<Uuid>,
    /// Writable characteristic backing the output session.
    pub output: Option<Uuid>,
}

impl MidiEndpoints {
    pub fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }
}

/// Finds the MIDI endpoints of a discovered link.
pub trait ServiceLocator: Send + Sync {
    /// `Ok(None)` means the peer has no usable MIDI characteristic.
    fn locate(&self, link: &dyn GattClient) -> Result<Option<MidiEndpoints>, GattError>;
}

/// Locator for the standard BLE-MIDI service plus configured extras.
#[derive(Debug, Clone)]
pub struct StandardMidiLocator {
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
}

impl Default for StandardMidiLocator {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

impl StandardMidiLocator {
    /// Standard UUIDs are always searched first.
    pub fn new(extra_services: Vec<Uuid>, extra_characteristics: Vec<Uuid>) -> Self {
        let mut services = vec![MIDI_SERVICE_UUID];
        services.extend(extra_services.into_iter().filter(|u| *u != MIDI_SERVICE_UUID));

        let mut characteristics = vec![MIDI_CHARACTERISTIC_UUID];
        characteristics.extend(
            extra_characteristics
                .into_iter()
                .filter(|u| *u != MIDI_CHARACTERISTIC_UUID),
        );

        Self {
            services,
            characteristics,
        }
    }

    fn endpoints_in(&self, service: &ServiceInfo) -> MidiEndpoints {
        let mut endpoints = MidiEndpoints {
            service: service.uuid,
            input: None,
            output: None,
        };

        for uuid in &self.characteristics {
            let Some(characteristic) = service.characteristic(*uuid) else {
                continue;
            };
            let props = characteristic.properties;
            if endpoints.input.is_none() && props.notify {
                endpoints.input = Some(*uuid);
            }
            if endpoints.output.is_none() && (props.write || props.write_without_response) {
                endpoints.output = Some(*uuid);
            }
        }

        endpoints
    }
}

impl ServiceLocator for StandardMidiLocator {
    fn locate(&self, link: &dyn GattClient) -> Result<Option<MidiEndpoints>, GattError> {
        let services = link.services()?;

        for uuid in &self.services {
            let Some(service) = services.iter().find(|s| s.uuid == *uuid) else {
                continue;
            };
            let endpoints = self.endpoints_in(service);
            if !endpoints.is_empty() {
                debug!("MIDI endpoints on {}: {:?}", link.address(), endpoints);
                return Ok(Some(endpoints));
            }
        }

        Ok(None)
    }
}
