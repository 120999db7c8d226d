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

//! MIDI input session bound to a notifying characteristic.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::parser::{MidiInputListener, PacketParser};
use super::DeviceInfo;
use crate::bluetooth::{DeviceAddress, GattClient};

/// Logical MIDI input of a connected peripheral.
pub struct MidiInputSession {
    info: DeviceInfo,
    service: Uuid,
    characteristic: Uuid,
    link: Arc<dyn GattClient>,
    parser: Box<dyn PacketParser>,
    terminated: AtomicBool,
}

impl MidiInputSession {
    pub(crate) fn new(
        info: DeviceInfo,
        service: Uuid,
        characteristic: Uuid,
        link: Arc<dyn GattClient>,
        parser: Box<dyn PacketParser>,
    ) -> Self {
        Self {
            info,
            service,
            characteristic,
            link,
            parser,
            terminated: AtomicBool::new(false),
        }
    }

    /// Start handing incoming data to the parser.
    pub fn start(&self) {
        if self.is_terminated() {
            return;
        }
        self.parser.start();
    }

    /// Pause processing without tearing the session down.
    pub fn stop(&self) {
        self.parser.stop();
    }

    /// Stop for good and drop the listener. Irreversible.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.parser.set_listener(None);
        self.parser.terminate();
        debug!("Input session for {} terminated", self.info.address);
    }

    /// Set or clear the MIDI listener. Ignored after termination.
    pub fn set_listener(&self, listener: Option<Arc<dyn MidiInputListener>>) {
        if self.is_terminated() {
            return;
        }
        self.parser.set_listener(listener);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> DeviceAddress {
        self.info.address
    }

    pub fn device_name(&self) -> &str {
        &self.info.name
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.info.manufacturer.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.info.model.as_deref()
    }

    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Raw notification payload from the link.
    pub(crate) fn incoming_data(&self, data: &[u8]) {
        if self.is_terminated() {
            return;
        }
        self.parser.feed(data);
    }

    /// Subscribe to notifications and fetch the initial value.
    pub(crate) fn configure_as_central(&self) {
        if !self
            .link
            .enable_notifications(self.service, self.characteristic)
        {
            warn!(
                "Could not enable MIDI notifications on {}",
                self.info.address
            );
        }
        self.link
            .read_characteristic(self.service, self.characteristic);
    }
}

impl fmt::Debug for MidiInputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiInputSession")
            .field("info", &self.info)
            .field("characteristic", &self.characteristic)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
