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

//! MIDI output session bound to a writable characteristic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::DeviceInfo;
use crate::bluetooth::ble_constants::config;
use crate::bluetooth::{DeviceAddress, GattClient};

/// Logical MIDI output of a connected peripheral.
pub struct MidiOutputSession {
    info: DeviceInfo,
    service: Uuid,
    characteristic: Uuid,
    link: Arc<dyn GattClient>,
    buffer_size: AtomicUsize,
    running: AtomicBool,
    configured: AtomicBool,
    terminated: AtomicBool,
}

impl MidiOutputSession {
    pub(crate) fn new(
        info: DeviceInfo,
        service: Uuid,
        characteristic: Uuid,
        link: Arc<dyn GattClient>,
    ) -> Self {
        Self {
            info,
            service,
            characteristic,
            link,
            buffer_size: AtomicUsize::new(config::DEFAULT_BUFFER_SIZE),
            running: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Write one payload without response.
    ///
    /// Returns false if the session is not running, not yet configured
    /// (pairing still pending) or the write failed; the caller decides
    /// whether to retry. Payloads longer than
    /// [`buffer_size`](Self::buffer_size) should be split by the caller.
    pub fn send(&self, data: &[u8]) -> bool {
        if !self.running.load(Ordering::SeqCst) || self.is_terminated() {
            return false;
        }
        if !self.configured.load(Ordering::SeqCst) {
            debug!("Output {} not configured yet", self.info.address);
            return false;
        }

        match self
            .link
            .write_without_response(self.service, self.characteristic, data)
        {
            Ok(()) => true,
            Err(e) => {
                debug!("MIDI write to {} failed: {}", self.info.address, e);
                false
            }
        }
    }

    /// Advisory maximum payload per write.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_buffer_size(&self, size: usize) {
        self.buffer_size.store(size, Ordering::SeqCst);
    }

    pub fn start(&self) {
        if !self.is_terminated() {
            self.running.store(true, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Refuse all further sends. Irreversible.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
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

    /// Enable write-without-response transfers.
    pub(crate) fn configure_as_central(&self) {
        self.configured.store(true, Ordering::SeqCst);
        debug!(
            "Output {} on {} uses write without response",
            self.characteristic, self.info.address
        );
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MidiOutputSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiOutputSession")
            .field("info", &self.info)
            .field("characteristic", &self.characteristic)
            .field("buffer_size", &self.buffer_size())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
