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

//! Packet parser boundary.
//!
//! Decoding BLE-MIDI packets (timestamps, running status, SysEx) belongs to
//! the parser implementation. Input sessions only feed it raw notification
//! payloads and drive its lifecycle.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bluetooth::DeviceAddress;

/// Receives MIDI data produced by a parser.
pub trait MidiInputListener: Send + Sync {
    /// Called for each unit of MIDI data the parser emits.
    fn on_midi_data(&self, source: DeviceAddress, data: &[u8]);
}

/// Consumer of raw BLE-MIDI notification payloads.
pub trait PacketParser: Send + Sync {
    /// Resume delivering to the listener.
    fn start(&self);

    /// Pause delivery; the parser stays usable.
    fn stop(&self);

    /// Shut the parser down for good.
    fn terminate(&self);

    /// Hand over one notification payload, in arrival order.
    fn feed(&self, packet: &[u8]);

    /// Replace (or clear) the listener.
    fn set_listener(&self, listener: Option<Arc<dyn MidiInputListener>>);
}

/// Creates one parser per input session.
pub trait ParserFactory: Send + Sync {
    fn create(&self, source: DeviceAddress) -> Box<dyn PacketParser>;
}

impl<F> ParserFactory for F
where
    F: Fn(DeviceAddress) -> Box<dyn PacketParser> + Send + Sync,
{
    fn create(&self, source: DeviceAddress) -> Box<dyn PacketParser> {
        self(source)
    }
}

/// Parser that forwards packets undecoded.
pub struct RawPacketParser {
    source: DeviceAddress,
    running: AtomicBool,
    terminated: AtomicBool,
    listener: RwLock<Option<Arc<dyn MidiInputListener>>>,
}

impl RawPacketParser {
    pub fn new(source: DeviceAddress) -> Self {
        Self {
            source,
            running: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            listener: RwLock::new(None),
        }
    }

    /// Factory for [`RawPacketParser`] instances.
    pub fn factory() -> Arc<dyn ParserFactory> {
        Arc::new(|source: DeviceAddress| -> Box<dyn PacketParser> {
            Box::new(RawPacketParser::new(source))
        })
    }
}

impl PacketParser for RawPacketParser {
    fn start(&self) {
        if !self.terminated.load(Ordering::SeqCst) {
            self.running.store(true, Ordering::SeqCst);
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        *self.listener.write() = None;
    }

    fn feed(&self, packet: &[u8]) {
        if !self.running.load(Ordering::SeqCst) || packet.is_empty() {
            return;
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_midi_data(self.source, packet);
        }
    }

    fn set_listener(&self, listener: Option<Arc<dyn MidiInputListener>>) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        *self.listener.write() = listener;
    }
}
