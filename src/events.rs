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

//! Device attach/detach and scan status notifications.
//!
//! Callbacks fire synchronously on the negotiation or teardown path and must
//! not block. [`ChannelListener`] turns them into [`DeviceEvent`]s for
//! applications that prefer to consume them from a task.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::midi::{MidiInputSession, MidiOutputSession};

/// Application callbacks.
pub trait DeviceListener: Send + Sync {
    fn on_input_attached(&self, _session: &Arc<MidiInputSession>) {}

    fn on_output_attached(&self, _session: &Arc<MidiOutputSession>) {}

    fn on_input_detached(&self, _session: &Arc<MidiInputSession>) {}

    fn on_output_detached(&self, _session: &Arc<MidiOutputSession>) {}

    fn on_scan_status_changed(&self, _scanning: bool) {}
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    InputAttached(Arc<MidiInputSession>),
    OutputAttached(Arc<MidiOutputSession>),
    InputDetached(Arc<MidiInputSession>),
    OutputDetached(Arc<MidiOutputSession>),
    ScanStatusChanged(bool),
}

/// Forwards callbacks into an unbounded channel.
pub struct ChannelListener {
    event_tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl ChannelListener {
    /// Create a listener and the receiving end of its events.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { event_tx }), event_rx)
    }

    fn emit(&self, event: DeviceEvent) {
        // Receiver gone means nobody is interested anymore
        let _ = self.event_tx.send(event);
    }
}

impl DeviceListener for ChannelListener {
    fn on_input_attached(&self, session: &Arc<MidiInputSession>) {
        self.emit(DeviceEvent::InputAttached(session.clone()));
    }

    fn on_output_attached(&self, session: &Arc<MidiOutputSession>) {
        self.emit(DeviceEvent::OutputAttached(session.clone()));
    }

    fn on_input_detached(&self, session: &Arc<MidiInputSession>) {
        self.emit(DeviceEvent::InputDetached(session.clone()));
    }

    fn on_output_detached(&self, session: &Arc<MidiOutputSession>) {
        self.emit(DeviceEvent::OutputDetached(session.clone()));
    }

    fn on_scan_status_changed(&self, scanning: bool) {
        self.emit(DeviceEvent::ScanStatusChanged(scanning));
    }
}

/// Shared listener slot.
///
/// The listener is cloned out before each call so no lock is held while
/// application code runs.
#[derive(Default)]
pub struct Listeners {
    slot: RwLock<Option<Arc<dyn DeviceListener>>>,
}

impl Listeners {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, listener: Option<Arc<dyn DeviceListener>>) {
        *self.slot.write() = listener;
    }

    fn current(&self) -> Option<Arc<dyn DeviceListener>> {
        self.slot.read().clone()
    }

    pub fn input_attached(&self, session: &Arc<MidiInputSession>) {
        if let Some(listener) = self.current() {
            listener.on_input_attached(session);
        }
    }

    pub fn output_attached(&self, session: &Arc<MidiOutputSession>) {
        if let Some(listener) = self.current() {
            listener.on_output_attached(session);
        }
    }

    pub fn input_detached(&self, session: &Arc<MidiInputSession>) {
        if let Some(listener) = self.current() {
            listener.on_input_detached(session);
        }
    }

    pub fn output_detached(&self, session: &Arc<MidiOutputSession>) {
        if let Some(listener) = self.current() {
            listener.on_output_detached(session);
        }
    }

    pub fn scan_status_changed(&self, scanning: bool) {
        if let Some(listener) = self.current() {
            listener.on_scan_status_changed(scanning);
        }
    }
}
