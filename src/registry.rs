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

//! Device registry.
//!
//! Maps connection identities to their connection record and their MIDI
//! port sessions. Each map has its own lock; every mutation swaps whole
//! per-address entries so readers see either the old or the new set.
//! Listener callbacks run after the map lock is released.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bluetooth::ble_constants::config;
use crate::bluetooth::{DeviceAddress, GattClient};
use crate::events::Listeners;
use crate::midi::{DeviceInfo, MidiInputSession, MidiOutputSession};
use crate::state::NegotiationState;

/// Book-keeping for one physical link.
#[derive(Clone)]
pub struct ConnectionRecord {
    pub link: Arc<dyn GattClient>,
    pub state: NegotiationState,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub mtu: Option<u16>,
}

impl ConnectionRecord {
    fn new(link: Arc<dyn GattClient>) -> Self {
        Self {
            link,
            state: NegotiationState::Connecting,
            manufacturer: None,
            model: None,
            mtu: None,
        }
    }
}

/// Registry of connections and their sessions.
pub struct DeviceRegistry {
    connections: RwLock<HashMap<DeviceAddress, ConnectionRecord>>,
    inputs: RwLock<HashMap<DeviceAddress, Vec<Arc<MidiInputSession>>>>,
    outputs: RwLock<HashMap<DeviceAddress, Vec<Arc<MidiOutputSession>>>>,
    listeners: Arc<Listeners>,
}

impl DeviceRegistry {
    pub fn new(listeners: Arc<Listeners>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            inputs: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            listeners,
        }
    }

    // ----- connections -----

    /// Record a link that just came up.
    ///
    /// Returns false if the address is already negotiating or negotiated,
    /// so duplicate link-up notifications are dropped.
    pub fn begin_connection(&self, link: Arc<dyn GattClient>) -> bool {
        let address = link.address();
        let mut connections = self.connections.write();
        match connections.get_mut(&address) {
            Some(record) if record.state != NegotiationState::Disconnected => false,
            Some(record) => {
                *record = ConnectionRecord::new(link);
                true
            }
            None => {
                connections.insert(address, ConnectionRecord::new(link));
                true
            }
        }
    }

    pub fn remove_connection(&self, address: DeviceAddress) -> Option<ConnectionRecord> {
        self.connections.write().remove(&address)
    }

    pub fn is_connected(&self, address: DeviceAddress) -> bool {
        self.connections.read().contains_key(&address)
    }

    pub fn state(&self, address: DeviceAddress) -> Option<NegotiationState> {
        self.connections.read().get(&address).map(|r| r.state)
    }

    /// Move a connection to `state`. Returns false if it is gone.
    pub fn set_state(&self, address: DeviceAddress, state: NegotiationState) -> bool {
        match self.connections.write().get_mut(&address) {
            Some(record) => {
                if record.state != state {
                    info!("{}: {} -> {}", address, record.state, state);
                    record.state = state;
                }
                true
            }
            None => false,
        }
    }

    pub fn link(&self, address: DeviceAddress) -> Option<Arc<dyn GattClient>> {
        self.connections.read().get(&address).map(|r| r.link.clone())
    }

    pub fn set_manufacturer(&self, address: DeviceAddress, manufacturer: String) {
        if let Some(record) = self.connections.write().get_mut(&address) {
            record.manufacturer = Some(manufacturer);
        }
    }

    pub fn set_model(&self, address: DeviceAddress, model: String) {
        if let Some(record) = self.connections.write().get_mut(&address) {
            record.model = Some(model);
        }
    }

    /// Identity and metadata for new sessions of `address`.
    pub fn device_info(&self, address: DeviceAddress) -> Option<DeviceInfo> {
        let connections = self.connections.read();
        let record = connections.get(&address)?;
        Some(DeviceInfo {
            address,
            name: record.link.device_name(),
            manufacturer: record.manufacturer.clone(),
            model: record.model.clone(),
        })
    }

    /// Remember the negotiated MTU and resize existing outputs.
    ///
    /// Returns the resulting output buffer size.
    pub fn record_mtu(&self, address: DeviceAddress, mtu: u16) -> usize {
        let buffer_size = config::buffer_size_for_mtu(mtu);

        if let Some(record) = self.connections.write().get_mut(&address) {
            record.mtu = Some(mtu);
        }

        if let Some(outputs) = self.outputs.read().get(&address) {
            for output in outputs {
                output.set_buffer_size(buffer_size);
            }
        }

        debug!("{}: MTU {} -> buffer size {}", address, mtu, buffer_size);
        buffer_size
    }

    /// Output buffer size for new sessions of `address`.
    pub fn buffer_size(&self, address: DeviceAddress) -> usize {
        self.connections
            .read()
            .get(&address)
            .and_then(|r| r.mtu)
            .map(config::buffer_size_for_mtu)
            .unwrap_or(config::DEFAULT_BUFFER_SIZE)
    }

    // ----- sessions -----

    /// Snapshot of all input sessions.
    pub fn list_input_sessions(&self) -> Vec<Arc<MidiInputSession>> {
        self.inputs.read().values().flatten().cloned().collect()
    }

    /// Snapshot of all output sessions.
    pub fn list_output_sessions(&self) -> Vec<Arc<MidiOutputSession>> {
        self.outputs.read().values().flatten().cloned().collect()
    }

    pub fn input_sessions_for(&self, address: DeviceAddress) -> Vec<Arc<MidiInputSession>> {
        self.inputs.read().get(&address).cloned().unwrap_or_default()
    }

    /// Attach an input session, replacing any set held for its address.
    pub fn attach_input(&self, session: Arc<MidiInputSession>) {
        let previous = self.swap_inputs(session.address(), Some(session.clone()));
        self.notify_replaced(previous, Vec::new(), Some(&session), None);
    }

    /// Attach an output session, replacing any set held for its address.
    pub fn attach_output(&self, session: Arc<MidiOutputSession>) {
        let previous = self.swap_outputs(session.address(), Some(session.clone()));
        self.notify_replaced(Vec::new(), previous, None, Some(&session));
    }

    /// Swap both session sets of `address`.
    ///
    /// Superseded sessions are terminated and reported detached before any
    /// new session is reported attached.
    pub fn replace_sessions(
        &self,
        address: DeviceAddress,
        input: Option<Arc<MidiInputSession>>,
        output: Option<Arc<MidiOutputSession>>,
    ) {
        let old_inputs = self.swap_inputs(address, input.clone());
        let old_outputs = self.swap_outputs(address, output.clone());
        self.notify_replaced(old_inputs, old_outputs, input.as_ref(), output.as_ref());
    }

    fn swap_inputs(
        &self,
        address: DeviceAddress,
        session: Option<Arc<MidiInputSession>>,
    ) -> Vec<Arc<MidiInputSession>> {
        let mut inputs = self.inputs.write();
        let previous = match session {
            Some(session) => inputs.insert(address, vec![session]),
            None => inputs.remove(&address),
        };
        previous.unwrap_or_default()
    }

    fn swap_outputs(
        &self,
        address: DeviceAddress,
        session: Option<Arc<MidiOutputSession>>,
    ) -> Vec<Arc<MidiOutputSession>> {
        let mut outputs = self.outputs.write();
        let previous = match session {
            Some(session) => outputs.insert(address, vec![session]),
            None => outputs.remove(&address),
        };
        previous.unwrap_or_default()
    }

    fn notify_replaced(
        &self,
        old_inputs: Vec<Arc<MidiInputSession>>,
        old_outputs: Vec<Arc<MidiOutputSession>>,
        input: Option<&Arc<MidiInputSession>>,
        output: Option<&Arc<MidiOutputSession>>,
    ) {
        for old in &old_inputs {
            old.terminate();
            self.listeners.input_detached(old);
        }
        for old in &old_outputs {
            old.terminate();
            self.listeners.output_detached(old);
        }
        if let Some(input) = input {
            info!("MIDI input attached: {} ({})", input.device_name(), input.address());
            self.listeners.input_attached(input);
        }
        if let Some(output) = output {
            info!("MIDI output attached: {} ({})", output.device_name(), output.address());
            self.listeners.output_attached(output);
        }
    }

    /// Route a notification payload to the inputs bound to `characteristic`.
    pub fn dispatch_input(&self, address: DeviceAddress, characteristic: Uuid, data: &[u8]) {
        let sessions = self.input_sessions_for(address);
        for session in sessions
            .iter()
            .filter(|s| s.characteristic() == characteristic)
        {
            session.incoming_data(data);
        }
    }

    /// Terminate and forget every session of `address`.
    ///
    /// Fires one detach notification per session. Calling it again for the
    /// same address finds nothing and is a no-op. Returns the number of
    /// sessions detached.
    pub fn detach_all(&self, address: DeviceAddress) -> usize {
        let inputs = self.inputs.write().remove(&address).unwrap_or_default();
        let outputs = self.outputs.write().remove(&address).unwrap_or_default();

        for input in &inputs {
            input.terminate();
            self.listeners.input_detached(input);
        }
        for output in &outputs {
            output.terminate();
            self.listeners.output_detached(output);
        }

        let detached = inputs.len() + outputs.len();
        if detached > 0 {
            info!("Detached {} MIDI session(s) of {}", detached, address);
        }
        detached
    }

    /// Close every link and terminate every session without notifications.
    pub fn terminate_all(&self) {
        let connections: Vec<ConnectionRecord> =
            self.connections.write().drain().map(|(_, r)| r).collect();
        for record in connections {
            record.link.disconnect();
        }

        let inputs: Vec<_> = self.inputs.write().drain().collect();
        for (_, sessions) in inputs {
            for session in sessions {
                session.terminate();
            }
        }

        let outputs: Vec<_> = self.outputs.write().drain().collect();
        for (_, sessions) in outputs {
            for session in sessions {
                session.terminate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::*;
    use crate::bluetooth::fake::{FakeLink, RecordingListener};
    use crate::midi::RawPacketParser;

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new([0x10, 0, 0, 0, 0, n])
    }

    fn setup() -> (Arc<DeviceRegistry>, Arc<RecordingListener>) {
        let listeners = Listeners::new();
        let recorder = Arc::new(RecordingListener::default());
        listeners.set(Some(recorder.clone()));
        (Arc::new(DeviceRegistry::new(listeners)), recorder)
    }

    fn sessions(
        registry: &DeviceRegistry,
        link: &Arc<FakeLink>,
    ) -> (Arc<MidiInputSession>, Arc<MidiOutputSession>) {
        let address = link.address();
        let info = registry.device_info(address).unwrap();
        let input = Arc::new(MidiInputSession::new(
            info.clone(),
            MIDI_SERVICE_UUID,
            MIDI_CHARACTERISTIC_UUID,
            link.clone(),
            Box::new(RawPacketParser::new(address)),
        ));
        let output = Arc::new(MidiOutputSession::new(
            info,
            MIDI_SERVICE_UUID,
            MIDI_CHARACTERISTIC_UUID,
            link.clone(),
        ));
        (input, output)
    }

    #[test]
    fn test_begin_connection_rejects_duplicates() {
        let (registry, _) = setup();
        let link = FakeLink::midi(addr(1));

        assert!(registry.begin_connection(link.clone()));
        assert!(!registry.begin_connection(link.clone()));
        assert_eq!(registry.state(addr(1)), Some(NegotiationState::Connecting));

        registry.set_state(addr(1), NegotiationState::Disconnected);
        assert!(registry.begin_connection(link));
    }

    #[test]
    fn test_attach_and_list() {
        let (registry, recorder) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());
        registry.set_manufacturer(addr(1), "Acme".to_string());

        let (input, output) = sessions(&registry, &link);
        registry.attach_input(input.clone());
        registry.attach_output(output.clone());

        assert_eq!(registry.list_input_sessions().len(), 1);
        assert_eq!(registry.list_output_sessions().len(), 1);
        assert_eq!(input.manufacturer(), Some("Acme"));
        assert_eq!(recorder.count("input_attached"), 1);
        assert_eq!(recorder.count("output_attached"), 1);
    }

    #[test]
    fn test_replace_detaches_previous() {
        let (registry, recorder) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());

        let (first, _) = sessions(&registry, &link);
        let (second, _) = sessions(&registry, &link);
        registry.attach_input(first.clone());
        registry.attach_input(second.clone());

        let listed = registry.list_input_sessions();
        assert_eq!(listed.len(), 1);
        assert!(Arc::ptr_eq(&listed[0], &second));
        assert!(first.is_terminated());
        assert_eq!(recorder.count("input_detached"), 1);
        assert_eq!(recorder.count("input_attached"), 2);
    }

    #[test]
    fn test_replace_sessions_detaches_before_attaching() {
        let (registry, recorder) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());

        let (input, output) = sessions(&registry, &link);
        registry.replace_sessions(addr(1), Some(input), Some(output));
        let (input, _) = sessions(&registry, &link);
        registry.replace_sessions(addr(1), Some(input), None);

        assert_eq!(
            recorder.kinds(),
            vec![
                "input_attached",
                "output_attached",
                "input_detached",
                "output_detached",
                "input_attached",
            ]
        );
        assert!(registry.list_output_sessions().is_empty());
    }

    #[test]
    fn test_detach_all_is_idempotent() {
        let (registry, recorder) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());

        let (input, output) = sessions(&registry, &link);
        registry.attach_input(input.clone());
        registry.attach_output(output.clone());

        assert_eq!(registry.detach_all(addr(1)), 2);
        assert_eq!(registry.detach_all(addr(1)), 0);
        assert_eq!(registry.detach_all(addr(9)), 0);

        assert_eq!(recorder.count("input_detached"), 1);
        assert_eq!(recorder.count("output_detached"), 1);
        assert!(input.is_terminated());
        assert!(output.is_terminated());
        assert!(registry.list_input_sessions().is_empty());
    }

    #[test]
    fn test_record_mtu_resizes_outputs() {
        let (registry, _) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());

        assert_eq!(registry.buffer_size(addr(1)), 20);

        let (_, output) = sessions(&registry, &link);
        registry.attach_output(output.clone());
        assert_eq!(output.buffer_size(), 20);

        assert_eq!(registry.record_mtu(addr(1), 100), 97);
        assert_eq!(output.buffer_size(), 97);
        assert_eq!(registry.buffer_size(addr(1)), 97);

        registry.record_mtu(addr(1), 15);
        assert_eq!(output.buffer_size(), 20);
    }

    #[test]
    fn test_terminate_all_is_silent() {
        let (registry, recorder) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());
        let (input, output) = sessions(&registry, &link);
        registry.attach_input(input.clone());
        registry.attach_output(output);

        registry.terminate_all();

        assert!(input.is_terminated());
        assert!(!registry.is_connected(addr(1)));
        assert!(registry.list_output_sessions().is_empty());
        assert_eq!(recorder.count("input_detached"), 0);
        assert!(link.disconnected());
    }

    #[test]
    fn test_concurrent_reader_never_sees_mixed_sets() {
        let (registry, _) = setup();
        let link = FakeLink::midi(addr(1));
        registry.begin_connection(link.clone());

        let writer = {
            let registry = registry.clone();
            let link = link.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let (input, _) = sessions(&registry, &link);
                    registry.attach_input(input);
                }
            })
        };

        for _ in 0..500 {
            assert!(registry.input_sessions_for(addr(1)).len() <= 1);
        }
        writer.join().unwrap();
        assert_eq!(registry.list_input_sessions().len(), 1);
    }
}
