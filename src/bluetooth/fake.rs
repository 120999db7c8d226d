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

//! In-memory GATT stack for unit tests.
//!
//! Accepted requests queue their completion event; tests feed the queue to
//! the negotiator with [`pump`], which keeps every step deterministic.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::address::DeviceAddress;
use super::ble_constants::*;
use super::gatt::{
    BondState, CharacteristicInfo, CharacteristicProperties, GattClient, GattError, GattEvent,
    LinkState, ServiceInfo,
};
use super::negotiator::Negotiator;
use crate::events::DeviceListener;
use crate::midi::{MidiInputSession, MidiOutputSession};
use crate::provider::CentralBackend;

struct FakeState {
    discovery_refused: bool,
    discovery_fails: bool,
    reads_refused: bool,
    mtu_refused: bool,
    peer_mtu: u16,
    bond_state: BondState,
    bond_requests: usize,
    confirm_requests: usize,
    confirm_result: Result<(), GattError>,
    services_error: Option<GattError>,
    write_error: Option<GattError>,
    discover_requests: usize,
    high_priority_requests: usize,
    reads: Vec<Uuid>,
    mtu_requests: Vec<u16>,
    notifications: Vec<Uuid>,
    writes: Vec<Vec<u8>>,
    disconnects: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            discovery_refused: false,
            discovery_fails: false,
            reads_refused: false,
            mtu_refused: false,
            peer_mtu: config::MAX_MTU,
            bond_state: BondState::None,
            bond_requests: 0,
            confirm_requests: 0,
            confirm_result: Ok(()),
            services_error: None,
            write_error: None,
            discover_requests: 0,
            high_priority_requests: 0,
            reads: Vec::new(),
            mtu_requests: Vec::new(),
            notifications: Vec::new(),
            writes: Vec::new(),
            disconnects: 0,
        }
    }
}

/// Scriptable peripheral.
pub struct FakeLink {
    address: DeviceAddress,
    name: String,
    services: Vec<ServiceInfo>,
    values: HashMap<Uuid, Vec<u8>>,
    events: Mutex<VecDeque<GattEvent>>,
    state: Mutex<FakeState>,
}

/// Standard BLE-MIDI service with a notify + write-without-response characteristic.
pub fn midi_service() -> ServiceInfo {
    ServiceInfo {
        uuid: MIDI_SERVICE_UUID,
        characteristics: vec![CharacteristicInfo {
            uuid: MIDI_CHARACTERISTIC_UUID,
            properties: CharacteristicProperties {
                read: true,
                write: false,
                write_without_response: true,
                notify: true,
            },
        }],
    }
}

fn device_information_service() -> ServiceInfo {
    let readable = CharacteristicProperties {
        read: true,
        ..Default::default()
    };
    ServiceInfo {
        uuid: DEVICE_INFORMATION_SERVICE_UUID,
        characteristics: vec![
            CharacteristicInfo {
                uuid: MANUFACTURER_NAME_UUID,
                properties: readable,
            },
            CharacteristicInfo {
                uuid: MODEL_NUMBER_UUID,
                properties: readable,
            },
        ],
    }
}

impl FakeLink {
    pub fn new(address: DeviceAddress, name: &str, services: Vec<ServiceInfo>) -> Arc<Self> {
        Self::with_values(address, name, services, HashMap::new())
    }

    fn with_values(
        address: DeviceAddress,
        name: &str,
        services: Vec<ServiceInfo>,
        values: HashMap<Uuid, Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            name: name.to_string(),
            services,
            values,
            events: Mutex::new(VecDeque::new()),
            state: Mutex::new(FakeState::default()),
        })
    }

    /// MIDI peripheral without a Device Information service.
    pub fn midi(address: DeviceAddress) -> Arc<Self> {
        Self::new(address, "MIDI Device", vec![midi_service()])
    }

    /// MIDI peripheral that reports manufacturer and model.
    pub fn midi_with_info(
        address: DeviceAddress,
        name: &str,
        manufacturer: &str,
        model: &str,
    ) -> Arc<Self> {
        let mut values = HashMap::new();
        values.insert(MANUFACTURER_NAME_UUID, manufacturer.as_bytes().to_vec());
        values.insert(MODEL_NUMBER_UUID, model.as_bytes().to_vec());
        Self::with_values(
            address,
            name,
            vec![device_information_service(), midi_service()],
            values,
        )
    }

    pub fn pop_event(&self) -> Option<GattEvent> {
        self.events.lock().pop_front()
    }

    pub fn push_event(&self, event: GattEvent) {
        self.events.lock().push_back(event);
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.lock().is_empty()
    }

    /// Finish a pending pairing successfully.
    pub fn complete_bond(&self) {
        self.state.lock().bond_state = BondState::Bonded;
        self.push_event(GattEvent::BondStateChanged(BondState::Bonded));
    }

    pub fn set_bond_state(&self, state: BondState) {
        self.state.lock().bond_state = state;
    }

    pub fn set_confirm_result(&self, result: Result<(), GattError>) {
        self.state.lock().confirm_result = result;
    }

    pub fn set_services_error(&self, error: Option<GattError>) {
        self.state.lock().services_error = error;
    }

    pub fn set_write_error(&self, error: Option<GattError>) {
        self.state.lock().write_error = error;
    }

    pub fn set_peer_mtu(&self, mtu: u16) {
        self.state.lock().peer_mtu = mtu;
    }

    pub fn refuse_discovery(&self) {
        self.state.lock().discovery_refused = true;
    }

    pub fn fail_discovery(&self) {
        self.state.lock().discovery_fails = true;
    }

    pub fn refuse_reads(&self) {
        self.state.lock().reads_refused = true;
    }

    pub fn refuse_mtu(&self) {
        self.state.lock().mtu_refused = true;
    }

    pub fn bond_requests(&self) -> usize {
        self.state.lock().bond_requests
    }

    pub fn confirm_requests(&self) -> usize {
        self.state.lock().confirm_requests
    }

    pub fn discover_requests(&self) -> usize {
        self.state.lock().discover_requests
    }

    pub fn high_priority_requests(&self) -> usize {
        self.state.lock().high_priority_requests
    }

    pub fn reads(&self) -> Vec<Uuid> {
        self.state.lock().reads.clone()
    }

    pub fn mtu_requests(&self) -> Vec<u16> {
        self.state.lock().mtu_requests.clone()
    }

    pub fn notifications_enabled(&self) -> Vec<Uuid> {
        self.state.lock().notifications.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn disconnected(&self) -> bool {
        self.state.lock().disconnects > 0
    }
}

impl GattClient for FakeLink {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn discover_services(&self) -> bool {
        let (refused, fails) = {
            let mut state = self.state.lock();
            state.discover_requests += 1;
            (state.discovery_refused, state.discovery_fails)
        };
        if refused {
            return false;
        }
        self.push_event(GattEvent::ServicesDiscovered { success: !fails });
        true
    }

    fn services(&self) -> Result<Vec<ServiceInfo>, GattError> {
        match &self.state.lock().services_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.services.clone()),
        }
    }

    fn read_characteristic(&self, _service: Uuid, characteristic: Uuid) -> bool {
        let refused = {
            let mut state = self.state.lock();
            state.reads.push(characteristic);
            state.reads_refused
        };
        if refused {
            return false;
        }
        let value = self.values.get(&characteristic).cloned().unwrap_or_default();
        self.push_event(GattEvent::CharacteristicRead {
            characteristic,
            value,
        });
        true
    }

    fn request_mtu(&self, mtu: u16) -> bool {
        let (refused, peer_mtu) = {
            let mut state = self.state.lock();
            state.mtu_requests.push(mtu);
            (state.mtu_refused, state.peer_mtu)
        };
        if refused {
            return false;
        }
        self.push_event(GattEvent::MtuChanged {
            mtu: mtu.min(peer_mtu),
        });
        true
    }

    fn enable_notifications(&self, _service: Uuid, characteristic: Uuid) -> bool {
        self.state.lock().notifications.push(characteristic);
        true
    }

    fn write_without_response(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), GattError> {
        let mut state = self.state.lock();
        if state.disconnects > 0 {
            return Err(GattError::NotConnected);
        }
        if let Some(e) = &state.write_error {
            return Err(e.clone());
        }
        state.writes.push(data.to_vec());
        Ok(())
    }

    fn bond_state(&self) -> BondState {
        self.state.lock().bond_state
    }

    fn create_bond(&self) -> bool {
        let mut state = self.state.lock();
        state.bond_requests += 1;
        state.bond_state = BondState::Bonding;
        true
    }

    fn confirm_pairing(&self) -> Result<(), GattError> {
        let mut state = self.state.lock();
        state.confirm_requests += 1;
        state.confirm_result.clone()
    }

    fn request_high_priority(&self) -> bool {
        self.state.lock().high_priority_requests += 1;
        true
    }

    fn disconnect(&self) {
        self.state.lock().disconnects += 1;
    }
}

/// Deliver every queued completion of `link` to the negotiator.
pub fn pump(negotiator: &Arc<Negotiator>, link: &Arc<FakeLink>) {
    let dyn_link: Arc<dyn GattClient> = link.clone();
    while let Some(event) = link.pop_event() {
        negotiator.handle_event(&dyn_link, event);
    }
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Listener that records callbacks by kind.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(&'static str, Option<DeviceAddress>)>>,
}

impl RecordingListener {
    pub fn count(&self, kind: &str) -> usize {
        self.events.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(k, _)| *k).collect()
    }

    fn record(&self, kind: &'static str, address: Option<DeviceAddress>) {
        self.events.lock().push((kind, address));
    }
}

impl DeviceListener for RecordingListener {
    fn on_input_attached(&self, session: &Arc<MidiInputSession>) {
        self.record("input_attached", Some(session.address()));
    }

    fn on_output_attached(&self, session: &Arc<MidiOutputSession>) {
        self.record("output_attached", Some(session.address()));
    }

    fn on_input_detached(&self, session: &Arc<MidiInputSession>) {
        self.record("input_detached", Some(session.address()));
    }

    fn on_output_detached(&self, session: &Arc<MidiOutputSession>) {
        self.record("output_detached", Some(session.address()));
    }

    fn on_scan_status_changed(&self, scanning: bool) {
        self.record(if scanning { "scan_started" } else { "scan_stopped" }, None);
    }
}

/// Backend whose scan results and links are supplied by the test.
#[derive(Default)]
pub struct FakeBackend {
    links: Mutex<HashMap<DeviceAddress, Arc<FakeLink>>>,
    found: Mutex<Option<mpsc::UnboundedSender<DeviceAddress>>>,
    scanning: AtomicBool,
    connects: Mutex<Vec<DeviceAddress>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, link: Arc<FakeLink>) {
        self.links.lock().insert(link.address(), link);
    }

    /// Report `address` as found by the running scan.
    pub fn advertise(&self, address: DeviceAddress) -> bool {
        match &*self.found.lock() {
            Some(tx) => tx.send(address).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> Vec<DeviceAddress> {
        self.connects.lock().clone()
    }
}

impl CentralBackend for FakeBackend {
    fn start_scan(&self, found: mpsc::UnboundedSender<DeviceAddress>) -> Result<()> {
        *self.found.lock() = Some(found);
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_scan(&self) {
        *self.found.lock() = None;
        self.scanning.store(false, Ordering::SeqCst);
    }

    fn connect(&self, address: DeviceAddress, negotiator: Arc<Negotiator>) -> Result<()> {
        let Some(link) = self.links.lock().get(&address).cloned() else {
            bail!("unknown device {}", address);
        };
        self.connects.lock().push(address);

        let link: Arc<dyn GattClient> = link;
        negotiator.handle_event(&link, GattEvent::ConnectionStateChanged(LinkState::Connected));
        Ok(())
    }
}
