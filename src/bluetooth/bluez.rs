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

//! BlueZ backend.
//!
//! Each connected device gets an event pump task. Requests made through
//! [`BluezLink`] run as short tasks and post their completion back into the
//! pump, which hands it to the negotiator in order with the device's
//! property changes.

use anyhow::{bail, Context, Result};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::address::DeviceAddress;
use super::ble_constants::{config, MIDI_SERVICE_UUID};
use super::gatt::{
    BondState, CharacteristicInfo, CharacteristicProperties, GattClient, GattError, GattEvent,
    LinkState, ServiceInfo,
};
use super::negotiator::Negotiator;
use crate::provider::CentralBackend;

const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);
/// Writes queued ahead of a slow peripheral before sends are refused.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Scanning and connections through the default BlueZ adapter.
pub struct BluezBackend {
    adapter: Adapter,
    runtime: Handle,
    scan_services: HashSet<Uuid>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezBackend {
    /// Open a BlueZ session and power on the default adapter.
    ///
    /// `extra_services` are accepted in scan results next to the standard
    /// BLE-MIDI service.
    pub async fn new(extra_services: &[Uuid]) -> Result<Self> {
        info!("Initializing BlueZ central...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        let mut scan_services: HashSet<Uuid> = extra_services.iter().copied().collect();
        scan_services.insert(MIDI_SERVICE_UUID);

        Ok(Self {
            adapter,
            runtime: Handle::current(),
            scan_services,
            scan_task: Mutex::new(None),
        })
    }
}

impl CentralBackend for BluezBackend {
    fn start_scan(&self, found: mpsc::UnboundedSender<DeviceAddress>) -> Result<()> {
        let adapter = self.adapter.clone();
        let services = self.scan_services.clone();
        let task = self.runtime.spawn(async move {
            if let Err(e) = scan(adapter, services, found).await {
                warn!("Scan failed: {}", e);
            }
        });

        if let Some(previous) = self.scan_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        // Dropping the discovery stream ends discovery in BlueZ
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
    }

    fn connect(&self, address: DeviceAddress, negotiator: Arc<Negotiator>) -> Result<()> {
        let device = self
            .adapter
            .device(address.into())
            .with_context(|| format!("Unknown device {}", address))?;
        let runtime = self.runtime.clone();

        self.runtime.spawn(async move {
            if let Err(e) = run_link(device, negotiator, runtime).await {
                warn!("Link to {} failed: {}", address, e);
            }
        });
        Ok(())
    }
}

async fn scan(
    adapter: Adapter,
    services: HashSet<Uuid>,
    found: mpsc::UnboundedSender<DeviceAddress>,
) -> Result<()> {
    let filter = DiscoveryFilter {
        uuids: services.clone(),
        transport: DiscoveryTransport::Le,
        ..Default::default()
    };
    adapter.set_discovery_filter(filter).await?;

    let mut events = Box::pin(adapter.discover_devices().await?);
    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };

        // Cached devices are reported regardless of the filter
        let device = adapter.device(address)?;
        let advertised = device.uuids().await?.unwrap_or_default();
        if advertised.is_disjoint(&services) {
            continue;
        }

        debug!("Discovered {}", address);
        if found.send(address.into()).is_err() {
            break;
        }
    }
    Ok(())
}

/// Connect `device` and pump its events into the negotiator until it drops.
async fn run_link(device: Device, negotiator: Arc<Negotiator>, runtime: Handle) -> Result<()> {
    let address = DeviceAddress::from(device.address());

    if !device.is_connected().await? {
        info!("Connecting to {}...", address);
        device.connect().await?;
    }

    let name = device
        .name()
        .await?
        .unwrap_or_else(|| address.to_string());
    let bond_state = if device.is_paired().await? {
        BondState::Bonded
    } else {
        BondState::None
    };

    let mut device_events = Box::pin(device.events().await?);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let link = Arc::new(BluezLink::new(device, name, bond_state, event_tx, runtime));
    let dyn_link: Arc<dyn GattClient> = link.clone();

    negotiator.handle_event(
        &dyn_link,
        GattEvent::ConnectionStateChanged(LinkState::Connected),
    );

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                if let GattEvent::BondStateChanged(state) = event {
                    link.set_bond_state(state);
                }
                negotiator.handle_event(&dyn_link, event);
            }
            Some(event) = device_events.next() => {
                match event {
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                        link.mark_disconnected();
                        negotiator.handle_event(
                            &dyn_link,
                            GattEvent::ConnectionStateChanged(LinkState::Disconnected),
                        );
                        break;
                    }
                    DeviceEvent::PropertyChanged(DeviceProperty::Paired(paired)) => {
                        let state = if paired { BondState::Bonded } else { BondState::None };
                        link.set_bond_state(state);
                        negotiator.handle_event(&dyn_link, GattEvent::BondStateChanged(state));
                    }
                    _ => {}
                }
            }
            _ = link.closed.notified() => {
                debug!("{}: link closed locally", address);
                break;
            }
            else => break,
        }
    }

    link.abort_tasks();
    Ok(())
}

struct RemoteCharacteristic {
    service: Uuid,
    uuid: Uuid,
    properties: CharacteristicProperties,
    handle: Characteristic,
}

/// One connected BlueZ device.
pub struct BluezLink {
    device: Device,
    address: DeviceAddress,
    name: String,
    runtime: Handle,
    event_tx: mpsc::UnboundedSender<GattEvent>,
    write_tx: mpsc::Sender<(Characteristic, Vec<u8>)>,
    discovered: Arc<AtomicBool>,
    characteristics: Arc<Mutex<Vec<RemoteCharacteristic>>>,
    bond_state: Mutex<BondState>,
    connected: AtomicBool,
    closed: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Subscriptions,
}

/// Notification stream tasks, at most one per characteristic.
#[derive(Default)]
struct Subscriptions(Mutex<HashMap<Uuid, JoinHandle<()>>>);

impl Subscriptions {
    /// Track `task` for `characteristic`, stopping the stream it replaces.
    fn replace(&self, characteristic: Uuid, task: JoinHandle<()>) {
        if let Some(previous) = self.0.lock().insert(characteristic, task) {
            previous.abort();
        }
    }

    fn abort_all(&self) {
        for (_, task) in self.0.lock().drain() {
            task.abort();
        }
    }
}

impl BluezLink {
    fn new(
        device: Device,
        name: String,
        bond_state: BondState,
        event_tx: mpsc::UnboundedSender<GattEvent>,
        runtime: Handle,
    ) -> Self {
        let address = DeviceAddress::from(device.address());
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = runtime.spawn(write_loop(address, write_rx));

        Self {
            device,
            address,
            name,
            runtime,
            event_tx,
            write_tx,
            discovered: Arc::new(AtomicBool::new(false)),
            characteristics: Arc::new(Mutex::new(Vec::new())),
            bond_state: Mutex::new(bond_state),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
            tasks: Mutex::new(vec![writer]),
            subscriptions: Subscriptions::default(),
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn find(&self, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
        self.characteristics
            .lock()
            .iter()
            .find(|c| c.service == service && c.uuid == characteristic)
            .map(|c| c.handle.clone())
    }

    fn set_bond_state(&self, state: BondState) {
        *self.bond_state.lock() = state;
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.subscriptions.abort_all();
    }
}

async fn write_loop(
    address: DeviceAddress,
    mut write_rx: mpsc::Receiver<(Characteristic, Vec<u8>)>,
) {
    let request = CharacteristicWriteRequest {
        op_type: WriteOp::Command,
        ..Default::default()
    };
    while let Some((characteristic, data)) = write_rx.recv().await {
        if let Err(e) = characteristic.write_ext(&data, &request).await {
            debug!("{}: MIDI write failed: {}", address, GattError::from(e));
        }
    }
}

fn enqueue_write<T>(write_tx: &mpsc::Sender<T>, write: T) -> Result<(), GattError> {
    write_tx.try_send(write).map_err(|e| match e {
        TrySendError::Full(_) => GattError::Busy,
        TrySendError::Closed(_) => GattError::NotConnected,
    })
}

async fn resolve_services(device: &Device) -> Result<Vec<(ServiceInfo, Vec<Characteristic>)>> {
    let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
    while !device.is_services_resolved().await? {
        if tokio::time::Instant::now() >= deadline {
            bail!("services not resolved within {:?}", SERVICES_RESOLVE_TIMEOUT);
        }
        tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
    }

    let mut resolved = Vec::new();
    for service in device.services().await? {
        let mut info = ServiceInfo {
            uuid: service.uuid().await?,
            characteristics: Vec::new(),
        };
        let mut handles = Vec::new();
        for characteristic in service.characteristics().await? {
            let flags = characteristic.flags().await?;
            info.characteristics.push(CharacteristicInfo {
                uuid: characteristic.uuid().await?,
                properties: CharacteristicProperties {
                    read: flags.read,
                    write: flags.write,
                    write_without_response: flags.write_without_response,
                    notify: flags.notify,
                },
            });
            handles.push(characteristic);
        }
        resolved.push((info, handles));
    }
    Ok(resolved)
}

impl GattClient for BluezLink {
    fn address(&self) -> DeviceAddress {
        self.address
    }

    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn discover_services(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }

        let device = self.device.clone();
        let address = self.address;
        let event_tx = self.event_tx.clone();
        let characteristics = self.characteristics.clone();
        let discovered = self.discovered.clone();

        self.spawn(async move {
            let success = match resolve_services(&device).await {
                Ok(resolved) => {
                    let mut cache = characteristics.lock();
                    cache.clear();
                    for (info, handles) in resolved {
                        for (meta, handle) in info.characteristics.iter().zip(handles) {
                            cache.push(RemoteCharacteristic {
                                service: info.uuid,
                                uuid: meta.uuid,
                                properties: meta.properties,
                                handle,
                            });
                        }
                    }
                    discovered.store(true, Ordering::SeqCst);
                    true
                }
                Err(e) => {
                    warn!("{}: service discovery failed: {}", address, e);
                    false
                }
            };
            let _ = event_tx.send(GattEvent::ServicesDiscovered { success });
        });
        true
    }

    fn services(&self) -> Result<Vec<ServiceInfo>, GattError> {
        if !self.discovered.load(Ordering::SeqCst) {
            return Err(GattError::Stack("services not discovered".to_string()));
        }

        let mut services: Vec<ServiceInfo> = Vec::new();
        for c in self.characteristics.lock().iter() {
            let info = CharacteristicInfo {
                uuid: c.uuid,
                properties: c.properties,
            };
            match services.iter_mut().find(|s| s.uuid == c.service) {
                Some(service) => service.characteristics.push(info),
                None => services.push(ServiceInfo {
                    uuid: c.service,
                    characteristics: vec![info],
                }),
            }
        }
        Ok(services)
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        let Some(handle) = self.find(service, characteristic) else {
            return false;
        };
        let address = self.address;
        let event_tx = self.event_tx.clone();

        self.spawn(async move {
            let value = match handle.read().await {
                Ok(value) => value,
                Err(e) => {
                    // Still a completion, so negotiation moves on
                    debug!("{}: read of {} failed: {}", address, characteristic, e);
                    Vec::new()
                }
            };
            let _ = event_tx.send(GattEvent::CharacteristicRead {
                characteristic,
                value,
            });
        });
        true
    }

    fn request_mtu(&self, mtu: u16) -> bool {
        // BlueZ exchanges the MTU itself; acquiring a writer reports the result
        let handle = self
            .characteristics
            .lock()
            .iter()
            .find(|c| c.properties.write_without_response)
            .map(|c| c.handle.clone());
        let Some(handle) = handle else {
            return false;
        };
        let address = self.address;
        let event_tx = self.event_tx.clone();

        self.spawn(async move {
            let negotiated = match handle.write_io().await {
                Ok(writer) => u16::try_from(writer.mtu()).unwrap_or(mtu),
                Err(e) => {
                    debug!("{}: MTU query failed: {}", address, e);
                    config::DEFAULT_MTU
                }
            };
            debug!("{}: MTU {} (requested {})", address, negotiated, mtu);
            let _ = event_tx.send(GattEvent::MtuChanged { mtu: negotiated });
        });
        true
    }

    fn enable_notifications(&self, service: Uuid, characteristic: Uuid) -> bool {
        let Some(handle) = self.find(service, characteristic) else {
            return false;
        };
        let address = self.address;
        let event_tx = self.event_tx.clone();

        let task = self.runtime.spawn(async move {
            let stream = match handle.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: could not subscribe to {}: {}", address, characteristic, e);
                    return;
                }
            };
            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                let event = GattEvent::CharacteristicChanged {
                    characteristic,
                    value,
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            debug!("{}: notifications of {} ended", address, characteristic);
        });
        self.subscriptions.replace(characteristic, task);
        true
    }

    fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), GattError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GattError::NotConnected);
        }
        let handle = self
            .find(service, characteristic)
            .ok_or(GattError::UnknownCharacteristic(characteristic))?;
        enqueue_write(&self.write_tx, (handle, data.to_vec()))
    }

    fn bond_state(&self) -> BondState {
        *self.bond_state.lock()
    }

    fn create_bond(&self) -> bool {
        let device = self.device.clone();
        let address = self.address;
        let event_tx = self.event_tx.clone();
        self.set_bond_state(BondState::Bonding);

        self.spawn(async move {
            let state = match device.pair().await {
                Ok(()) => BondState::Bonded,
                Err(e) => {
                    warn!("{}: pairing failed: {}", address, GattError::from(e));
                    BondState::None
                }
            };
            let _ = event_tx.send(GattEvent::BondStateChanged(state));
        });
        true
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.abort_tasks();
        self.closed.notify_one();

        let device = self.device.clone();
        let address = self.address;
        self.runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("{}: disconnect failed: {}", address, e);
            }
        });
    }
}
