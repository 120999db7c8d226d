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

//! Per-connection negotiation.
//!
//! Drives each link from link-up through discovery, device information,
//! MTU and port setup to an active (or pairing) connection. Discovery
//! through port setup runs under the global [`NegotiationLock`]; the
//! remaining steps of the lock holder are kept in a [`CommandQueue`] and
//! advanced by the completion events the stack delivers.

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::address::DeviceAddress;
use super::ble_constants::{
    config, DEVICE_INFORMATION_SERVICE_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID,
};
use super::bonding::{BondingOutcome, BondingRecord, BondingWorkflow};
use super::command_queue::{CommandQueue, Completion, GattCommand};
use super::gatt::{BondState, GattClient, GattEvent, LinkState};
use super::lock::{NegotiationLock, NegotiationPermit};
use super::locator::{MidiEndpoints, ServiceLocator};
use crate::config::{CentralConfig, MtuStrategy};
use crate::midi::{MidiInputSession, MidiOutputSession, ParserFactory};
use crate::registry::DeviceRegistry;
use crate::state::NegotiationState;

/// Platform behavior decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub mtu_strategy: MtuStrategy,
    /// Pairing requests may be confirmed without user interaction.
    pub privileged_pairing: bool,
}

impl Default for PlatformCapabilities {
    fn default() -> Self {
        Self {
            mtu_strategy: MtuStrategy::Request,
            privileged_pairing: false,
        }
    }
}

/// Tunables for the negotiator.
#[derive(Debug, Clone)]
pub struct NegotiatorSettings {
    pub auto_start_sessions: bool,
    pub require_bonding: bool,
    pub negotiation_timeout: Duration,
    pub requested_mtu: u16,
    pub capabilities: PlatformCapabilities,
}

impl Default for NegotiatorSettings {
    fn default() -> Self {
        Self::from_config(&CentralConfig::default(), PlatformCapabilities::default())
    }
}

impl NegotiatorSettings {
    pub fn from_config(config: &CentralConfig, capabilities: PlatformCapabilities) -> Self {
        Self {
            auto_start_sessions: config.auto_start_sessions,
            require_bonding: config.require_bonding,
            negotiation_timeout: config.negotiation_timeout(),
            requested_mtu: config.requested_mtu,
            capabilities,
        }
    }
}

/// The connection currently holding the lock.
struct ActiveNegotiation {
    permit: NegotiationPermit,
    link: Arc<dyn GattClient>,
    queue: CommandQueue,
}

/// Connection state machine shared by all links.
pub struct Negotiator {
    registry: Arc<DeviceRegistry>,
    lock: NegotiationLock,
    active: Mutex<Option<ActiveNegotiation>>,
    bonding: BondingWorkflow,
    locator: Arc<dyn ServiceLocator>,
    parsers: Arc<dyn ParserFactory>,
    auto_start: AtomicBool,
    require_bonding: AtomicBool,
    timeout: Duration,
    requested_mtu: u16,
    mtu_strategy: MtuStrategy,
}

impl Negotiator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        settings: NegotiatorSettings,
        locator: Arc<dyn ServiceLocator>,
        parsers: Arc<dyn ParserFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            lock: NegotiationLock::new(),
            active: Mutex::new(None),
            bonding: BondingWorkflow::new(settings.capabilities.privileged_pairing),
            locator,
            parsers,
            auto_start: AtomicBool::new(settings.auto_start_sessions),
            require_bonding: AtomicBool::new(settings.require_bonding),
            timeout: settings.negotiation_timeout,
            requested_mtu: settings.requested_mtu,
            mtu_strategy: settings.capabilities.mtu_strategy,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn set_auto_start_sessions(&self, enabled: bool) {
        self.auto_start.store(enabled, Ordering::SeqCst);
    }

    pub fn set_require_bonding(&self, enabled: bool) {
        self.require_bonding.store(enabled, Ordering::SeqCst);
    }

    /// Connection currently negotiating under the lock.
    pub fn lock_holder(&self) -> Option<DeviceAddress> {
        self.lock.holder()
    }

    /// Connection whose configuration waits for pairing.
    pub fn pending_bond(&self) -> Option<DeviceAddress> {
        self.bonding.pending_address()
    }

    /// Entry point for every stack event of `link`.
    pub fn handle_event(self: &Arc<Self>, link: &Arc<dyn GattClient>, event: GattEvent) {
        let address = link.address();
        match event {
            GattEvent::ConnectionStateChanged(LinkState::Connected) => {
                let this = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    this.on_connected(link).await;
                });
            }
            GattEvent::ConnectionStateChanged(LinkState::Disconnected) => {
                if !self.is_current(link) {
                    debug!("{}: superseded link went down", address);
                    return;
                }
                info!("{} disconnected", address);
                self.teardown(address);
            }
            GattEvent::ServicesDiscovered { success } => {
                self.on_services_discovered(address, success);
            }
            GattEvent::CharacteristicRead {
                characteristic,
                value,
            } => {
                self.on_characteristic_read(address, characteristic, &value);
            }
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                self.registry.dispatch_input(address, characteristic, &value);
            }
            GattEvent::MtuChanged { mtu } => {
                self.on_mtu_changed(address, mtu);
            }
            GattEvent::BondStateChanged(state) => {
                self.on_bond_state_changed(address, state);
            }
        }
    }

    /// Link came up: register it and negotiate once the lock is free.
    pub async fn on_connected(self: &Arc<Self>, link: Arc<dyn GattClient>) {
        let address = link.address();
        if !self.registry.begin_connection(link.clone()) {
            debug!("{}: already negotiating, ignoring link-up", address);
            return;
        }
        info!("{} connected ({})", address, link.device_name());
        self.negotiate(link).await;
    }

    /// Run discovery again on an established link.
    ///
    /// New sessions replace the current ones; the superseded sessions are
    /// reported detached before the new ones are reported attached.
    pub async fn rediscover(self: &Arc<Self>, address: DeviceAddress) -> Result<()> {
        let link = self
            .registry
            .link(address)
            .ok_or_else(|| anyhow!("{} is not connected", address))?;

        match self.registry.state(address) {
            Some(state) if state.is_processed() => {}
            Some(state) => bail!("{} is still negotiating ({})", address, state),
            None => bail!("{} is not connected", address),
        }

        self.bonding.cancel(address);
        self.registry.set_state(address, NegotiationState::Connecting);
        self.negotiate(link).await;
        Ok(())
    }

    async fn negotiate(self: &Arc<Self>, link: Arc<dyn GattClient>) {
        let address = link.address();

        let Some(permit) = self.lock.acquire(address, self.timeout).await else {
            warn!(
                "{}: gave up waiting {:?} for the negotiation lock",
                address, self.timeout
            );
            if self.is_current(&link) {
                self.teardown(address);
            } else {
                link.disconnect();
            }
            return;
        };

        // Torn down or reconnected while waiting
        if !self.is_current(&link)
            || self.registry.state(address) != Some(NegotiationState::Connecting)
        {
            debug!("{}: connection changed while waiting for the lock", address);
            return;
        }

        self.registry.set_state(address, NegotiationState::Discovering);
        *self.active.lock() = Some(ActiveNegotiation {
            permit,
            link: link.clone(),
            queue: CommandQueue::new(),
        });

        if !link.discover_services() {
            warn!("{}: service discovery could not be started", address);
            self.teardown(address);
        }
    }

    fn on_services_discovered(&self, address: DeviceAddress, success: bool) {
        let Some(link) = self.holder_link(address) else {
            debug!("{}: unsolicited service discovery result", address);
            return;
        };

        if !success {
            warn!("{}: service discovery failed", address);
            self.teardown(address);
            return;
        }

        self.registry.set_state(address, NegotiationState::InfoQuery);

        let mut commands = Vec::new();
        match link.services() {
            Ok(services) => {
                if let Some(info) = services
                    .iter()
                    .find(|s| s.uuid == DEVICE_INFORMATION_SERVICE_UUID)
                {
                    for uuid in [MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID] {
                        if info.characteristic(uuid).is_some() {
                            commands.push(GattCommand::ReadCharacteristic {
                                service: DEVICE_INFORMATION_SERVICE_UUID,
                                characteristic: uuid,
                            });
                        }
                    }
                }
            }
            Err(e) => debug!("{}: no service list: {}", address, e),
        }
        commands.push(GattCommand::RequestMtu {
            mtu: self.requested_mtu,
        });
        commands.push(GattCommand::SetupPorts);

        {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(negotiation) if negotiation.permit.address() == address => {
                    for command in commands {
                        negotiation.queue.push(command);
                    }
                }
                _ => return,
            }
        }

        self.advance(address);
    }

    fn on_characteristic_read(&self, address: DeviceAddress, characteristic: Uuid, value: &[u8]) {
        if characteristic == MANUFACTURER_NAME_UUID {
            if let Some(manufacturer) = decode_string(value) {
                debug!("{}: manufacturer {}", address, manufacturer);
                self.registry.set_manufacturer(address, manufacturer);
            }
        } else if characteristic == MODEL_NUMBER_UUID {
            if let Some(model) = decode_string(value) {
                debug!("{}: model {}", address, model);
                self.registry.set_model(address, model);
            }
        }

        if self.complete(address, Completion::Read { characteristic }) {
            self.advance(address);
        }
    }

    fn on_mtu_changed(&self, address: DeviceAddress, mtu: u16) {
        self.registry.record_mtu(address, mtu);

        // Only a pending MTU request moves the negotiation on
        if self.complete(address, Completion::Mtu) {
            self.advance(address);
        }
    }

    fn on_bond_state_changed(&self, address: DeviceAddress, state: BondState) {
        let Some(record) = self.bonding.on_bond_state_changed(address, state) else {
            return;
        };

        if self.registry.state(address) != Some(NegotiationState::Bonding) {
            debug!("{}: bonded after leaving the pairing state", address);
            return;
        }

        info!("{}: paired", address);
        record.configure();
        self.registry.set_state(address, NegotiationState::Active);
    }

    /// Run queued commands until one waits for a completion.
    fn advance(&self, address: DeviceAddress) {
        loop {
            let (link, command) = {
                let mut active = self.active.lock();
                let Some(negotiation) = active
                    .as_mut()
                    .filter(|n| n.permit.address() == address)
                else {
                    return;
                };
                let Some(command) = negotiation.queue.next() else {
                    return;
                };
                // In flight before the request goes out, so a fast completion finds it
                if command != GattCommand::SetupPorts {
                    negotiation.queue.set_in_flight(command.clone());
                }
                (negotiation.link.clone(), command)
            };

            debug!("{}: next command {:?}", address, command);
            match command {
                GattCommand::ReadCharacteristic {
                    service,
                    characteristic,
                } => {
                    if link.read_characteristic(service, characteristic) {
                        return;
                    }
                    debug!("{}: read of {} refused", address, characteristic);
                    if !self.complete(address, Completion::Read { characteristic }) {
                        return;
                    }
                }
                GattCommand::RequestMtu { mtu } => {
                    self.registry
                        .set_state(address, NegotiationState::MtuNegotiation);
                    match self.mtu_strategy {
                        MtuStrategy::AssumeMax => {
                            self.registry.record_mtu(address, config::MAX_MTU);
                        }
                        MtuStrategy::Request => {
                            if link.request_mtu(mtu) {
                                return;
                            }
                            debug!("{}: MTU request refused", address);
                        }
                    }
                    if !self.complete(address, Completion::Mtu) {
                        return;
                    }
                }
                GattCommand::SetupPorts => {
                    self.setup_ports(address, link);
                    return;
                }
            }
        }
    }

    fn setup_ports(&self, address: DeviceAddress, link: Arc<dyn GattClient>) {
        self.registry.set_state(address, NegotiationState::PortSetup);

        let endpoints = match self.locator.locate(&*link) {
            Ok(Some(endpoints)) => Some(endpoints),
            Ok(None) => {
                warn!("{}: no MIDI service found", address);
                None
            }
            Err(e) => {
                error!("{}: MIDI service lookup failed: {}", address, e);
                None
            }
        };

        let sessions =
            endpoints.and_then(|endpoints| self.build_sessions(address, &link, endpoints));
        let Some((input, output)) = sessions else {
            self.teardown(address);
            return;
        };

        self.registry
            .replace_sessions(address, input.clone(), output.clone());

        // Torn down while the sessions were being attached
        if !self.registry.is_connected(address) {
            self.release(address);
            self.registry.detach_all(address);
            return;
        }

        if self.auto_start.load(Ordering::SeqCst) {
            if let Some(input) = &input {
                input.start();
            }
            if let Some(output) = &output {
                output.start();
            }
        }

        if !link.request_high_priority() {
            debug!("{}: connection priority not supported", address);
        }

        let record = BondingRecord {
            address,
            input,
            output,
        };

        let outcome = if self.require_bonding.load(Ordering::SeqCst) {
            self.bonding.begin(&*link, record.clone())
        } else {
            BondingOutcome::AlreadyBonded
        };

        match outcome {
            BondingOutcome::AlreadyBonded => {
                record.configure();
                self.registry.set_state(address, NegotiationState::Active);
            }
            BondingOutcome::Pending => {
                self.registry.set_state(address, NegotiationState::Bonding);
            }
        }

        // A pending pairing must not block other connections
        self.release(address);
    }

    fn build_sessions(
        &self,
        address: DeviceAddress,
        link: &Arc<dyn GattClient>,
        endpoints: MidiEndpoints,
    ) -> Option<(Option<Arc<MidiInputSession>>, Option<Arc<MidiOutputSession>>)> {
        let info = self.registry.device_info(address)?;

        let input = endpoints.input.map(|characteristic| {
            Arc::new(MidiInputSession::new(
                info.clone(),
                endpoints.service,
                characteristic,
                link.clone(),
                self.parsers.create(address),
            ))
        });

        let output = endpoints.output.map(|characteristic| {
            let output = MidiOutputSession::new(
                info.clone(),
                endpoints.service,
                characteristic,
                link.clone(),
            );
            output.set_buffer_size(self.registry.buffer_size(address));
            Arc::new(output)
        });

        if input.is_none() && output.is_none() {
            return None;
        }
        Some((input, output))
    }

    /// Drop the connection at any state.
    ///
    /// Releases the lock if held, discards pending commands and bonding
    /// state, closes the link and detaches its sessions. Safe to repeat.
    pub fn teardown(&self, address: DeviceAddress) {
        self.release(address);
        if self.bonding.cancel(address) {
            debug!("{}: pending pairing discarded", address);
        }

        if let Some(record) = self.registry.remove_connection(address) {
            record.link.disconnect();
        }
        self.registry.detach_all(address);
    }

    /// Forget all negotiation state and close every link silently.
    pub fn reset(&self) {
        let released = self.active.lock().take();
        drop(released);
        self.bonding.clear();
        self.registry.terminate_all();
    }

    /// Whether `link` is still the registered link for its address.
    fn is_current(&self, link: &Arc<dyn GattClient>) -> bool {
        self.registry
            .link(link.address())
            .is_some_and(|current| same_link(&current, link))
    }

    fn holder_link(&self, address: DeviceAddress) -> Option<Arc<dyn GattClient>> {
        self.active
            .lock()
            .as_ref()
            .filter(|n| n.permit.address() == address)
            .map(|n| n.link.clone())
    }

    fn complete(&self, address: DeviceAddress, completion: Completion) -> bool {
        match self.active.lock().as_mut() {
            Some(negotiation) if negotiation.permit.address() == address => {
                negotiation.queue.complete(completion)
            }
            _ => false,
        }
    }

    /// Release the lock if `address` holds it.
    fn release(&self, address: DeviceAddress) -> bool {
        let released = {
            let mut active = self.active.lock();
            let holds = active
                .as_ref()
                .is_some_and(|n| n.permit.address() == address);
            if holds {
                active.take()
            } else {
                None
            }
        };
        // Permit drops here, outside the state mutex
        released.is_some()
    }
}

fn same_link(a: &Arc<dyn GattClient>, b: &Arc<dyn GattClient>) -> bool {
    // Data pointers only, vtables are not unique
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Device information strings may be NUL padded.
fn decode_string(value: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(value);
    let text = text.trim_end_matches('\0').trim();
    (!text.is_empty()).then(|| text.to_string())
}
