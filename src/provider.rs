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

//! Application facing entry point.
//!
//! Wires a host backend to the negotiator and exposes scanning, session
//! lists and connection control.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    DeviceAddress, Negotiator, NegotiatorSettings, PlatformCapabilities, ServiceLocator,
    StandardMidiLocator,
};
use crate::config::{Config, ScanConfig};
use crate::events::{DeviceListener, Listeners};
use crate::midi::{MidiInputSession, MidiOutputSession, ParserFactory, RawPacketParser};
use crate::registry::DeviceRegistry;

/// Host side of scanning and link establishment.
pub trait CentralBackend: Send + Sync {
    /// Start discovering MIDI peripherals; found addresses go to `found`.
    ///
    /// The backend drops `found` when the scan ends.
    fn start_scan(&self, found: mpsc::UnboundedSender<DeviceAddress>) -> Result<()>;

    fn stop_scan(&self);

    /// Bring up the link to `address` and deliver its events to `negotiator`.
    fn connect(&self, address: DeviceAddress, negotiator: Arc<Negotiator>) -> Result<()>;

    /// Whether pairing requests can be confirmed without the user.
    fn supports_pairing_confirmation(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct ScanState {
    scanning: bool,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Arc<dyn CentralBackend>,
    negotiator: Arc<Negotiator>,
    listeners: Arc<Listeners>,
    scan: Mutex<ScanState>,
    scan_config: ScanConfig,
}

/// BLE-MIDI central.
#[derive(Clone)]
pub struct BleMidiCentralProvider {
    inner: Arc<Inner>,
}

impl BleMidiCentralProvider {
    /// Provider using the standard MIDI locator and undecoded packets.
    pub fn new(config: &Config, backend: Arc<dyn CentralBackend>) -> Self {
        let locator = StandardMidiLocator::new(
            config.midi.extra_service_uuids.clone(),
            config.midi.extra_characteristic_uuids.clone(),
        );
        Self::with_components(config, backend, Arc::new(locator), RawPacketParser::factory())
    }

    pub fn with_components(
        config: &Config,
        backend: Arc<dyn CentralBackend>,
        locator: Arc<dyn ServiceLocator>,
        parsers: Arc<dyn ParserFactory>,
    ) -> Self {
        let capabilities = PlatformCapabilities {
            mtu_strategy: config.central.mtu_strategy,
            privileged_pairing: backend.supports_pairing_confirmation(),
        };
        let listeners = Listeners::new();
        let registry = Arc::new(DeviceRegistry::new(listeners.clone()));
        let negotiator = Negotiator::new(
            registry,
            NegotiatorSettings::from_config(&config.central, capabilities),
            locator,
            parsers,
        );

        Self {
            inner: Arc::new(Inner {
                backend,
                negotiator,
                listeners,
                scan: Mutex::new(ScanState::default()),
                scan_config: config.scan.clone(),
            }),
        }
    }

    /// Start scanning for MIDI peripherals and connect to what is found.
    ///
    /// `timeout` overrides the configured scan duration. Already running
    /// scans are left alone.
    pub fn start_scan(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.or_else(|| self.inner.scan_config.timeout());

        {
            let mut scan = self.inner.scan.lock();
            if scan.scanning {
                debug!("Scan already running");
                return Ok(());
            }

            let (found_tx, mut found_rx) = mpsc::unbounded_channel();
            self.inner.backend.start_scan(found_tx)?;
            scan.scanning = true;

            let provider = self.clone();
            tokio::spawn(async move {
                while let Some(address) = found_rx.recv().await {
                    provider.on_device_found(address);
                }
                debug!("Scan results finished");
            });

            if let Some(timeout) = timeout {
                let provider = self.clone();
                scan.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    debug!("Scan timeout after {:?}", timeout);
                    provider.stop_scan();
                }));
            }
        }

        info!("Scanning for BLE-MIDI devices...");
        self.inner.listeners.scan_status_changed(true);
        Ok(())
    }

    /// Stop a running scan.
    pub fn stop_scan(&self) {
        if self.halt_scan() {
            info!("Scan stopped");
            self.inner.listeners.scan_status_changed(false);
        }
    }

    fn halt_scan(&self) -> bool {
        let mut scan = self.inner.scan.lock();
        if !scan.scanning {
            return false;
        }
        scan.scanning = false;
        if let Some(timer) = scan.timer.take() {
            timer.abort();
        }
        self.inner.backend.stop_scan();
        true
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scan.lock().scanning
    }

    fn on_device_found(&self, address: DeviceAddress) {
        if self.inner.negotiator.registry().is_connected(address) {
            debug!("{} already connected", address);
            return;
        }

        info!("Found MIDI device {}", address);
        match self.connect(address) {
            Ok(()) => {
                if self.inner.scan_config.stop_on_connect {
                    self.stop_scan();
                }
            }
            Err(e) => warn!("Failed to connect to {}: {}", address, e),
        }
    }

    /// Connect to a known peripheral.
    pub fn connect(&self, address: DeviceAddress) -> Result<()> {
        self.inner
            .backend
            .connect(address, self.inner.negotiator.clone())
    }

    /// Snapshot of all attached input sessions.
    pub fn input_sessions(&self) -> Vec<Arc<MidiInputSession>> {
        self.inner.negotiator.registry().list_input_sessions()
    }

    /// Snapshot of all attached output sessions.
    pub fn output_sessions(&self) -> Vec<Arc<MidiOutputSession>> {
        self.inner.negotiator.registry().list_output_sessions()
    }

    /// Close the link to `address`; its sessions are reported detached.
    pub fn disconnect(&self, address: DeviceAddress) {
        info!("Disconnecting {}", address);
        self.inner.negotiator.teardown(address);
    }

    /// Close the link behind an input session.
    pub fn disconnect_input(&self, session: &MidiInputSession) {
        self.disconnect(session.address());
    }

    /// Close the link behind an output session.
    pub fn disconnect_output(&self, session: &MidiOutputSession) {
        self.disconnect(session.address());
    }

    /// Discover services of a connected peripheral again.
    pub async fn rediscover(&self, address: DeviceAddress) -> Result<()> {
        self.inner.negotiator.rediscover(address).await
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn DeviceListener>>) {
        self.inner.listeners.set(listener);
    }

    pub fn set_auto_start_sessions(&self, enabled: bool) {
        self.inner.negotiator.set_auto_start_sessions(enabled);
    }

    pub fn set_require_bonding(&self, enabled: bool) {
        self.inner.negotiator.set_require_bonding(enabled);
    }

    /// Stop scanning and close everything without detach notifications.
    pub fn terminate(&self) {
        self.halt_scan();
        self.inner.negotiator.reset();
        info!("BLE-MIDI central terminated");
    }
}
