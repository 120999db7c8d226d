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

//! BLE-MIDI central daemon

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blemidi_central::bluetooth::BluezBackend;
use blemidi_central::{
    BleMidiCentralProvider, ChannelListener, Config, DeviceAddress, DeviceEvent,
    MidiInputListener,
};

/// Logs every MIDI packet received.
struct LogMidi;

impl MidiInputListener for LogMidi {
    fn on_midi_data(&self, source: DeviceAddress, data: &[u8]) {
        info!("MIDI from {}: {:02X?}", source, data);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blemidi_central=info".parse()?),
        )
        .init();

    info!("Starting BLE-MIDI central v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let backend = BluezBackend::new(&config.midi.extra_service_uuids).await?;
    let provider = BleMidiCentralProvider::new(&config, Arc::new(backend));

    let (listener, mut event_rx) = ChannelListener::new();
    provider.set_listener(Some(listener));

    provider.start_scan(None)?;

    let midi_log: Arc<dyn MidiInputListener> = Arc::new(LogMidi);
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    DeviceEvent::InputAttached(input) => {
                        info!(
                            "Input attached: {} ({}) manufacturer={:?} model={:?}",
                            input.device_name(),
                            input.address(),
                            input.manufacturer(),
                            input.model()
                        );
                        input.set_listener(Some(midi_log.clone()));
                    }
                    DeviceEvent::OutputAttached(output) => {
                        info!(
                            "Output attached: {} ({}), buffer size {}",
                            output.device_name(),
                            output.address(),
                            output.buffer_size()
                        );
                    }
                    DeviceEvent::InputDetached(input) => {
                        info!("Input detached: {}", input.address());
                    }
                    DeviceEvent::OutputDetached(output) => {
                        info!("Output detached: {}", output.address());
                    }
                    DeviceEvent::ScanStatusChanged(scanning) => {
                        info!("Scanning {}", if scanning { "started" } else { "stopped" });
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    provider.terminate();
    info!("BLE-MIDI central stopped");
    Ok(())
}
