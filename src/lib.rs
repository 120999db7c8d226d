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

//! BLE-MIDI central.
//!
//! Finds peripherals advertising the BLE-MIDI service, negotiates each
//! connection one at a time and exposes the resulting MIDI input and output
//! sessions through [`BleMidiCentralProvider`].

pub mod bluetooth;
pub mod config;
pub mod events;
pub mod midi;
pub mod provider;
pub mod registry;
pub mod state;

pub use bluetooth::{DeviceAddress, GattClient, GattError, GattEvent};
pub use config::Config;
pub use events::{ChannelListener, DeviceEvent, DeviceListener};
pub use midi::{MidiInputListener, MidiInputSession, MidiOutputSession};
pub use provider::{BleMidiCentralProvider, CentralBackend};
pub use state::NegotiationState;
