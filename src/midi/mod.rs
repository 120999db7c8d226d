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

//! Logical MIDI port sessions.

mod input;
mod output;
mod parser;

pub use input::MidiInputSession;
pub use output::MidiOutputSession;
pub use parser::{MidiInputListener, PacketParser, ParserFactory, RawPacketParser};

use crate::bluetooth::DeviceAddress;

/// Identity and metadata shared by the sessions of one peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: DeviceAddress,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}
