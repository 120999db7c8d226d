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

//! BLE service and characteristic UUIDs used by BLE-MIDI centrals.

use uuid::Uuid;

/// Standard BLE-MIDI service UUID.
pub const MIDI_SERVICE_UUID: Uuid = Uuid::from_u128(0x03b80e5a_ede8_4b33_a751_6ce34ec4c700);

/// Standard BLE-MIDI data I/O characteristic UUID.
/// Properties: Read, Write Without Response, Notify
pub const MIDI_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7772e5db_3868_4112_a1a9_f2669d106bf3);

/// Device Information service (0x180A).
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = short_uuid(0x180A);

/// Manufacturer Name String characteristic (0x2A29).
pub const MANUFACTURER_NAME_UUID: Uuid = short_uuid(0x2A29);

/// Model Number String characteristic (0x2A24).
pub const MODEL_NUMBER_UUID: Uuid = short_uuid(0x2A24);

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((short as u128) << 96))
}

/// BLE configuration constants.
pub mod config {
    /// Default ATT MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: u16 = 23;

    /// Largest ATT MTU a central asks for.
    pub const MAX_MTU: u16 = 517;

    /// ATT write overhead (opcode + handle).
    pub const ATT_OVERHEAD: usize = 3;

    /// Output buffer size before any MTU negotiation.
    pub const DEFAULT_BUFFER_SIZE: usize = 20;

    /// Output write-buffer size for a given ATT MTU.
    pub fn buffer_size_for_mtu(mtu: u16) -> usize {
        (mtu as usize)
            .saturating_sub(ATT_OVERHEAD)
            .max(DEFAULT_BUFFER_SIZE)
    }
}
