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

//! Connection negotiation state.

/// Where a connection is in its negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Disconnected,
    /// Link is up, waiting for the negotiation lock.
    Connecting,
    Discovering,
    InfoQuery,
    MtuNegotiation,
    PortSetup,
    /// Sessions exist, central configuration waits for pairing.
    Bonding,
    Active,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Disconnected => "Disconnected",
            NegotiationState::Connecting => "Connecting...",
            NegotiationState::Discovering => "Discovering services",
            NegotiationState::InfoQuery => "Reading device information",
            NegotiationState::MtuNegotiation => "Negotiating MTU",
            NegotiationState::PortSetup => "Setting up ports",
            NegotiationState::Bonding => "Waiting for pairing",
            NegotiationState::Active => "Active",
        }
    }

    /// Whether this state is only reachable while holding the negotiation lock.
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            NegotiationState::Discovering
                | NegotiationState::InfoQuery
                | NegotiationState::MtuNegotiation
                | NegotiationState::PortSetup
        )
    }

    /// Whether negotiation already ran past port setup.
    pub fn is_processed(&self) -> bool {
        matches!(self, NegotiationState::Bonding | NegotiationState::Active)
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
