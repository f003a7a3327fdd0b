// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire protocol for the GM3 controller bus.
//!
//! This crate defines the byte-level contract shared by everything that
//! talks GM3: the frame envelope and its nonstandard CRC-16, the command
//! opcodes and SERVICE sub-functions observed on the bus, and the typed
//! value codec used for parameter payloads. It contains no I/O; the
//! transport in `drv-gm3-bus-server` feeds it bytes.

pub mod crc;
pub mod frame;
pub mod value;

mod cmd;

pub use cmd::{Command, ServiceFunction};
pub use frame::{Frame, FrameError};
pub use value::{TypeCode, Value, ValueError};

/// Bus-wide broadcast destination.
pub const BROADCAST_ADDR: u16 = 0xFFFF;

/// The panel is the bus master; it probes for devices and grants the
/// token. Its address is fixed.
pub const PANEL_ADDR: u16 = 100;

/// Default address of the heat-pump controller (regulator).
pub const DEFAULT_CONTROLLER_ADDR: u16 = 1;

/// Catalog indices at and above this value belong to the PANEL address
/// space; the panel's wire index N is stored at `N + PANEL_INDEX_BASE`.
pub const PANEL_INDEX_BASE: u32 = 10_000;

/// The 16-byte IDENTIFY_ANS payload the panel expects from an ecoNET
/// device.
pub const IDENTIFY_ANS_PAYLOAD: [u8; 16] = *b"PLUM\0EcoNET\0\0\0\0\0";

/// SERVICE payload that returns the bus token to the panel.
pub const TOKEN_RETURN_PAYLOAD: [u8; 4] = [0x00, 0x08, 0x00, 0x00];

/// Addresses that must never be claimed as our own: the controller and
/// its spare, the panel's block, two observed fixed devices, and
/// broadcast.
pub fn is_reserved_addr(addr: u16) -> bool {
    matches!(addr, 1 | 2 | 100..=110 | 131 | 237 | 0xFFFF)
}

/// The two parameter banks on the bus. The regulator bank lives on the
/// controller and describes itself with ranged struct records; the
/// panel bank lives at address 100 and uses the rangeless variant. The
/// catalog keeps them apart by offsetting panel indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSpace {
    Regulator,
    Panel,
}

impl AddressSpace {
    /// Struct request opcode for discovering this bank.
    pub fn struct_request(self) -> Command {
        match self {
            Self::Regulator => Command::GetParamsStructWithRange,
            Self::Panel => Command::GetParamsStruct,
        }
    }

    /// Bus destination for requests against this bank.
    pub fn destination(self, controller_addr: u16) -> u16 {
        match self {
            Self::Regulator => controller_addr,
            Self::Panel => PANEL_ADDR,
        }
    }

    /// Maps a wire index into the unified catalog index range.
    pub fn catalog_index(self, wire_index: u16) -> u32 {
        match self {
            Self::Regulator => u32::from(wire_index),
            Self::Panel => u32::from(wire_index) + PANEL_INDEX_BASE,
        }
    }

    /// Splits a catalog index back into its space and wire index.
    pub fn from_catalog_index(index: u32) -> Option<(Self, u16)> {
        if index < PANEL_INDEX_BASE {
            Some((Self::Regulator, index as u16))
        } else {
            u16::try_from(index - PANEL_INDEX_BASE)
                .ok()
                .map(|wire| (Self::Panel, wire))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_set() {
        for addr in [1, 2, 100, 105, 110, 131, 237, 0xFFFF] {
            assert!(is_reserved_addr(addr), "{addr} should be reserved");
        }
        for addr in [0, 3, 99, 111, 130, 132, 236, 238, 0xFFFE] {
            assert!(!is_reserved_addr(addr), "{addr} should be claimable");
        }
    }

    #[test]
    fn address_space_mapping() {
        assert_eq!(AddressSpace::Regulator.catalog_index(1280), 1280);
        assert_eq!(AddressSpace::Panel.catalog_index(7), 10_007);
        assert_eq!(
            AddressSpace::from_catalog_index(1280),
            Some((AddressSpace::Regulator, 1280))
        );
        assert_eq!(
            AddressSpace::from_catalog_index(10_007),
            Some((AddressSpace::Panel, 7))
        );
        assert_eq!(AddressSpace::from_catalog_index(100_000), None);

        assert_eq!(AddressSpace::Regulator.destination(1), 1);
        assert_eq!(AddressSpace::Regulator.destination(3), 3);
        assert_eq!(AddressSpace::Panel.destination(1), PANEL_ADDR);
    }

    #[test]
    fn identify_ans_payload_bytes() {
        assert_eq!(
            IDENTIFY_ANS_PAYLOAD,
            [
                0x50, 0x4C, 0x55, 0x4D, 0x00, 0x45, 0x63, 0x6F, 0x4E, 0x45,
                0x54, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]
        );
    }
}
