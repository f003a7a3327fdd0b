// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command opcodes and SERVICE sub-functions observed on the bus.

use num_derive::FromPrimitive;

/// Frame command byte. Requests answer with `code | 0x80` except for
/// SERVICE, which is unsolicited, and the two error sentinels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Command {
    GetSettings = 0x00,
    GetParamsStruct = 0x01,
    GetParamsStructWithRange = 0x02,
    Identify = 0x09,
    ModifyParam = 0x29,
    GetParams = 0x40,
    Service = 0x68,
    DataSizeError = 0x7E,
    NoData = 0x7F,
    GetSettingsAns = 0x80,
    GetParamsStructAns = 0x81,
    GetParamsStructWithRangeAns = 0x82,
    IdentifyAns = 0x89,
    ModifyParamAns = 0xA9,
    GetParamsAns = 0xC0,
}

impl Command {
    pub fn from_u8(raw: u8) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_u8(raw)
    }

    /// The answer opcode a request expects, if it expects one.
    pub fn reply(self) -> Option<Self> {
        match self {
            Self::GetSettings => Some(Self::GetSettingsAns),
            Self::GetParamsStruct => Some(Self::GetParamsStructAns),
            Self::GetParamsStructWithRange => {
                Some(Self::GetParamsStructWithRangeAns)
            }
            Self::Identify => Some(Self::IdentifyAns),
            Self::ModifyParam => Some(Self::ModifyParamAns),
            Self::GetParams => Some(Self::GetParamsAns),
            _ => None,
        }
    }
}

/// Sub-opcode of a SERVICE frame: 16-bit little-endian at payload
/// offset 0. The panel emits more functions than we act on; unknown
/// ones are preserved for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServiceFunction {
    TokenGrant,
    TokenReturn,
    ClockSync,
    DeviceTable,
    PairingBeacon,
    Other(u16),
}

impl ServiceFunction {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x0801 => Self::TokenGrant,
            0x0800 => Self::TokenReturn,
            0x0023 => Self::ClockSync,
            0x2001 => Self::DeviceTable,
            0x2004 => Self::PairingBeacon,
            other => Self::Other(other),
        }
    }

    /// Reads the function code out of a SERVICE payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let raw = u16::from_le_bytes([*payload.first()?, *payload.get(1)?]);
        Some(Self::from_u16(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values() {
        for (raw, cmd) in [
            (0x00, Command::GetSettings),
            (0x01, Command::GetParamsStruct),
            (0x02, Command::GetParamsStructWithRange),
            (0x09, Command::Identify),
            (0x29, Command::ModifyParam),
            (0x40, Command::GetParams),
            (0x68, Command::Service),
            (0x7E, Command::DataSizeError),
            (0x7F, Command::NoData),
            (0x80, Command::GetSettingsAns),
            (0x81, Command::GetParamsStructAns),
            (0x82, Command::GetParamsStructWithRangeAns),
            (0x89, Command::IdentifyAns),
            (0xA9, Command::ModifyParamAns),
            (0xC0, Command::GetParamsAns),
        ] {
            assert_eq!(Command::from_u8(raw), Some(cmd));
            assert_eq!(cmd as u8, raw);
        }
        assert_eq!(Command::from_u8(0x41), None);
    }

    #[test]
    fn request_reply_pairing() {
        assert_eq!(
            Command::Identify.reply(),
            Some(Command::IdentifyAns)
        );
        assert_eq!(
            Command::GetParams.reply(),
            Some(Command::GetParamsAns)
        );
        assert_eq!(Command::Service.reply(), None);
        assert_eq!(Command::NoData.reply(), None);
    }

    #[test]
    fn service_function_decoding() {
        assert_eq!(
            ServiceFunction::from_payload(&[0x01, 0x08, 0x00, 0x00]),
            Some(ServiceFunction::TokenGrant)
        );
        assert_eq!(
            ServiceFunction::from_payload(&[0x00, 0x08, 0x00, 0x00]),
            Some(ServiceFunction::TokenReturn)
        );
        assert_eq!(
            ServiceFunction::from_payload(&[0x23, 0x00]),
            Some(ServiceFunction::ClockSync)
        );
        assert_eq!(
            ServiceFunction::from_payload(&[0x01, 0x20]),
            Some(ServiceFunction::DeviceTable)
        );
        assert_eq!(
            ServiceFunction::from_payload(&[0x04, 0x20]),
            Some(ServiceFunction::PairingBeacon)
        );
        assert_eq!(
            ServiceFunction::from_payload(&[0x99, 0x30]),
            Some(ServiceFunction::Other(0x3099))
        );
        assert_eq!(ServiceFunction::from_payload(&[0x01]), None);
        assert_eq!(ServiceFunction::from_payload(&[]), None);
    }
}
