// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot catalog discovery.
//!
//! Each address space is walked with paged struct requests while the
//! token is held: the regulator with GET_PARAMS_STRUCT_WITH_RANGE
//! (0x02), whose records carry min/max, and the panel with
//! GET_PARAMS_STRUCT (0x01), whose records carry a display exponent
//! instead. Paging continues until the peer reports NO_DATA, a page
//! comes back empty, or three consecutive batches fail after the
//! transport's own retries.

use drv_gm3_api::{CatalogWriter, Parameter};
use drv_gm3_proto::{AddressSpace, TypeCode, Value};

use crate::arbiter::BusHandle;
use crate::transport::{Reply, TransportError};
use crate::wire::Wire;

// Bit 5 of the struct type_byte marks the parameter writable; the low
// nibble is the type code.
const TYPE_MASK: u8 = 0x0F;
const WRITABLE_MASK: u8 = 0x20;

const MAX_BATCH_FAILURES: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The page ended mid-record.
    Truncated,
    /// A parameter name was not valid UTF-8.
    BadName,
    /// Declared indices run past the 16-bit wire index range.
    IndexOverflow,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::Truncated => "struct page truncated mid-record",
            Self::BadName => "parameter name is not UTF-8",
            Self::IndexOverflow => "wire index overflow in struct page",
        };
        f.write_str(msg)
    }
}

/// A parsed struct-response page: the peer's declared first index and
/// count, plus the records we could type.
#[derive(Debug, PartialEq)]
pub struct StructPage {
    pub first: u16,
    pub declared: u8,
    pub entries: Vec<(u16, RawEntry)>,
}

#[derive(Debug, PartialEq)]
pub struct RawEntry {
    pub name: String,
    pub unit_code: u8,
    pub type_code: TypeCode,
    pub writable: bool,
    pub exponent: Option<u8>,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

/// Walks one address space and appends everything found to the
/// catalog. Returns the number of parameters added.
pub fn discover_space<W: Wire>(
    bus: &mut BusHandle<'_, W>,
    catalog: &CatalogWriter,
    space: AddressSpace,
    controller_addr: u16,
    page_size: u8,
) -> Result<usize, TransportError> {
    let dest = space.destination(controller_addr);
    let mut first: u16 = 0;
    let mut added = 0usize;
    let mut failures = 0u32;

    loop {
        let request =
            [page_size, first.to_le_bytes()[0], first.to_le_bytes()[1]];
        let page = match bus.request(dest, space.struct_request(), &request)? {
            Reply::Answer(frame) => {
                match parse_struct_page(&frame.payload, space) {
                    Ok(page) => page,
                    Err(e) => {
                        log::warn!(
                            "{space:?} struct page at {first} unparseable: {e}"
                        );
                        failures += 1;
                        if failures >= MAX_BATCH_FAILURES {
                            break;
                        }
                        continue;
                    }
                }
            }
            Reply::NoData => {
                log::debug!("{space:?} discovery: NO_DATA at {first}");
                break;
            }
            Reply::DataSizeError => {
                log::warn!("{space:?} discovery: size error at {first}");
                failures += 1;
                if failures >= MAX_BATCH_FAILURES {
                    break;
                }
                continue;
            }
            Reply::Timeout => {
                failures += 1;
                log::warn!(
                    "{space:?} struct page at {first} unanswered \
                     ({failures}/{MAX_BATCH_FAILURES})"
                );
                if failures >= MAX_BATCH_FAILURES {
                    break;
                }
                continue;
            }
        };

        if page.declared == 0 {
            break;
        }
        failures = 0;

        for (wire_index, raw) in page.entries {
            let param = Parameter {
                catalog_index: space.catalog_index(wire_index),
                wire_index,
                space,
                name: raw.name,
                unit_code: raw.unit_code,
                type_code: raw.type_code,
                writable: raw.writable,
                exponent: raw.exponent,
                min: raw.min,
                max: raw.max,
                current_value: None,
                last_update: None,
            };
            if catalog.insert(param) {
                added += 1;
            }
        }

        first = match page.first.checked_add(u16::from(page.declared)) {
            Some(next) => next,
            None => break,
        };
    }

    log::info!("{space:?} discovery complete: {added} parameters");
    Ok(added)
}

/// Parses one struct-response payload:
/// `[paramsNo][firstIndex_lo][firstIndex_hi]` followed by `paramsNo`
/// records. Regulator records are
/// `name\0 unit\0 type extra min_lo min_hi max_lo max_hi`; panel
/// records are `name\0 unit\0 exponent type`. Records with a type code
/// outside the known set are skipped but still occupy their index.
pub fn parse_struct_page(
    payload: &[u8],
    space: AddressSpace,
) -> Result<StructPage, ParseError> {
    if payload.len() < 3 {
        return Err(ParseError::Truncated);
    }
    let declared = payload[0];
    let first = u16::from_le_bytes([payload[1], payload[2]]);
    let mut off = 3;
    let mut entries = Vec::with_capacity(usize::from(declared));

    for i in 0..u16::from(declared) {
        let wire_index =
            first.checked_add(i).ok_or(ParseError::IndexOverflow)?;

        let (name_bytes, used) =
            take_cstr(&payload[off..]).ok_or(ParseError::Truncated)?;
        let name = core::str::from_utf8(name_bytes)
            .map_err(|_| ParseError::BadName)?
            .to_owned();
        off += used;

        let (unit_bytes, used) =
            take_cstr(&payload[off..]).ok_or(ParseError::Truncated)?;
        let unit_code = unit_bytes.first().copied().unwrap_or(0);
        if unit_bytes.len() > 1 {
            log::debug!(
                "parameter {name:?} has a {}-byte unit field; \
                 keeping the leading code byte",
                unit_bytes.len()
            );
        }
        off += used;

        let (type_byte, exponent, min_raw, max_raw) = match space {
            AddressSpace::Regulator => {
                let tail = payload
                    .get(off..off + 6)
                    .ok_or(ParseError::Truncated)?;
                off += 6;
                (
                    tail[0],
                    None,
                    Some(u16::from_le_bytes([tail[2], tail[3]])),
                    Some(u16::from_le_bytes([tail[4], tail[5]])),
                )
            }
            AddressSpace::Panel => {
                let tail = payload
                    .get(off..off + 2)
                    .ok_or(ParseError::Truncated)?;
                off += 2;
                (tail[1], Some(tail[0]), None, None)
            }
        };

        let Some(type_code) = TypeCode::from_u8(type_byte & TYPE_MASK) else {
            log::warn!(
                "parameter {name:?} at {wire_index} has unknown type byte \
                 {type_byte:#04x}; skipping"
            );
            continue;
        };

        entries.push((
            wire_index,
            RawEntry {
                name,
                unit_code,
                type_code,
                writable: type_byte & WRITABLE_MASK != 0,
                exponent,
                min: min_raw
                    .and_then(|raw| Value::from_range_field(raw, type_code)),
                max: max_raw
                    .and_then(|raw| Value::from_range_field(raw, type_code)),
            },
        ));
    }

    Ok(StructPage {
        first,
        declared,
        entries,
    })
}

fn take_cstr(buf: &[u8]) -> Option<(&[u8], usize)> {
    let nul = buf.iter().position(|&b| b == 0)?;
    Some((&buf[..nul], nul + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_book::AddrBook;
    use crate::arbiter::Arbiter;
    use crate::test_wire::FakeWire;
    use crate::transport::Transport;
    use drv_gm3_api::HealthMonitor;
    use drv_gm3_proto::Frame;
    use std::time::Duration;

    fn regulator_record(
        name: &str,
        unit: u8,
        type_byte: u8,
        min: u16,
        max: u16,
    ) -> Vec<u8> {
        let mut out = name.as_bytes().to_vec();
        out.push(0);
        out.push(unit);
        out.push(0);
        out.push(type_byte);
        out.push(0xAA); // extra byte, ignored
        out.extend_from_slice(&min.to_le_bytes());
        out.extend_from_slice(&max.to_le_bytes());
        out
    }

    fn panel_record(name: &str, exponent: u8, type_byte: u8) -> Vec<u8> {
        let mut out = name.as_bytes().to_vec();
        out.push(0);
        out.push(b'C');
        out.push(0);
        out.push(exponent);
        out.push(type_byte);
        out
    }

    fn page(first: u16, records: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![records.len() as u8];
        out.extend_from_slice(&first.to_le_bytes());
        for r in records {
            out.extend_from_slice(r);
        }
        out
    }

    #[test]
    fn regulator_page_parses_types_ranges_and_writability() {
        // 0x24 = UINT8 | writable; 0x07 = FLOAT, read-only.
        let payload = page(
            100,
            &[
                regulator_record("HDWTSetPoint", 1, 0x24, 35, 65),
                regulator_record("BoilerTemp", 1, 0x07, 0, 0),
            ],
        );
        let parsed =
            parse_struct_page(&payload, AddressSpace::Regulator).unwrap();
        assert_eq!(parsed.first, 100);
        assert_eq!(parsed.declared, 2);
        assert_eq!(parsed.entries.len(), 2);

        let (idx, e) = &parsed.entries[0];
        assert_eq!(*idx, 100);
        assert_eq!(e.name, "HDWTSetPoint");
        assert_eq!(e.unit_code, 1);
        assert_eq!(e.type_code, TypeCode::Uint8);
        assert!(e.writable);
        assert_eq!(e.min, Some(Value::U16(35)));
        assert_eq!(e.max, Some(Value::U16(65)));
        assert_eq!(e.exponent, None);

        let (idx, e) = &parsed.entries[1];
        assert_eq!(*idx, 101);
        assert_eq!(e.type_code, TypeCode::Float);
        assert!(!e.writable);
    }

    #[test]
    fn panel_page_carries_exponent_and_no_range() {
        let payload = page(0, &[panel_record("RoomTemp", 1, 0x02)]);
        let parsed =
            parse_struct_page(&payload, AddressSpace::Panel).unwrap();
        let (idx, e) = &parsed.entries[0];
        assert_eq!(*idx, 0);
        assert_eq!(e.type_code, TypeCode::Int16);
        assert_eq!(e.exponent, Some(1));
        assert_eq!(e.unit_code, b'C');
        assert_eq!(e.min, None);
        assert_eq!(e.max, None);
    }

    #[test]
    fn unknown_type_is_skipped_but_keeps_its_index() {
        let payload = page(
            10,
            &[
                regulator_record("Odd", 0, 0x0B, 0, 0), // 11: not a type
                regulator_record("Fine", 0, 0x04, 0, 9),
            ],
        );
        let parsed =
            parse_struct_page(&payload, AddressSpace::Regulator).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].0, 11);
        assert_eq!(parsed.entries[0].1.name, "Fine");
    }

    #[test]
    fn truncated_page_is_an_error() {
        let mut payload = page(0, &[regulator_record("X", 0, 0x04, 0, 1)]);
        payload.truncate(payload.len() - 1);
        assert_eq!(
            parse_struct_page(&payload, AddressSpace::Regulator),
            Err(ParseError::Truncated)
        );
        assert_eq!(
            parse_struct_page(&[], AddressSpace::Regulator),
            Err(ParseError::Truncated)
        );
    }

    // End-to-end paging against a scripted controller.
    #[test]
    fn discovery_pages_until_no_data() {
        let me = 131u16;
        let controller = 1u16;
        let grant =
            Frame::new(me, 100, 0x68, &[0x01, 0x08, 0x00, 0x00]).encode();

        let page1 = Frame::new(
            me,
            controller,
            0x82,
            &page(
                0,
                &[
                    regulator_record("HDWTSetPoint", 1, 0x24, 35, 65),
                    regulator_record("BoilerTemp", 1, 0x07, 0, 0),
                ],
            ),
        )
        .encode();
        let no_data = Frame::new(me, controller, 0x7F, &[]).encode();

        let wire = FakeWire::new();
        wire.push_rx(&grant);
        wire.reply_after_writes(1, &page1);
        wire.reply_after_writes(2, &no_data);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paired_address");
        std::fs::write(&path, "131\n").unwrap();
        let mut arb = Arbiter::new(
            Transport::new(wire.clone(), HealthMonitor::new()),
            AddrBook::load(path),
            true,
            Duration::from_millis(600),
        );

        let (catalog, reader) = drv_gm3_api::catalog();
        let added = arb
            .run_with_token(Duration::from_secs(1), |bus| {
                discover_space(
                    bus,
                    &catalog,
                    AddressSpace::Regulator,
                    controller,
                    100,
                )
            })
            .unwrap()
            .unwrap();

        assert_eq!(added, 2);
        assert_eq!(reader.len(), 2);
        let p = reader.get(0).unwrap();
        assert_eq!(p.name, "HDWTSetPoint");
        assert!(p.writable);
        assert_eq!(p.min, Some(Value::U16(35)));

        // Two struct requests went out: page 0, then page 2.
        let writes = wire.writes();
        let req1 = Frame::decode(&writes[0]).unwrap();
        assert_eq!(req1.cmd, 0x02);
        assert_eq!(req1.dest, controller);
        assert_eq!(req1.payload, [100, 0, 0]);
        let req2 = Frame::decode(&writes[1]).unwrap();
        assert_eq!(req2.payload, [100, 2, 0]);
    }
}
