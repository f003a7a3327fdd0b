// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic value refresh.
//!
//! Values are fetched with paged GET_PARAMS requests and applied to
//! the catalog one batch at a time, so readers see each page land
//! atomically. A response is a concatenation of
//! `[index_lo][index_hi][value_bytes…]` tuples whose value width comes
//! from the catalog's type for that index, which means an index we
//! never discovered makes the rest of the batch unparseable. That is
//! catalog drift; the batch is dropped and polling moves on.

use std::time::Instant;

use drv_gm3_api::CatalogWriter;
use drv_gm3_proto::{AddressSpace, Command, Value};

use crate::arbiter::BusHandle;
use crate::transport::{Reply, TransportError};
use crate::wire::Wire;

#[derive(Debug, PartialEq, Eq)]
pub enum BatchError {
    /// The peer reported an index the catalog does not know.
    CatalogDrift { wire_index: u16 },
    /// A tuple was cut short or carried an undecodable value.
    Malformed,
}

impl core::fmt::Display for BatchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CatalogDrift { wire_index } => {
                write!(f, "unknown index {wire_index} in poll batch")
            }
            Self::Malformed => f.write_str("malformed poll batch"),
        }
    }
}

/// Result of one space's poll round.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub updated: usize,
    pub batches: u32,
    pub failed_batches: u32,
}

/// Refreshes every known value in `space`, one page at a time.
pub fn poll_space<W: Wire>(
    bus: &mut BusHandle<'_, W>,
    catalog: &CatalogWriter,
    space: AddressSpace,
    controller_addr: u16,
    page_size: u16,
) -> Result<PollOutcome, TransportError> {
    let mut outcome = PollOutcome::default();
    let Some((lo, hi)) = catalog.wire_bounds(space) else {
        return Ok(outcome);
    };
    let dest = space.destination(controller_addr);
    let page_size = page_size.max(1);

    let mut first = lo;
    loop {
        let count = page_size.min(hi - first + 1);
        let mut payload = first.to_le_bytes().to_vec();
        payload.extend_from_slice(&count.to_le_bytes());
        outcome.batches += 1;

        match bus.request(dest, Command::GetParams, &payload)? {
            Reply::Answer(frame) => {
                match parse_value_batch(&frame.payload, catalog, space) {
                    Ok(updates) => {
                        catalog.apply_values(&updates, Instant::now());
                        outcome.updated += updates.len();
                    }
                    Err(e) => {
                        log::warn!(
                            "{space:?} batch at {first}+{count} dropped: {e}"
                        );
                        outcome.failed_batches += 1;
                    }
                }
            }
            Reply::NoData => {
                log::debug!("{space:?} batch at {first}: NO_DATA, skipped");
            }
            Reply::DataSizeError => {
                log::warn!(
                    "{space:?} batch at {first}+{count}: size error; \
                     consider lowering PARAMS_PER_REQUEST"
                );
                outcome.failed_batches += 1;
            }
            Reply::Timeout => {
                outcome.failed_batches += 1;
            }
        }

        match first.checked_add(count) {
            Some(next) if next <= hi => first = next,
            _ => break,
        }
    }
    Ok(outcome)
}

/// Parses a GET_PARAMS answer into catalog updates. The whole batch is
/// rejected on the first defect: value widths are positional, so
/// nothing after a bad tuple can be trusted.
pub fn parse_value_batch(
    payload: &[u8],
    catalog: &CatalogWriter,
    space: AddressSpace,
) -> Result<Vec<(u32, Value)>, BatchError> {
    let mut off = 0;
    let mut out = Vec::new();
    while off < payload.len() {
        let index_bytes =
            payload.get(off..off + 2).ok_or(BatchError::Malformed)?;
        let wire_index = u16::from_le_bytes([index_bytes[0], index_bytes[1]]);
        off += 2;

        let type_code = catalog
            .type_of(space, wire_index)
            .ok_or(BatchError::CatalogDrift { wire_index })?;
        let (value, used) = Value::decode(&payload[off..], type_code)
            .map_err(|_| BatchError::Malformed)?;
        off += used;

        out.push((space.catalog_index(wire_index), value));
    }
    Ok(out)
}
