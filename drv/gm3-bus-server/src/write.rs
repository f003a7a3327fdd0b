// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parameter writes.
//!
//! Validation happens entirely against the catalog before anything is
//! transmitted: a non-writable target, a type mismatch, or an
//! out-of-range value never reaches the bus. Only then is MODIFY_PARAM
//! issued under the token, the 0xA9 result code checked, and the
//! catalog optimistically updated with the accepted value (the next
//! poll corrects it if the controller stored something else).

use std::time::Instant;

use drv_gm3_api::{
    catalog::epoch_secs, CatalogWriter, GatewayError, ParamSelector,
    Parameter, WriteOutcome,
};
use drv_gm3_proto::{AddressSpace, Command, Value};

use crate::arbiter::BusHandle;
use crate::transport::Reply;
use crate::wire::Wire;

/// Resolves a selector to its catalog entry. An unqualified name that
/// collides across spaces resolves to the regulator entry (the lower
/// catalog index); qualify by space to reach the panel's.
pub fn resolve(
    catalog: &CatalogWriter,
    selector: &ParamSelector,
) -> Result<Parameter, GatewayError> {
    let index = match selector {
        ParamSelector::Index(index) => *index,
        ParamSelector::Name { name, space } => {
            let mut hits = catalog.lookup_name(name);
            hits.sort_unstable();
            match space {
                None => {
                    *hits.first().ok_or(GatewayError::ParameterNotFound)?
                }
                Some(wanted) => hits
                    .into_iter()
                    .find(|i| {
                        AddressSpace::from_catalog_index(*i)
                            .map(|(s, _)| s == *wanted)
                            .unwrap_or(false)
                    })
                    .ok_or(GatewayError::ParameterNotFound)?,
            }
        }
    };
    catalog.get(index).ok_or(GatewayError::ParameterNotFound)
}

/// Checks a proposed JSON value against the parameter's metadata and
/// coerces it to the wire type. No bus traffic.
pub fn validate(
    param: &Parameter,
    proposed: &serde_json::Value,
) -> Result<Value, GatewayError> {
    if !param.writable {
        return Err(GatewayError::NotWritable);
    }
    let value = Value::from_json(proposed, param.type_code)
        .map_err(|_| GatewayError::BadValueType)?;

    if let Some(v) = value.as_f64() {
        if let Some(min) = param.min.as_ref().and_then(Value::as_f64) {
            if v < min {
                return Err(GatewayError::OutOfRange);
            }
        }
        if let Some(max) = param.max.as_ref().and_then(Value::as_f64) {
            if v > max {
                return Err(GatewayError::OutOfRange);
            }
        }
    }
    Ok(value)
}

/// Transmits MODIFY_PARAM for an already validated value and
/// correlates the acknowledgment. Issued exactly once; a lost reply is
/// reported as a timeout rather than retried, since the controller may
/// have applied the write.
pub fn perform<W: Wire>(
    bus: &mut BusHandle<'_, W>,
    catalog: &CatalogWriter,
    param: &Parameter,
    value: Value,
    controller_addr: u16,
) -> Result<WriteOutcome, GatewayError> {
    let mut payload = param.wire_index.to_le_bytes().to_vec();
    value.encode(&mut payload);
    let dest = param.space.destination(controller_addr);

    match bus.request(dest, Command::ModifyParam, &payload) {
        Ok(Reply::Answer(frame)) => {
            let code = frame.payload.first().copied().unwrap_or(0xFF);
            if code != 0 {
                return Err(GatewayError::WriteRejected(code));
            }
            catalog.apply_values(
                &[(param.catalog_index, value.clone())],
                Instant::now(),
            );
            log::info!(
                "wrote {} = {value} (index {})",
                param.name,
                param.catalog_index
            );
            Ok(WriteOutcome {
                success: true,
                parameter: param.name.clone(),
                index: param.catalog_index,
                old_value: param.current_value.clone(),
                new_value: value,
                timestamp: epoch_secs(),
            })
        }
        Ok(Reply::NoData) => {
            Err(GatewayError::WriteRejected(Command::NoData as u8))
        }
        Ok(Reply::DataSizeError) => {
            Err(GatewayError::WriteRejected(Command::DataSizeError as u8))
        }
        Ok(Reply::Timeout) => Err(GatewayError::WriteTimeout),
        Err(e) => {
            log::warn!("write transport failure: {e}");
            Err(GatewayError::BusUnavailable)
        }
    }
}
