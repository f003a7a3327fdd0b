// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parameter catalog.
//!
//! A typed, indexed store of parameter metadata and latest observed
//! values across both address spaces. The bus task is the only writer;
//! HTTP read handlers and the gateway handle read through cloned
//! snapshots. Construction hands out exactly one [`CatalogWriter`]
//! (deliberately not `Clone`) plus a freely clonable [`CatalogReader`],
//! so the single-writer contract is enforced by the type system rather
//! than by convention.
//!
//! After the initial discovery the catalog is append-only: entries
//! never disappear, and only `current_value`/`last_update` mutate. A
//! reader always sees a value paired with the timestamp it arrived
//! with, never a mixed tuple.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use drv_gm3_proto::{AddressSpace, TypeCode, Value};
use serde::Serialize;

/// One catalog entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub catalog_index: u32,
    pub wire_index: u16,
    pub space: AddressSpace,
    pub name: String,
    pub unit_code: u8,
    pub type_code: TypeCode,
    pub writable: bool,
    /// Panel display exponent, passed through verbatim; the scaling
    /// semantic belongs to clients.
    pub exponent: Option<u8>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub current_value: Option<Value>,
    pub last_update: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    params: BTreeMap<u32, Parameter>,
    by_name: HashMap<String, Vec<u32>>,
}

/// Creates an empty catalog, returning its writer and reader halves.
pub fn catalog() -> (CatalogWriter, CatalogReader) {
    let shared = Arc::new(RwLock::new(Inner::default()));
    (
        CatalogWriter {
            shared: Arc::clone(&shared),
        },
        CatalogReader { shared },
    )
}

/// Mutating half, owned by the bus task.
pub struct CatalogWriter {
    shared: Arc<RwLock<Inner>>,
}

/// Read-only half; cheap to clone and share.
#[derive(Clone)]
pub struct CatalogReader {
    shared: Arc<RwLock<Inner>>,
}

impl CatalogWriter {
    /// Adds a newly discovered parameter. Returns false (and changes
    /// nothing) if the index is already present; discovery runs once
    /// and the catalog is append-only afterwards.
    pub fn insert(&self, param: Parameter) -> bool {
        let mut inner = self.shared.write().unwrap();
        if inner.params.contains_key(&param.catalog_index) {
            return false;
        }
        inner
            .by_name
            .entry(param.name.clone())
            .or_default()
            .push(param.catalog_index);
        inner.params.insert(param.catalog_index, param);
        true
    }

    /// Applies one poll batch of value updates under a single write
    /// lock, so a batch lands atomically with one timestamp. Unknown
    /// indices were filtered out by the batch parser; any that slip
    /// through are ignored here.
    pub fn apply_values(&self, updates: &[(u32, Value)], at: Instant) {
        let mut inner = self.shared.write().unwrap();
        for (index, value) in updates {
            if let Some(p) = inner.params.get_mut(index) {
                p.current_value = Some(value.clone());
                p.last_update = Some(at);
            }
        }
    }

    pub fn get(&self, index: u32) -> Option<Parameter> {
        self.shared.read().unwrap().params.get(&index).cloned()
    }

    pub fn lookup_name(&self, name: &str) -> Vec<u32> {
        self.shared
            .read()
            .unwrap()
            .by_name
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Wire type of an entry, for sizing poll-response fields.
    pub fn type_of(&self, space: AddressSpace, wire_index: u16) -> Option<TypeCode> {
        let index = space.catalog_index(wire_index);
        self.shared
            .read()
            .unwrap()
            .params
            .get(&index)
            .map(|p| p.type_code)
    }

    /// Contiguous wire-index bounds of a space, if it has any entries.
    pub fn wire_bounds(&self, space: AddressSpace) -> Option<(u16, u16)> {
        let inner = self.shared.read().unwrap();
        let mut bounds: Option<(u16, u16)> = None;
        for p in inner.params.values() {
            if p.space == space {
                bounds = Some(match bounds {
                    None => (p.wire_index, p.wire_index),
                    Some((lo, hi)) => {
                        (lo.min(p.wire_index), hi.max(p.wire_index))
                    }
                });
            }
        }
        bounds
    }

    pub fn len(&self) -> usize {
        self.shared.read().unwrap().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CatalogReader {
    pub fn get(&self, index: u32) -> Option<Parameter> {
        self.shared.read().unwrap().params.get(&index).cloned()
    }

    pub fn lookup_name(&self, name: &str) -> Vec<u32> {
        self.shared
            .read()
            .unwrap()
            .by_name
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shared.read().unwrap().params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clones the whole catalog under one short read lock and formats
    /// it in the shape the HTTP surface serves.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let params = self.shared.read().unwrap().params.clone();
        let mut out = BTreeMap::new();
        for (index, p) in params {
            out.insert(index.to_string(), ParameterRecord::from(p));
        }
        CatalogSnapshot {
            timestamp: epoch_secs(),
            parameters: out,
        }
    }
}

/// Seconds since the Unix epoch, for the timestamps the HTTP surface
/// serves.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// JSON view of the catalog: `{ timestamp, parameters: { "<index>":
/// {...} } }`.
#[derive(Clone, Debug, Serialize)]
pub struct CatalogSnapshot {
    pub timestamp: u64,
    pub parameters: BTreeMap<String, ParameterRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ParameterRecord {
    pub index: u32,
    pub name: String,
    pub value: Option<Value>,
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub unit: u8,
    pub writable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponent: Option<u8>,
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl From<Parameter> for ParameterRecord {
    fn from(p: Parameter) -> Self {
        Self {
            index: p.catalog_index,
            name: p.name,
            value: p.current_value,
            type_name: p.type_code.name(),
            unit: p.unit_code,
            writable: p.writable,
            exponent: p.exponent,
            min: p.min,
            max: p.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(index: u32, name: &str) -> Parameter {
        let (space, wire) = AddressSpace::from_catalog_index(index).unwrap();
        Parameter {
            catalog_index: index,
            wire_index: wire,
            space,
            name: name.to_owned(),
            unit_code: 1,
            type_code: TypeCode::Uint8,
            writable: true,
            exponent: None,
            min: None,
            max: None,
            current_value: None,
            last_update: None,
        }
    }

    #[test]
    fn insert_is_append_only() {
        let (w, r) = catalog();
        assert!(w.insert(param(7, "HDWTSetPoint")));
        assert!(!w.insert(param(7, "Imposter")));
        assert_eq!(r.get(7).unwrap().name, "HDWTSetPoint");
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn names_collide_across_spaces() {
        let (w, r) = catalog();
        w.insert(param(42, "BoilerTemp"));
        w.insert(param(10_042, "BoilerTemp"));
        let mut hits = r.lookup_name("BoilerTemp");
        hits.sort_unstable();
        assert_eq!(hits, [42, 10_042]);
        assert_eq!(r.get(42).unwrap().space, AddressSpace::Regulator);
        assert_eq!(r.get(10_042).unwrap().space, AddressSpace::Panel);
    }

    #[test]
    fn batch_updates_are_atomic_tuples() {
        let (w, r) = catalog();
        w.insert(param(1, "A"));
        w.insert(param(2, "B"));

        let at = Instant::now();
        w.apply_values(&[(1, Value::U8(10)), (2, Value::U8(20))], at);

        let a = r.get(1).unwrap();
        assert_eq!(a.current_value, Some(Value::U8(10)));
        assert_eq!(a.last_update, Some(at));

        // An update to an index we never discovered is dropped.
        w.apply_values(&[(999, Value::U8(1))], Instant::now());
        assert_eq!(r.get(999), None);
    }

    #[test]
    fn wire_bounds_per_space() {
        let (w, _r) = catalog();
        assert_eq!(w.wire_bounds(AddressSpace::Regulator), None);
        w.insert(param(5, "A"));
        w.insert(param(120, "B"));
        w.insert(param(10_003, "C"));
        assert_eq!(w.wire_bounds(AddressSpace::Regulator), Some((5, 120)));
        assert_eq!(w.wire_bounds(AddressSpace::Panel), Some((3, 3)));
    }

    #[test]
    fn snapshot_shape() {
        let (w, r) = catalog();
        let mut p = param(7, "HDWTSetPoint");
        p.current_value = Some(Value::U8(45));
        p.min = Some(Value::U16(35));
        p.max = Some(Value::U16(65));
        w.insert(p);

        let snap = r.snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        let rec = &json["parameters"]["7"];
        assert_eq!(rec["index"], 7);
        assert_eq!(rec["name"], "HDWTSetPoint");
        assert_eq!(rec["value"], 45);
        assert_eq!(rec["type"], "uint8");
        assert_eq!(rec["writable"], true);
        assert_eq!(rec["min"], 35);
        assert_eq!(rec["max"], 65);
        // No exponent key for regulator entries.
        assert!(rec.get("exponent").is_none());
    }
}
