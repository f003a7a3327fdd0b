// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed parameter values.
//!
//! Every catalog parameter carries one of twelve wire types. Integers
//! and floats are little-endian with a fixed width; BOOL is a single
//! 0/1 byte; STRING is UTF-8 with a terminating NUL. DOUBLE and the
//! 64-bit integers are rare on observed hardware but part of the wire
//! contract and fully supported.
//!
//! At the HTTP boundary values serialize as native JSON scalars, and
//! incoming writes are coerced back with lossless conversions only.

use num_derive::FromPrimitive;
use serde::{Serialize, Serializer};

/// Wire type codes, as they appear in struct-response `type_byte`
/// fields (low nibble).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum TypeCode {
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Uint8 = 4,
    Uint16 = 5,
    Uint32 = 6,
    Float = 7,
    Double = 9,
    Bool = 10,
    String = 12,
    Int64 = 13,
    Uint64 = 14,
}

impl TypeCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_u8(raw)
    }

    /// Encoded width in bytes; `None` for the variable-length STRING.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::Uint8 | Self::Bool => Some(1),
            Self::Int16 | Self::Uint16 => Some(2),
            Self::Int32 | Self::Uint32 | Self::Float => Some(4),
            Self::Int64 | Self::Uint64 | Self::Double => Some(8),
            Self::String => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool | Self::String)
    }

    /// Name used in snapshot JSON, matching the wire nomenclature.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Float => "float",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
        }
    }
}

/// A decoded parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    U8(u8),
    U16(u16),
    U32(u32),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    I64(i64),
    U64(u64),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueError {
    /// Fewer bytes than the type's width.
    Truncated,
    /// BOOL byte other than 0 or 1.
    BadBool,
    /// STRING without a terminating NUL.
    MissingNul,
    /// STRING bytes are not UTF-8.
    BadUtf8,
    /// A write's JSON value cannot be losslessly coerced to the target
    /// type.
    BadCoercion,
}

impl core::fmt::Display for ValueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Self::Truncated => "value bytes truncated",
            Self::BadBool => "boolean byte is neither 0 nor 1",
            Self::MissingNul => "string missing NUL terminator",
            Self::BadUtf8 => "string is not valid UTF-8",
            Self::BadCoercion => "value does not fit the parameter type",
        };
        f.write_str(msg)
    }
}

impl Value {
    pub fn type_code(&self) -> TypeCode {
        match self {
            Self::I8(_) => TypeCode::Int8,
            Self::I16(_) => TypeCode::Int16,
            Self::I32(_) => TypeCode::Int32,
            Self::U8(_) => TypeCode::Uint8,
            Self::U16(_) => TypeCode::Uint16,
            Self::U32(_) => TypeCode::Uint32,
            Self::F32(_) => TypeCode::Float,
            Self::F64(_) => TypeCode::Double,
            Self::Bool(_) => TypeCode::Bool,
            Self::Str(_) => TypeCode::String,
            Self::I64(_) => TypeCode::Int64,
            Self::U64(_) => TypeCode::Uint64,
        }
    }

    /// Decodes one value of type `tc` from the head of `buf`, returning
    /// it with the number of bytes consumed.
    pub fn decode(buf: &[u8], tc: TypeCode) -> Result<(Self, usize), ValueError> {
        fn take<const N: usize>(buf: &[u8]) -> Result<[u8; N], ValueError> {
            buf.get(..N)
                .and_then(|b| b.try_into().ok())
                .ok_or(ValueError::Truncated)
        }

        let v = match tc {
            TypeCode::Int8 => {
                (Self::I8(take::<1>(buf)?[0] as i8), 1)
            }
            TypeCode::Uint8 => (Self::U8(take::<1>(buf)?[0]), 1),
            TypeCode::Int16 => {
                (Self::I16(i16::from_le_bytes(take(buf)?)), 2)
            }
            TypeCode::Uint16 => {
                (Self::U16(u16::from_le_bytes(take(buf)?)), 2)
            }
            TypeCode::Int32 => {
                (Self::I32(i32::from_le_bytes(take(buf)?)), 4)
            }
            TypeCode::Uint32 => {
                (Self::U32(u32::from_le_bytes(take(buf)?)), 4)
            }
            TypeCode::Int64 => {
                (Self::I64(i64::from_le_bytes(take(buf)?)), 8)
            }
            TypeCode::Uint64 => {
                (Self::U64(u64::from_le_bytes(take(buf)?)), 8)
            }
            TypeCode::Float => {
                (Self::F32(f32::from_le_bytes(take(buf)?)), 4)
            }
            TypeCode::Double => {
                (Self::F64(f64::from_le_bytes(take(buf)?)), 8)
            }
            TypeCode::Bool => match take::<1>(buf)?[0] {
                0 => (Self::Bool(false), 1),
                1 => (Self::Bool(true), 1),
                _ => return Err(ValueError::BadBool),
            },
            TypeCode::String => {
                let nul = buf
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(ValueError::MissingNul)?;
                let s = core::str::from_utf8(&buf[..nul])
                    .map_err(|_| ValueError::BadUtf8)?;
                (Self::Str(s.to_owned()), nul + 1)
            }
        };
        Ok(v)
    }

    /// Appends the wire encoding of this value to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::I8(v) => out.push(*v as u8),
            Self::U8(v) => out.push(*v),
            Self::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Bool(v) => out.push(*v as u8),
            Self::Str(v) => {
                out.extend_from_slice(v.as_bytes());
                out.push(0);
            }
        }
    }

    /// Numeric view for range checks; `None` for BOOL and STRING.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::I8(v) => Some(f64::from(*v)),
            Self::I16(v) => Some(f64::from(*v)),
            Self::I32(v) => Some(f64::from(*v)),
            Self::U8(v) => Some(f64::from(*v)),
            Self::U16(v) => Some(f64::from(*v)),
            Self::U32(v) => Some(f64::from(*v)),
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            Self::I64(v) => Some(*v as f64),
            Self::U64(v) => Some(*v as f64),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// Interprets a struct-response 16-bit range field in the domain of
    /// the parameter's type: sign-extended for signed types,
    /// zero-extended for unsigned, numeric for floats. Non-numeric
    /// types have no range.
    pub fn from_range_field(raw: u16, tc: TypeCode) -> Option<Self> {
        match tc {
            TypeCode::Int8 | TypeCode::Int16 | TypeCode::Int32
            | TypeCode::Int64 => Some(Self::I16(raw as i16)),
            TypeCode::Uint8 | TypeCode::Uint16 | TypeCode::Uint32
            | TypeCode::Uint64 => Some(Self::U16(raw)),
            TypeCode::Float | TypeCode::Double => {
                Some(Self::F32(f32::from(raw as i16)))
            }
            TypeCode::Bool | TypeCode::String => None,
        }
    }

    /// Coerces a JSON scalar to type `tc`. Only lossless conversions
    /// are accepted: integral JSON numbers into integer types when in
    /// range, any JSON number into floats, booleans into BOOL, strings
    /// into STRING. A fractional number aimed at an integer type is
    /// rejected rather than rounded.
    pub fn from_json(
        json: &serde_json::Value,
        tc: TypeCode,
    ) -> Result<Self, ValueError> {
        use serde_json::Value as J;

        fn int_of(json: &serde_json::Value) -> Option<i128> {
            if !json.is_number() {
                return None;
            }
            if let Some(v) = json.as_i64() {
                Some(i128::from(v))
            } else if let Some(v) = json.as_u64() {
                Some(i128::from(v))
            } else {
                let f = json.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 2f64.powi(53)
                {
                    Some(f as i128)
                } else {
                    None
                }
            }
        }

        fn int_to<T: TryFrom<i128>>(
            json: &serde_json::Value,
        ) -> Result<T, ValueError> {
            int_of(json)
                .and_then(|v| T::try_from(v).ok())
                .ok_or(ValueError::BadCoercion)
        }

        let v = match tc {
            TypeCode::Int8 => Self::I8(int_to(json)?),
            TypeCode::Int16 => Self::I16(int_to(json)?),
            TypeCode::Int32 => Self::I32(int_to(json)?),
            TypeCode::Int64 => Self::I64(int_to(json)?),
            TypeCode::Uint8 => Self::U8(int_to(json)?),
            TypeCode::Uint16 => Self::U16(int_to(json)?),
            TypeCode::Uint32 => Self::U32(int_to(json)?),
            TypeCode::Uint64 => Self::U64(int_to(json)?),
            TypeCode::Float => match json {
                J::Number(n) => {
                    let f = n.as_f64().ok_or(ValueError::BadCoercion)?;
                    Self::F32(f as f32)
                }
                _ => return Err(ValueError::BadCoercion),
            },
            TypeCode::Double => match json {
                J::Number(n) => {
                    Self::F64(n.as_f64().ok_or(ValueError::BadCoercion)?)
                }
                _ => return Err(ValueError::BadCoercion),
            },
            TypeCode::Bool => match json {
                J::Bool(b) => Self::Bool(*b),
                _ => return Err(ValueError::BadCoercion),
            },
            TypeCode::String => match json {
                J::String(s) => Self::Str(s.clone()),
                _ => return Err(ValueError::BadCoercion),
            },
        };
        Ok(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::I8(v) => s.serialize_i8(*v),
            Self::I16(v) => s.serialize_i16(*v),
            Self::I32(v) => s.serialize_i32(*v),
            Self::U8(v) => s.serialize_u8(*v),
            Self::U16(v) => s.serialize_u16(*v),
            Self::U32(v) => s.serialize_u32(*v),
            Self::F32(v) => s.serialize_f32(*v),
            Self::F64(v) => s.serialize_f64(*v),
            Self::Bool(v) => s.serialize_bool(*v),
            Self::Str(v) => s.serialize_str(v),
            Self::I64(v) => s.serialize_i64(*v),
            Self::U64(v) => s.serialize_u64(*v),
        }
    }
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::I8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
        }
    }
}
