//! Conversion between register buffers and typed values.
//!
//! [`decode`] and [`encode`] translate raw big-endian bytes for a [`DataType`].
//! [`decode_capability`] and [`encode_capability`] add the per-capability
//! scale or transform on top.

use crate::{
    bits,
    register::{Conversion, DataType, ParseConfiguration, Register, Transform},
    Error, Result,
};
use std::fmt;

/// A decoded register or capability value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value; booleans count as `0`/`1`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

fn check_range(value: i64, data_type: DataType) -> Result<()> {
    match data_type.range() {
        Some((min, max)) if !(min..=max).contains(&value) => Err(Error::InvalidValue(format!(
            "{value} is outside the {data_type:?} range {min}..={max}"
        ))),
        _ => Ok(()),
    }
}

fn take<const N: usize>(buffer: &[u8]) -> Result<[u8; N]> {
    buffer
        .get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            Error::InvalidValue(format!(
                "buffer of {} byte(s) is too short, expected {N}",
                buffer.len()
            ))
        })
}

/// Decodes the leading bytes of `buffer` as `data_type`.
///
/// Numeric types consume exactly their width and ignore trailing bytes.
/// Strings consume the whole buffer and are trimmed of trailing NUL bytes.
pub fn decode(buffer: &[u8], data_type: DataType) -> Result<Value> {
    let value = match data_type {
        DataType::U16 => u16::from_be_bytes(take(buffer)?) as i64,
        DataType::I16 => i16::from_be_bytes(take(buffer)?) as i64,
        DataType::U32 => u32::from_be_bytes(take(buffer)?) as i64,
        DataType::I32 => i32::from_be_bytes(take(buffer)?) as i64,
        DataType::String => {
            let end = buffer
                .iter()
                .rposition(|b| *b != 0)
                .map_or(0, |pos| pos + 1);
            return Ok(Value::Text(
                String::from_utf8_lossy(&buffer[..end]).into_owned(),
            ));
        }
    };
    check_range(value, data_type)?;
    Ok(Value::Integer(value))
}

/// Encodes `value` as `data_type` into `words` 16-bit registers.
///
/// Floats are rounded to the nearest integer first. Fails with
/// [`Error::InvalidValue`] if the value does not fit.
pub fn encode(value: &Value, data_type: DataType, words: u16) -> Result<Vec<u8>> {
    let integer = match (value, data_type) {
        (Value::Text(text), DataType::String) => {
            let capacity = words as usize * 2;
            if text.len() > capacity {
                return Err(Error::InvalidValue(format!(
                    "'{text}' does not fit into {words} register(s)"
                )));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(capacity, 0);
            return Ok(bytes);
        }
        (_, DataType::String) | (Value::Text(_), _) => {
            return Err(Error::InvalidValue(format!(
                "cannot encode {value:?} as {data_type:?}"
            )))
        }
        (Value::Bool(b), _) => i64::from(*b),
        (Value::Integer(i), _) => *i,
        (Value::Float(f), _) => {
            if !f.is_finite() {
                return Err(Error::InvalidValue(format!("{f} is not a finite number")));
            }
            let rounded = f.round();
            if rounded < i64::MIN as f64 || rounded > i64::MAX as f64 {
                return Err(Error::InvalidValue(format!("{f} is out of range")));
            }
            rounded as i64
        }
    };
    check_range(integer, data_type)?;
    Ok(match data_type {
        DataType::U16 => (integer as u16).to_be_bytes().to_vec(),
        DataType::I16 => (integer as i16).to_be_bytes().to_vec(),
        DataType::U32 => (integer as u32).to_be_bytes().to_vec(),
        DataType::I32 => (integer as i32).to_be_bytes().to_vec(),
        DataType::String => unreachable!("strings are handled above"),
    })
}

/// The whole-number divisor equivalent to `scale`, if there is one.
fn divisor(scale: f64) -> Option<f64> {
    if !(scale > 0.0 && scale < 1.0) {
        return None;
    }
    let reciprocal = 1.0 / scale;
    let rounded = reciprocal.round();
    ((reciprocal - rounded).abs() <= 1e-9 * rounded).then_some(rounded)
}

/// Applies a scale to a raw integer.
///
/// Scales such as `0.1` or `0.01` act as divisors (divide by 10 or 100),
/// which keeps results such as `0.3` exact instead of `0.30000000000000004`.
/// Any other scale is a plain factor.
pub fn apply_scale(raw: i64, scale: f64) -> f64 {
    match divisor(scale) {
        Some(divisor) => raw as f64 / divisor,
        None => raw as f64 * scale,
    }
}

/// Inverse of [`apply_scale`].
pub fn remove_scale(value: f64, scale: f64) -> f64 {
    match divisor(scale) {
        Some(divisor) => value * divisor,
        None => value / scale,
    }
}

/// Decodes the part of `buffer` belonging to `register` as its raw value.
pub fn decode_register(register: &Register, buffer: &[u8]) -> Result<Value> {
    let len = buffer.len().min(register.byte_len());
    decode(&buffer[..len], register.data_type)
}

fn integer(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        other => Err(Error::InvalidValue(format!("{other:?} is not an integer"))),
    }
}

fn check_valid(config: &ParseConfiguration, value: &Value) -> Result<()> {
    if let (Some(valid), Some(number)) = (config.valid, value.as_f64()) {
        if number < valid.min || number > valid.max {
            return Err(Error::InvalidValue(format!(
                "{} = {number} is outside {}..={}",
                config.capability, valid.min, valid.max
            )));
        }
    }
    Ok(())
}

/// Runs the full decode pipeline for one capability: raw decode, then the
/// configured scale or transform, then the valid options check.
pub fn decode_capability(
    register: &Register,
    config: &ParseConfiguration,
    buffer: &[u8],
) -> Result<Value> {
    let raw = decode_register(register, buffer)?;
    let register_bytes = &buffer[..buffer.len().min(register.byte_len())];
    let value = match config.conversion {
        Conversion::Raw => raw,
        Conversion::Scale(scale) => Value::Float(apply_scale(integer(&raw)?, scale)),
        Conversion::Transform(Transform::Lookup(table)) => {
            let code = integer(&raw)?;
            let label = table
                .iter()
                .find(|(candidate, _)| *candidate == code)
                .map(|(_, label)| *label)
                .ok_or_else(|| {
                    Error::InvalidValue(format!("unknown code {code} for {}", config.capability))
                })?;
            Value::Text(label.to_string())
        }
        Conversion::Transform(Transform::Bit(bit)) => {
            Value::Bool(bits::get_bit(register_bytes, bit as usize)?)
        }
        Conversion::Transform(Transform::BitField { start, width }) => Value::Integer(
            bits::get_field(register_bytes, start as usize, width as usize)? as i64,
        ),
        Conversion::Transform(Transform::Offset { offset, scale }) => {
            Value::Float(apply_scale(integer(&raw)? - offset, scale))
        }
        Conversion::Transform(Transform::SwappedWords { scale }) => {
            let bytes: [u8; 4] = take(register_bytes)?;
            let swapped = [bytes[2], bytes[3], bytes[0], bytes[1]];
            let raw = integer(&decode(&swapped, register.data_type)?)?;
            Value::Float(apply_scale(raw, scale))
        }
    };
    check_valid(config, &value)?;
    Ok(value)
}

/// Inverse of [`decode_capability`] for writes. Validates before producing
/// any bytes, so nothing reaches the wire for an invalid value.
///
/// Bit transforms have no standalone encoding; use a read-modify-write action.
pub fn encode_capability(
    register: &Register,
    config: &ParseConfiguration,
    value: &Value,
) -> Result<Vec<u8>> {
    check_valid(config, value)?;
    let number = || {
        value
            .as_f64()
            .ok_or_else(|| Error::InvalidValue(format!("{value:?} is not a number")))
    };
    let (data_type, length) = (register.data_type, register.length);
    match config.conversion {
        Conversion::Raw => encode(value, data_type, length),
        Conversion::Scale(scale) => encode(
            &Value::Float(remove_scale(number()?, scale)),
            data_type,
            length,
        ),
        Conversion::Transform(Transform::Lookup(table)) => {
            let code = match value {
                Value::Text(label) => table
                    .iter()
                    .find(|(_, candidate)| candidate.eq_ignore_ascii_case(label))
                    .map(|(code, _)| *code)
                    .ok_or_else(|| Error::InvalidValue(format!("unknown label '{label}'")))?,
                other => integer(other)?,
            };
            if !table.iter().any(|(candidate, _)| *candidate == code) {
                return Err(Error::InvalidValue(format!("unknown code {code}")));
            }
            encode(&Value::Integer(code), data_type, length)
        }
        Conversion::Transform(Transform::Offset { offset, scale }) => {
            let raw = remove_scale(number()?, scale).round() as i64 + offset;
            encode(&Value::Integer(raw), data_type, length)
        }
        Conversion::Transform(Transform::SwappedWords { scale }) => {
            let bytes = encode(
                &Value::Float(remove_scale(number()?, scale)),
                data_type,
                length,
            )?;
            match bytes.as_slice() {
                [a, b, c, d] => Ok(vec![*c, *d, *a, *b]),
                _ => Err(Error::InvalidValue(format!(
                    "{data_type:?} cannot hold swapped words"
                ))),
            }
        }
        Conversion::Transform(Transform::Bit(_) | Transform::BitField { .. }) => {
            Err(Error::InvalidValue(format!(
                "{} is a bit field and cannot be written directly",
                config.capability
            )))
        }
    }
}
