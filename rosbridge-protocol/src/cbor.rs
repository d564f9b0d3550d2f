//! Self-contained CBOR encoder/decoder for the protocol subset.
//!
//! Values are bridged to and from [`serde_json::Value`], which is what the
//! rest of the stack speaks. The supported shapes are:
//!
//! - major 0/1: unsigned and negative integers
//! - major 2: byte strings (decoded as arrays of integers)
//! - major 3: UTF-8 text strings
//! - major 4: arrays
//! - major 5: maps with text keys (insertion order preserved)
//! - major 6: tagged values (the tag is skipped, the inner value returned)
//! - major 7: `false`/`true`/`null`, float16/32/64
//!
//! Indefinite lengths and simple values outside the set above are rejected.
//! Decoding checks that no bytes remain after the top-level item.

use crate::error::CborError;
use serde_json::{Map, Number, Value};

/// Maximum nesting depth accepted while decoding.
const MAX_DEPTH: usize = 128;

/// Encodes a JSON value into CBOR bytes.
pub fn to_vec(value: &Value) -> Result<Vec<u8>, CborError> {
    let mut out = Vec::with_capacity(64);
    encode_value(value, &mut out)?;
    Ok(out)
}

/// Decodes a single CBOR item, rejecting trailing bytes.
pub fn from_slice(data: &[u8]) -> Result<Value, CborError> {
    let mut decoder = Decoder { buf: data, pos: 0 };
    let value = decoder.decode_item(0)?;
    let remaining = data.len() - decoder.pos;
    if remaining != 0 {
        return Err(CborError::TrailingBytes(remaining));
    }
    Ok(value)
}

fn write_head(out: &mut Vec<u8>, major: u8, len: u64) {
    let mt = major << 5;
    if len < 24 {
        out.push(mt | len as u8);
    } else if len <= 0xff {
        out.push(mt | 24);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(mt | 25);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len <= 0xffff_ffff {
        out.push(mt | 26);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    } else {
        out.push(mt | 27);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CborError> {
    match value {
        Value::Null => out.push(0xf6),
        Value::Bool(false) => out.push(0xf4),
        Value::Bool(true) => out.push(0xf5),
        Value::Number(n) => encode_number(n, out)?,
        Value::String(s) => {
            write_head(out, 3, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_head(out, 4, items.len() as u64);
            for item in items {
                encode_value(item, out)?;
            }
        }
        Value::Object(map) => {
            write_head(out, 5, map.len() as u64);
            for (key, item) in map {
                write_head(out, 3, key.len() as u64);
                out.extend_from_slice(key.as_bytes());
                encode_value(item, out)?;
            }
        }
    }
    Ok(())
}

fn encode_number(n: &Number, out: &mut Vec<u8>) -> Result<(), CborError> {
    if let Some(u) = n.as_u64() {
        write_head(out, 0, u);
    } else if let Some(i) = n.as_i64() {
        write_head(out, 1, (-1 - i) as u64);
    } else if let Some(f) = n.as_f64() {
        if !f.is_finite() {
            return Err(CborError::NonFiniteFloat);
        }
        out.push(0xfb);
        out.extend_from_slice(&f.to_be_bytes());
    } else {
        return Err(CborError::NonFiniteFloat);
    }
    Ok(())
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CborError> {
        if self.buf.len() - self.pos < n {
            return Err(CborError::UnexpectedEnd);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, CborError> {
        Ok(self.take(1)?[0])
    }

    /// Reads the argument encoded by the additional-info bits.
    fn read_arg(&mut self, info: u8) -> Result<u64, CborError> {
        match info {
            0..=23 => Ok(info as u64),
            24 => Ok(self.byte()? as u64),
            25 => {
                let b = self.take(2)?;
                Ok(u16::from_be_bytes([b[0], b[1]]) as u64)
            }
            26 => {
                let b = self.take(4)?;
                Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64)
            }
            27 => {
                let b = self.take(8)?;
                Ok(u64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            other => Err(CborError::UnsupportedAdditionalInfo(other)),
        }
    }

    fn decode_item(&mut self, depth: usize) -> Result<Value, CborError> {
        if depth > MAX_DEPTH {
            return Err(CborError::DepthLimit);
        }

        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.read_arg(info)?;
                Ok(Value::Number(Number::from(n)))
            }
            1 => {
                let n = self.read_arg(info)?;
                if n > i64::MAX as u64 {
                    return Err(CborError::IntegerOutOfRange);
                }
                Ok(Value::Number(Number::from(-1 - n as i64)))
            }
            2 => {
                let len = self.read_arg(info)? as usize;
                let bytes = self.take(len)?;
                Ok(Value::Array(
                    bytes.iter().map(|b| Value::Number(Number::from(*b))).collect(),
                ))
            }
            3 => {
                let len = self.read_arg(info)? as usize;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| CborError::InvalidUtf8)?;
                Ok(Value::String(text.to_string()))
            }
            4 => {
                let len = self.read_arg(info)? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.decode_item(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            5 => {
                let len = self.read_arg(info)? as usize;
                let mut map = Map::new();
                for _ in 0..len {
                    let key = match self.decode_item(depth + 1)? {
                        Value::String(s) => s,
                        _ => return Err(CborError::NonStringKey),
                    };
                    let value = self.decode_item(depth + 1)?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            6 => {
                let _tag = self.read_arg(info)?;
                self.decode_item(depth + 1)
            }
            _ => self.decode_simple(info),
        }
    }

    fn decode_simple(&mut self, info: u8) -> Result<Value, CborError> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 | 23 => Ok(Value::Null),
            25 => {
                let b = self.take(2)?;
                float_value(decode_half(u16::from_be_bytes([b[0], b[1]])))
            }
            26 => {
                let b = self.take(4)?;
                float_value(f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64)
            }
            27 => {
                let b = self.take(8)?;
                float_value(f64::from_be_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            other => Err(CborError::UnsupportedAdditionalInfo(other)),
        }
    }
}

fn float_value(f: f64) -> Result<Value, CborError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or(CborError::NonFiniteFloat)
}

/// Expands an IEEE 754 half-precision float to f64.
fn decode_half(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = (bits >> 10) & 0x1f;
    let frac = (bits & 0x3ff) as f64;
    let magnitude = match exp {
        0 => frac * 2f64.powi(-24),
        31 => {
            if frac == 0.0 {
                f64::INFINITY
            } else {
                f64::NAN
            }
        }
        e => (1024.0 + frac) * 2f64.powi(e as i32 - 25),
    };
    sign * magnitude
}
