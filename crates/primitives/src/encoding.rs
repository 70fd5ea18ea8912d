//! Deterministic binary encoding shared by every hashed or persisted
//! structure.
//!
//! The wire format is the protobuf wire format: a varint key of
//! `field_number << 3 | wire_type`, varint scalars, and length-delimited
//! byte fields, with default values omitted. Hashing always runs over this
//! encoding, never over the in-memory layout.

use crate::hash::{Hash256, ZERO_HASH};

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    Truncated,
    Overflow,
    WireType(u8),
    BadLength(&'static str),
    Misaligned(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "unexpected end of input"),
            DecodeError::Overflow => write!(f, "varint out of range"),
            DecodeError::WireType(wire) => write!(f, "unsupported wire type {wire}"),
            DecodeError::BadLength(message) => write!(f, "{message}"),
            DecodeError::Misaligned(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        self.varint(u64::from(field) << 3 | u64::from(wire_type));
    }

    /// Varint scalar field; omitted when zero.
    pub fn write_u32(&mut self, field: u32, value: u32) {
        if value == 0 {
            return;
        }
        self.key(field, WIRE_VARINT);
        self.varint(u64::from(value));
    }

    /// Singular bytes field; omitted when empty.
    pub fn write_bytes(&mut self, field: u32, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        self.key(field, WIRE_LEN);
        self.varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    /// Singular hash field; the zero hash is the default and is omitted.
    pub fn write_hash(&mut self, field: u32, value: &Hash256) {
        if *value != ZERO_HASH {
            self.write_bytes(field, value);
        }
    }

    /// Element of a repeated field (embedded message or repeated bytes).
    /// Always keyed, even when empty, so element counts survive decoding.
    pub fn write_element(&mut self, field: u32, value: &[u8]) {
        self.key(field, WIRE_LEN);
        self.varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    /// Packed repeated u32 field; omitted when the list is empty.
    pub fn write_packed_u32(&mut self, field: u32, values: &[u32]) {
        if values.is_empty() {
            return;
        }
        let mut body = Encoder::new();
        for value in values {
            body.varint(u64::from(*value));
        }
        self.write_element(field, &body.buf);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn as_u32(&self) -> Result<u32, DecodeError> {
        match self {
            FieldValue::Varint(value) => {
                u32::try_from(*value).map_err(|_| DecodeError::Overflow)
            }
            FieldValue::Bytes(_) => Err(DecodeError::WireType(WIRE_LEN)),
        }
    }

    pub fn as_bytes(&self) -> Result<&'a [u8], DecodeError> {
        match self {
            FieldValue::Bytes(bytes) => Ok(bytes),
            FieldValue::Varint(_) => Err(DecodeError::WireType(WIRE_VARINT)),
        }
    }

    pub fn as_hash(&self) -> Result<Hash256, DecodeError> {
        let bytes = self.as_bytes()?;
        if bytes.len() != 32 {
            return Err(DecodeError::BadLength("hash field is not 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn as_packed_u32(&self) -> Result<Vec<u32>, DecodeError> {
        let mut decoder = Decoder::new(self.as_bytes()?);
        let mut values = Vec::new();
        while !decoder.is_empty() {
            let value = decoder.read_varint()?;
            values.push(u32::try_from(value).map_err(|_| DecodeError::Overflow)?);
        }
        Ok(values)
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
            self.pos += 1;
            if shift >= 64 {
                return Err(DecodeError::Overflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Returns the next `(field_number, value)` pair, or `None` at the end
    /// of the message.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, DecodeError> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let field = u32::try_from(key >> 3).map_err(|_| DecodeError::Overflow)?;
        match (key & 0x7) as u8 {
            WIRE_VARINT => {
                let value = self.read_varint()?;
                Ok(Some((field, FieldValue::Varint(value))))
            }
            WIRE_LEN => {
                let len = self.read_varint()? as usize;
                let end = self.pos.checked_add(len).ok_or(DecodeError::Overflow)?;
                if end > self.bytes.len() {
                    return Err(DecodeError::Truncated);
                }
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(Some((field, FieldValue::Bytes(slice))))
            }
            other => Err(DecodeError::WireType(other)),
        }
    }
}
