//! Serializer codes and the optional convenience layer built on top of
//! the core.
//!
//! The core only ever persists two 2-byte *codes* in the header — which
//! serializer the key and value were encoded with — so a later opener
//! knows whether it can decode entries without being told again. It never
//! runs serializer logic itself. Everything in this module sits outside
//! that boundary: a small trait plus a handful of built-in
//! implementations callers can use, or ignore in favor of their own.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Codes persisted in the header for the key/value serializer in use.
/// `User` means the opener supplied a serializer the header can't
/// describe; such a store can only be reopened by supplying the same
/// serializer again, since the core can't recover it from the code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SerializerCode {
    User = 0,
    RawBytes = 1,
    Utf8 = 2,
    Json = 3,
    IntegerLe1 = 4,
    IntegerLe2 = 5,
    IntegerLe4 = 6,
    IntegerLe5 = 7,
    IntegerLe6 = 8,
    IntegerLe7 = 9,
    IntegerLe8 = 10,
}

impl SerializerCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0 => SerializerCode::User,
            1 => SerializerCode::RawBytes,
            2 => SerializerCode::Utf8,
            3 => SerializerCode::Json,
            4 => SerializerCode::IntegerLe1,
            5 => SerializerCode::IntegerLe2,
            6 => SerializerCode::IntegerLe4,
            7 => SerializerCode::IntegerLe5,
            8 => SerializerCode::IntegerLe6,
            9 => SerializerCode::IntegerLe7,
            10 => SerializerCode::IntegerLe8,
            _ => return None,
        })
    }
}

/// Converts typed values to and from the raw bytes the core stores.
pub trait Serializer<T> {
    fn code(&self) -> SerializerCode;
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

pub struct RawBytesSerializer;

impl Serializer<Vec<u8>> for RawBytesSerializer {
    fn code(&self) -> SerializerCode {
        SerializerCode::RawBytes
    }
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

pub struct Utf8Serializer;

impl Serializer<String> for Utf8Serializer {
    fn code(&self) -> SerializerCode {
        SerializerCode::Utf8
    }
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }
    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::type_err(e.to_string()))
    }
}

pub struct JsonSerializer<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        JsonSerializer { _marker: std::marker::PhantomData }
    }
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer<T> {
    fn code(&self) -> SerializerCode {
        SerializerCode::Json
    }
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::type_err(e.to_string()))
    }
    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::type_err(e.to_string()))
    }
}

/// Fixed-width little-endian integer serializer, for `N` in
/// `{1, 2, 4, 5, 6, 7, 8}` matching the block widths the format supports.
pub struct IntegerLeSerializer<const N: usize>;

impl<const N: usize> Serializer<u64> for IntegerLeSerializer<N> {
    fn code(&self) -> SerializerCode {
        match N {
            1 => SerializerCode::IntegerLe1,
            2 => SerializerCode::IntegerLe2,
            4 => SerializerCode::IntegerLe4,
            5 => SerializerCode::IntegerLe5,
            6 => SerializerCode::IntegerLe6,
            7 => SerializerCode::IntegerLe7,
            8 => SerializerCode::IntegerLe8,
            _ => SerializerCode::User,
        }
    }
    fn encode(&self, value: &u64) -> Result<Vec<u8>> {
        Ok(crate::codec::encode_uint(*value, N))
    }
    fn decode(&self, bytes: &[u8]) -> Result<u64> {
        crate::codec::decode_uint(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_round_trips() {
        let ser = Utf8Serializer;
        let encoded = ser.encode(&"hello".to_string()).unwrap();
        assert_eq!(ser.decode(&encoded).unwrap(), "hello");
    }

    #[test]
    fn json_round_trips() {
        let ser: JsonSerializer<Vec<i32>> = JsonSerializer::default();
        let encoded = ser.encode(&vec![1, 2, 3]).unwrap();
        assert_eq!(ser.decode(&encoded).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn integer_le_round_trips() {
        let ser = IntegerLeSerializer::<4>;
        let encoded = ser.encode(&1234).unwrap();
        assert_eq!(encoded.len(), 4);
        assert_eq!(ser.decode(&encoded).unwrap(), 1234);
    }

    #[test]
    fn code_from_u16_rejects_unknown() {
        assert!(SerializerCode::from_u16(99).is_none());
    }
}
