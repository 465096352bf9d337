//! The 200-byte self-describing file header.
//!
//! Every file begins with a fixed-length header that records the integer
//! widths used for the rest of the format, the live key count, the current
//! bucket count, and where the bucket array and appendable data region
//! begin. Everything after the header is a bucket array followed by a
//! freely growing region of data blocks (see `block` and `index`).
//!
//! Layout (all integers little-endian):
//!
//! | offset | len | field |
//! |---|---|---|
//! | 0 | 4 | magic `b"FMAP"` |
//! | 4 | 2 | version |
//! | 6 | 1 | `n_file` — width in bytes of file-offset/pointer fields |
//! | 7 | 1 | `n_key` — width in bytes of key-length fields |
//! | 8 | 1 | `n_val` — width in bytes of value-length fields |
//! | 9 | 1 | flags (bit0 fixed value length, bit1 timestamps enabled) |
//! | 10 | 4 | fixed value length (0 when not fixed) |
//! | 14 | 2 | key serializer code |
//! | 16 | 2 | value serializer code |
//! | 18 | 8 | bucket count |
//! | 26 | 8 | live key count |
//! | 34 | 8 | bucket array offset |
//! | 42 | 8 | data end offset (next append position) |
//! | 50 | 7 | file creation timestamp, microseconds since epoch (7-byte
//! |    |   | little-endian, matching the per-entry timestamp width) |
//! | 57 | 143 | reserved, zero-filled |

use std::io::{Read, Seek, SeekFrom, Write};

use crate::codec::{decode_uint, encode_uint};
use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"FMAP";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 200;

const FLAG_FIXED_VALUE_LEN: u8 = 0b01;
const FLAG_TIMESTAMPS: u8 = 0b10;

/// Width, in bytes, of a timestamp field — both the per-entry timestamp
/// in a data block and the file-creation timestamp in the header. Spec's
/// 7-byte little-endian microsecond count, sufficient through roughly the
/// year 4000.
pub const TIMESTAMP_WIDTH: usize = 7;

/// Default width, in bytes, of file-offset and pointer fields. Six bytes
/// addresses up to 256 TiB, comfortably beyond anything this format is
/// meant to hold in memory-mapped form.
pub const DEFAULT_N_FILE: u8 = 6;
pub const DEFAULT_N_KEY: u8 = 2;
pub const DEFAULT_N_VAL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub n_file: u8,
    pub n_key: u8,
    pub n_val: u8,
    pub fixed_value_len: Option<u32>,
    pub timestamps: bool,
    pub key_serializer_code: u16,
    pub value_serializer_code: u16,
    pub n_buckets: u64,
    pub n_keys: u64,
    pub bucket_array_offset: u64,
    pub data_end_offset: u64,
    pub created_at_micros: u64,
}

impl Header {
    pub fn new(
        n_buckets: u64,
        fixed_value_len: Option<u32>,
        timestamps: bool,
        key_serializer_code: u16,
        value_serializer_code: u16,
        created_at_micros: u64,
    ) -> Self {
        let bucket_array_offset = HEADER_LEN;
        let bucket_bytes = n_buckets * DEFAULT_N_FILE as u64;
        Header {
            n_file: DEFAULT_N_FILE,
            n_key: DEFAULT_N_KEY,
            n_val: DEFAULT_N_VAL,
            fixed_value_len,
            timestamps,
            key_serializer_code,
            value_serializer_code,
            n_buckets,
            n_keys: 0,
            bucket_array_offset,
            data_end_offset: bucket_array_offset + bucket_bytes,
            created_at_micros,
        }
    }

    pub fn timestamp_width(&self) -> usize {
        if self.timestamps { TIMESTAMP_WIDTH } else { 0 }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6] = self.n_file;
        buf[7] = self.n_key;
        buf[8] = self.n_val;
        let mut flags = 0u8;
        if self.fixed_value_len.is_some() {
            flags |= FLAG_FIXED_VALUE_LEN;
        }
        if self.timestamps {
            flags |= FLAG_TIMESTAMPS;
        }
        buf[9] = flags;
        buf[10..14].copy_from_slice(&self.fixed_value_len.unwrap_or(0).to_le_bytes());
        buf[14..16].copy_from_slice(&self.key_serializer_code.to_le_bytes());
        buf[16..18].copy_from_slice(&self.value_serializer_code.to_le_bytes());
        buf[18..26].copy_from_slice(&self.n_buckets.to_le_bytes());
        buf[26..34].copy_from_slice(&self.n_keys.to_le_bytes());
        buf[34..42].copy_from_slice(&self.bucket_array_offset.to_le_bytes());
        buf[42..50].copy_from_slice(&self.data_end_offset.to_le_bytes());
        buf[50..57].copy_from_slice(&encode_uint(self.created_at_micros, TIMESTAMP_WIDTH));
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN as usize {
            return Err(Error::corrupt("header truncated"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::corrupt("bad magic"));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::corrupt(format!("unsupported version {version}")));
        }
        let flags = buf[9];
        let fixed_value_len = u32::from_le_bytes(buf[10..14].try_into().unwrap());
        Ok(Header {
            n_file: buf[6],
            n_key: buf[7],
            n_val: buf[8],
            fixed_value_len: (flags & FLAG_FIXED_VALUE_LEN != 0).then_some(fixed_value_len),
            timestamps: flags & FLAG_TIMESTAMPS != 0,
            key_serializer_code: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
            value_serializer_code: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            n_buckets: u64::from_le_bytes(buf[18..26].try_into().unwrap()),
            n_keys: u64::from_le_bytes(buf[26..34].try_into().unwrap()),
            bucket_array_offset: u64::from_le_bytes(buf[34..42].try_into().unwrap()),
            data_end_offset: u64::from_le_bytes(buf[42..50].try_into().unwrap()),
            created_at_micros: decode_uint(&buf[50..57])?,
        })
    }

    pub fn write_to(&self, file: &mut std::fs::File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.encode())?;
        Ok(())
    }

    pub fn read_from(file: &mut std::fs::File) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut buf)?;
        Header::decode(&buf)
    }

    /// Rewrite only the mutable counters (`n_keys`, `n_buckets`,
    /// `bucket_array_offset`, `data_end_offset`) without touching the
    /// static format fields. Called at the end of every `sync`.
    pub fn write_counters(&self, file: &mut std::fs::File) -> Result<()> {
        file.seek(SeekFrom::Start(18))?;
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.n_buckets.to_le_bytes());
        buf[8..16].copy_from_slice(&self.n_keys.to_le_bytes());
        buf[16..24].copy_from_slice(&self.bucket_array_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.data_end_offset.to_le_bytes());
        file.write_all(&buf)?;
        Ok(())
    }
}
