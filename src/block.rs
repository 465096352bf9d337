//! Data block encoding — the unit of storage appended to the data region.
//!
//! A block holds one key/value version plus the bookkeeping needed to walk
//! and prune its hash chain:
//!
//! ```text
//! key_hash(13) | next(n_file) | flags(1) | key_len(n_key) | val_len(n_val)?
//!   | timestamp(7)? | key_bytes(key_len) | val_bytes(val_len or fixed)
//! ```
//!
//! `val_len` is omitted on disk when the store has a fixed value length
//! (`Header::fixed_value_len`); `timestamp` is omitted when the store was
//! opened without the timestamp flag. `next` is a bucket/chain pointer: `0`
//! means the chain ends in nothing (used only in the bucket array, to mark
//! an untouched bucket), `1` means this is the last block on its chain,
//! and any other value is the absolute file offset of the next block down
//! the chain. Both sentinels are safe because no real block can start
//! before [`crate::header::HEADER_LEN`].

use crate::codec::{decode_uint, encode_uint, hash_key, KEY_HASH_LEN};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::source::ByteSource;

pub const TOMBSTONE: u64 = 0;
pub const CHAIN_END: u64 = 1;

const FLAG_DELETED: u8 = 0b01;

/// One key/value version as read from, or about to be appended to, the
/// data region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub key_hash: [u8; KEY_HASH_LEN],
    pub next: u64,
    pub deleted: bool,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Option<u64>,
}

impl Block {
    pub fn new_value(key: Vec<u8>, value: Vec<u8>, next: u64, timestamp: Option<u64>) -> Self {
        Block {
            key_hash: hash_key(&key),
            next,
            deleted: false,
            key,
            value,
            timestamp,
        }
    }

    pub fn new_tombstone(key: Vec<u8>, next: u64, timestamp: Option<u64>) -> Self {
        Block {
            key_hash: hash_key(&key),
            next,
            deleted: true,
            key,
            value: Vec::new(),
            timestamp,
        }
    }

    /// Encode this block for the given header's layout widths.
    pub fn encode(&self, header: &Header) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            KEY_HASH_LEN
                + header.n_file as usize
                + 1
                + header.n_key as usize
                + header.n_val as usize
                + header.timestamp_width()
                + self.key.len()
                + self.value.len(),
        );
        out.extend_from_slice(&self.key_hash);
        out.extend(encode_uint(self.next, header.n_file as usize));
        out.push(if self.deleted { FLAG_DELETED } else { 0 });
        out.extend(encode_uint(self.key.len() as u64, header.n_key as usize));
        if header.fixed_value_len.is_none() {
            out.extend(encode_uint(self.value.len() as u64, header.n_val as usize));
        }
        if header.timestamps {
            out.extend(encode_uint(self.timestamp.unwrap_or(0), header.timestamp_width()));
        }
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }

    /// Length, in bytes, of this block's on-disk encoding under `header`.
    pub fn encoded_len(&self, header: &Header) -> usize {
        KEY_HASH_LEN
            + header.n_file as usize
            + 1
            + header.n_key as usize
            + if header.fixed_value_len.is_none() { header.n_val as usize } else { 0 }
            + header.timestamp_width()
            + self.key.len()
            + self.value.len()
    }

    /// Decode a block from `buf`, which must hold at least the fixed
    /// prefix plus `key.len() + value.len()` bytes. Returns the block and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8], header: &Header) -> Result<(Self, usize)> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
            let end = *pos + n;
            if end > buf.len() {
                return Err(Error::corrupt("data block truncated"));
            }
            let slice = &buf[*pos..end];
            *pos = end;
            Ok(slice)
        };

        let key_hash: [u8; KEY_HASH_LEN] = take(&mut pos, KEY_HASH_LEN)?.try_into().unwrap();
        let next = decode_uint(take(&mut pos, header.n_file as usize)?)?;
        let flags = take(&mut pos, 1)?[0];
        let key_len = decode_uint(take(&mut pos, header.n_key as usize)?)? as usize;
        let val_len = match header.fixed_value_len {
            Some(fixed) => fixed as usize,
            None => decode_uint(take(&mut pos, header.n_val as usize)?)? as usize,
        };
        let timestamp = if header.timestamps {
            Some(decode_uint(take(&mut pos, header.timestamp_width())?)?)
        } else {
            None
        };
        let key = take(&mut pos, key_len)?.to_vec();
        let value = if flags & FLAG_DELETED != 0 {
            Vec::new()
        } else {
            take(&mut pos, val_len)?.to_vec()
        };

        Ok((
            Block {
                key_hash,
                next,
                deleted: flags & FLAG_DELETED != 0,
                key,
                value,
                timestamp,
            },
            pos,
        ))
    }

    /// Size of the fixed-width prefix (everything before the key/value
    /// bytes) for a block under `header`. Callers read this many bytes
    /// first to learn `key_len`/`val_len` before reading the variable
    /// tail.
    pub fn prefix_len(header: &Header) -> usize {
        KEY_HASH_LEN
            + header.n_file as usize
            + 1
            + header.n_key as usize
            + if header.fixed_value_len.is_none() { header.n_val as usize } else { 0 }
            + header.timestamp_width()
    }
}

/// Read the block at `offset` from a byte source whose total length may
/// be larger than the block itself. Reads the fixed-width prefix first to
/// learn how many key/value bytes follow, then reads exactly that many
/// more, so callers never have to guess a block's length up front.
pub fn read_block(source: &dyn ByteSource, header: &Header, offset: u64) -> Result<Block> {
    let prefix_len = Block::prefix_len(header);
    let prefix = source.read_at(offset, prefix_len)?;
    let key_len_start = KEY_HASH_LEN + header.n_file as usize + 1;
    let key_len = decode_uint(&prefix[key_len_start..key_len_start + header.n_key as usize])? as usize;
    let val_len = match header.fixed_value_len {
        Some(fixed) => fixed as usize,
        None => {
            let val_len_start = key_len_start + header.n_key as usize;
            decode_uint(&prefix[val_len_start..val_len_start + header.n_val as usize])? as usize
        }
    };
    let flags = prefix[KEY_HASH_LEN + header.n_file as usize];
    let tail_len = key_len + if flags & FLAG_DELETED != 0 { 0 } else { val_len };
    let full = source.read_at(offset, prefix_len + tail_len)?;
    let (block, _) = Block::decode(&full, header)?;
    Ok(block)
}
