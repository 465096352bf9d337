//! The external-chaining hash index: bucket array layout, bucket
//! selection, and the auto-reindex bucket-growth policy.
//!
//! The bucket array is a flat sequence of `n_buckets` pointer fields, each
//! `header.n_file` bytes wide, living right after the header. Bucket `i`'s
//! pointer is either [`crate::block::TOMBSTONE`] (bucket never written) or
//! the absolute file offset of the first block on that bucket's chain.
//! Growing the bucket array never moves existing data blocks: a bigger
//! array is appended after the old one and every live chain is re-threaded
//! through it, which is what makes auto-reindex safe to run with the data
//! region already full of committed blocks.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use crate::block::{read_block, Block, CHAIN_END, TOMBSTONE};
use crate::codec::{decode_uint, encode_uint, hash_key, KEY_HASH_LEN};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::source::{ByteSource, FileSource};

/// Starting bucket count used by `open(..., flag='n')` when the caller
/// doesn't override it — the first value of the growth sequence.
pub const INITIAL_BUCKET_COUNT: u64 = 12_007;

pub fn bucket_offset(header: &Header, bucket: u64) -> u64 {
    header.bucket_array_offset + bucket * header.n_file as u64
}

/// Map a key's hash digest to a bucket index.
pub fn get_bucket(key_hash: &[u8], n_buckets: u64) -> u64 {
    // A 13-byte digest is wider than a u64; folding it down with a
    // wrapping sum keeps every input byte significant to the bucket
    // choice instead of only the low 8 bytes.
    let mut acc: u64 = 0;
    for chunk in key_hash.chunks(8) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        acc = acc.wrapping_add(u64::from_le_bytes(buf));
    }
    acc % n_buckets
}

pub fn read_bucket(source: &dyn ByteSource, header: &Header, bucket: u64) -> Result<u64> {
    let bytes = source.read_at(bucket_offset(header, bucket), header.n_file as usize)?;
    decode_uint(&bytes)
}

pub fn write_bucket(file: &mut File, header: &Header, bucket: u64, value: u64) -> Result<()> {
    file.seek(SeekFrom::Start(bucket_offset(header, bucket)))?;
    file.write_all(&encode_uint(value, header.n_file as usize))?;
    Ok(())
}

/// Write a freshly zero-filled bucket array of `n_buckets` entries,
/// starting at `offset`. Used both at file creation and to lay down the
/// larger array an auto-reindex appends.
pub fn write_empty_bucket_array(file: &mut File, header: &Header, offset: u64, n_buckets: u64) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let zero = vec![0u8; header.n_file as usize];
    for _ in 0..n_buckets {
        file.write_all(&zero)?;
    }
    let _ = TOMBSTONE; // zero-filled buckets decode to TOMBSTONE by construction
    Ok(())
}

/// Smallest prime strictly greater than `n`, found by trial division.
/// Bucket counts never grow large enough (low millions at most, given
/// doubling) for this to be a meaningful bottleneck compared to the I/O
/// a reindex already does.
fn next_prime_after(n: u64) -> u64 {
    let mut candidate = if n % 2 == 0 { n + 1 } else { n + 2 };
    loop {
        if is_prime(candidate) {
            return candidate;
        }
        candidate += 2;
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut i = 3u64;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// Next bucket count to grow to, given the current one. Roughly doubles,
/// landing on the next prime at or above `max(current * 2, INITIAL_BUCKET_COUNT)`
/// so auto-reindex always lands on a prime bucket count regardless of the
/// one it started from (including a caller-chosen starting count that
/// isn't itself prime).
pub fn next_bucket_count(current: u64) -> u64 {
    let target = current.saturating_mul(2).max(INITIAL_BUCKET_COUNT);
    if is_prime(target) {
        target
    } else {
        next_prime_after(target - 1)
    }
}

/// Upper bound on how many blocks a single chain can legitimately hold:
/// no more than the data region could physically contain, given a block's
/// smallest possible encoding. A chain walk that exceeds this has looped
/// back on itself — the file is corrupt, not just unlucky.
pub fn max_chain_steps(header: &Header) -> u64 {
    let data_len = header.data_end_offset.saturating_sub(header.bucket_array_offset);
    let min_block_len = Block::prefix_len(header) as u64;
    data_len / min_block_len.max(1) + 1
}

/// Walk the chain starting at `head`, looking for `key`. The key-hash
/// prefix narrows candidates cheaply but the full key is always compared
/// since distinct keys can share a hash bucket, or even (astronomically
/// unlikely, but not structurally impossible) a truncated hash.
pub fn find_in_chain(source: &dyn ByteSource, header: &Header, head: u64, key: &[u8]) -> Result<Option<Block>> {
    let target_hash = hash_key(key);
    let max_steps = max_chain_steps(header);
    let mut offset = head;
    let mut steps = 0u64;
    while offset != TOMBSTONE && offset != CHAIN_END {
        if steps > max_steps {
            return Err(Error::corrupt("bucket chain exceeds the file's block capacity (cycle?)"));
        }
        steps += 1;
        let block = read_block(source, header, offset)?;
        if block.key_hash == target_hash && block.key == key {
            return Ok(Some(block));
        }
        offset = block.next;
    }
    Ok(None)
}

/// Patch a block's `next` pointer in place, at its fixed offset right
/// after the key-hash field. Used by auto-reindex, which re-threads
/// existing blocks into a new bucket array without moving their data.
pub fn patch_next(file: &mut File, header: &Header, block_offset: u64, new_next: u64) -> Result<()> {
    file.seek(SeekFrom::Start(block_offset + KEY_HASH_LEN as u64))?;
    file.write_all(&encode_uint(new_next, header.n_file as usize))?;
    Ok(())
}

/// Grow the bucket array and re-thread every existing block into it.
///
/// The old bucket array and every data block stay exactly where they are;
/// only each block's `next` pointer is patched in place and a new, larger
/// bucket array is appended after the current data end. The old bucket
/// array becomes dead space, reclaimed on the next prune.
pub fn auto_reindex(file: &mut File, header: &mut Header) -> Result<()> {
    let new_n_buckets = next_bucket_count(header.n_buckets);
    let new_array_offset = header.data_end_offset;
    write_empty_bucket_array(file, header, new_array_offset, new_n_buckets)?;

    let max_steps = max_chain_steps(header);
    let mut new_heads = vec![TOMBSTONE; new_n_buckets as usize];
    for old_bucket in 0..header.n_buckets {
        let source = FileSource::new(&mut *file);
        let mut offset = read_bucket(&source, header, old_bucket)?;
        let mut chain = Vec::new();
        let mut steps = 0u64;
        while offset != TOMBSTONE && offset != CHAIN_END {
            if steps > max_steps {
                return Err(Error::corrupt("bucket chain exceeds the file's block capacity (cycle?)"));
            }
            steps += 1;
            let block = read_block(&source, header, offset)?;
            let next = block.next;
            chain.push((offset, block.key_hash));
            offset = next;
        }
        drop(source);
        // `chain` was walked head-to-tail, i.e. newest-to-oldest. Prepending
        // in that same order would leave the oldest block at the new head,
        // so reverse first — oldest-to-newest — and let the newest block be
        // the last one prepended, landing back at the head.
        for (offset, key_hash) in chain.into_iter().rev() {
            let new_bucket = get_bucket(&key_hash, new_n_buckets) as usize;
            patch_next(file, header, offset, new_heads[new_bucket])?;
            new_heads[new_bucket] = offset;
        }
    }

    header.n_buckets = new_n_buckets;
    header.bucket_array_offset = new_array_offset;
    header.data_end_offset = new_array_offset + new_n_buckets * header.n_file as u64;

    for (bucket, head) in new_heads.into_iter().enumerate() {
        if head != TOMBSTONE {
            write_bucket(file, header, bucket as u64, head)?;
        }
    }

    tracing::debug!(new_n_buckets, "auto-reindex grew bucket array");
    Ok(())
}
