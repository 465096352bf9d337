//! Fixed-width little-endian integer codec and the key-hash function.
//!
//! Every integer in the file format is little-endian and of a width fixed
//! by the header (1, 2, 4, 5, 6, or 7 bytes for lengths/offsets; 8 for the
//! microsecond timestamp truncated to 7 bytes on disk). Widths above 8
//! don't occur in this format, but the decode/encode helpers below are
//! generic over any width up to 8 so callers don't juggle byte arrays by
//! hand at each call site.

use crate::error::{Error, Result};

/// Width, in bytes, of the key-hash digest used to address hash buckets.
pub const KEY_HASH_LEN: usize = 13;

/// Encode `value` into the low `width` bytes of a little-endian integer.
///
/// `width` must be between 1 and 8 inclusive; this is an internal
/// invariant of the format, not a user input, so it panics on violation
/// rather than returning a `Result`.
pub fn encode_uint(value: u64, width: usize) -> Vec<u8> {
    assert!((1..=8).contains(&width), "unsupported integer width {width}");
    value.to_le_bytes()[..width].to_vec()
}

/// Decode a little-endian unsigned integer from exactly `bytes.len()`
/// bytes (which must be 1..=8).
pub fn decode_uint(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::corrupt(format!(
            "invalid integer width {}",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

/// Hash a byte key down to a [`KEY_HASH_LEN`]-byte digest used to select a
/// hash bucket and to identify a key's data blocks on its chain.
///
/// This uses BLAKE3 in keyed mode with a digest-only fixed key (not a
/// user-supplied secret — the file format has no notion of a keyed,
/// security-sensitive hash). Equal inputs always yield equal digests
/// across hosts and file lifetimes, which is all the format requires;
/// changing this function, its key, or the truncation width is a file
/// format break.
pub fn hash_key(key: &[u8]) -> [u8; KEY_HASH_LEN] {
    const HASH_KEY: [u8; 32] = *b"filemap-bucket-hash-v1-xxxxxxxxx";
    let digest = blake3::Hasher::new_keyed(&HASH_KEY).update(key).finalize();
    let mut out = [0u8; KEY_HASH_LEN];
    out.copy_from_slice(&digest.as_bytes()[..KEY_HASH_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_supported_width() {
        for width in 1..=8usize {
            let max = if width == 8 {
                u64::MAX
            } else {
                (1u64 << (width * 8)) - 1
            };
            for value in [0, 1, max / 2, max] {
                let encoded = encode_uint(value, width);
                assert_eq!(encoded.len(), width);
                assert_eq!(decode_uint(&encoded).unwrap(), value);
            }
        }
    }

    #[test]
    fn hash_is_deterministic_and_fixed_width() {
        let a = hash_key(b"hello");
        let b = hash_key(b"hello");
        let c = hash_key(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), KEY_HASH_LEN);
    }

    #[test]
    fn decode_rejects_bad_widths() {
        assert!(decode_uint(&[]).is_err());
        assert!(decode_uint(&[0u8; 9]).is_err());
    }
}
