//! Prune / compaction: rebuild the file keeping only live, reachable
//! entries.
//!
//! Every `set` on an existing key prepends a new block to its bucket's
//! chain rather than overwriting in place, so a long-lived file
//! accumulates dead blocks: superseded versions and tombstones. Pruning
//! walks every chain once, keeps the first (newest) block seen per key —
//! a live value unless it's a tombstone or falls before an optional
//! timestamp cutoff — and rewrites a fresh file containing only those,
//! with the bucket array reset to the canonical offset right after the
//! header.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::block::{read_block, Block, CHAIN_END, TOMBSTONE};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::index::{get_bucket, write_empty_bucket_array};
use crate::source::ByteSource;

#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    pub live_entries: u64,
    pub dropped_blocks: u64,
}

/// Rebuild `path` in place, keeping only live entries from `header`/`source`.
///
/// `new_n_buckets` overrides the bucket count of the rebuilt file (default:
/// keep the current count). `min_timestamp`, if set, drops live entries
/// older than it; it requires the store to have been opened with
/// timestamps enabled.
pub fn prune(
    path: &Path,
    source: &dyn ByteSource,
    header: &Header,
    new_n_buckets: Option<u64>,
    min_timestamp: Option<u64>,
) -> Result<(Header, PruneStats)> {
    if min_timestamp.is_some() && !header.timestamps {
        return Err(Error::NoTimestamps);
    }

    // Dedup by the full key, not just its 13-byte hash: two distinct keys
    // that happen to collide on that hash must both survive pruning (spec
    // §8 scenario 2), so only an exact key match marks a block superseded.
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let mut live: Vec<Block> = Vec::new();
    let mut stats = PruneStats::default();

    let max_steps = crate::index::max_chain_steps(header);
    for bucket in 0..header.n_buckets {
        let mut offset = crate::index::read_bucket(source, header, bucket)?;
        let mut steps = 0u64;
        while offset != TOMBSTONE && offset != CHAIN_END {
            if steps > max_steps {
                return Err(Error::corrupt("bucket chain exceeds the file's block capacity (cycle?)"));
            }
            steps += 1;
            let block = read_block(source, header, offset)?;
            let next = block.next;
            if seen.insert(block.key.clone()) {
                let keep = !block.deleted
                    && min_timestamp
                        .map(|cutoff| block.timestamp.unwrap_or(0) >= cutoff)
                        .unwrap_or(true);
                if keep {
                    live.push(block);
                } else {
                    stats.dropped_blocks += 1;
                }
            } else {
                stats.dropped_blocks += 1;
            }
            offset = next;
        }
    }
    stats.live_entries = live.len() as u64;

    let new_n_buckets = new_n_buckets.unwrap_or(header.n_buckets);
    let mut new_header = Header::new(
        new_n_buckets,
        header.fixed_value_len,
        header.timestamps,
        header.key_serializer_code,
        header.value_serializer_code,
        header.created_at_micros,
    );
    new_header.n_keys = live.len() as u64;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let file = tmp.as_file_mut();
        file.write_all(&new_header.encode())?;
        write_empty_bucket_array(file, &new_header, new_header.bucket_array_offset, new_n_buckets)?;

        let mut bucket_heads = vec![TOMBSTONE; new_n_buckets as usize];
        let mut data = Vec::new();
        let mut cursor = new_header.data_end_offset;
        for block in &live {
            let bucket = get_bucket(&block.key_hash, new_n_buckets) as usize;
            let mut rebuilt = block.clone();
            rebuilt.next = bucket_heads[bucket];
            let encoded = rebuilt.encode(&new_header);
            bucket_heads[bucket] = cursor;
            cursor += encoded.len() as u64;
            data.extend(encoded);
        }
        new_header.data_end_offset = cursor;
        file.write_all(&data)?;

        for (bucket, head) in bucket_heads.into_iter().enumerate() {
            if head != TOMBSTONE {
                crate::index::write_bucket(file, &new_header, bucket as u64, head)?;
            }
        }
        new_header.write_to(file)?;
        file.sync_all()?;
    }
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok((new_header, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileSource;
    use std::io::{Seek, SeekFrom};

    fn write_test_file(header: &Header, entries: &[(Vec<u8>, Vec<u8>, Option<u64>, bool)]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.fm");
        let mut file = File::create(&path).unwrap();
        file.write_all(&header.encode()).unwrap();
        write_empty_bucket_array(&mut file, header, header.bucket_array_offset, header.n_buckets).unwrap();

        let mut bucket_heads = vec![TOMBSTONE; header.n_buckets as usize];
        let mut data = Vec::new();
        let mut cursor = header.data_end_offset;
        for (key, value, ts, deleted) in entries {
            let hash = crate::codec::hash_key(key);
            let bucket = get_bucket(&hash, header.n_buckets) as usize;
            let block = if *deleted {
                Block::new_tombstone(key.clone(), bucket_heads[bucket], *ts)
            } else {
                Block::new_value(key.clone(), value.clone(), bucket_heads[bucket], *ts)
            };
            let encoded = block.encode(header);
            bucket_heads[bucket] = cursor;
            cursor += encoded.len() as u64;
            data.extend(encoded);
        }
        file.write_all(&data).unwrap();
        for (bucket, head) in bucket_heads.into_iter().enumerate() {
            if head != TOMBSTONE {
                crate::index::write_bucket(&mut file, header, bucket as u64, head).unwrap();
            }
        }
        file.seek(SeekFrom::Start(0)).unwrap();
        (dir, path)
    }

    #[test]
    fn prune_drops_superseded_and_deleted_entries() {
        let header = Header::new(11, None, true, 0, 0, 0);
        let (_dir, path) = write_test_file(
            &header,
            &[
                (b"a".to_vec(), b"1".to_vec(), Some(1), false),
                (b"a".to_vec(), b"2".to_vec(), Some(2), false),
                (b"b".to_vec(), b"x".to_vec(), Some(1), false),
                (b"b".to_vec(), Vec::new(), Some(3), true),
            ],
        );
        let mut file = File::open(&path).unwrap();
        let source = FileSource::new(&mut file);
        let (new_header, stats) = prune(&path, &source, &header, None, None).unwrap();
        assert_eq!(stats.live_entries, 1);
        assert_eq!(new_header.n_keys, 1);
    }

    #[test]
    fn prune_with_timestamp_cutoff_requires_timestamps() {
        let header = Header::new(11, None, false, 0, 0, 0);
        let (_dir, path) = write_test_file(&header, &[(b"a".to_vec(), b"1".to_vec(), None, false)]);
        let mut file = File::open(&path).unwrap();
        let source = FileSource::new(&mut file);
        assert!(matches!(
            prune(&path, &source, &header, None, Some(1)),
            Err(Error::NoTimestamps)
        ));
    }

    #[test]
    fn prune_keeps_both_entries_on_a_key_hash_collision() {
        // Two distinct keys forced onto the same 13-byte digest (as a real
        // digest collision would) must both survive: dedup has to compare
        // full keys, not trust the truncated hash alone.
        let header = Header::new(11, None, false, 0, 0, 0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.fm");
        let mut file = File::create(&path).unwrap();
        file.write_all(&header.encode()).unwrap();
        write_empty_bucket_array(&mut file, &header, header.bucket_array_offset, header.n_buckets).unwrap();

        let shared_hash = crate::codec::hash_key(b"colliding-hash-seed");
        let mut block_a = Block::new_value(b"key-a".to_vec(), b"value-a".to_vec(), TOMBSTONE, None);
        block_a.key_hash = shared_hash;
        let mut block_b = Block::new_value(b"key-b".to_vec(), b"value-b".to_vec(), TOMBSTONE, None);
        block_b.key_hash = shared_hash;

        let bucket = get_bucket(&shared_hash, header.n_buckets) as usize;
        let mut cursor = header.data_end_offset;
        let encoded_a = block_a.encode(&header);
        let offset_a = cursor;
        cursor += encoded_a.len() as u64;
        let mut data = encoded_a;
        block_b.next = offset_a;
        let encoded_b = block_b.encode(&header);
        let offset_b = cursor;
        data.extend(encoded_b);
        file.write_all(&data).unwrap();
        crate::index::write_bucket(&mut file, &header, bucket as u64, offset_b).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let mut file = File::open(&path).unwrap();
        let source = FileSource::new(&mut file);
        let (new_header, stats) = prune(&path, &source, &header, None, None).unwrap();
        assert_eq!(stats.live_entries, 2);
        assert_eq!(new_header.n_keys, 2);
    }
}
