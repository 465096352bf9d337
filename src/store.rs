//! Top-level orchestration: the public `Store` handle, its `OpenOptions`
//! builder, and every mapping operation built on the modules below it.
//!
//! A `Store` owns exactly one open file descriptor and one advisory lock
//! (exclusive for a writer, shared for a reader) and serializes every
//! operation through a single mutex, matching the single-writer,
//! any-number-of-readers concurrency model this format assumes.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::{self, Block, CHAIN_END, TOMBSTONE};
use crate::buffer::{BufferedEntry, WriteBuffer, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::index::{self, INITIAL_BUCKET_COUNT};
use crate::lock::{self, LockMode};
use crate::prune::{self, PruneStats};
use crate::serializer::SerializerCode;
use crate::source::{ByteSource, MmapSource};

/// A reserved key, unreachable from user input in practice (it embeds a
/// sentinel byte sequence), used to stash database-wide metadata without
/// a dedicated file region. Hidden from `len`/`iterate`.
const METADATA_KEY: &[u8] = b"\xff\xfffilemap:metadata\xff\xff";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlag {
    /// Open an existing file read-only.
    Read,
    /// Open an existing file read-write.
    Write,
    /// Open read-write, creating the file if it doesn't exist.
    Create,
    /// Always create a new, empty file, truncating any existing one.
    New,
}

impl OpenFlag {
    pub fn from_char(c: char) -> Result<Self> {
        match c {
            'r' => Ok(OpenFlag::Read),
            'w' => Ok(OpenFlag::Write),
            'c' => Ok(OpenFlag::Create),
            'n' => Ok(OpenFlag::New),
            other => Err(Error::BadFlag(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub flag: OpenFlag,
    pub bucket_count: u64,
    pub buffer_size: usize,
    pub timestamps: bool,
    pub fixed_value_len: Option<u32>,
    pub key_serializer_code: u16,
    pub value_serializer_code: u16,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            flag: OpenFlag::Create,
            bucket_count: INITIAL_BUCKET_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timestamps: true,
            fixed_value_len: None,
            key_serializer_code: SerializerCode::RawBytes as u16,
            value_serializer_code: SerializerCode::RawBytes as u16,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(mut self, flag: OpenFlag) -> Self {
        self.flag = flag;
        self
    }

    pub fn bucket_count(mut self, n: u64) -> Self {
        self.bucket_count = n;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn fixed_value_len(mut self, len: u32) -> Self {
        self.fixed_value_len = Some(len);
        self
    }

    pub fn key_serializer_code(mut self, code: u16) -> Self {
        self.key_serializer_code = code;
        self
    }

    pub fn value_serializer_code(mut self, code: u16) -> Self {
        self.value_serializer_code = code;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Store> {
        Store::open(path.as_ref(), self)
    }
}

struct Inner {
    path: PathBuf,
    file: File,
    header: Header,
    buffer: WriteBuffer,
    buffer_size: usize,
    read_only: bool,
    reader: Option<MmapSource>,
}

impl Inner {
    /// A `ByteSource` over whichever backing this handle currently uses:
    /// the memory map for read-only handles, a cloned file descriptor
    /// otherwise. Cheap, and safe to create and drop per call since
    /// neither variant holds an exclusive borrow of `self`.
    fn source(&self) -> Box<dyn ByteSource + '_> {
        match &self.reader {
            Some(mmap) => Box::new(MmapRef(mmap)),
            None => Box::new(FileRef(&self.file)),
        }
    }

    fn chain_head(&self, bucket: u64) -> Result<u64> {
        match self.buffer.staged_head(bucket) {
            Some(head) => Ok(head),
            None => index::read_bucket(self.source().as_ref(), &self.header, bucket),
        }
    }

    fn contains(&self, key: &[u8]) -> Result<bool> {
        if let Some(entry) = self.buffer.lookup(key) {
            return Ok(matches!(entry, BufferedEntry::Value { .. }));
        }
        let bucket = index::get_bucket(&crate::codec::hash_key(key), self.header.n_buckets);
        let head = index::read_bucket(self.source().as_ref(), &self.header, bucket)?;
        let found = index::find_in_chain(self.source().as_ref(), &self.header, head, key)?;
        Ok(found.map(|b| !b.deleted).unwrap_or(false))
    }

    fn get_entry(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<u64>)>> {
        if let Some(entry) = self.buffer.lookup(key) {
            return Ok(match entry.clone() {
                BufferedEntry::Value { value, timestamp } => Some((value, timestamp)),
                BufferedEntry::Tombstone => None,
            });
        }
        let bucket = index::get_bucket(&crate::codec::hash_key(key), self.header.n_buckets);
        let head = index::read_bucket(self.source().as_ref(), &self.header, bucket)?;
        let found = index::find_in_chain(self.source().as_ref(), &self.header, head, key)?;
        Ok(found.and_then(|b| if b.deleted { None } else { Some((b.value, b.timestamp)) }))
    }
}

struct MmapRef<'a>(&'a MmapSource);

impl ByteSource for MmapRef<'_> {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.0.read_at(offset, len)
    }
    fn len(&self) -> u64 {
        self.0.len()
    }
}

/// File-backed source over a shared reference: clones the descriptor per
/// read so it never needs exclusive access to the handle `Store` holds.
struct FileRef<'a>(&'a File);

impl ByteSource for FileRef<'_> {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.0.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
    fn len(&self) -> u64 {
        self.0.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

/// An open handle to a filemap store. Cheap to hold, but every operation
/// takes an internal mutex — a `Store` is meant to be owned by one writer
/// or reader at a time within a process, not raced across threads for
/// throughput.
pub struct Store {
    inner: Mutex<Inner>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Store {
    pub fn open(path: &Path, options: OpenOptions) -> Result<Store> {
        let exists = path.exists();
        let (read_only, create) = match options.flag {
            OpenFlag::Read => (true, false),
            OpenFlag::Write => (false, false),
            OpenFlag::Create => (false, !exists),
            OpenFlag::New => (false, true),
        };
        if !exists && matches!(options.flag, OpenFlag::Read | OpenFlag::Write) {
            return Err(Error::not_found(path.display().to_string()));
        }

        let truncate = matches!(options.flag, OpenFlag::New);
        let mut file = FsOpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create || truncate)
            .truncate(truncate)
            .open(path)?;

        lock::acquire(&file, if read_only { LockMode::Shared } else { LockMode::Exclusive })?;

        let needs_init = truncate || file.metadata()?.len() == 0;
        let header = if needs_init {
            if read_only {
                return Err(Error::not_found(path.display().to_string()));
            }
            let header = Header::new(
                options.bucket_count,
                options.fixed_value_len,
                options.timestamps,
                options.key_serializer_code,
                options.value_serializer_code,
                now_micros(),
            );
            header.write_to(&mut file)?;
            index::write_empty_bucket_array(&mut file, &header, header.bucket_array_offset, header.n_buckets)?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), n_buckets = header.n_buckets, "created new store");
            header
        } else {
            let header = Header::read_from(&mut file)?;
            tracing::debug!(path = %path.display(), n_keys = header.n_keys, "opened existing store");
            header
        };

        let reader = if read_only { Some(MmapSource::new(&file)?) } else { None };
        let buffer = WriteBuffer::new(header.data_end_offset, options.buffer_size);

        Ok(Store {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                file,
                header,
                buffer,
                buffer_size: options.buffer_size,
                read_only,
                reader,
            }),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get_entry(key)?.map(|(value, _)| value))
    }

    pub fn get_timestamp(&self, key: &[u8]) -> Result<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        if !inner.header.timestamps {
            return Err(Error::NoTimestamps);
        }
        Ok(inner.get_entry(key)?.and_then(|(_, ts)| ts))
    }

    /// The `include_value` form of `get_timestamp`: returns the entry's
    /// timestamp alongside its current value from a single chain walk,
    /// rather than making the caller look the value up separately.
    pub fn get_timestamp_with_value(&self, key: &[u8]) -> Result<Option<(u64, Vec<u8>)>> {
        let inner = self.inner.lock().unwrap();
        if !inner.header.timestamps {
            return Err(Error::NoTimestamps);
        }
        Ok(inner.get_entry(key)?.and_then(|(value, ts)| ts.map(|ts| (ts, value))))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        inner.contains(key)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let timestamp = {
            let inner = self.inner.lock().unwrap();
            inner.header.timestamps.then(now_micros)
        };
        self.set_with_timestamp(key, value, timestamp)
    }

    pub fn set_timestamp(&self, key: &[u8], timestamp: u64) -> Result<()> {
        let value = {
            let inner = self.inner.lock().unwrap();
            if !inner.header.timestamps {
                return Err(Error::NoTimestamps);
            }
            inner
                .get_entry(key)?
                .ok_or_else(|| Error::not_found(format!("{key:?}")))?
                .0
        };
        self.set_with_timestamp(key, &value, Some(timestamp))
    }

    fn set_with_timestamp(&self, key: &[u8], value: &[u8], timestamp: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(Error::ReadOnly);
        }
        let max_key_len = (1u128 << (8 * inner.header.n_key as u32)) - 1;
        if key.len() as u128 > max_key_len {
            return Err(Error::type_err(format!(
                "key length {} exceeds the {}-byte limit this file's key-length field can express",
                key.len(),
                max_key_len
            )));
        }
        if key != METADATA_KEY {
            if let Some(fixed) = inner.header.fixed_value_len {
                if value.len() as u32 != fixed {
                    return Err(Error::type_err(format!(
                        "value length {} does not match fixed length {fixed}",
                        value.len()
                    )));
                }
            }
        }
        let existed = inner.contains(key)?;
        let hash = crate::codec::hash_key(key);
        let bucket = index::get_bucket(&hash, inner.header.n_buckets);
        let current_head = inner.chain_head(bucket)?;
        let header = inner.header;
        inner
            .buffer
            .stage_value(&header, bucket, current_head, key.to_vec(), value.to_vec(), timestamp);
        if !existed {
            inner.header.n_keys += 1;
        }
        self.maybe_flush(&mut inner)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(Error::ReadOnly);
        }
        if !inner.contains(key)? {
            return Err(Error::not_found(format!("{key:?}")));
        }
        let hash = crate::codec::hash_key(key);
        let bucket = index::get_bucket(&hash, inner.header.n_buckets);
        let current_head = inner.chain_head(bucket)?;
        let header = inner.header;
        let ts = header.timestamps.then(now_micros);
        inner.buffer.stage_tombstone(&header, bucket, current_head, key.to_vec(), ts);
        inner.header.n_keys = inner.header.n_keys.saturating_sub(1);
        self.maybe_flush(&mut inner)
    }

    /// Bulk `set` over every `(key, value)` pair, in iteration order.
    /// Equivalent to calling `set` once per pair, but checks `read_only`
    /// once up front rather than failing partway through the batch.
    pub fn update<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        if self.inner.lock().unwrap().read_only {
            return Err(Error::ReadOnly);
        }
        for (key, value) in entries {
            self.set(&key, &value)?;
        }
        Ok(())
    }

    pub fn set_metadata<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        if self.inner.lock().unwrap().header.fixed_value_len.is_some() {
            return Err(Error::type_err(
                "metadata is variable-length and cannot be stored in a fixed-value-length file",
            ));
        }
        let bytes = serde_json::to_vec(value).map_err(|e| Error::type_err(e.to_string()))?;
        self.set_with_timestamp(METADATA_KEY, &bytes, None)
    }

    pub fn get_metadata<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.get(METADATA_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| Error::type_err(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// The `include_ts` form of `get_metadata`: returns the metadata object
    /// together with its timestamp (`None` if the store has timestamps
    /// disabled or none was recorded for this write).
    pub fn get_metadata_with_timestamp<T: serde::de::DeserializeOwned>(&self) -> Result<Option<(T, Option<u64>)>> {
        let entry = {
            let inner = self.inner.lock().unwrap();
            inner.get_entry(METADATA_KEY)?
        };
        match entry {
            Some((bytes, ts)) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| Error::type_err(e.to_string()))?;
                Ok(Some((value, ts)))
            }
            None => Ok(None),
        }
    }

    /// Number of live, user-visible keys (the hidden metadata entry, if
    /// any, is never counted).
    pub fn len(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        let has_metadata = inner.contains(METADATA_KEY)?;
        Ok(inner.header.n_keys.saturating_sub(has_metadata as u64))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush the write buffer, check for auto-reindex, and persist the
    /// updated header counters. No-op if nothing is buffered and the
    /// bucket array doesn't need to grow.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)
    }

    fn maybe_flush(&self, inner: &mut Inner) -> Result<()> {
        if inner.buffer.should_flush() {
            self.flush_locked(inner)?;
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.read_only {
            return Ok(());
        }
        if !inner.buffer.is_empty() {
            let new_end = inner.header.data_end_offset;
            let (data, patches) = inner.buffer.drain(new_end);
            use std::io::{Seek, SeekFrom, Write};
            inner.file.seek(SeekFrom::Start(new_end))?;
            inner.file.write_all(&data)?;
            inner.header.data_end_offset = new_end + data.len() as u64;
            for (bucket, head) in patches {
                index::write_bucket(&mut inner.file, &inner.header, bucket, head)?;
            }
            // `drain` reset the buffer's base offset to `new_end`, but the
            // data just appended moved the true append point forward —
            // rebuild the buffer pointed at the corrected offset so the
            // next staged write's block lands where it claims to.
            inner.buffer = WriteBuffer::new(inner.header.data_end_offset, inner.buffer_size);
        }
        if inner.header.n_keys > inner.header.n_buckets {
            index::auto_reindex(&mut inner.file, &mut inner.header)?;
            inner.buffer = WriteBuffer::new(inner.header.data_end_offset, inner.buffer_size);
        }
        inner.header.write_counters(&mut inner.file)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Rebuild the file keeping only live entries, optionally changing
    /// the bucket count or dropping entries older than `min_timestamp`.
    pub fn prune(&self, new_bucket_count: Option<u64>, min_timestamp: Option<u64>) -> Result<PruneStats> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(Error::ReadOnly);
        }
        self.flush_locked(&mut inner)?;
        let stats = self.rebuild(&mut inner, new_bucket_count, min_timestamp)?;
        Ok(stats)
    }

    /// Drop every live key, resetting the store to its canonical empty
    /// layout at the current bucket count — unlike `prune`, this never
    /// needs to look at what's currently stored.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_only {
            return Err(Error::ReadOnly);
        }
        let header = Header::new(
            inner.header.n_buckets,
            inner.header.fixed_value_len,
            inner.header.timestamps,
            inner.header.key_serializer_code,
            inner.header.value_serializer_code,
            inner.header.created_at_micros,
        );
        header.write_to(&mut inner.file)?;
        index::write_empty_bucket_array(&mut inner.file, &header, header.bucket_array_offset, header.n_buckets)?;
        inner.file.set_len(header.data_end_offset)?;
        inner.file.sync_all()?;
        inner.header = header;
        inner.buffer = WriteBuffer::new(inner.header.data_end_offset, inner.buffer_size);
        Ok(())
    }

    fn rebuild(&self, inner: &mut Inner, new_bucket_count: Option<u64>, min_timestamp: Option<u64>) -> Result<PruneStats> {
        let (new_header, stats) = {
            let source = inner.source();
            prune::prune(&inner.path, source.as_ref(), &inner.header, new_bucket_count, min_timestamp)?
        };

        lock::release(&inner.file)?;
        let mut file = FsOpenOptions::new().read(true).write(true).open(&inner.path)?;
        lock::acquire(&file, LockMode::Exclusive)?;
        let header = Header::read_from(&mut file)?;
        debug_assert_eq!(header.n_keys, new_header.n_keys);
        inner.file = file;
        inner.header = header;
        inner.buffer = WriteBuffer::new(inner.header.data_end_offset, inner.buffer_size);
        tracing::info!(live = stats.live_entries, dropped = stats.dropped_blocks, "pruned store");
        Ok(stats)
    }

    /// Every live (key, value) pair. Flushes first so the walk sees every
    /// buffered write.
    pub fn iterate(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.iterate_entries()?.into_iter().map(|(k, v, _)| (k, v)).collect())
    }

    pub fn iterate_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, Option<u64>)>> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)?;
        let header = inner.header;
        let source = inner.source();
        // Dedup by the full key, not just its 13-byte hash: two distinct
        // keys that happen to collide on that hash are still two separate
        // entries, each with their own most-recent block on the chain.
        let mut seen: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
        let mut out = Vec::new();
        let max_steps = index::max_chain_steps(&header);
        for bucket in 0..header.n_buckets {
            let mut offset = index::read_bucket(source.as_ref(), &header, bucket)?;
            let mut steps = 0u64;
            while offset != TOMBSTONE && offset != CHAIN_END {
                if steps > max_steps {
                    return Err(Error::corrupt("bucket chain exceeds the file's block capacity (cycle?)"));
                }
                steps += 1;
                let b: Block = block::read_block(source.as_ref(), &header, offset)?;
                let next = b.next;
                if seen.insert(b.key.clone()) && !b.deleted && b.key != METADATA_KEY {
                    out.push((b.key, b.value, b.timestamp));
                }
                offset = next;
            }
        }
        Ok(out)
    }

    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.into_inner().unwrap();
        self.flush_locked(&mut inner)?;
        lock::release(&inner.file)?;
        Ok(())
    }

    /// Release the current lock and reopen the same path under `flag`,
    /// without losing the `Store`'s identity (useful to switch a writer
    /// handle to a reader, or vice versa, in the same process).
    pub fn reopen(&self, flag: OpenFlag) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_locked(&mut inner)?;
        lock::release(&inner.file)?;
        let read_only = matches!(flag, OpenFlag::Read);
        let mut file = FsOpenOptions::new().read(true).write(!read_only).open(&inner.path)?;
        lock::acquire(&file, if read_only { LockMode::Shared } else { LockMode::Exclusive })?;
        let header = Header::read_from(&mut file)?;
        inner.reader = if read_only { Some(MmapSource::new(&file)?) } else { None };
        inner.file = file;
        inner.header = header;
        inner.read_only = read_only;
        inner.buffer = WriteBuffer::new(inner.header.data_end_offset, inner.buffer_size);
        Ok(())
    }
}
