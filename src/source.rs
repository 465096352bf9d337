//! Abstract random-access byte sources.
//!
//! The writer reads back through a plain, seekable `File`; readers (and any
//! process that only ever reads) go through a read-only memory map instead.
//! Both implement [`ByteSource`] so the chain-walk and bucket-lookup code in
//! `index`/`block` is written once and shared by both paths, matching the
//! "one abstract walk over a byte source" shape this format calls for.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use memmap2::{Advice, Mmap};

use crate::error::{Error, Result};

/// A random-access view over a file's bytes, used to read the header,
/// bucket array, and data blocks without caring whether the backing store
/// is a buffered `File` or a memory map.
pub trait ByteSource {
    /// Read exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Total length of the underlying file, in bytes.
    fn len(&self) -> u64;
}

/// Buffered-file byte source used by the writer, which must see its own
/// unflushed writes immediately and cannot tolerate a stale mapping.
pub struct FileSource<'a> {
    file: &'a mut File,
}

impl<'a> FileSource<'a> {
    pub fn new(file: &'a mut File) -> Self {
        FileSource { file }
    }
}

impl ByteSource for FileSource<'_> {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        // SAFETY-free: `File` doesn't expose pread directly through a
        // shared reference on all platforms, so take the discipline of
        // seek-then-read under the caller's exclusive access instead.
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn len(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

/// Read-only memory-mapped byte source used by reader handles. Advised
/// `MADV_RANDOM` since chain walks jump around the file with no
/// sequential locality to exploit.
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn new(file: &File) -> Result<Self> {
        let mmap = unsafe { Mmap::map(file)? };
        mmap.advise(Advice::Random)?;
        Ok(MmapSource { mmap })
    }
}

impl ByteSource for MmapSource {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start + len;
        if end > self.mmap.len() {
            return Err(Error::corrupt("read past end of mapped file"));
        }
        Ok(self.mmap[start..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_source_reads_back_written_bytes() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"hello world").unwrap();
        let source = FileSource::new(&mut tmp);
        assert_eq!(source.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn mmap_source_rejects_out_of_range_reads() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"short").unwrap();
        let source = MmapSource::new(&tmp).unwrap();
        assert!(source.read_at(0, 100).is_err());
    }
}
