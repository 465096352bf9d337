//! An embedded, single-writer, file-backed key/value store.
//!
//! A store is a single file: a 200-byte self-describing header, a flat
//! bucket array, and an append-only region of data blocks threaded into
//! singly-linked chains per bucket (external chaining). Writers buffer
//! mutations in memory and flush them with `sync`, which also grows the
//! bucket array automatically once the live key count outgrows it.
//! Superseded and deleted blocks accumulate until reclaimed by `prune`.
//!
//! ```no_run
//! use filemap::{OpenFlag, OpenOptions};
//!
//! let store = OpenOptions::new().flag(OpenFlag::Create).open("data.fm")?;
//! store.set(b"hello", b"world")?;
//! assert_eq!(store.get(b"hello")?, Some(b"world".to_vec()));
//! store.sync()?;
//! # Ok::<(), filemap::Error>(())
//! ```

pub mod block;
pub mod buffer;
pub mod codec;
pub mod error;
pub mod header;
pub mod index;
pub mod lock;
pub mod prune;
pub mod serializer;
pub mod source;
pub mod store;

pub use error::{Error, Result};
pub use prune::PruneStats;
pub use serializer::{IntegerLeSerializer, JsonSerializer, RawBytesSerializer, Serializer, SerializerCode, Utf8Serializer};
pub use store::{OpenFlag, OpenOptions, Store};
