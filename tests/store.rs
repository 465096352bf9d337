//! Integration tests exercising the store end to end through its public
//! API, one file per test run.

use filemap::{Error, OpenFlag, OpenOptions};
use rand::Rng;

/// Route the crate's `tracing` events to the test harness's captured
/// output so a failing test's `sync`/`prune`/auto-reindex logs show up
/// alongside the assertion failure instead of disappearing.
fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn new_store(dir: &tempfile::TempDir, name: &str) -> filemap::Store {
    init_tracing();
    OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join(name))
        .unwrap()
}

#[test]
fn write_sync_reopen_preserves_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.fm");
    {
        let store = OpenOptions::new().flag(OpenFlag::New).open(&path).unwrap();
        for i in 0..500u32 {
            store.set(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        store.sync().unwrap();
    }

    let store = OpenOptions::new().flag(OpenFlag::Write).open(&path).unwrap();
    for i in 0..500u32 {
        assert_eq!(
            store.get(format!("key-{i}").as_bytes()).unwrap(),
            Some(format!("value-{i}").into_bytes())
        );
    }
    assert_eq!(store.len().unwrap(), 500);
}

#[test]
fn delete_then_reopen_keeps_key_absent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.fm");
    {
        let store = OpenOptions::new().flag(OpenFlag::New).open(&path).unwrap();
        store.set(b"a", b"1").unwrap();
        store.set(b"b", b"2").unwrap();
        store.delete(b"a").unwrap();
        store.sync().unwrap();
    }
    let store = OpenOptions::new().flag(OpenFlag::Write).open(&path).unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn repeated_overwrites_of_one_key_never_inflate_live_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, "store.fm");
    for i in 0..200u32 {
        store.set(b"hot-key", format!("v{i}").as_bytes()).unwrap();
    }
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.get(b"hot-key").unwrap(), Some(b"v199".to_vec()));
}

#[test]
fn prune_reclaims_space_and_preserves_live_data() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, "store.fm");
    for i in 0..50u32 {
        store.set(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    for i in 0..50u32 {
        store.set(format!("k{i}").as_bytes(), b"v2").unwrap();
    }
    for i in 0..25u32 {
        store.delete(format!("k{i}").as_bytes()).unwrap();
    }
    let stats = store.prune(None, None).unwrap();
    assert_eq!(stats.live_entries, 25);
    assert_eq!(store.len().unwrap(), 25);
    for i in 25..50u32 {
        assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap(), Some(b"v2".to_vec()));
    }
    for i in 0..25u32 {
        assert_eq!(store.get(format!("k{i}").as_bytes()).unwrap(), None);
    }
}

#[test]
fn auto_reindex_keeps_every_key_reachable_across_growth() {
    let dir = tempfile::tempdir().unwrap();
    let store = OpenOptions::new()
        .flag(OpenFlag::New)
        .bucket_count(5)
        .open(dir.path().join("store.fm"))
        .unwrap();

    let mut rng = rand::thread_rng();
    let mut expected = Vec::new();
    for i in 0..300u32 {
        let value: u64 = rng.gen();
        let key = format!("key-{i}").into_bytes();
        let value = value.to_le_bytes().to_vec();
        store.set(&key, &value).unwrap();
        expected.push((key, value));
    }
    store.sync().unwrap();

    for (key, value) in &expected {
        assert_eq!(store.get(key).unwrap().as_ref(), Some(value));
    }
    assert_eq!(store.len().unwrap(), 300);
}

#[test]
fn auto_reindex_preserves_latest_value_of_a_superseded_key() {
    // A key overwritten before the triggering sync must still read back as
    // its newest value after the bucket array grows and every chain is
    // re-threaded, not whatever version happened to end up deepest in the
    // old chain.
    let dir = tempfile::tempdir().unwrap();
    let store = OpenOptions::new()
        .flag(OpenFlag::New)
        .bucket_count(5)
        .open(dir.path().join("store.fm"))
        .unwrap();

    store.set(b"dup", b"v1").unwrap();
    store.set(b"dup", b"v2").unwrap();
    for i in 0..10u32 {
        store.set(format!("key{i}").as_bytes(), b"v").unwrap();
    }
    store.sync().unwrap();

    assert_eq!(store.get(b"dup").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(store.len().unwrap(), 11);
}

#[test]
fn fixed_value_length_store_rejects_mismatched_values() {
    let dir = tempfile::tempdir().unwrap();
    let store = OpenOptions::new()
        .flag(OpenFlag::New)
        .fixed_value_len(8)
        .open(dir.path().join("store.fm"))
        .unwrap();
    store.set(b"k", &[0u8; 8]).unwrap();
    assert!(matches!(store.set(b"k2", &[0u8; 4]), Err(Error::Type(_))));
}

#[test]
fn timestamps_round_trip_and_are_rejected_without_the_flag() {
    let dir = tempfile::tempdir().unwrap();
    let store = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("with-ts.fm"))
        .unwrap();
    store.set(b"k", b"v").unwrap();
    assert!(store.get_timestamp(b"k").unwrap().is_some());

    let no_ts = OpenOptions::new()
        .flag(OpenFlag::New)
        .timestamps(false)
        .open(dir.path().join("no-ts.fm"))
        .unwrap();
    no_ts.set(b"k", b"v").unwrap();
    assert!(matches!(no_ts.get_timestamp(b"k"), Err(Error::NoTimestamps)));
}

#[test]
fn get_timestamp_with_value_returns_both_in_one_call() {
    let dir = tempfile::tempdir().unwrap();
    let store = OpenOptions::new()
        .flag(OpenFlag::New)
        .open(dir.path().join("store.fm"))
        .unwrap();
    store.set(b"k", b"v").unwrap();
    let ts = store.get_timestamp(b"k").unwrap().unwrap();
    let (ts_combined, value) = store.get_timestamp_with_value(b"k").unwrap().unwrap();
    assert_eq!(ts_combined, ts);
    assert_eq!(value, b"v".to_vec());
    assert_eq!(store.get_timestamp_with_value(b"missing").unwrap(), None);
}

#[test]
fn metadata_survives_reopen_and_stays_out_of_iteration() {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Info {
        schema_version: u32,
        label: String,
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.fm");
    {
        let store = OpenOptions::new().flag(OpenFlag::New).open(&path).unwrap();
        store.set(b"a", b"1").unwrap();
        store
            .set_metadata(&Info { schema_version: 2, label: "example".into() })
            .unwrap();
        store.sync().unwrap();
    }
    let store = OpenOptions::new().flag(OpenFlag::Write).open(&path).unwrap();
    assert_eq!(
        store.get_metadata::<Info>().unwrap(),
        Some(Info { schema_version: 2, label: "example".into() })
    );
    assert_eq!(store.len().unwrap(), 1);
    assert_eq!(store.iterate().unwrap(), vec![(b"a".to_vec(), b"1".to_vec())]);

    let (meta, ts) = store.get_metadata_with_timestamp::<Info>().unwrap().unwrap();
    assert_eq!(meta, Info { schema_version: 2, label: "example".into() });
    assert!(ts.is_some());
}

#[test]
fn second_writer_cannot_open_a_locked_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.fm");
    let _first = OpenOptions::new().flag(OpenFlag::New).open(&path).unwrap();
    let second = OpenOptions::new().flag(OpenFlag::Write).open(&path);
    assert!(matches!(second, Err(Error::Locked)));
}

#[test]
fn opening_a_missing_file_for_read_or_write_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.fm");
    assert!(matches!(
        OpenOptions::new().flag(OpenFlag::Read).open(&path),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        OpenOptions::new().flag(OpenFlag::Write).open(&path),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn clear_resets_store_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, "store.fm");
    for i in 0..20u32 {
        store.set(format!("k{i}").as_bytes(), b"v").unwrap();
    }
    store.clear().unwrap();
    assert_eq!(store.len().unwrap(), 0);
    assert!(store.is_empty().unwrap());
    assert_eq!(store.get(b"k0").unwrap(), None);
    store.set(b"fresh", b"v").unwrap();
    assert_eq!(store.get(b"fresh").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn update_applies_every_pair_in_one_batch() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, "store.fm");
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..10u32)
        .map(|i| (format!("k{i}").into_bytes(), format!("v{i}").into_bytes()))
        .collect();
    store.update(entries.clone()).unwrap();
    assert_eq!(store.len().unwrap(), 10);
    for (k, v) in &entries {
        assert_eq!(store.get(k).unwrap().as_ref(), Some(v));
    }
}

#[test]
fn update_on_read_only_handle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.fm");
    OpenOptions::new().flag(OpenFlag::New).open(&path).unwrap().close().unwrap();
    let reader = OpenOptions::new().flag(OpenFlag::Read).open(&path).unwrap();
    assert!(matches!(reader.update(vec![(b"a".to_vec(), b"1".to_vec())]), Err(Error::ReadOnly)));
}

#[test]
fn two_keys_sharing_a_bucket_are_both_retrievable() {
    // A single-bucket store forces every key onto the same chain, the same
    // situation an engineered key-hash collision would produce without
    // needing to actually find two inputs that hash alike.
    let dir = tempfile::tempdir().unwrap();
    let store = OpenOptions::new()
        .flag(OpenFlag::New)
        .bucket_count(1)
        .open(dir.path().join("store.fm"))
        .unwrap();
    store.set(b"first", b"1").unwrap();
    store.set(b"second", b"2").unwrap();
    store.sync().unwrap();
    assert_eq!(store.get(b"first").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"second").unwrap(), Some(b"2".to_vec()));
    assert_eq!(store.len().unwrap(), 2);
}

#[test]
fn overlong_key_is_rejected_with_type_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir, "store.fm");
    let huge_key = vec![0u8; 70_000]; // default n_key is 2 bytes -> max 65535
    assert!(matches!(store.set(&huge_key, b"v"), Err(Error::Type(_))));
}
