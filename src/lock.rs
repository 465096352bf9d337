//! Advisory whole-file locking.
//!
//! A writer takes an exclusive lock; any number of readers take a shared
//! lock. Both fail fast on contention rather than blocking, so a second
//! writer (or a writer opening over an active reader/writer) gets
//! [`Error::Locked`] immediately instead of hanging.

use std::fs::File;

use fs4::FileExt;

use crate::error::{Error, Result};

pub enum LockMode {
    Shared,
    Exclusive,
}

pub fn acquire(file: &File, mode: LockMode) -> Result<()> {
    let result = match mode {
        LockMode::Shared => file.try_lock_shared(),
        LockMode::Exclusive => file.try_lock_exclusive(),
    };
    result.map_err(|_| Error::Locked)
}

pub fn release(file: &File) -> Result<()> {
    file.unlock()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn exclusive_lock_blocks_a_second_exclusive_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock-test");
        let first = OpenOptions::new().create(true).write(true).open(&path).unwrap();
        let second = OpenOptions::new().create(true).write(true).open(&path).unwrap();

        acquire(&first, LockMode::Exclusive).unwrap();
        assert!(matches!(acquire(&second, LockMode::Exclusive), Err(Error::Locked)));
        release(&first).unwrap();
        acquire(&second, LockMode::Exclusive).unwrap();
        release(&second).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock-test-shared");
        let first = OpenOptions::new().create(true).read(true).open(&path).unwrap();
        let second = OpenOptions::new().create(true).read(true).open(&path).unwrap();

        acquire(&first, LockMode::Shared).unwrap();
        acquire(&second, LockMode::Shared).unwrap();
        release(&first).unwrap();
        release(&second).unwrap();
    }
}
