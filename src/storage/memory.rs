//! RAM-backed [`KeyValueStore`].
//!
//! Writes are durable as soon as they return, so `commit` only counts calls.
//! A single write failure can be armed per key to exercise partial-failure
//! paths in the registry.

use heapless::{FnvIndexMap, Vec};

use super::{Key, KeyValueStore};
use crate::error::StorageError;

/// Largest value a [`MemoryStore`] entry can hold.
pub const MAX_VALUE_LEN: usize = 64;

pub struct MemoryStore {
    entries: FnvIndexMap<Key, Vec<u8, MAX_VALUE_LEN>, 32>,
    fail_key: Option<Key>,
    fail_commit: bool,
    commits: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: FnvIndexMap::new(),
            fail_key: None,
            fail_commit: false,
            commits: 0,
        }
    }

    /// Make the next write (set or erase) to `key` fail with `StorageError::Io`.
    pub fn fail_next_write(&mut self, key: Key) {
        self.fail_key = Some(key);
    }

    /// Make the next `commit` fail with `StorageError::Io`.
    pub fn fail_next_commit(&mut self) {
        self.fail_commit = true;
    }

    pub fn contains(&self, key: Key) -> bool {
        self.entries.contains_key(&key)
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn commits(&self) -> u32 {
        self.commits
    }

    fn check_write(&mut self, key: Key) -> Result<(), StorageError> {
        if self.fail_key == Some(key) {
            self.fail_key = None;
            return Err(StorageError::Io);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    async fn get_blob(&mut self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
        let Some(value) = self.entries.get(&key) else {
            return Ok(None);
        };
        let dst = buf
            .get_mut(..value.len())
            .ok_or(StorageError::BufferTooSmall)?;
        dst.copy_from_slice(value);
        Ok(Some(value.len()))
    }

    async fn set_blob(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError> {
        self.check_write(key)?;
        let value = Vec::from_slice(data).map_err(|_| StorageError::BufferTooSmall)?;
        self.entries
            .insert(key, value)
            .map_err(|_| StorageError::Io)?;
        Ok(())
    }

    async fn erase(&mut self, key: Key) -> Result<bool, StorageError> {
        self.check_write(key)?;
        Ok(self.entries.remove(&key).is_some())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if core::mem::take(&mut self.fail_commit) {
            return Err(StorageError::Io);
        }
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn armed_failure_fires_once() {
        let mut store = MemoryStore::new();
        store.fail_next_write(Key::DeviceCount);
        assert_eq!(
            block_on(store.set_i32(Key::DeviceCount, 1)),
            Err(StorageError::Io)
        );
        assert!(!store.contains(Key::DeviceCount));
        block_on(store.set_i32(Key::DeviceCount, 1)).unwrap();
        assert!(store.contains(Key::DeviceCount));
    }

    #[test]
    fn armed_commit_failure_fires_once() {
        let mut store = MemoryStore::new();
        store.fail_next_commit();
        assert_eq!(block_on(store.commit()), Err(StorageError::Io));
        block_on(store.commit()).unwrap();
        assert_eq!(store.commits(), 1);
    }

    #[test]
    fn erase_reports_whether_key_existed() {
        let mut store = MemoryStore::new();
        block_on(store.set_blob(Key::DeviceAddress(0), &[1; 6])).unwrap();
        assert_eq!(block_on(store.erase(Key::DeviceAddress(0))), Ok(true));
        assert_eq!(block_on(store.erase(Key::DeviceAddress(0))), Ok(false));
    }

    #[test]
    fn short_buffer_is_reported() {
        let mut store = MemoryStore::new();
        block_on(store.set_blob(Key::DeviceAddress(0), &[1; 6])).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            block_on(store.get_blob(Key::DeviceAddress(0), &mut buf)),
            Err(StorageError::BufferTooSmall)
        );
    }
}
