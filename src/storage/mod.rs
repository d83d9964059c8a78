//! Key/value persistence seam for the device registry.
//!
//! Storage layout (one item per key):
//!   - `bt_count`      - i32, number of registry slots in use
//!   - `bt_<i>_mac`    - 6-byte address blob for slot `i`
//!   - `bt_<i>_name`   - UTF-8 display name for slot `i`
//!
//! Backends only have to provide blob get/set/erase and `commit`; strings
//! and integers are layered on top as UTF-8 and little-endian blobs.

pub mod memory;

use core::fmt;

use crate::error::StorageError;

pub use memory::MemoryStore;

/// A persisted registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Key {
    DeviceCount,
    DeviceAddress(u8),
    DeviceName(u8),
}

impl Key {
    /// Stable numeric id, used as the map key by flash backends.
    pub const fn id(self) -> u16 {
        match self {
            Key::DeviceCount => 0x0001,
            Key::DeviceAddress(i) => 0x0100 | i as u16,
            Key::DeviceName(i) => 0x0200 | i as u16,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::DeviceCount => f.write_str("bt_count"),
            Key::DeviceAddress(i) => write!(f, "bt_{}_mac", i),
            Key::DeviceName(i) => write!(f, "bt_{}_name", i),
        }
    }
}

/// Persistent key/value store.
///
/// Writes may be buffered by the backend until [`commit`](Self::commit).
#[allow(async_fn_in_trait)]
pub trait KeyValueStore {
    /// Copy the blob stored under `key` into `buf`, returning its length.
    async fn get_blob(&mut self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError>;

    async fn set_blob(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Returns whether it existed.
    async fn erase(&mut self, key: Key) -> Result<bool, StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn get_str<'b>(
        &mut self,
        key: Key,
        buf: &'b mut [u8],
    ) -> Result<Option<&'b str>, StorageError> {
        let len = self.get_blob(key, &mut *buf).await?;
        let buf: &'b [u8] = buf;
        match len {
            Some(n) => core::str::from_utf8(&buf[..n])
                .map(Some)
                .map_err(|_| StorageError::Corrupted),
            None => Ok(None),
        }
    }

    async fn set_str(&mut self, key: Key, value: &str) -> Result<(), StorageError> {
        self.set_blob(key, value.as_bytes()).await
    }

    async fn get_i32(&mut self, key: Key) -> Result<Option<i32>, StorageError> {
        let mut raw = [0u8; 4];
        match self.get_blob(key, &mut raw).await? {
            Some(4) => Ok(Some(i32::from_le_bytes(raw))),
            Some(_) => Err(StorageError::Corrupted),
            None => Ok(None),
        }
    }

    async fn set_i32(&mut self, key: Key, value: i32) -> Result<(), StorageError> {
        self.set_blob(key, &value.to_le_bytes()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use std::string::ToString;

    #[test]
    fn keys_render_storage_names() {
        assert_eq!(Key::DeviceCount.to_string(), "bt_count");
        assert_eq!(Key::DeviceAddress(3).to_string(), "bt_3_mac");
        assert_eq!(Key::DeviceName(7).to_string(), "bt_7_name");
    }

    #[test]
    fn key_ids_are_distinct_per_slot() {
        assert_ne!(Key::DeviceAddress(1).id(), Key::DeviceName(1).id());
        assert_ne!(Key::DeviceAddress(1).id(), Key::DeviceAddress(2).id());
        assert_ne!(Key::DeviceCount.id(), Key::DeviceAddress(1).id());
    }

    #[test]
    fn integers_are_stored_little_endian() {
        let mut store = MemoryStore::new();
        block_on(store.set_i32(Key::DeviceCount, 0x0102_0304)).unwrap();
        let mut raw = [0u8; 4];
        assert_eq!(block_on(store.get_blob(Key::DeviceCount, &mut raw)), Ok(Some(4)));
        assert_eq!(raw, [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(block_on(store.get_i32(Key::DeviceCount)), Ok(Some(0x0102_0304)));
    }

    #[test]
    fn wrongly_sized_integer_is_corrupted() {
        let mut store = MemoryStore::new();
        block_on(store.set_blob(Key::DeviceCount, &[1, 2])).unwrap();
        assert_eq!(
            block_on(store.get_i32(Key::DeviceCount)),
            Err(StorageError::Corrupted)
        );
    }

    #[test]
    fn strings_round_through_blobs() {
        let mut store = MemoryStore::new();
        block_on(store.set_str(Key::DeviceName(0), "Pixel 8")).unwrap();
        let mut buf = [0u8; 32];
        let name = block_on(store.get_str(Key::DeviceName(0), &mut buf)).unwrap();
        assert_eq!(name, Some("Pixel 8"));
    }

    #[test]
    fn invalid_utf8_string_is_corrupted() {
        let mut store = MemoryStore::new();
        block_on(store.set_blob(Key::DeviceName(0), &[0xFF, 0xFE])).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(
            block_on(store.get_str(Key::DeviceName(0), &mut buf)),
            Err(StorageError::Corrupted)
        );
    }
}
