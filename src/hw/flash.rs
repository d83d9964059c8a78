//! Registry storage in the nRF52840's internal flash.
//!
//! Each [`Key`] is a `u16` item in a `sequential-storage` map spread over
//! the pages reserved in `config`. The map handles wear levelling and GC;
//! every store is durable once it returns, so `commit` has nothing to flush.

use core::ops::Range;

use bt_door_key::config::{STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START};
use bt_door_key::error::StorageError;
use bt_door_key::storage::{Key, KeyValueStore};
use defmt::{debug, error};
use embedded_storage_async::nor_flash::NorFlash;
use sequential_storage::cache::NoCache;
use sequential_storage::map::{fetch_item, remove_item, store_item};

/// Flash page size for nRF52840 (4 KB).
const FLASH_PAGE_SIZE: u32 = 4096;

const STORAGE_START: u32 = STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE;
const STORAGE_END: u32 = (STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE;

/// Scratch space for one map item (key + value + header).
const ITEM_BUF_LEN: usize = 128;

pub struct FlashStore<F> {
    flash: F,
    range: Range<u32>,
    buf: [u8; ITEM_BUF_LEN],
}

impl<F: NorFlash> FlashStore<F> {
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            range: STORAGE_START..STORAGE_END,
            buf: [0; ITEM_BUF_LEN],
        }
    }
}

fn storage_error<E: core::fmt::Debug>(key: Key, e: sequential_storage::Error<E>) -> StorageError {
    error!("flash: {} failed: {:?}", key, defmt::Debug2Format(&e));
    match e {
        sequential_storage::Error::Corrupted { .. } => StorageError::Corrupted,
        sequential_storage::Error::BufferTooSmall(_) => StorageError::BufferTooSmall,
        _ => StorageError::Io,
    }
}

impl<F: NorFlash> KeyValueStore for FlashStore<F> {
    async fn get_blob(&mut self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
        let item = fetch_item::<u16, &[u8], _>(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            &key.id(),
        )
        .await
        .map_err(|e| storage_error(key, e))?;

        let Some(data) = item else {
            return Ok(None);
        };
        let dst = buf
            .get_mut(..data.len())
            .ok_or(StorageError::BufferTooSmall)?;
        dst.copy_from_slice(data);
        Ok(Some(data.len()))
    }

    async fn set_blob(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError> {
        store_item::<u16, &[u8], _>(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            &key.id(),
            &data,
        )
        .await
        .map_err(|e| storage_error(key, e))?;
        debug!("flash: stored {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn erase(&mut self, key: Key) -> Result<bool, StorageError> {
        let mut scratch = [0u8; ITEM_BUF_LEN];
        let existed = self.get_blob(key, &mut scratch).await?.is_some();
        if !existed {
            return Ok(false);
        }
        remove_item::<u16, _>(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            &key.id(),
        )
        .await
        .map_err(|e| storage_error(key, e))?;
        debug!("flash: erased {}", key);
        Ok(true)
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
