//! Persistent registry of paired companion devices.
//!
//! Records live in a [`KeyValueStore`] and are mirrored into an in-memory
//! slot table so lookups never touch flash once [`Registry::load`] has run.
//!
//! Slot policy:
//!   - A record is written at slot `bt_count`, then `bt_count` is bumped.
//!   - Removing a record leaves a hole; holes are never compacted.
//!   - Once `bt_count` reaches capacity, `add` fills the lowest hole and
//!     `bt_count` stays put.
//!   - Removing the highest live slot trims trailing holes and lowers
//!     `bt_count`, so that index range becomes available again.
//!   - [`Registry::count`] is the number of live records, not `bt_count`.
//!
//! A failed write is never reflected in the cache: the record only appears
//! once every key for it and the count have been persisted. Keys already
//! written by a failed `add` are erased again and the count restored.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::bt::{device_name, BdAddr, DeviceName};
use crate::config::{DEVICE_NAME_LEN, MAX_PAIRED_DEVICES};
use crate::error::{Error, Result, StorageError};
use crate::storage::{Key, KeyValueStore};

/// Capacity of the comma-joined address list (17 chars + separator each).
pub const ADDRESS_LIST_LEN: usize = MAX_PAIRED_DEVICES * 18;

/// Comma-joined `AA:BB:CC:DD:EE:FF` list.
pub type AddressList = String<ADDRESS_LIST_LEN>;

/// A paired companion device.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceRecord {
    pub address: BdAddr,
    pub name: DeviceName,
}

impl DeviceRecord {
    pub fn new(address: BdAddr, name: &str) -> Self {
        Self {
            address,
            name: device_name(name),
        }
    }
}

pub struct Registry<S> {
    store: S,
    /// Slot table; `None` marks a hole. `slots.len()` mirrors `bt_count`.
    slots: Vec<Option<DeviceRecord>, MAX_PAIRED_DEVICES>,
    loaded: bool,
}

impl<S: KeyValueStore> Registry<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            slots: Vec::new(),
            loaded: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Give back the underlying store (e.g. to re-open it after a restart).
    pub fn into_store(self) -> S {
        self.store
    }

    /// Rebuild the cache from storage.
    ///
    /// A missing count is initialised to 0. On error the previous cache is
    /// kept as-is.
    pub async fn load(&mut self) -> Result<()> {
        let stored = match self.store.get_i32(Key::DeviceCount).await? {
            Some(count) => count,
            None => {
                info!("registry: no device count stored, initialising");
                self.store.set_i32(Key::DeviceCount, 0).await?;
                self.store.commit().await?;
                0
            }
        };
        let slot_count = clamp_slot_count(stored);

        let mut fresh = Vec::new();
        for index in 0..slot_count {
            let record = self.read_slot(index).await?;
            // Cannot overflow: slot_count <= MAX_PAIRED_DEVICES.
            let _ = fresh.push(record);
        }

        self.slots = fresh;
        self.loaded = true;
        info!(
            "registry: loaded {} devices ({} slots)",
            self.count(),
            slot_count
        );
        Ok(())
    }

    /// Number of live records.
    pub fn count(&self) -> u32 {
        self.records().count() as u32
    }

    /// Number of slots in use, holes included (the persisted `bt_count`).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Live records in slot order.
    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.slots.iter().flatten()
    }

    /// The `ordinal`-th live record, skipping holes.
    pub fn nth(&self, ordinal: usize) -> Option<&DeviceRecord> {
        self.records().nth(ordinal)
    }

    /// Record stored at slot `index`, if that slot is live.
    pub fn slot(&self, index: usize) -> Option<&DeviceRecord> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub async fn find_by_address(&mut self, address: BdAddr) -> Result<Option<DeviceRecord>> {
        if self.loaded {
            return Ok(self.records().find(|r| r.address == address).cloned());
        }

        debug!("registry: not loaded, reading storage for {}", address);
        let slot_count = self.persisted_slot_count().await?;
        for index in 0..slot_count {
            if let Some(record) = self.read_slot(index).await? {
                if record.address == address {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    pub async fn exists(&mut self, address: BdAddr) -> Result<bool> {
        Ok(self.find_by_address(address).await?.is_some())
    }

    /// Append a record at the next free slot.
    pub async fn add(&mut self, address: BdAddr, name: &str) -> Result<()> {
        self.ensure_loaded().await?;
        if self.position(address).is_some() {
            return Err(Error::AlreadyRegistered);
        }
        let Some((index, appended)) = self.free_slot() else {
            warn!("registry: full, cannot add {}", address);
            return Err(Error::RegistryFull);
        };

        let record = DeviceRecord::new(address, name);
        if let Err(e) = self.write_slot(index, &record, appended).await {
            error!("registry: adding {} failed: {}", address, e);
            self.roll_back_slot(index, appended).await;
            return Err(e);
        }

        if appended {
            let _ = self.slots.push(Some(record));
        } else {
            self.slots[index] = Some(record);
        }
        info!("registry: added {} at slot {}", address, index);
        Ok(())
    }

    pub async fn update_name(&mut self, address: BdAddr, name: &str) -> Result<()> {
        self.ensure_loaded().await?;
        let index = self.position(address).ok_or(Error::NotFound)?;
        let name = device_name(name);
        let key = Key::DeviceName(index as u8);

        let written = match self.store.set_str(key, &name).await {
            Ok(()) => self.store.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Some(Some(old)) = self.slots.get(index) {
                let old = old.name.clone();
                let restored = match self.store.set_str(key, &old).await {
                    Ok(()) => self.store.commit().await,
                    Err(e) => Err(e),
                };
                if restored.is_err() {
                    error!("registry: restoring name of {} failed", address);
                }
            }
            return Err(e.into());
        }

        if let Some(Some(record)) = self.slots.get_mut(index) {
            record.name = name;
        }
        info!("registry: renamed {}", address);
        Ok(())
    }

    pub async fn remove(&mut self, address: BdAddr) -> Result<()> {
        self.ensure_loaded().await?;
        let index = self.position(address).ok_or(Error::NotFound)?;
        self.remove_slot(index).await
    }

    /// Remove the first record whose name matches exactly. Returns its address.
    pub async fn remove_by_name(&mut self, name: &str) -> Result<BdAddr> {
        self.ensure_loaded().await?;
        let (index, address) = self
            .slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match slot {
                Some(r) if r.name.as_str() == name => Some((i, r.address)),
                _ => None,
            })
            .ok_or(Error::NotFound)?;
        self.remove_slot(index).await?;
        Ok(address)
    }

    /// Remove the record at slot `index`.
    pub async fn remove_at(&mut self, index: usize) -> Result<()> {
        self.ensure_loaded().await?;
        if self.slot(index).is_none() {
            return Err(Error::NotFound);
        }
        self.remove_slot(index).await
    }

    /// Erase every record and the count. Calling it again is not an error.
    pub async fn remove_all(&mut self) -> Result<()> {
        for index in 0..MAX_PAIRED_DEVICES {
            let slot = index as u8;
            self.store.erase(Key::DeviceAddress(slot)).await?;
            if let Some(entry) = self.slots.get_mut(index) {
                *entry = None;
            }
            self.store.erase(Key::DeviceName(slot)).await?;
        }
        self.store.erase(Key::DeviceCount).await?;
        self.store.commit().await?;

        self.slots.clear();
        self.loaded = true;
        info!("registry: all devices removed");
        Ok(())
    }

    /// Comma-joined addresses of every live record, in slot order.
    pub fn list_addresses_as_text(&self) -> AddressList {
        let mut out = AddressList::new();
        for (i, record) in self.records().enumerate() {
            if i > 0 {
                let _ = out.push(',');
            }
            let _ = write!(out, "{}", record.address);
        }
        out
    }

    async fn ensure_loaded(&mut self) -> Result<()> {
        if !self.loaded {
            self.load().await?;
        }
        Ok(())
    }

    fn position(&self, address: BdAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(r) if r.address == address))
    }

    async fn persisted_slot_count(&mut self) -> Result<usize> {
        let stored = self.store.get_i32(Key::DeviceCount).await?.unwrap_or(0);
        Ok(clamp_slot_count(stored))
    }

    async fn read_slot(&mut self, index: usize) -> Result<Option<DeviceRecord>> {
        let slot = index as u8;
        let mut mac = [0u8; 6];
        match self.store.get_blob(Key::DeviceAddress(slot), &mut mac).await {
            Ok(Some(6)) => {}
            Ok(None) => return Ok(None),
            Ok(Some(_)) | Err(StorageError::BufferTooSmall) => {
                warn!("registry: slot {} has a malformed address, skipping", index);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let mut buf = [0u8; DEVICE_NAME_LEN];
        let name = match self.store.get_str(Key::DeviceName(slot), &mut buf).await {
            Ok(Some(name)) => device_name(name),
            Ok(None) => DeviceName::new(),
            Err(StorageError::BufferTooSmall | StorageError::Corrupted) => {
                warn!("registry: slot {} has an unreadable name", index);
                DeviceName::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(DeviceRecord {
            address: BdAddr::new(mac),
            name,
        }))
    }

    /// Next slot for a new record: append while `bt_count` is below
    /// capacity, otherwise the lowest hole. The flag tells which.
    fn free_slot(&self) -> Option<(usize, bool)> {
        let used = self.slots.len();
        if used < MAX_PAIRED_DEVICES {
            return Some((used, true));
        }
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|index| (index, false))
    }

    async fn write_slot(&mut self, index: usize, record: &DeviceRecord, appended: bool) -> Result<()> {
        let slot = index as u8;
        self.store
            .set_blob(Key::DeviceAddress(slot), &record.address.bytes())
            .await?;
        self.store.set_str(Key::DeviceName(slot), &record.name).await?;
        if appended {
            self.store
                .set_i32(Key::DeviceCount, (index + 1) as i32)
                .await?;
        }
        self.store.commit().await?;
        Ok(())
    }

    /// Put slot `index` back to empty after a failed `write_slot`.
    async fn roll_back_slot(&mut self, index: usize, appended: bool) {
        if let Err(e) = self.clear_slot(index, appended).await {
            error!("registry: rollback of slot {} failed: {}", index, e);
        }
    }

    async fn clear_slot(&mut self, index: usize, appended: bool) -> Result<(), StorageError> {
        let slot = index as u8;
        self.store.erase(Key::DeviceAddress(slot)).await?;
        self.store.erase(Key::DeviceName(slot)).await?;
        if appended {
            self.store.set_i32(Key::DeviceCount, index as i32).await?;
        }
        self.store.commit().await
    }

    async fn remove_slot(&mut self, index: usize) -> Result<()> {
        let slot = index as u8;

        // The address key is what makes a slot live.
        self.store.erase(Key::DeviceAddress(slot)).await?;
        self.slots[index] = None;
        self.store.erase(Key::DeviceName(slot)).await?;

        let used = self
            .slots
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |i| i + 1);
        if used < self.slots.len() {
            self.store.set_i32(Key::DeviceCount, used as i32).await?;
            self.slots.truncate(used);
        }
        self.store.commit().await?;

        info!("registry: removed slot {}, {} devices left", index, self.count());
        Ok(())
    }
}

fn clamp_slot_count(stored: i32) -> usize {
    if stored < 0 {
        warn!("registry: negative device count {}, treating as 0", stored);
        return 0;
    }
    let count = stored as usize;
    if count > MAX_PAIRED_DEVICES {
        warn!(
            "registry: stored count {} exceeds capacity {}",
            count,
            MAX_PAIRED_DEVICES
        );
        return MAX_PAIRED_DEVICES;
    }
    count
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
