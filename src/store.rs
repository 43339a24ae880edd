// store.rs

use std::collections::BTreeMap;

use crc::{Crc, CRC_32_ISCSI};
use log::*;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::*;

pub const SETTINGS_REGION_SIZE: usize = 512;
pub const SETTINGS_HEADER_BYTE: u8 = 0xFA;

// marker byte + u16 document length
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("settings document of {size} bytes does not fit in {capacity} bytes")]
    TooLarge { size: usize, capacity: usize },
    #[error("cannot encode settings: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

impl PersistError {
    fn storage(e: anyhow::Error) -> Self {
        PersistError::Storage(format!("{e:#}"))
    }
}

/// All settings categories plus the durable region they are saved to.
///
/// Record layout in the region:
///
/// ```text
/// [0]          0xFA validity marker
/// [1..3]       document length L, little endian
/// [3..3+L]     JSON document, one object per category
/// [3+L..7+L]   CRC-32 (iSCSI) of the document
/// ```
pub struct SettingsStore {
    categories: BTreeMap<String, SettingsCategory>,
    initialized: bool,
    storage: Box<dyn SettingsStorage>,
}

impl SettingsStore {
    pub fn new(storage: impl SettingsStorage + 'static) -> Self {
        Self {
            categories: BTreeMap::new(),
            initialized: false,
            storage: Box::new(storage),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Creates the category if needed. Modules call this while being
    /// constructed to register their settings.
    pub fn add_category(&mut self, name: &str) -> &mut SettingsCategory {
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| SettingsCategory::new(name))
    }

    pub fn category(&self, name: &str) -> Result<&SettingsCategory, SettingsError> {
        self.categories
            .get(name)
            .ok_or_else(|| SettingsError::UnknownCategory(name.to_string()))
    }

    /// Before `load_all()` unknown categories are created on the fly,
    /// afterwards they are an error.
    pub fn category_mut(&mut self, name: &str) -> Result<&mut SettingsCategory, SettingsError> {
        if !self.initialized {
            return Ok(self.add_category(name));
        }
        match self.categories.get_mut(name) {
            Some(c) => Ok(c),
            None => {
                warn!("Settings: category {name} not found");
                Err(SettingsError::UnknownCategory(name.to_string()))
            }
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = &SettingsCategory> {
        self.categories.values()
    }

    pub fn setting(&self, category: &str, name: &str) -> Option<&Setting> {
        self.categories.get(category)?.setting(name)
    }

    pub fn get<T: SettingType>(&self, category: &str, name: &str) -> Result<T, SettingsError> {
        match self.categories.get(category) {
            Some(c) => c.get(name),
            None => Err(SettingsError::NotFound {
                category: category.to_string(),
                name: name.to_string(),
            }),
        }
    }

    pub fn set<T: SettingType>(
        &mut self,
        category: &str,
        name: &str,
        value: T,
    ) -> Result<(), SettingsError> {
        self.set_value(category, name, value.into_value())
    }

    pub fn set_value(
        &mut self,
        category: &str,
        name: &str,
        value: SettingValue,
    ) -> Result<(), SettingsError> {
        match self.categories.get_mut(category) {
            Some(c) => c.set_value(name, value),
            None => Err(SettingsError::NotFound {
                category: category.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Like `set_value`, but a change that would make the saved record
    /// overflow the storage region is undone and reported as `NoSpace`.
    pub fn set_value_checked(
        &mut self,
        category: &str,
        name: &str,
        value: SettingValue,
    ) -> Result<(), SettingsError> {
        let previous = self
            .setting(category, name)
            .cloned()
            .ok_or_else(|| SettingsError::NotFound {
                category: category.to_string(),
                name: name.to_string(),
            })?;
        self.set_value(category, name, value)?;
        if self.fits() {
            return Ok(());
        }

        if let Some(c) = self.categories.get_mut(category) {
            c.add(name, previous);
        }
        Err(SettingsError::NoSpace {
            category: category.to_string(),
            name: name.to_string(),
            capacity: self.storage.capacity(),
        })
    }

    /// Bytes the current settings take as a stored record.
    pub fn record_len(&self) -> Result<usize, PersistError> {
        let doc = serde_json::to_vec(&self.to_document())?;
        Ok(HEADER_LEN + doc.len() + CRC_LEN)
    }

    /// Whether the current settings can be saved into the storage region.
    pub fn fits(&self) -> bool {
        self.record_len().is_ok_and(|len| {
            len <= self.storage.capacity() && len - HEADER_LEN - CRC_LEN <= usize::from(u16::MAX)
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.categories.values().any(SettingsCategory::is_dirty)
    }

    pub fn total_size(&self) -> usize {
        self.categories.values().map(SettingsCategory::size).sum()
    }

    pub fn to_document(&self) -> Value {
        let map: Map<String, Value> = self
            .categories
            .iter()
            .map(|(name, c)| (name.clone(), c.to_json()))
            .collect();
        Value::Object(map)
    }

    /// Reads stored settings over the compiled-in defaults. A missing or
    /// damaged record is logged and leaves the defaults in place.
    pub fn load_all(&mut self) {
        self.initialized = true;

        let doc = match self.read_record() {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(e) => {
                error!("Settings: {e}");
                return;
            }
        };

        let Value::Object(root) = doc else {
            error!("Settings: stored document is not an object");
            return;
        };

        for (name, value) in root.iter() {
            let Some(category) = self.categories.get_mut(name) else {
                debug!("Settings: ignoring unknown category {name}");
                continue;
            };
            match value.as_object() {
                Some(obj) => category.load_json(obj),
                None => warn!("Settings: category {name} is not an object"),
            }
        }
        info!("Settings: loaded {n} categories", n = root.len());
    }

    fn read_record(&mut self) -> Result<Option<Value>, String> {
        let capacity = self.storage.capacity();
        if capacity < HEADER_LEN + CRC_LEN {
            return Err(format!("storage of {capacity} bytes is too small"));
        }

        let mut header = [0u8; HEADER_LEN];
        self.storage
            .read(0, &mut header)
            .map_err(|e| format!("cannot read header: {e:#}"))?;
        if header[0] != SETTINGS_HEADER_BYTE {
            info!("Settings: invalid header {h}, using defaults", h = header[0]);
            return Ok(None);
        }

        let len = usize::from(u16::from_le_bytes([header[1], header[2]]));
        if len == 0 {
            info!("Settings: no settings found");
            return Ok(None);
        }
        if HEADER_LEN + len + CRC_LEN > capacity {
            return Err(format!("document length {len} exceeds storage"));
        }

        let mut body = vec![0u8; len + CRC_LEN];
        self.storage
            .read(HEADER_LEN, &mut body)
            .map_err(|e| format!("cannot read document: {e:#}"))?;
        let (doc, crc) = body.split_at(len);
        let stored_crc = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if CRC32.checksum(doc) != stored_crc {
            return Err("checksum mismatch, using defaults".to_string());
        }

        serde_json::from_slice(doc)
            .map(Some)
            .map_err(|e| format!("error deserializing JSON: {e}"))
    }

    /// Writes every category when anything is dirty. Returns whether a
    /// write happened. Dirty flags are cleared only after a good commit.
    pub fn save_all(&mut self) -> Result<bool, PersistError> {
        if !self.is_dirty() {
            return Ok(false);
        }

        let doc = serde_json::to_vec(&self.to_document())?;
        let capacity = self.storage.capacity();
        let size = HEADER_LEN + doc.len() + CRC_LEN;
        if size > capacity || doc.len() > usize::from(u16::MAX) {
            return Err(PersistError::TooLarge { size, capacity });
        }

        let mut record = Vec::with_capacity(size);
        record.push(SETTINGS_HEADER_BYTE);
        record.extend_from_slice(&(doc.len() as u16).to_le_bytes());
        record.extend_from_slice(&doc);
        record.extend_from_slice(&CRC32.checksum(&doc).to_le_bytes());

        self.storage.write(0, &record).map_err(PersistError::storage)?;
        if let Err(e) = self.storage.commit() {
            error!("Settings: commit failed: {e:#}");
            return Err(PersistError::storage(e));
        }

        self.categories
            .values_mut()
            .for_each(SettingsCategory::mark_clean);
        info!("Settings: saved {sz} bytes", sz = record.len());
        Ok(true)
    }

    /// Invalidates the stored record and restarts. In-memory values are
    /// not saved first.
    pub fn factory_reset(&mut self, system: &mut dyn SystemControl) {
        warn!("Settings: factory reset");
        if let Err(e) = self.storage.write(0, &[0]) {
            error!("Settings: cannot clear header: {e:#}");
        } else if let Err(e) = self.storage.commit() {
            error!("Settings: commit failed: {e:#}");
        }
        system.restart();
    }
}


// EOF
