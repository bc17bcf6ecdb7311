//! Firmware module metadata.
//!
//! Every firmware binary starts with a 24-byte module prefix describing where
//! it lives in flash and which system version it depends on. The restore
//! catalog publishes the same information per part name as JSON; both end up
//! as [`ModuleRecord`]s keyed by part name in a [`ModuleInfoMap`].

use std::collections::HashMap;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Module flag: the prefix must be stripped before flashing.
pub const MODULE_FLAG_DROP_MODULE_INFO: u8 = 0x01;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Invalid start address {0:?}")]
    InvalidStartAddress(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Module prefix (24 bytes / 0x18), little-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModulePrefix {
    pub start_address: u32,
    pub end_address: u32,
    pub flags: u8,
    pub module_version: u16,
    pub platform_id: u16,
    pub function: u8,
    pub index: u8,
    pub dep_function: u8,
    pub dep_index: u8,
    pub dep_version: u16,
    pub dep2_function: u8,
    pub dep2_index: u8,
    pub dep2_version: u16,
}

impl ModulePrefix {
    pub const SIZE: usize = 24;

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let start_address = cursor.read_u32::<LittleEndian>()?;
        let end_address = cursor.read_u32::<LittleEndian>()?;
        let _reserved = cursor.read_u8()?;
        Ok(Self {
            start_address,
            end_address,
            flags: cursor.read_u8()?,
            module_version: cursor.read_u16::<LittleEndian>()?,
            platform_id: cursor.read_u16::<LittleEndian>()?,
            function: cursor.read_u8()?,
            index: cursor.read_u8()?,
            dep_function: cursor.read_u8()?,
            dep_index: cursor.read_u8()?,
            dep_version: cursor.read_u16::<LittleEndian>()?,
            dep2_function: cursor.read_u8()?,
            dep2_index: cursor.read_u8()?,
            dep2_version: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn drops_module_info(&self) -> bool {
        self.flags & MODULE_FLAG_DROP_MODULE_INFO != 0
    }
}

/// Prefix fields as published in the restore catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixInfo {
    /// Hex string, with or without a `0x` prefix.
    pub module_start_addy: String,
    #[serde(default)]
    pub module_flags: u8,
    #[serde(default, rename = "platformID")]
    pub platform_id: u16,
    #[serde(default)]
    pub module_version: u16,
    #[serde(default)]
    pub dep_module_version: u16,
}

impl PrefixInfo {
    pub fn start_address(&self) -> Result<u32, HeaderError> {
        let s = self.module_start_addy.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u32::from_str_radix(digits, 16)
            .map_err(|_| HeaderError::InvalidStartAddress(self.module_start_addy.clone()))
    }

    pub fn drops_module_info(&self) -> bool {
        self.module_flags & MODULE_FLAG_DROP_MODULE_INFO != 0
    }
}

impl From<&ModulePrefix> for PrefixInfo {
    fn from(prefix: &ModulePrefix) -> Self {
        Self {
            module_start_addy: format!("{:x}", prefix.start_address),
            module_flags: prefix.flags,
            platform_id: prefix.platform_id,
            module_version: prefix.module_version,
            dep_module_version: prefix.dep_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRecord {
    pub prefix_info: PrefixInfo,
}

/// Module metadata keyed by part name (`system-part1`, `bootloader`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleInfoMap(pub HashMap<String, ModuleRecord>);

impl ModuleInfoMap {
    /// Parse the catalog JSON, rejecting records whose start address is not hex.
    pub fn from_json(data: &[u8]) -> anyhow::Result<Self> {
        let map: Self = serde_json::from_slice(data)?;
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<(), HeaderError> {
        for record in self.0.values() {
            record.prefix_info.start_address()?;
        }
        Ok(())
    }

    pub fn get(&self, part: &str) -> Option<&ModuleRecord> {
        self.0.get(part)
    }

    pub fn insert(&mut self, part: impl Into<String>, record: ModuleRecord) {
        self.0.insert(part.into(), record);
    }

    pub fn contains(&self, part: &str) -> bool {
        self.0.contains_key(part)
    }
}
