//! Version and restore-image resolution.
//!
//! Lookup tables mapping numeric system versions to semantic versions and
//! platform ids to the restore images published for them. The tables are
//! small and loaded once per staging pass, so every lookup is a linear scan
//! returning an `Option` for "not found".

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Platform id of the tracker-class hardware.
pub const TRACKER_PLATFORM_ID: u16 = 26;

/// First system version whose tracker builds require an NCP upgrade.
pub const NCP_UPGRADE_MIN_SYSTEM_VERSION: u32 = 3000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Unknown system version {0}")]
    UnknownSemVer(String),

    #[error("Unknown platform id {0}")]
    UnknownPlatform(u16),

    #[error("No restore image for platform {platform_id} at system version {system_version} or later")]
    NoRestoreImage {
        platform_id: u16,
        system_version: u32,
    },
}

/// One row of the version table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub sys: u32,
    #[serde(rename = "semVer")]
    pub sem_ver: String,
}

/// Numeric system version <-> semantic version table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTable {
    pub versions: Vec<VersionEntry>,
}

impl VersionTable {
    pub fn new(versions: Vec<VersionEntry>) -> Self {
        Self { versions }
    }

    pub fn system_version_to_sem_ver(&self, sys: u32) -> Option<&str> {
        self.versions
            .iter()
            .find(|v| v.sys == sys)
            .map(|v| v.sem_ver.as_str())
    }

    pub fn sem_ver_to_system_version(&self, sem_ver: &str) -> Option<u32> {
        self.versions
            .iter()
            .find(|v| v.sem_ver == sem_ver)
            .map(|v| v.sys)
    }
}

/// A hardware platform as published in the restore catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub id: u16,
    pub name: String,
    #[serde(rename = "gen")]
    pub generation: u8,
}

impl PlatformInfo {
    pub fn is_tracker(&self) -> bool {
        self.id == TRACKER_PLATFORM_ID
    }
}

/// Catalog of restore images published per platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreCatalog {
    pub platforms: Vec<PlatformInfo>,
    #[serde(default)]
    pub versions_zip_by_platform: HashMap<String, Vec<String>>,
}

impl RestoreCatalog {
    pub fn platform(&self, platform_id: u16) -> Option<&PlatformInfo> {
        self.platforms.iter().find(|p| p.id == platform_id)
    }

    pub fn platform_id_to_name(&self, platform_id: u16) -> Option<&str> {
        self.platform(platform_id).map(|p| p.name.as_str())
    }

    /// Least restore version whose system version is `>= sys_ver`.
    ///
    /// An exact match wins when present. Entries unknown to the version table
    /// are skipped.
    pub fn find_restore_sem_ver(
        &self,
        versions: &VersionTable,
        platform_id: u16,
        sys_ver: u32,
    ) -> Option<&str> {
        let name = self.platform_id_to_name(platform_id)?;
        self.versions_zip_by_platform
            .get(name)?
            .iter()
            .filter_map(|sem_ver| {
                let sys = versions.sem_ver_to_system_version(sem_ver)?;
                (sys >= sys_ver).then_some((sys, sem_ver.as_str()))
            })
            .min_by_key(|(sys, _)| *sys)
            .map(|(_, sem_ver)| sem_ver)
    }
}

/// Resolved (system version, semantic version, restore image version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTriple {
    pub system_version: u32,
    pub sem_ver: Option<String>,
    pub restore_sem_ver: String,
}

impl VersionTriple {
    /// Whether the restore image is an exact match for the system version.
    pub fn is_exact(&self) -> bool {
        self.sem_ver.as_deref() == Some(self.restore_sem_ver.as_str())
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "system {} ({}), restore {}",
            self.system_version,
            self.sem_ver.as_deref().unwrap_or("unknown"),
            self.restore_sem_ver
        )
    }
}

/// Resolve the version triple for a firmware binary.
///
/// `dependency_version` is the system version the binary declares;
/// `force_sem_ver` overrides it when set.
pub fn resolve_triple(
    catalog: &RestoreCatalog,
    versions: &VersionTable,
    platform_id: u16,
    dependency_version: u32,
    force_sem_ver: Option<&str>,
) -> Result<VersionTriple, ResolveError> {
    let system_version = match force_sem_ver {
        Some(sem_ver) => versions
            .sem_ver_to_system_version(sem_ver)
            .ok_or_else(|| ResolveError::UnknownSemVer(sem_ver.to_string()))?,
        None => dependency_version,
    };

    if catalog.platform(platform_id).is_none() {
        return Err(ResolveError::UnknownPlatform(platform_id));
    }

    let restore_sem_ver = catalog
        .find_restore_sem_ver(versions, platform_id, system_version)
        .ok_or(ResolveError::NoRestoreImage {
            platform_id,
            system_version,
        })?;

    Ok(VersionTriple {
        system_version,
        sem_ver: versions
            .system_version_to_sem_ver(system_version)
            .map(str::to_string),
        restore_sem_ver: restore_sem_ver.to_string(),
    })
}

/// Whether a device needs its radio coprocessor upgraded before use.
pub fn needs_ncp_upgrade(platform: &PlatformInfo, system_version: u32) -> bool {
    platform.is_tracker() && system_version >= NCP_UPGRADE_MIN_SYSTEM_VERSION
}
