//! Staging: everything that depends on the configuration but not on the
//! attached device.
//!
//! Catalogs, the product firmware binary, the restore image and the resolved
//! versions are cached in the staging directory. `savedData.json` records the
//! configuration hash they were produced for; a different hash clears the
//! directory.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::catalog::{PlatformInfo, RestoreCatalog, VersionTable, VersionTriple, needs_ncp_upgrade, resolve_triple};
use crate::cloud::{AssetSource, CloudApi, Product, ProductFirmware};
use crate::config::ProvisionConfig;
use crate::module_info::{ModuleInfoMap, ModulePrefix, ModuleRecord, PrefixInfo};
use crate::plan::{FlashPlan, NCP_PARTS, PRIMARY_PARTS, PlanTarget, build_plan, write_marker_binaries};

pub const SAVED_DATA_FILE: &str = "savedData.json";
pub const FIRMWARE_FILE: &str = "firmware.bin";
pub const RESTORE_ZIP_FILE: &str = "restore.zip";

/// Cached staging state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedData {
    pub config_hash: String,
    #[serde(default)]
    pub device_restore_info: Option<RestoreCatalog>,
    #[serde(default)]
    pub version_info: Option<VersionTable>,
    #[serde(default)]
    pub firmware_versions: Vec<ProductFirmware>,
    #[serde(default)]
    pub default_firmware_version: Option<u32>,
    #[serde(default)]
    pub firmware_version: Option<u32>,
    #[serde(default)]
    pub triple: Option<VersionTriple>,
    #[serde(default)]
    pub platform_info: Option<PlatformInfo>,
    #[serde(default)]
    pub should_upgrade_tracker_ncp: bool,
    #[serde(default)]
    pub module_info: Option<ModuleInfoMap>,
}

/// Staging directory plus its saved data.
pub struct StagingArea {
    dir: PathBuf,
    data: SavedData,
}

impl StagingArea {
    /// Open `dir`, clearing it if it was staged for another configuration.
    pub fn open(dir: impl Into<PathBuf>, config_hash: &str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating staging dir {}", dir.display()))?;

        let saved_path = dir.join(SAVED_DATA_FILE);
        let loaded = match std::fs::read(&saved_path) {
            Ok(bytes) => match serde_json::from_slice::<SavedData>(&bytes) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(error = %e, "Failed to load saved data, recreating");
                    None
                }
            },
            Err(_) => None,
        };

        let data = match loaded {
            Some(data) if data.config_hash == config_hash => data,
            Some(_) => {
                info!("Config changed, recreating staging directory");
                std::fs::remove_dir_all(&dir)?;
                std::fs::create_dir_all(&dir)?;
                SavedData::default()
            }
            None => SavedData::default(),
        };

        Ok(Self {
            dir,
            data: SavedData {
                config_hash: config_hash.to_string(),
                ..data
            },
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn data(&self) -> &SavedData {
        &self.data
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(self.path(SAVED_DATA_FILE), text)?;
        Ok(())
    }
}

/// Result of staging: what every device run needs.
#[derive(Debug, Clone)]
pub struct StagedFirmware {
    pub product: Product,
    pub platform: PlatformInfo,
    pub triple: VersionTriple,
    pub firmware_version: u32,
    pub should_upgrade_ncp: bool,
    pub primary_plan: FlashPlan,
    /// Radio coprocessor plan, when the target needs an upgrade.
    pub ncp_plan: Option<FlashPlan>,
}

async fn fetch_json<T: DeserializeOwned, A: AssetSource>(assets: &A, path: &str) -> Result<T> {
    let bytes = assets
        .fetch(path)
        .await
        .with_context(|| format!("error downloading {path}"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("error parsing {path}"))
}

fn read_prefix(path: &Path) -> Result<ModulePrefix> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ModulePrefix::from_bytes(&data)?)
}

/// Fetch, resolve and cache everything needed to flash devices of the
/// configured product.
#[instrument(skip_all, fields(product = config.product_id))]
pub async fn stage_firmware<C, A>(config: &ProvisionConfig, cloud: &C, assets: &A) -> Result<StagedFirmware>
where
    C: CloudApi,
    A: AssetSource,
{
    let mut staging = StagingArea::open(&config.staging_dir, &config.config_hash())?;

    let product = cloud
        .get_product()
        .await
        .context("failed to retrieve product info (typically bad access token or product id)")?;

    if staging.data.device_restore_info.is_none() {
        staging.data.device_restore_info = Some(fetch_json(assets, "deviceRestore.json").await?);
        staging.save()?;
    }
    if staging.data.version_info.is_none() {
        staging.data.version_info = Some(fetch_json(assets, "versionInfo.json").await?);
        staging.save()?;
    }

    let firmware_versions = cloud
        .list_product_firmware()
        .await
        .context("failed to list product firmware")?;
    staging.data.default_firmware_version = firmware_versions
        .iter()
        .filter(|f| f.product_default)
        .map(|f| f.version)
        .last();
    staging.data.firmware_versions = firmware_versions;
    staging.save()?;

    let firmware_path = staging.path(FIRMWARE_FILE);
    let has_firmware_record = staging
        .data
        .module_info
        .as_ref()
        .is_some_and(|m| m.contains("firmware"));

    if !firmware_path.exists() || !has_firmware_record || staging.data.triple.is_none() {
        let Some(version) = config.firmware_version.or(staging.data.default_firmware_version) else {
            bail!("firmware_version not set and no product default firmware");
        };

        let binary = cloud
            .download_product_firmware(version)
            .await
            .with_context(|| format!("failed to download firmware version {version}"))?;
        info!(version, "Using firmware version");
        std::fs::write(&firmware_path, &binary)?;

        let prefix = ModulePrefix::from_bytes(&binary).context("reading firmware module prefix")?;
        let catalog = staging.data.device_restore_info.as_ref().context("restore catalog missing")?;
        let versions = staging.data.version_info.as_ref().context("version table missing")?;

        let triple = resolve_triple(
            catalog,
            versions,
            prefix.platform_id,
            u32::from(prefix.dep_version),
            config.force_system_version.as_deref(),
        )?;
        if !triple.is_exact() {
            warn!(
                "Not an exact system match, using {} instead of {}",
                triple.restore_sem_ver,
                triple.sem_ver.as_deref().unwrap_or("unknown")
            );
        }

        let platform = catalog
            .platform(prefix.platform_id)
            .cloned()
            .context("firmware platform is not in the restore catalog")?;

        staging.data.should_upgrade_tracker_ncp = needs_ncp_upgrade(&platform, triple.system_version);
        staging.data.platform_info = Some(platform);
        staging.data.triple = Some(triple);
        staging.data.firmware_version = Some(version);
        // Module info is fetched for the restore image of this triple
        staging.data.module_info = None;
        staging.save()?;
    }

    let triple = staging.data.triple.clone().context("version triple missing")?;
    let platform = staging.data.platform_info.clone().context("platform info missing")?;

    if staging.data.module_info.is_none() {
        let path = format!("device-restore/{}/{}.json", triple.restore_sem_ver, platform.name);
        let bytes = assets
            .fetch(&path)
            .await
            .with_context(|| format!("error downloading module info {path}"))?;
        let mut modules = ModuleInfoMap::from_json(&bytes)?;

        let prefix = read_prefix(&firmware_path)?;
        modules.insert(
            "firmware",
            ModuleRecord {
                prefix_info: PrefixInfo::from(&prefix),
            },
        );
        staging.data.module_info = Some(modules);
        staging.save()?;
    }

    let zip_path = staging.path(RESTORE_ZIP_FILE);
    if !zip_path.exists() {
        let path = format!("device-restore/{}/{}.zip", triple.restore_sem_ver, platform.name);
        let bytes = assets
            .fetch(&path)
            .await
            .with_context(|| format!("error downloading restore zip {path}"))?;
        std::fs::write(&zip_path, &bytes)?;

        let dir = staging.dir().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
            archive.extract(&dir)?;
            Ok(())
        })
        .await??;
        info!(restore = %triple.restore_sem_ver, platform = %platform.name, "Restore image extracted");
    }

    write_marker_binaries(staging.dir())?;

    let modules = staging.data.module_info.as_ref().context("module info missing")?;
    let target = PlanTarget {
        generation: platform.generation,
        platform_id: platform.id,
    };
    let primary_plan = build_plan(PRIMARY_PARTS, modules, target, staging.dir())?;
    let should_upgrade_ncp = staging.data.should_upgrade_tracker_ncp;
    let ncp_plan = if should_upgrade_ncp {
        Some(build_plan(NCP_PARTS, modules, target, staging.dir())?)
    } else {
        None
    };

    let firmware_version = staging.data.firmware_version.context("firmware version missing")?;
    info!(triple = %triple, parts = primary_plan.len(), "Staging complete");

    Ok(StagedFirmware {
        product,
        platform,
        triple,
        firmware_version,
        should_upgrade_ncp,
        primary_plan,
        ncp_plan,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Staging inputs shared by staging and orchestrator tests.

    use std::io::Write;

    use byteorder::{LittleEndian, WriteBytesExt};
    use serde_json::json;

    use crate::cloud::{MemoryAssets, MockCloud};

    /// Firmware image with a module prefix declaring `dep_version`.
    pub fn firmware_binary(platform_id: u16, dep_version: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(0x000d_4000).unwrap();
        buf.write_u32::<LittleEndian>(0x000f_4000).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u16::<LittleEndian>(5).unwrap();
        buf.write_u16::<LittleEndian>(platform_id).unwrap();
        buf.extend_from_slice(&[5, 1, 4, 1]);
        buf.write_u16::<LittleEndian>(dep_version).unwrap();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(b"user code");
        buf
    }

    fn restore_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options =
            zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for name in ["system-part1.bin", "bootloader.bin", "softdevice.bin", "ncp.bin"] {
            writer.start_file(name, options).unwrap();
            writer.write_all(&[0u8; 32]).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Assets for platform `platform_id` (generation 3) with restore images
    /// 2.3.0 and 4.0.0.
    pub fn assets(platform_id: u16, platform_name: &str) -> MemoryAssets {
        let assets = MemoryAssets::new();
        assets.insert(
            "deviceRestore.json",
            json!({
                "platforms": [{"id": platform_id, "name": platform_name, "gen": 3}],
                "versionsZipByPlatform": {platform_name: ["2.3.0", "4.0.0"]}
            })
            .to_string(),
        );
        assets.insert(
            "versionInfo.json",
            json!({"versions": [
                {"sys": 2300, "semVer": "2.3.0"},
                {"sys": 3000, "semVer": "3.0.0"},
                {"sys": 4000, "semVer": "4.0.0"}
            ]})
            .to_string(),
        );
        let modules = json!({
            "system-part1": {"prefixInfo": {"moduleStartAddy": "30000", "moduleFlags": 0}},
            "bootloader": {"prefixInfo": {"moduleStartAddy": "f4000", "moduleFlags": 0}},
            "softdevice": {"prefixInfo": {"moduleStartAddy": "1000", "moduleFlags": 1}},
            "ncp": {"prefixInfo": {"moduleStartAddy": "0", "moduleFlags": 0}}
        })
        .to_string();
        for version in ["2.3.0", "4.0.0"] {
            assets.insert(&format!("device-restore/{version}/{platform_name}.json"), modules.clone());
            assets.insert(&format!("device-restore/{version}/{platform_name}.zip"), restore_zip());
        }
        assets
    }

    /// Cloud with product 1234 on `platform_id` and default firmware v3.
    pub fn cloud(platform_id: u16, dep_version: u16) -> MockCloud {
        let cloud = MockCloud::new().with_product(1234, platform_id);
        cloud.add_firmware(2, false, firmware_binary(platform_id, 2300));
        cloud.add_firmware(3, true, firmware_binary(platform_id, dep_version));
        cloud
    }
}
