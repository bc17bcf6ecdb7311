//! Flash plan builder.
//!
//! Turns module metadata and platform facts into the ordered list of parts
//! written over DFU. Parts without metadata are dropped, except for the two
//! synthetic marker parts whose addresses are fixed.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::catalog::TRACKER_PLATFORM_ID;
use crate::module_info::{HeaderError, ModuleInfoMap, ModulePrefix};

/// OTA staging sector in external flash (gen 3).
pub const GEN3_OTA_ADDRESS: u32 = 0x8028_9000;
/// OTA staging sector in external flash on the tracker.
pub const TRACKER_OTA_ADDRESS: u32 = 0x8068_9000;
/// OTA staging sector in internal flash (gen 2 and earlier).
pub const INTERNAL_OTA_ADDRESS: u32 = 0x080C_0000;
/// External flash alternate setting.
pub const EXTERNAL_FLASH_ALT: u8 = 2;

/// DCT alternate setting used by both marker parts.
pub const MARKER_ALT: u8 = 1;
/// Writing 0xA5 here moves the staged bootloader into place and reboots.
pub const A5_MARKER_ADDRESS: u32 = 1753;
/// Setup-done flag in the DCT.
pub const SETUP_DONE_ADDRESS: u32 = 0x1fc6;

pub const A5_MARKER_FILE: &str = "a5.bin";
pub const SETUP_DONE_FILE: &str = "01.bin";

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Module {part}: {source}")]
    Module {
        part: PartName,
        #[source]
        source: HeaderError,
    },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Logical name of a flashable part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartName {
    SystemPart1,
    SystemPart2,
    SystemPart3,
    Softdevice,
    Ncp,
    Firmware,
    Bootloader,
    SetupDone,
    A5,
}

impl PartName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartName::SystemPart1 => "system-part1",
            PartName::SystemPart2 => "system-part2",
            PartName::SystemPart3 => "system-part3",
            PartName::Softdevice => "softdevice",
            PartName::Ncp => "ncp",
            PartName::Firmware => "firmware",
            PartName::Bootloader => "bootloader",
            PartName::SetupDone => "setup-done",
            PartName::A5 => "a5",
        }
    }

    /// Parts staged through the OTA sector rather than written in place.
    pub fn is_ota_staged(&self) -> bool {
        matches!(self, PartName::Bootloader | PartName::Ncp)
    }
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate parts of the primary plan, in flashing order.
pub const PRIMARY_PARTS: &[PartName] = &[
    PartName::SystemPart1,
    PartName::SystemPart2,
    PartName::SystemPart3,
    PartName::Softdevice,
    PartName::Firmware,
    PartName::Bootloader,
    PartName::SetupDone,
    PartName::A5,
];

/// Candidate parts of the radio-coprocessor plan.
pub const NCP_PARTS: &[PartName] = &[PartName::Ncp, PartName::A5];

/// One part to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPart {
    pub name: PartName,
    pub binary_path: PathBuf,
    pub address: u32,
    pub alt_setting: u8,
    /// Device reboots into the new image after this part.
    pub leave: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashPlan {
    pub parts: Vec<FlashPart>,
}

impl FlashPlan {
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn part(&self, name: PartName) -> Option<&FlashPart> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<PartName> {
        self.parts.iter().map(|p| p.name).collect()
    }
}

/// Platform facts the builder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanTarget {
    pub generation: u8,
    pub platform_id: u16,
}

impl PlanTarget {
    fn ota_address(&self) -> u32 {
        if self.generation == 3 {
            if self.platform_id == TRACKER_PLATFORM_ID {
                TRACKER_OTA_ADDRESS
            } else {
                GEN3_OTA_ADDRESS
            }
        } else {
            INTERNAL_OTA_ADDRESS
        }
    }
}

/// Write the two single-byte marker binaries into the staging directory.
pub fn write_marker_binaries(staging_dir: &Path) -> Result<(), PlanError> {
    for (file, byte) in [(A5_MARKER_FILE, 0xA5u8), (SETUP_DONE_FILE, 0x01u8)] {
        let path = staging_dir.join(file);
        std::fs::write(&path, [byte]).map_err(|source| PlanError::Io { path, source })?;
    }
    Ok(())
}

/// Build the plan for `candidates` from binaries in `staging_dir`.
pub fn build_plan(
    candidates: &[PartName],
    modules: &ModuleInfoMap,
    target: PlanTarget,
    staging_dir: &Path,
) -> Result<FlashPlan, PlanError> {
    let mut parts = Vec::with_capacity(candidates.len());

    for &name in candidates {
        let part = match (modules.get(name.as_str()), name) {
            // The address marker never takes values from module metadata
            (_, PartName::A5) => FlashPart {
                name,
                binary_path: staging_dir.join(A5_MARKER_FILE),
                address: A5_MARKER_ADDRESS,
                alt_setting: MARKER_ALT,
                leave: true,
            },
            (Some(record), _) => {
                let info = &record.prefix_info;
                let mut binary_path = staging_dir.join(format!("{name}.bin"));
                if info.drops_module_info() {
                    binary_path = strip_prefix(&binary_path, staging_dir, name)?;
                }

                let mut address = info
                    .start_address()
                    .map_err(|source| PlanError::Module { part: name, source })?;
                let mut alt_setting = 0;

                if name.is_ota_staged() {
                    address = target.ota_address();
                    if target.generation == 3 {
                        alt_setting = EXTERNAL_FLASH_ALT;
                    }
                }

                FlashPart {
                    name,
                    binary_path,
                    address,
                    alt_setting,
                    leave: false,
                }
            }
            (None, PartName::SetupDone) if target.generation == 3 => FlashPart {
                name,
                binary_path: staging_dir.join(SETUP_DONE_FILE),
                address: SETUP_DONE_ADDRESS,
                alt_setting: MARKER_ALT,
                leave: false,
            },
            (None, _) => {
                debug!(part = %name, "No module info, dropping part");
                continue;
            }
        };
        parts.push(part);
    }

    Ok(FlashPlan { parts })
}

fn strip_prefix(binary_path: &Path, staging_dir: &Path, name: PartName) -> Result<PathBuf, PlanError> {
    let data = std::fs::read(binary_path).map_err(|source| PlanError::Io {
        path: binary_path.to_path_buf(),
        source,
    })?;
    let stripped = data.get(ModulePrefix::SIZE..).ok_or(PlanError::Module {
        part: name,
        source: HeaderError::BufferTooSmall {
            expected: ModulePrefix::SIZE,
            actual: data.len(),
        },
    })?;
    let out = staging_dir.join(format!("{name}.noprefix.bin"));
    std::fs::write(&out, stripped).map_err(|source| PlanError::Io {
        path: out.clone(),
        source,
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_info::{ModuleRecord, PrefixInfo};

    fn record(addr: &str, flags: u8) -> ModuleRecord {
        ModuleRecord {
            prefix_info: PrefixInfo {
                module_start_addy: addr.to_string(),
                module_flags: flags,
                platform_id: 13,
                module_version: 0,
                dep_module_version: 0,
            },
        }
    }

    fn gen3_modules() -> ModuleInfoMap {
        let mut m = ModuleInfoMap::default();
        m.insert("system-part1", record("30000", 0));
        m.insert("softdevice", record("1000", 1));
        m.insert("firmware", record("d4000", 0));
        m.insert("bootloader", record("f4000", 0));
        m.insert("ncp", record("0", 0));
        m
    }

    #[test]
    fn test_gen3_plan_order_and_addresses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("softdevice.bin"), [0xEEu8; 30]).unwrap();
        let target = PlanTarget {
            generation: 3,
            platform_id: 13,
        };

        let plan = build_plan(PRIMARY_PARTS, &gen3_modules(), target, dir.path()).unwrap();
        assert_eq!(
            plan.names(),
            vec![
                PartName::SystemPart1,
                PartName::Softdevice,
                PartName::Firmware,
                PartName::Bootloader,
                PartName::SetupDone,
                PartName::A5,
            ]
        );

        let sp1 = plan.part(PartName::SystemPart1).unwrap();
        assert_eq!((sp1.address, sp1.alt_setting, sp1.leave), (0x30000, 0, false));

        let bl = plan.part(PartName::Bootloader).unwrap();
        assert_eq!((bl.address, bl.alt_setting), (GEN3_OTA_ADDRESS, EXTERNAL_FLASH_ALT));

        let sd = plan.part(PartName::SetupDone).unwrap();
        assert_eq!(sd.binary_path, dir.path().join(SETUP_DONE_FILE));
        assert_eq!((sd.address, sd.alt_setting), (SETUP_DONE_ADDRESS, MARKER_ALT));

        let a5 = plan.parts.last().unwrap();
        assert_eq!(a5.name, PartName::A5);
        assert_eq!((a5.address, a5.alt_setting, a5.leave), (1753, 1, true));
    }

    #[test]
    fn test_dropped_prefix_is_written_to_temp_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = vec![0u8; ModulePrefix::SIZE];
        image.extend_from_slice(b"payload");
        std::fs::write(dir.path().join("softdevice.bin"), &image).unwrap();
        let target = PlanTarget {
            generation: 3,
            platform_id: 13,
        };

        let plan = build_plan(PRIMARY_PARTS, &gen3_modules(), target, dir.path()).unwrap();
        let sd = plan.part(PartName::Softdevice).unwrap();
        assert_eq!(sd.binary_path, dir.path().join("softdevice.noprefix.bin"));
        assert_eq!(std::fs::read(&sd.binary_path).unwrap(), b"payload");
    }

    #[test]
    fn test_tracker_ncp_plan_uses_tracker_ota_sector() {
        let dir = tempfile::tempdir().unwrap();
        let target = PlanTarget {
            generation: 3,
            platform_id: TRACKER_PLATFORM_ID,
        };

        let plan = build_plan(NCP_PARTS, &gen3_modules(), target, dir.path()).unwrap();
        assert_eq!(plan.names(), vec![PartName::Ncp, PartName::A5]);
        let ncp = plan.part(PartName::Ncp).unwrap();
        assert_eq!((ncp.address, ncp.alt_setting), (TRACKER_OTA_ADDRESS, EXTERNAL_FLASH_ALT));
    }

    #[test]
    fn test_gen2_plan_drops_setup_done_and_uses_internal_ota() {
        let dir = tempfile::tempdir().unwrap();
        let mut modules = ModuleInfoMap::default();
        modules.insert("system-part1", record("8020000", 0));
        modules.insert("system-part2", record("8060000", 0));
        modules.insert("firmware", record("80a0000", 0));
        modules.insert("bootloader", record("8000000", 0));
        let target = PlanTarget {
            generation: 2,
            platform_id: 10,
        };

        let plan = build_plan(PRIMARY_PARTS, &modules, target, dir.path()).unwrap();
        assert!(plan.part(PartName::SetupDone).is_none());
        assert!(plan.part(PartName::SystemPart3).is_none());

        let bl = plan.part(PartName::Bootloader).unwrap();
        assert_eq!((bl.address, bl.alt_setting), (INTERNAL_OTA_ADDRESS, 0));

        let a5 = plan.part(PartName::A5).unwrap();
        assert_eq!((a5.address, a5.alt_setting, a5.leave), (A5_MARKER_ADDRESS, MARKER_ALT, true));
    }

    #[test]
    fn test_marker_present_without_any_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_marker_binaries(dir.path()).unwrap();
        let target = PlanTarget {
            generation: 1,
            platform_id: 6,
        };

        let plan = build_plan(PRIMARY_PARTS, &ModuleInfoMap::default(), target, dir.path()).unwrap();
        assert_eq!(plan.names(), vec![PartName::A5]);
        assert_eq!(std::fs::read(dir.path().join(A5_MARKER_FILE)).unwrap(), [0xA5]);
        assert_eq!(std::fs::read(dir.path().join(SETUP_DONE_FILE)).unwrap(), [0x01]);
    }

    #[test]
    fn test_marker_ignores_a5_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("softdevice.bin"), [0xEEu8; 30]).unwrap();
        let mut modules = gen3_modules();
        modules.insert("a5", record("30000", 0));
        let target = PlanTarget {
            generation: 3,
            platform_id: 13,
        };

        let plan = build_plan(PRIMARY_PARTS, &modules, target, dir.path()).unwrap();
        let a5 = plan.part(PartName::A5).unwrap();
        assert_eq!((a5.address, a5.alt_setting, a5.leave), (1753, 1, true));
        assert_eq!(a5.binary_path, dir.path().join(A5_MARKER_FILE));
    }

    #[test]
    fn test_short_image_with_dropped_prefix_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("softdevice.bin"), [0xEEu8; 10]).unwrap();
        let target = PlanTarget {
            generation: 3,
            platform_id: 13,
        };

        let err = build_plan(PRIMARY_PARTS, &gen3_modules(), target, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            PlanError::Module {
                part: PartName::Softdevice,
                source: HeaderError::BufferTooSmall { expected: 24, actual: 10 },
            }
        ));
        assert!(!dir.path().join("softdevice.noprefix.bin").exists());
    }
}
