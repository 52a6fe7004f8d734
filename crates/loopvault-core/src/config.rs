//! Configuration model and helpers used by loopvault binaries.

use crate::error::{VaultError, VaultResult};
use directories_next::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Loopvault";
const APP_NAME: &str = "loopvault";
const CONFIG_FILE_NAME: &str = "loopvault.toml";

/// Directory under which unlocked mappings appear as device nodes.
pub const MAPPER_ROOT: &str = "/dev/mapper";

/// The one volume this process manages: the loopback container file, the
/// name its unlocked mapping appears under, and where the filesystem
/// mounts. Loaded once and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VolumeCfg {
    /// Regular file holding the encrypted volume's raw bytes.
    pub loopback_file: String,

    /// Mapping name the unlocked device is exposed under.
    pub luks_device_name: String,

    /// Target directory for the mounted filesystem.
    pub mount_point: String,
}

impl VolumeCfg {
    /// Device node the unlocked mapping appears as.
    pub fn mapper_path(&self) -> PathBuf {
        Path::new(MAPPER_ROOT).join(&self.luks_device_name)
    }
}

/// Optional overrides for the external tool binaries. When unset, the
/// binaries are resolved from well-known install paths and then `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub losetup_path: Option<String>,

    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VaultConfig {
    pub volume: VolumeCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl VaultConfig {
    /// Resolve the per-user configuration path consulted when the caller
    /// does not name one explicitly.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Read a config file from disk, detect format, and validate basics.
    ///
    /// A missing or unreadable file is fatal: this tool manages exactly one
    /// operator-owned volume and guessing its identity would be worse than
    /// refusing to start.
    pub fn load<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|err| {
            VaultError::InvalidConfig(format!(
                "could not read configuration file {}: {err}",
                path.display()
            ))
        })?;

        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> VaultResult<()> {
        for (key, value) in [
            ("volume.loopback_file", &self.volume.loopback_file),
            ("volume.luks_device_name", &self.volume.luks_device_name),
            ("volume.mount_point", &self.volume.mount_point),
        ] {
            if value.trim().is_empty() {
                return Err(VaultError::InvalidConfig(format!(
                    "{key} must not be empty"
                )));
            }
        }

        if !looks_like_mapping_name(&self.volume.luks_device_name) {
            return Err(VaultError::InvalidConfig(format!(
                "volume.luks_device_name `{}` is not a valid mapping name",
                self.volume.luks_device_name
            )));
        }

        Ok(())
    }
}

/// Lightweight sanity check that a name can appear under `/dev/mapper`.
pub fn looks_like_mapping_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') {
        return false;
    }

    trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
}
