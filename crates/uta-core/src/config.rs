use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{DiaryError, Result};
use crate::keyring::KdfParams;
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutosaveSettings {
    /// Quiet period after the last keystroke before an autosave commit.
    pub quiet_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationSettings {
    pub fade_in_delay_ms: u64,
    pub fade_out_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupSettings {
    /// Reject imports whose embedded signature does not verify.
    pub verify_signatures: bool,
    /// Import backups that carry no signature at all.
    pub allow_unsigned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiaryConfig {
    pub data_dir: Option<PathBuf>,
    pub database_file: String,
    pub salt_file: String,
    pub backup_root: Option<PathBuf>,
    pub kdf: KdfParams,
    pub autosave: AutosaveSettings,
    pub notifications: NotificationSettings,
    pub backups: BackupSettings,
}

impl Default for AutosaveSettings {
    fn default() -> Self {
        Self {
            quiet_interval_ms: 3500,
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            fade_in_delay_ms: 0,
            fade_out_after_ms: 2000,
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            allow_unsigned: false,
        }
    }
}

impl Default for DiaryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: "diary.uta".into(),
            salt_file: "diary.salt".into(),
            backup_root: None,
            kdf: KdfParams::default(),
            autosave: AutosaveSettings::default(),
            notifications: NotificationSettings::default(),
            backups: BackupSettings::default(),
        }
    }
}

impl AutosaveSettings {
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }
}

impl NotificationSettings {
    pub fn fade_in_delay(&self) -> Duration {
        Duration::from_millis(self.fade_in_delay_ms)
    }

    pub fn fade_out_after(&self) -> Duration {
        Duration::from_millis(self.fade_out_after_ms)
    }
}

impl DiaryConfig {
    /// Read a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => {
                let config: DiaryConfig = serde_json::from_str(&json)
                    .map_err(|e| DiaryError::Config(format!("{}: {e}", path.display())))?;
                config.check()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(DiaryError::Config(format!("{}: {e}", path.display()))),
        }
    }

    fn check(&self) -> Result<()> {
        if self.database_file.trim().is_empty() || self.salt_file.trim().is_empty() {
            return Err(DiaryError::Config("file names must not be empty".into()));
        }
        if self.database_file == self.salt_file {
            return Err(DiaryError::Config(
                "database_file and salt_file must differ".into(),
            ));
        }
        Ok(())
    }

    /// Environment override, then the config value, then the platform default.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if std::env::var_os(paths::DATA_DIR_ENV).is_some() {
            return paths::data_dir();
        }
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::data_dir(),
        }
    }

    pub fn resolve_backup_root(&self) -> Result<PathBuf> {
        if std::env::var_os(paths::BACKUP_ROOT_ENV).is_some() {
            return paths::backup_root();
        }
        match &self.backup_root {
            Some(dir) => Ok(dir.clone()),
            None => paths::backup_root(),
        }
    }
}
