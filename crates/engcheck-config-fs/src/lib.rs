// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem [`ConfigStore`]: one `<key>.json` per settings document under
//! the platform config dir (e.g. `~/.config/engcheck` on Linux).

use directories::ProjectDirs;
use engcheck_app_core::config::{ConfigError, ConfigStore};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Settings directory on disk.
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    dir: PathBuf,
}

impl FsConfigStore {
    /// Store in the user's platform config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("com", "engcheck", "EngCheck").ok_or(ConfigError::NoConfigDir)?;
        Self::at(dirs.config_dir())
    }

    /// Store in `dir`, created if missing.
    pub fn at(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the documents.
    pub fn base(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`. Keys are plain names; no separators or dotfiles.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, ConfigError> {
        let plain = !key.is_empty()
            && !key.starts_with('.')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !plain {
            return Err(ConfigError::BadKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl ConfigStore for FsConfigStore {
    fn read(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        match fs::read(self.path_for(key)?) {
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ConfigError::NotFound(key.to_string())),
            other => Ok(other?),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key)?;
        // Readers see either the old document or the new one.
        let staged = path.with_extension("json.partial");
        fs::write(&staged, bytes)?;
        fs::rename(&staged, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use engcheck_app_core::config::ConfigService;
    use engcheck_app_core::settings::MonitorSettings;

    #[test]
    fn monitor_settings_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("cfg");
        let svc = ConfigService::new(FsConfigStore::at(&cfg).unwrap());

        let mut settings: MonitorSettings = svc.load_or_init().unwrap();
        assert!(cfg.join("monitor.json").exists());
        settings.categories = vec!["fire".into()];
        svc.save(&settings).unwrap();

        let reopened = ConfigService::new(FsConfigStore::at(&cfg).unwrap());
        let loaded: MonitorSettings = reopened.load().unwrap().unwrap();
        assert_eq!(loaded.categories, vec!["fire"]);
        assert!(!cfg.join("monitor.json.partial").exists());
    }

    #[test]
    fn keys_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::at(dir.path()).unwrap();
        assert!(matches!(store.read("absent"), Err(ConfigError::NotFound(k)) if k == "absent"));
        for key in ["../escape", ".hidden", "a/b", ""] {
            assert!(matches!(store.read(key), Err(ConfigError::BadKey(_))), "{key:?}");
        }
    }
}
