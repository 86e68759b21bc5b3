//! Durable configuration with validated writes, healthy-state backups and self-heal.
//!
//! Lifecycle of the persisted configuration:
//!
//! ```text
//!   apply ──► Committed{since} ──confirm_healthy──► BackedUp
//!                    │
//!                    └──crash loop──► Unhealthy  (never backed up)
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use common::Configuration;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::fsutil::atomic_write;

const BACKUP_PREFIX: &str = "config.";
const BACKUP_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPhase {
    Committed { since: Instant },
    BackedUp,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    pub path: PathBuf,
    /// Creation time in unix milliseconds, taken from the file name.
    pub created_ms: i64,
}

struct StoreState {
    raw: Option<String>,
    config: Option<Configuration>,
    phase: ConfigPhase,
}

pub struct ConfigStore {
    config_path: PathBuf,
    backup_dir: PathBuf,
    // Writers (apply, restore, confirm) take the write half; load takes the read half.
    state: RwLock<StoreState>,
}

impl ConfigStore {
    pub fn new(config_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        ConfigStore {
            config_path: config_path.into(),
            backup_dir: backup_dir.into(),
            state: RwLock::new(StoreState {
                raw: None,
                config: None,
                phase: ConfigPhase::Committed {
                    since: Instant::now(),
                },
            }),
        }
    }

    /// Directory relative project paths are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Startup load. Heals a corrupt file from the newest usable backup and loads again.
    /// Returns the configuration and, when a heal happened, the reason the file was bad.
    pub async fn open(&self) -> Result<(Configuration, Option<String>)> {
        let (config, healed) = match self.load().await {
            Ok(config) => (config, None),
            Err(Error::ConfigCorrupt {
                reason,
                restored: true,
            }) => (self.load().await?, Some(reason)),
            Err(e) => return Err(e),
        };

        let newest = self.newest_backup_bytes().await?;
        let mut state = self.state.write().await;
        let identical = newest.is_some() && newest.as_deref() == state.raw.as_deref().map(str::as_bytes);
        state.phase = if identical {
            ConfigPhase::BackedUp
        } else {
            ConfigPhase::Committed {
                since: Instant::now(),
            }
        };
        Ok((config, healed))
    }

    /// Read, validate and parse the persisted configuration. A bad file is replaced by the
    /// newest valid backup, and `ConfigCorrupt { restored: true }` is returned so the
    /// caller knows to load again.
    pub async fn load(&self) -> Result<Configuration> {
        let outcome = {
            let _reader = self.state.read().await;
            read_config(&self.config_path).await
        };
        match outcome {
            Ok((raw, config)) => {
                let mut state = self.state.write().await;
                state.raw = Some(raw);
                state.config = Some(config.clone());
                Ok(config)
            }
            Err(reason) => {
                warn!(
                    "configuration {} is unusable: {reason}",
                    self.config_path.display()
                );
                match self.restore_latest_backup().await {
                    Ok(_) => Err(Error::ConfigCorrupt {
                        reason,
                        restored: true,
                    }),
                    Err(Error::NoBackupAvailable) => {
                        error!("configuration is unusable and no backup can replace it");
                        Err(Error::NoBackupAvailable)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Validate and persist `raw`. On any violation nothing is written.
    pub async fn apply(&self, raw: &str) -> Result<Configuration> {
        let mut state = self.state.write().await;
        let config = common::parse(raw).map_err(Error::ConfigInvalid)?;
        atomic_write(&self.config_path, raw.as_bytes()).await?;
        state.raw = Some(raw.to_string());
        state.config = Some(config.clone());
        state.phase = ConfigPhase::Committed {
            since: Instant::now(),
        };
        info!("new configuration committed to {}", self.config_path.display());
        Ok(config)
    }

    /// Copy the newest backup that still validates over the configuration file.
    pub async fn restore_latest_backup(&self) -> Result<Configuration> {
        let mut state = self.state.write().await;
        for backup in self.backups().await? {
            let raw = match fs::read_to_string(&backup.path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("skipping unreadable backup {}: {e}", backup.path.display());
                    continue;
                }
            };
            let config = match common::parse(&raw) {
                Ok(config) => config,
                Err(violations) => {
                    warn!(
                        "skipping invalid backup {}: {}",
                        backup.path.display(),
                        Error::ConfigInvalid(violations)
                    );
                    continue;
                }
            };
            atomic_write(&self.config_path, raw.as_bytes()).await?;
            state.raw = Some(raw);
            state.config = Some(config.clone());
            state.phase = ConfigPhase::BackedUp;
            info!("configuration restored from {}", backup.path.display());
            return Ok(config);
        }
        Err(Error::NoBackupAvailable)
    }

    /// Snapshot the committed configuration as a backup. Returns the new backup's path,
    /// or `None` when there was nothing to confirm.
    pub async fn confirm_healthy(&self) -> Result<Option<PathBuf>> {
        let mut state = self.state.write().await;
        if !matches!(state.phase, ConfigPhase::Committed { .. }) {
            return Ok(None);
        }
        let Some(raw) = state.raw.clone() else {
            return Ok(None);
        };

        let newest = self.newest_backup_bytes().await?;
        let path = if newest.as_deref() == Some(raw.as_bytes()) {
            None
        } else {
            let path = self.next_backup_path().await;
            atomic_write(&path, raw.as_bytes()).await?;
            info!("configuration confirmed healthy, backed up to {}", path.display());
            Some(path)
        };
        state.phase = ConfigPhase::BackedUp;

        let retention = state
            .config
            .as_ref()
            .map(|c| c.supervisor.backup_retention)
            .unwrap_or(10)
            .max(1);
        drop(state);
        self.prune(retention).await?;
        Ok(path)
    }

    pub async fn mark_unhealthy(&self) {
        let mut state = self.state.write().await;
        if matches!(state.phase, ConfigPhase::Committed { .. }) {
            warn!("committed configuration led to a crash loop; it will not be backed up");
            state.phase = ConfigPhase::Unhealthy;
        }
    }

    pub async fn phase(&self) -> ConfigPhase {
        self.state.read().await.phase
    }

    pub async fn current(&self) -> Option<Configuration> {
        self.state.read().await.config.clone()
    }

    /// The persisted bytes, as last loaded or written.
    pub async fn raw(&self) -> Result<String> {
        if let Some(raw) = self.state.read().await.raw.clone() {
            return Ok(raw);
        }
        Ok(fs::read_to_string(&self.config_path).await?)
    }

    /// Backups, newest first.
    pub async fn backups(&self) -> Result<Vec<BackupInfo>> {
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(created_ms) = name
                .strip_prefix(BACKUP_PREFIX)
                .and_then(|rest| rest.strip_suffix(BACKUP_SUFFIX))
                .and_then(|millis| millis.parse::<i64>().ok())
            else {
                continue;
            };
            backups.push(BackupInfo {
                path: entry.path(),
                created_ms,
            });
        }
        backups.sort_by(|a, b| b.created_ms.cmp(&a.created_ms));
        Ok(backups)
    }

    async fn newest_backup_bytes(&self) -> Result<Option<Vec<u8>>> {
        match self.backups().await?.first() {
            Some(newest) => Ok(Some(fs::read(&newest.path).await?)),
            None => Ok(None),
        }
    }

    async fn next_backup_path(&self) -> PathBuf {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let path = self
                .backup_dir
                .join(format!("{BACKUP_PREFIX}{millis}{BACKUP_SUFFIX}"));
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return path;
            }
            millis += 1;
        }
    }

    async fn prune(&self, retention: usize) -> Result<()> {
        for stale in self.backups().await?.into_iter().skip(retention) {
            info!("pruning old backup {}", stale.path.display());
            fs::remove_file(&stale.path).await?;
        }
        Ok(())
    }
}

async fn read_config(path: &Path) -> std::result::Result<(String, Configuration), String> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let config = common::parse(&raw).map_err(|violations| {
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    })?;
    Ok((raw, config))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_backup_names_sort_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).await.unwrap();
        for name in ["config.100.json", "config.300.json", "config.200.json", "notes.txt"] {
            fs::write(backups.join(name), b"{}").await.unwrap();
        }
        let store = ConfigStore::new(dir.path().join("config.json"), &backups);
        let found: Vec<i64> = store
            .backups()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.created_ms)
            .collect();
        assert_eq!(found, vec![300, 200, 100]);
    }
}
