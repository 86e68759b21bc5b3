use anyhow::{Result, bail};
use nix::unistd::getuid;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";
pub const BACKUP_DIR: &str = "backups";
pub const HANDOFF_FILE: &str = "handoff.json";
pub const LOG_DIR: &str = "logs";

/// Where every piece of durable supervisor state lives.
#[derive(Debug, Clone)]
pub struct StateLayout {
    pub root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateLayout { root: root.into() }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    pub fn handoff_file(&self) -> PathBuf {
        self.root.join(HANDOFF_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }
}

fn create_dir_all_private(path: &Path) -> std::io::Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

/// Pick the state directory: an explicit path wins, then the system location for root,
/// then the XDG state/home fallbacks for unprivileged users.
pub fn determine(root_path: Option<PathBuf>) -> Result<PathBuf> {
    let uid = getuid().as_raw();

    if let Some(path) = root_path {
        if !path.exists() {
            create_dir_all_private(&path)?;
        }
        let path = path.canonicalize()?;
        return Ok(path);
    }

    if uid == 0 {
        let path = get_default_root_path();
        create_dir_all_private(&path)?;
        return Ok(path);
    }

    if let Ok(path) = std::env::var("XDG_STATE_HOME") {
        let path = Path::new(&path).join("rkm");
        if create_dir_all_private(&path).is_ok() {
            return Ok(path);
        }
    }

    if let Ok(path) = std::env::var("HOME")
        && let Ok(resolved) = fs::canonicalize(path)
    {
        let state_dir = resolved.join(".local/state/rkm");
        if create_dir_all_private(&state_dir).is_ok() {
            return Ok(state_dir);
        }
    }

    let tmp_dir = PathBuf::from(format!("/tmp/rkm-{uid}"));
    if create_dir_all_private(&tmp_dir).is_ok() {
        return Ok(tmp_dir);
    }

    bail!("could not find a state location with suitable permissions for the current user");
}

#[cfg(not(test))]
fn get_default_root_path() -> PathBuf {
    PathBuf::from("/var/lib/rkm")
}

#[cfg(test)]
fn get_default_root_path() -> PathBuf {
    std::env::temp_dir().join("default_rkm_path")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_explicit_path_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("state");
        let got = determine(Some(wanted.clone())).unwrap();
        assert_eq!(got, wanted.canonicalize().unwrap());
        let layout = StateLayout::new(&got);
        assert_eq!(layout.config_file(), got.join("config.json"));
        assert_eq!(layout.handoff_file(), got.join("handoff.json"));
    }

    #[test]
    fn test_implicit_path_follows_uid() {
        let got = determine(None).unwrap();
        assert!(got.is_dir());
        let uid = getuid().as_raw();
        if uid == 0 {
            assert_eq!(got, get_default_root_path());
        } else {
            let name = got.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name == "rkm" || name == format!("rkm-{uid}"), "{got:?}");
        }
    }
}
