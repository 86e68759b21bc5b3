use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Replace `path` with `bytes` so that readers see either the old or the new content.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = temp_sibling(path);
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        atomic_write(&path, b"one").await.unwrap();
        atomic_write(&path, b"two").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"two");
        assert!(!temp_sibling(&path).exists());
        remove_if_exists(&path).await.unwrap();
        remove_if_exists(&path).await.unwrap();
    }
}
