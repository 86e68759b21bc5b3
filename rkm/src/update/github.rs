use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use common::SourceSpec;
use regex::Regex;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::fsutil::{atomic_write, remove_if_exists};
use crate::update::source::{CodeSource, Revision, SourceTarget};

const USER_AGENT: &str = concat!("rkm/", env!("CARGO_PKG_VERSION"));
const ABSENT: &str = "absent";

static REPOSITORY_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?github\.com/([\w.-]+)/([\w.-]+)$").expect("valid regex")
});

/// Raw-content URL for one file of a GitHub repository at `source_ref`.
pub fn raw_url(repository: &str, file_path: &str, source_ref: &str) -> Option<String> {
    let trimmed = repository.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let caps = REPOSITORY_URL.captures(trimmed)?;
    Some(format!(
        "https://raw.githubusercontent.com/{}/{}/{}/{}",
        &caps[1],
        &caps[2],
        source_ref,
        file_path.trim_start_matches('/')
    ))
}

fn backup_path(entry: &Path) -> PathBuf {
    let mut name = entry.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

async fn digest_of(path: &Path) -> Result<Option<String>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    Ok(Some(sha256::try_digest(path)?))
}

/// Replaces a single file with its latest version from the raw view of a GitHub
/// repository. The previous content is kept next to it as `<file>.bak` for revert.
pub struct RawFileFetcher {
    client: reqwest::Client,
}

impl RawFileFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow!("cannot build http client: {e}"))?;
        Ok(RawFileFetcher { client })
    }
}

#[async_trait]
impl CodeSource for RawFileFetcher {
    async fn revision(&self, target: &SourceTarget) -> Result<Revision> {
        let digest = digest_of(&target.entry).await?;
        Ok(Revision(digest.unwrap_or_else(|| ABSENT.to_string())))
    }

    async fn fetch(&self, target: &SourceTarget, source_ref: &str) -> Result<Revision> {
        let failed = |reason: String| Error::FetchFailed {
            target: target.label.clone(),
            reason,
        };
        let SourceSpec::Github {
            repository,
            file_path,
        } = &target.spec
        else {
            return Err(anyhow!("{} is not a raw-file source", target.label).into());
        };
        let url = raw_url(repository, file_path, source_ref)
            .ok_or_else(|| failed(format!("{repository} is not a GitHub repository URL")))?;

        info!("downloading {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("{url} answered {}", response.status())));
        }
        let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;

        if fs::try_exists(&target.entry).await? {
            fs::copy(&target.entry, backup_path(&target.entry)).await?;
        }
        atomic_write(&target.entry, &body).await?;
        self.revision(target).await
    }

    async fn revert(&self, target: &SourceTarget, to: &Revision) -> Result<()> {
        if to.0 == ABSENT {
            remove_if_exists(&target.entry).await?;
            return Ok(());
        }
        let backup = backup_path(&target.entry);
        if digest_of(&backup).await?.as_deref() != Some(to.0.as_str()) {
            return Err(anyhow!("{} does not hold revision {to}", backup.display()).into());
        }
        fs::rename(&backup, &target.entry).await?;
        info!("{} restored to {to}", target.entry.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_raw_url_derivation() {
        assert_eq!(
            raw_url("https://github.com/acme/bots.git", "alpha.py", "main").as_deref(),
            Some("https://raw.githubusercontent.com/acme/bots/main/alpha.py")
        );
        assert_eq!(
            raw_url("https://github.com/acme/bots/", "/src/alpha.py", "v2").as_deref(),
            Some("https://raw.githubusercontent.com/acme/bots/v2/src/alpha.py")
        );
        assert_eq!(raw_url("https://gitlab.com/acme/bots", "a.py", "main"), None);
        assert_eq!(raw_url("https://github.com/acme", "a.py", "main"), None);
    }

    #[tokio::test]
    async fn test_revert_restores_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("alpha.py");
        fs::write(&entry, b"print('old')").await.unwrap();
        let target = SourceTarget {
            label: "alpha".to_string(),
            workdir: dir.path().to_path_buf(),
            entry: entry.clone(),
            spec: SourceSpec::Github {
                repository: "https://github.com/acme/bots".to_string(),
                file_path: "alpha.py".to_string(),
            },
        };
        let fetcher = RawFileFetcher::new(Duration::from_secs(1)).unwrap();
        let old = fetcher.revision(&target).await.unwrap();

        // what a fetch leaves behind
        fs::copy(&entry, backup_path(&entry)).await.unwrap();
        fs::write(&entry, b"print('new')").await.unwrap();
        assert_ne!(fetcher.revision(&target).await.unwrap(), old);

        fetcher.revert(&target, &old).await.unwrap();
        assert_eq!(fetcher.revision(&target).await.unwrap(), old);
        assert!(!backup_path(&entry).exists());
    }
}
