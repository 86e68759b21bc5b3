use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use common::SourceSpec;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::update::git::GitCli;
use crate::update::github::RawFileFetcher;

/// An opaque code revision: a commit id for git checkouts, a content digest for raw files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(12).collect();
        f.write_str(&short)
    }
}

/// Where an update is applied.
#[derive(Debug, Clone)]
pub struct SourceTarget {
    /// Project name, or `self`.
    pub label: String,
    pub workdir: PathBuf,
    /// The single file a raw-file source replaces.
    pub entry: PathBuf,
    pub spec: SourceSpec,
}

#[async_trait]
pub trait CodeSource: Send + Sync {
    async fn revision(&self, target: &SourceTarget) -> Result<Revision>;

    /// Bring the target to `source_ref`. On error the working tree is left as it was.
    async fn fetch(&self, target: &SourceTarget, source_ref: &str) -> Result<Revision>;

    async fn revert(&self, target: &SourceTarget, to: &Revision) -> Result<()>;
}

/// Dispatches to the backend named by the target's [`SourceSpec`].
pub struct RemoteSource {
    git: GitCli,
    raw: RawFileFetcher,
}

impl RemoteSource {
    pub fn new(fetch_timeout: Duration) -> Result<Self> {
        Ok(RemoteSource {
            git: GitCli,
            raw: RawFileFetcher::new(fetch_timeout)?,
        })
    }
}

#[async_trait]
impl CodeSource for RemoteSource {
    async fn revision(&self, target: &SourceTarget) -> Result<Revision> {
        match &target.spec {
            SourceSpec::Git { .. } => self.git.revision(target).await,
            SourceSpec::Github { .. } => self.raw.revision(target).await,
        }
    }

    async fn fetch(&self, target: &SourceTarget, source_ref: &str) -> Result<Revision> {
        match &target.spec {
            SourceSpec::Git { .. } => self.git.fetch(target, source_ref).await,
            SourceSpec::Github { .. } => self.raw.fetch(target, source_ref).await,
        }
    }

    async fn revert(&self, target: &SourceTarget, to: &Revision) -> Result<()> {
        match &target.spec {
            SourceSpec::Git { .. } => self.git.revert(target, to).await,
            SourceSpec::Github { .. } => self.raw.revert(target, to).await,
        }
    }
}
