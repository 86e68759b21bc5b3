use std::path::Path;
use std::process::Output;

use anyhow::anyhow;
use async_trait::async_trait;
use common::SourceSpec;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::update::source::{CodeSource, Revision, SourceTarget};

/// Updates a git checkout by fetching and fast-forwarding. Anything that would need a
/// real merge is refused, so a failed pull never leaves a half-merged tree.
pub struct GitCli;

async fn git(workdir: &Path, args: &[&str]) -> std::io::Result<Output> {
    debug!("git -C {} {}", workdir.display(), args.join(" "));
    Command::new("git")
        .arg("-C")
        .arg(workdir)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl CodeSource for GitCli {
    async fn revision(&self, target: &SourceTarget) -> Result<Revision> {
        let output = git(&target.workdir, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| Error::FetchFailed {
                target: target.label.clone(),
                reason: format!("cannot run git: {e}"),
            })?;
        if !output.status.success() {
            return Err(Error::FetchFailed {
                target: target.label.clone(),
                reason: format!("not a git checkout: {}", stderr_of(&output)),
            });
        }
        Ok(Revision(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    async fn fetch(&self, target: &SourceTarget, source_ref: &str) -> Result<Revision> {
        let SourceSpec::Git { remote, .. } = &target.spec else {
            return Err(anyhow!("{} is not a git source", target.label).into());
        };

        let output = git(&target.workdir, &["fetch", remote.as_str(), source_ref])
            .await
            .map_err(|e| Error::FetchFailed {
                target: target.label.clone(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::FetchFailed {
                target: target.label.clone(),
                reason: stderr_of(&output),
            });
        }

        let output = git(&target.workdir, &["merge", "--ff-only", "FETCH_HEAD"]).await?;
        if !output.status.success() {
            return Err(Error::MergeConflict {
                target: target.label.clone(),
                reason: stderr_of(&output),
            });
        }
        let revision = self.revision(target).await?;
        info!("{} fast-forwarded to {revision}", target.label);
        Ok(revision)
    }

    async fn revert(&self, target: &SourceTarget, to: &Revision) -> Result<()> {
        let output = git(&target.workdir, &["reset", "--hard", to.0.as_str()]).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "git reset of {} to {to} failed: {}",
                target.label,
                stderr_of(&output)
            )
            .into());
        }
        info!("{} reset to {to}", target.label);
        Ok(())
    }
}
