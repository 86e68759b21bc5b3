//! Remote code updates for managed projects and for the supervisor itself.

pub mod git;
pub mod github;
pub mod relaunch;
pub mod source;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    CallerId, Configuration, SourceSpec, UpdateOutcome, UpdateRequest, UpdateSettings,
    UpdateTarget,
};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, sleep, timeout};
use tracing::{error, info, warn};

use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::handoff::{HandoffReason, HandoffRecord, HandoffStore};
use crate::notify::{Notice, Notifier};
use crate::supervisor::Supervisor;
use relaunch::Relauncher;
use source::{CodeSource, Revision, SourceTarget};

pub use relaunch::{ExecRelauncher, RELAUNCHED_ENV};
pub use source::RemoteSource;

const DEFAULT_DRAIN: Duration = Duration::from_millis(300);
const ALIVE_POLL: Duration = Duration::from_millis(100);
const BUILD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const SELF_LABEL: &str = "self";

pub struct UpdateManager {
    supervisor: Arc<Supervisor>,
    store: Arc<ConfigStore>,
    source: Arc<dyn CodeSource>,
    relauncher: Arc<dyn Relauncher>,
    handoff: HandoffStore,
    notifier: Arc<dyn Notifier>,
    restarting: watch::Sender<bool>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    self_lock: Mutex<()>,
    drain: Duration,
}

impl UpdateManager {
    pub fn new(
        supervisor: Arc<Supervisor>,
        store: Arc<ConfigStore>,
        source: Arc<dyn CodeSource>,
        relauncher: Arc<dyn Relauncher>,
        handoff: HandoffStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (restarting, _) = watch::channel(false);
        UpdateManager {
            supervisor,
            store,
            source,
            relauncher,
            handoff,
            notifier,
            restarting,
            locks: Mutex::new(HashMap::new()),
            self_lock: Mutex::new(()),
            drain: DEFAULT_DRAIN,
        }
    }

    /// How long in-flight responses get to flush before the supervisor replaces itself.
    pub fn with_drain(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    /// `true` from the moment a self-restart is scheduled until it fails.
    pub fn subscribe_restarting(&self) -> watch::Receiver<bool> {
        self.restarting.subscribe()
    }

    pub fn is_restarting(&self) -> bool {
        *self.restarting.borrow()
    }

    fn enter_restarting(&self) -> Result<()> {
        if self.restarting.send_replace(true) {
            return Err(Error::SupervisorRestarting);
        }
        Ok(())
    }

    fn leave_restarting(&self) {
        self.restarting.send_replace(false);
    }

    async fn config(&self) -> Result<Configuration> {
        match self.store.current().await {
            Some(config) => Ok(config),
            None => self.store.load().await,
        }
    }

    async fn project_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    async fn fetch(
        &self,
        target: &SourceTarget,
        source_ref: &str,
        settings: &UpdateSettings,
        request: &mut UpdateRequest,
    ) -> Result<(Revision, Revision)> {
        let before = self.source.revision(target).await?;
        request.revision_before = Some(before.0.clone());
        let after = match timeout(
            settings.fetch_timeout(),
            self.source.fetch(target, source_ref),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::FetchFailed {
                    target: target.label.clone(),
                    reason: format!("timed out after {:?}", settings.fetch_timeout()),
                });
            }
        };
        request.revision_after = Some(after.0.clone());
        Ok((before, after))
    }

    /// Fetch new code for a project and restart it. If the restarted project does not
    /// stay alive for the whole alive window the code is reverted and the project
    /// restarted on the old revision.
    pub async fn pull_project(
        &self,
        name: &str,
        source_ref: Option<String>,
        requester: CallerId,
    ) -> Result<UpdateRequest> {
        let spec = self.supervisor.launch_spec(name).await?;
        let Some(source) = spec.source.clone() else {
            return Err(Error::FetchFailed {
                target: name.to_string(),
                reason: "no remote source configured".to_string(),
            });
        };
        let settings = self.config().await?.updates;
        let lock = self.project_lock(name).await;
        let _pull = lock.lock().await;

        let source_ref = resolve_ref(source_ref, &source, &settings);
        let target = SourceTarget {
            label: name.to_string(),
            workdir: spec.working_dir.clone(),
            entry: spec.entry.clone(),
            spec: source,
        };
        let mut request =
            UpdateRequest::new(UpdateTarget::Project(name.to_string()), &source_ref, requester);
        let (before, after) = self
            .fetch(&target, &source_ref, &settings, &mut request)
            .await?;
        if before == after {
            request.outcome = UpdateOutcome::Applied;
            request.detail = format!("already up to date at {after}");
            return Ok(request);
        }

        info!(project = name, "updated {before} -> {after}, restarting");
        let window = settings.alive_window();
        let deadline = Instant::now() + window;
        let failure = match timeout(window, self.supervisor.restart(name)).await {
            Ok(Ok(())) => self.watch_alive(name, deadline).await.err(),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("not alive within {window:?}")),
        };
        let Some(reason) = failure else {
            request.outcome = UpdateOutcome::Applied;
            request.detail = format!("restarted on {after}");
            return Ok(request);
        };

        warn!(project = name, "update to {after} failed: {reason}; rolling back to {before}");
        if let Err(e) = self.source.revert(&target, &before).await {
            request.outcome = UpdateOutcome::Failed;
            request.detail = format!("{reason}; revert to {before} failed: {e}");
            error!(project = name, "{}", request.detail);
            self.notifier
                .notify(Notice::UpdateFailed {
                    project: name.to_string(),
                    detail: request.detail.clone(),
                })
                .await;
            return Ok(request);
        }

        request.outcome = UpdateOutcome::RolledBack;
        request.detail = match self.supervisor.restart(name).await {
            Ok(()) => format!("{reason}; rolled back to {before}"),
            Err(e) => format!(
                "{reason}; rolled back to {before}, but it failed to start as well ({e}); \
                 the liveness loop keeps retrying"
            ),
        };
        self.notifier
            .notify(Notice::UpdateRolledBack {
                project: name.to_string(),
                detail: request.detail.clone(),
            })
            .await;
        Ok(request)
    }

    /// Keep polling a freshly restarted project until `deadline`.
    async fn watch_alive(&self, name: &str, deadline: Instant) -> std::result::Result<(), String> {
        while Instant::now() < deadline {
            match self.supervisor.is_running(name).await {
                Ok(true) => {}
                Ok(false) => return Err("exited within the alive window".to_string()),
                Err(e) => return Err(e.to_string()),
            }
            sleep(ALIVE_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
        Ok(())
    }

    /// Fetch and build the supervisor's own code, then schedule a self-restart. The
    /// returned request stays `pending`; the relaunched instance publishes the final word.
    pub async fn pull_self(
        self: &Arc<Self>,
        source_ref: Option<String>,
        requester: CallerId,
    ) -> Result<UpdateRequest> {
        if self.is_restarting() {
            return Err(Error::SupervisorRestarting);
        }
        let _pull = self.self_lock.lock().await;
        let config = self.config().await?;
        let self_spec = config.self_spec.clone().ok_or_else(|| Error::FetchFailed {
            target: SELF_LABEL.to_string(),
            reason: "no SELF section configured".to_string(),
        })?;
        let source = self_spec.source().ok_or_else(|| Error::FetchFailed {
            target: SELF_LABEL.to_string(),
            reason: "SELF names neither git nor github_path".to_string(),
        })?;
        let workdir = self_spec.working_dir(&self.store.base_dir());
        let entry = match &source {
            SourceSpec::Github { file_path, .. } => workdir.join(file_path),
            SourceSpec::Git { .. } => workdir.clone(),
        };
        let source_ref = resolve_ref(source_ref, &source, &config.updates);
        let target = SourceTarget {
            label: SELF_LABEL.to_string(),
            workdir: workdir.clone(),
            entry,
            spec: source,
        };

        let mut request = UpdateRequest::new(UpdateTarget::SelfTarget, &source_ref, requester);
        let (before, after) = self
            .fetch(&target, &source_ref, &config.updates, &mut request)
            .await?;
        if before == after {
            request.outcome = UpdateOutcome::Applied;
            request.detail = format!("already up to date at {after}");
            return Ok(request);
        }
        if !self_spec.build.is_empty() {
            build(&self_spec.build, &workdir).await?;
        }

        let executable = self_executable(self_spec.executable.as_deref(), &workdir)?;
        self.enter_restarting()?;
        let this = self.clone();
        let reason = HandoffReason::PullSelf {
            requested_by: requester,
            revision: Some(after.0.clone()),
        };
        tokio::spawn(async move {
            let _ = this.relaunch(executable, reason).await;
        });

        request.outcome = UpdateOutcome::Pending;
        request.detail = format!("updated {before} -> {after}; relaunching supervisor");
        Ok(request)
    }

    /// Schedule a self-restart without fetching anything.
    pub async fn reboot_self(self: &Arc<Self>, requester: CallerId) -> Result<()> {
        let config = self.config().await?;
        let executable = match &config.self_spec {
            Some(spec) => self_executable(
                spec.executable.as_deref(),
                &spec.working_dir(&self.store.base_dir()),
            )?,
            None => std::env::current_exe()?,
        };
        self.enter_restarting()?;
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this
                .relaunch(
                    executable,
                    HandoffReason::RebootSelf {
                        requested_by: requester,
                    },
                )
                .await;
        });
        Ok(())
    }

    /// Freeze the supervisor, persist the process table and re-execute. Must be entered
    /// with restarting mode already on. Returns only when the relaunch failed, after
    /// undoing the freeze.
    pub async fn relaunch(&self, executable: PathBuf, reason: HandoffReason) -> Result<()> {
        sleep(self.drain).await;
        let settings = self.config().await.map(|c| c.updates).unwrap_or_default();
        let freeze = self.supervisor.freeze_for_handoff().await;
        let now = Utc::now();
        let confirm = chrono::Duration::from_std(settings.relaunch_confirm())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let record = HandoffRecord {
            written_at: now,
            confirm_deadline: now + confirm,
            reason,
            supervisor_pid: std::process::id(),
            entries: freeze.entries(),
        };

        let err = match self.handoff.write(&record).await {
            Ok(()) => {
                info!("relaunching supervisor from {}", executable.display());
                let err = self.relauncher.relaunch(&executable).await;
                if let Err(e) = self.handoff.discard().await {
                    warn!("cannot remove stale handoff record: {e}");
                }
                err
            }
            Err(e) => e,
        };

        freeze.thaw();
        self.leave_restarting();
        let detail = err.to_string();
        error!("self-restart failed: {detail}");
        self.notifier
            .notify(Notice::SelfUpdateFailed {
                detail: detail.clone(),
            })
            .await;
        Err(Error::SelfUpdateFailed(detail))
    }
}

fn resolve_ref(requested: Option<String>, source: &SourceSpec, settings: &UpdateSettings) -> String {
    requested
        .filter(|r| !r.is_empty())
        .or_else(|| match source {
            SourceSpec::Git { branch, .. } => branch.clone(),
            SourceSpec::Github { .. } => None,
        })
        .unwrap_or_else(|| settings.default_ref.clone())
}

fn self_executable(configured: Option<&str>, workdir: &Path) -> Result<PathBuf> {
    match configured {
        Some(path) if Path::new(path).is_absolute() => Ok(PathBuf::from(path)),
        Some(path) => Ok(workdir.join(path)),
        None => Ok(std::env::current_exe()?),
    }
}

async fn build(argv: &[String], workdir: &Path) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    info!("building supervisor: {}", argv.join(" "));
    let output = timeout(
        BUILD_TIMEOUT,
        Command::new(program)
            .args(args)
            .current_dir(workdir)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| Error::SelfUpdateFailed(format!("build timed out after {BUILD_TIMEOUT:?}")))?
    .map_err(|e| Error::SelfUpdateFailed(format!("cannot run {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(Error::SelfUpdateFailed(format!(
            "build exited with {}: {}",
            output.status,
            tail.join("\n")
        )));
    }
    Ok(())
}

/// Startup half of a self-restart: adopt what the previous instance left running and
/// publish the verdict.
pub async fn resume_after_handoff(
    supervisor: &Supervisor,
    handoff: &HandoffStore,
    notifier: &dyn Notifier,
) -> Result<()> {
    let Some(record) = handoff.take().await? else {
        return Ok(());
    };
    info!(
        "resuming after self-restart requested by {:?}",
        record.reason
    );
    if !record.written_by(std::process::id()) {
        warn!(
            "handoff record was written by pid {}, not by this process; exit codes of \
             adopted processes will not be available",
            record.supervisor_pid
        );
    }
    let report = supervisor.adopt(&record).await;
    if record.is_overdue(Utc::now()) {
        notifier
            .notify(Notice::SelfUpdateFailed {
                detail: format!(
                    "relaunch confirmed after its deadline {}",
                    record.confirm_deadline
                ),
            })
            .await;
    } else {
        notifier
            .notify(Notice::SelfUpdateConfirmed {
                adopted: report.adopted,
                fresh: report.fresh,
            })
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_ref_order() {
        let settings = UpdateSettings::default();
        let git = SourceSpec::Git {
            remote: "origin".to_string(),
            branch: Some("release".to_string()),
        };
        let raw = SourceSpec::Github {
            repository: "https://github.com/acme/bots".to_string(),
            file_path: "a.py".to_string(),
        };
        assert_eq!(resolve_ref(Some("v1".to_string()), &git, &settings), "v1");
        assert_eq!(resolve_ref(None, &git, &settings), "release");
        assert_eq!(resolve_ref(Some(String::new()), &raw, &settings), "main");
    }

    #[test]
    fn test_self_executable_resolution() {
        let workdir = Path::new("/srv/rkm");
        assert_eq!(
            self_executable(Some("target/release/rkm"), workdir).unwrap(),
            PathBuf::from("/srv/rkm/target/release/rkm")
        );
        assert_eq!(
            self_executable(Some("/usr/bin/rkm"), workdir).unwrap(),
            PathBuf::from("/usr/bin/rkm")
        );
    }
}
