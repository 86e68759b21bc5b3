use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use common::{CallerId, Command, CommandOutput, CommandRequest, CommandResponse, Configuration};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::logging;
use crate::supervisor::{ReconcileReport, Supervisor};
use crate::update::UpdateManager;
use crate::upgrade;

/// Turns authorized operator commands into calls on the supervisor's components.
pub struct Dispatcher {
    store: Arc<ConfigStore>,
    supervisor: Arc<Supervisor>,
    updates: Arc<UpdateManager>,
    log_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ConfigStore>,
        supervisor: Arc<Supervisor>,
        updates: Arc<UpdateManager>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Dispatcher {
            store,
            supervisor,
            updates,
            log_dir: log_dir.into(),
        }
    }

    async fn config(&self) -> Result<Configuration> {
        match self.store.current().await {
            Some(config) => Ok(config),
            None => self.store.load().await,
        }
    }

    /// Entry point for a request off the wire: the request must be addressed to our group.
    pub async fn handle(self: &Arc<Self>, request: CommandRequest) -> CommandResponse {
        match self.config().await {
            Ok(config) if config.group_id != request.group => {
                return CommandResponse::Error(
                    Error::BadRequest(format!(
                        "request addressed to group {}, this supervisor serves {}",
                        request.group, config.group_id
                    ))
                    .into_failure(),
                );
            }
            Ok(_) => {}
            Err(e) => return CommandResponse::Error(e.into_failure()),
        }
        self.dispatch(request.caller, request.command).await
    }

    /// Authorize `caller` and run `command` as its own task. Commands still running when a
    /// self-restart begins answer `SupervisorRestarting`.
    pub async fn dispatch(self: &Arc<Self>, caller: CallerId, command: Command) -> CommandResponse {
        let name = command.name();
        let result = self.run(caller, command).await;
        match result {
            Ok(output) => {
                info!(caller, command = name, "command succeeded");
                CommandResponse::Ok(output)
            }
            Err(e) => {
                warn!(caller, command = name, "command failed: {e}");
                CommandResponse::Error(e.into_failure())
            }
        }
    }

    async fn run(self: &Arc<Self>, caller: CallerId, command: Command) -> Result<CommandOutput> {
        let mut restarting = self.updates.subscribe_restarting();
        if *restarting.borrow_and_update() {
            return Err(Error::SupervisorRestarting);
        }
        if !self.config().await?.is_authorized(caller) {
            return Err(Error::Unauthorized(caller));
        }

        // the commands that start a self-restart answer for themselves.
        let initiates_restart = matches!(command, Command::RebootSelf | Command::PullSelf { .. });
        let this = self.clone();
        let task = tokio::spawn(async move { this.execute(caller, command).await });
        if initiates_restart {
            return joined(task.await);
        }
        tokio::select! {
            biased;
            result = task => joined(result),
            _ = wait_for_restart(&mut restarting) => Err(Error::SupervisorRestarting),
        }
    }

    async fn execute(&self, caller: CallerId, command: Command) -> Result<CommandOutput> {
        match command {
            Command::RebootSelf => {
                self.updates.reboot_self(caller).await?;
                Ok(message("supervisor is restarting"))
            }
            Command::Reboot { project } => {
                self.supervisor.restart(&project).await?;
                let status = self.supervisor.project_status(&project).await?;
                Ok(message(format!(
                    "{project} restarted (pid {})",
                    status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
                )))
            }
            Command::Pull {
                project,
                source_ref,
            } => {
                let request = self
                    .updates
                    .pull_project(&project, source_ref, caller)
                    .await?;
                Ok(CommandOutput::Update(request))
            }
            Command::PullSelf { source_ref } => {
                let request = self.updates.pull_self(source_ref, caller).await?;
                Ok(CommandOutput::Update(request))
            }
            Command::GetConfig => Ok(CommandOutput::Config {
                content: self.store.raw().await?,
            }),
            Command::SetConfig { content } => {
                let config = self.store.apply(&content).await?;
                let report = self.reconcile(&config).await;
                Ok(message(format!("configuration applied; {}", summary(&report))))
            }
            Command::RestoreConfig => {
                let config = self.store.restore_latest_backup().await?;
                let report = self.reconcile(&config).await;
                Ok(message(format!("configuration restored; {}", summary(&report))))
            }
            Command::GetLogs { lines } => {
                let (file, text) = logging::tail(&self.log_dir, lines).await?;
                Ok(CommandOutput::Logs { file, text })
            }
            Command::Upgrade { library, version } => {
                let config = self.config().await?;
                upgrade::upgrade(&config, library.as_deref(), version.as_deref()).await
            }
            Command::Status => Ok(CommandOutput::Status {
                projects: self.supervisor.status().await,
            }),
        }
    }

    async fn reconcile(&self, config: &Configuration) -> ReconcileReport {
        let specs = config.launch_specs(&self.store.base_dir());
        let report = self
            .supervisor
            .reconcile(config.supervisor_settings(), specs)
            .await;
        self.supervisor.start_idle().await;
        report
    }
}

fn message(text: impl Into<String>) -> CommandOutput {
    CommandOutput::Message { text: text.into() }
}

fn summary(report: &ReconcileReport) -> String {
    format!(
        "added {:?}, removed {:?}, changed {:?}",
        report.added, report.removed, report.changed
    )
}

fn joined(
    result: std::result::Result<Result<CommandOutput>, tokio::task::JoinError>,
) -> Result<CommandOutput> {
    result.unwrap_or_else(|e| Err(anyhow!("command task failed: {e}").into()))
}

async fn wait_for_restart(restarting: &mut watch::Receiver<bool>) {
    loop {
        if *restarting.borrow_and_update() {
            return;
        }
        if restarting.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
