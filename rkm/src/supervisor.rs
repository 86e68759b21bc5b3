//! Keeps the registered projects running.
//!
//! Every project sits behind its own `tokio::sync::Mutex`; holding it is what serializes
//! `start`, `stop`, `restart` and the liveness check of that project. The liveness sweep
//! only ever `try_lock`s, so a project busy with an operator command is skipped for one
//! tick instead of being raced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{
    DesiredState, ExitRecord, LaunchSpec, ObservedState, ProjectStatus, SupervisorSettings,
};
use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config_store::{ConfigPhase, ConfigStore};
use crate::error::{Error, Result};
use crate::handoff::{HandoffEntry, HandoffRecord};
use crate::notify::{Notice, Notifier};
use crate::process::{self, ExitState, LaunchSignature, ProcessHandle};

/// Runtime record of one managed project.
pub struct ProjectRuntime {
    spec: LaunchSpec,
    handle: Option<ProcessHandle>,
    desired: DesiredState,
    observed: ObservedState,
    restart_count: u32,
    /// Restart instants inside the crash-loop window.
    restarts: VecDeque<Instant>,
    last_exit: Option<ExitRecord>,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl ProjectRuntime {
    fn new(spec: LaunchSpec) -> Self {
        ProjectRuntime {
            spec,
            handle: None,
            desired: DesiredState::Running,
            observed: ObservedState::Stopped,
            restart_count: 0,
            restarts: VecDeque::new(),
            last_exit: None,
            failures: 0,
            next_attempt: None,
        }
    }

    fn status(&self) -> ProjectStatus {
        ProjectStatus {
            name: self.spec.name.clone(),
            desired: self.desired,
            observed: self.observed,
            pid: self.handle.as_ref().map(|h| h.pid),
            restart_count: self.restart_count,
            last_exit: self.last_exit.clone(),
            adopted: self.handle.as_ref().is_some_and(|h| h.adopted),
        }
    }
}

type Slot = Arc<Mutex<ProjectRuntime>>;

#[derive(Default)]
struct Table {
    order: Vec<String>,
    slots: HashMap<String, Slot>,
    specs: HashMap<String, LaunchSpec>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdoptionReport {
    pub adopted: Vec<String>,
    /// Registered projects whose recorded process could not be adopted.
    pub fresh: Vec<String>,
    /// Recorded processes of projects that are no longer registered; they were terminated.
    pub orphaned: Vec<String>,
}

pub struct Supervisor {
    settings: RwLock<SupervisorSettings>,
    table: RwLock<Table>,
    sweep: Mutex<()>,
    frozen: AtomicBool,
    last_crash_loop: Mutex<Option<Instant>>,
    managed: Mutex<HashSet<u32>>,
    notifier: Arc<dyn Notifier>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, notifier: Arc<dyn Notifier>) -> Self {
        Supervisor {
            settings: RwLock::new(settings),
            table: RwLock::new(Table::default()),
            sweep: Mutex::new(()),
            frozen: AtomicBool::new(false),
            last_crash_loop: Mutex::new(None),
            managed: Mutex::new(HashSet::new()),
            notifier,
        }
    }

    pub async fn settings(&self) -> SupervisorSettings {
        self.settings.read().await.clone()
    }

    /// Initial registration. Nothing is launched; see [`Supervisor::start_idle`].
    pub async fn register(
        &self,
        settings: SupervisorSettings,
        specs: Vec<LaunchSpec>,
    ) -> ReconcileReport {
        self.reconcile(settings, specs).await
    }

    /// Bring the table in line with `specs`: removed projects are stopped and dropped,
    /// changed ones are restarted with their new spec, new ones are registered idle.
    pub async fn reconcile(
        &self,
        settings: SupervisorSettings,
        specs: Vec<LaunchSpec>,
    ) -> ReconcileReport {
        *self.settings.write().await = settings.clone();
        let mut report = ReconcileReport::default();
        let mut removed = Vec::new();
        let mut changed = Vec::new();
        {
            // must hold the write lock so no one looks a project up half-way through.
            let mut table = self.table.write().await;
            let wanted: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
            let stale: Vec<String> = table
                .order
                .iter()
                .filter(|name| !wanted.contains(name.as_str()))
                .cloned()
                .collect();
            for name in stale {
                table.specs.remove(&name);
                if let Some(slot) = table.slots.remove(&name) {
                    removed.push(slot);
                }
                report.removed.push(name);
            }

            let mut order = Vec::with_capacity(specs.len());
            for spec in specs {
                let name = spec.name.clone();
                match table.specs.get(&name) {
                    Some(current) if *current == spec => {}
                    Some(_) => {
                        if let Some(slot) = table.slots.get(&name) {
                            changed.push((slot.clone(), spec.clone()));
                        }
                        table.specs.insert(name.clone(), spec);
                        report.changed.push(name.clone());
                    }
                    None => {
                        table
                            .slots
                            .insert(name.clone(), Arc::new(Mutex::new(ProjectRuntime::new(spec.clone()))));
                        table.specs.insert(name.clone(), spec);
                        report.added.push(name.clone());
                    }
                }
                order.push(name);
            }
            table.order = order;
        }

        let grace = settings.stop_grace();
        for slot in removed {
            let mut rt = slot.lock().await;
            info!(project = %rt.spec.name, "project removed from configuration");
            self.halt(&mut rt, grace).await;
            rt.desired = DesiredState::Stopped;
            rt.observed = ObservedState::Stopped;
        }
        for (slot, spec) in changed {
            let mut rt = slot.lock().await;
            rt.spec = spec;
            if rt.desired == DesiredState::Running && rt.handle.is_some() {
                info!(project = %rt.spec.name, "launch spec changed, restarting");
                rt.observed = ObservedState::Restarting;
                self.halt(&mut rt, grace).await;
                if let Err(e) = self.launch(&mut rt, &settings).await {
                    warn!("{e}");
                }
            }
        }
        if !report.added.is_empty() || !report.removed.is_empty() || !report.changed.is_empty() {
            info!(
                "reconciled projects: added {:?}, removed {:?}, changed {:?}",
                report.added, report.removed, report.changed
            );
        }
        report
    }

    /// Launch every project that wants to run but has never been started.
    pub async fn start_idle(&self) {
        let settings = self.settings().await;
        let settings = &settings;
        let slots = self.slots().await;
        join_all(slots.into_iter().map(|(_, slot)| async move {
            let mut rt = slot.lock().await;
            if rt.desired == DesiredState::Running
                && rt.handle.is_none()
                && rt.observed == ObservedState::Stopped
                && let Err(e) = self.launch(&mut rt, settings).await
            {
                warn!("{e}");
            }
        }))
        .await;
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut rt = slot.lock().await;
        rt.desired = DesiredState::Running;
        if let Some(pid) = rt.handle.as_ref().map(|h| h.pid) {
            match process::poll_exit(pid) {
                ExitState::Running => {
                    rt.observed = ObservedState::Alive;
                    return Ok(());
                }
                ExitState::Exited(record) => {
                    self.detach(&mut rt).await;
                    rt.last_exit = Some(record);
                }
            }
        }
        rt.failures = 0;
        rt.next_attempt = None;
        let settings = self.settings().await;
        self.launch(&mut rt, &settings).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut rt = slot.lock().await;
        rt.desired = DesiredState::Stopped;
        let grace = self.settings().await.stop_grace();
        self.halt(&mut rt, grace).await;
        rt.observed = ObservedState::Stopped;
        Ok(())
    }

    /// Stop then start under one hold of the project lock. Operator restarts clear the
    /// crash-loop window and the launch backoff.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut rt = slot.lock().await;
        let settings = self.settings().await;
        rt.observed = ObservedState::Restarting;
        self.halt(&mut rt, settings.stop_grace()).await;
        rt.desired = DesiredState::Running;
        rt.restart_count += 1;
        rt.restarts.clear();
        rt.failures = 0;
        rt.next_attempt = None;
        self.launch(&mut rt, &settings).await
    }

    /// One liveness sweep. Only one sweep runs at a time; a sweep that finds the previous
    /// one still running returns at once.
    pub async fn tick(&self) {
        if self.frozen.load(Ordering::SeqCst) {
            debug!("supervisor frozen, liveness sweep skipped");
            return;
        }
        let Ok(_sweep) = self.sweep.try_lock() else {
            debug!("previous liveness sweep still running");
            return;
        };
        let settings = self.settings().await;
        let settings = &settings;
        let slots = self.slots().await;
        join_all(slots.into_iter().map(|(name, slot)| async move {
            let Ok(mut rt) = slot.try_lock() else {
                debug!(project = %name, "busy, skipped by liveness sweep");
                return;
            };
            self.check(&mut rt, settings).await;
        }))
        .await;
    }

    async fn check(&self, rt: &mut ProjectRuntime, settings: &SupervisorSettings) {
        if let Some(pid) = rt.handle.as_ref().map(|h| h.pid) {
            match process::poll_exit(pid) {
                ExitState::Running => {
                    // a start that was cancelled half-way leaves a stale transitional state.
                    if rt.observed != ObservedState::Alive {
                        rt.observed = ObservedState::Alive;
                    }
                    return;
                }
                ExitState::Exited(record) => {
                    warn!(
                        project = %rt.spec.name,
                        pid,
                        "process exited ({})",
                        describe_exit(&record)
                    );
                    self.detach(rt).await;
                    rt.last_exit = Some(record);
                    rt.observed = ObservedState::Exited;
                }
            }
        }

        if rt.desired != DesiredState::Running {
            return;
        }
        if rt.next_attempt.is_some_and(|at| Instant::now() < at) {
            debug!(project = %rt.spec.name, "launch backoff in effect");
            return;
        }

        if rt.observed == ObservedState::Exited {
            let now = Instant::now();
            let window = settings.crash_loop_window();
            while rt
                .restarts
                .front()
                .is_some_and(|at| now.duration_since(*at) > window)
            {
                rt.restarts.pop_front();
            }
            if rt.restarts.len() >= settings.crash_loop_threshold as usize {
                self.escalate(rt, settings, now).await;
                return;
            }
            rt.restarts.push_back(now);
            rt.restart_count += 1;
            rt.observed = ObservedState::Restarting;
            info!(
                project = %rt.spec.name,
                restart = rt.restart_count,
                "restarting exited process"
            );
        }

        if let Err(e) = self.launch(rt, settings).await {
            warn!("{e}");
        }
    }

    async fn escalate(&self, rt: &mut ProjectRuntime, settings: &SupervisorSettings, now: Instant) {
        rt.desired = DesiredState::Stopped;
        *self.last_crash_loop.lock().await = Some(now);
        error!(
            project = %rt.spec.name,
            "crash loop: {} restarts within {:?}, left stopped until an operator restarts it",
            rt.restarts.len(),
            settings.crash_loop_window()
        );
        self.notifier
            .notify(Notice::CrashLoop {
                project: rt.spec.name.clone(),
                restarts: rt.restarts.len(),
                window_secs: settings.crash_loop_window().as_secs(),
            })
            .await;
    }

    /// Spawn, wait the settle delay, and require the process to still be running.
    async fn launch(&self, rt: &mut ProjectRuntime, settings: &SupervisorSettings) -> Result<()> {
        let name = rt.spec.name.clone();
        rt.observed = ObservedState::Starting;
        if settings.kill_strays {
            self.kill_strays(&rt.spec, settings.stop_grace()).await;
        }

        let handle = match process::spawn(&rt.spec) {
            Ok(handle) => handle,
            Err(e) => {
                rt.observed = ObservedState::Exited;
                defer(rt, settings);
                return Err(Error::LaunchFailed {
                    project: name,
                    reason: format!("cannot spawn {}: {e}", rt.spec.program),
                });
            }
        };
        let pid = handle.pid;
        self.attach(rt, handle).await;

        sleep(settings.settle_delay()).await;
        match process::poll_exit(pid) {
            ExitState::Running => {
                rt.observed = ObservedState::Alive;
                rt.failures = 0;
                rt.next_attempt = None;
                info!(project = %name, pid, "process is alive");
                Ok(())
            }
            ExitState::Exited(record) => {
                self.detach(rt).await;
                let reason = format!("exited during startup ({})", describe_exit(&record));
                rt.last_exit = Some(record);
                rt.observed = ObservedState::Exited;
                defer(rt, settings);
                Err(Error::LaunchFailed {
                    project: name,
                    reason,
                })
            }
        }
    }

    async fn kill_strays(&self, spec: &LaunchSpec, grace: Duration) {
        let exclude: Vec<u32> = self.managed.lock().await.iter().copied().collect();
        let entry = spec.entry.clone();
        let strays = tokio::task::spawn_blocking(move || process::find_strays(&entry, &exclude))
            .await
            .unwrap_or_default();
        for pid in strays {
            warn!(
                project = %spec.name,
                pid,
                "terminating stray process running {}",
                spec.entry.display()
            );
            process::terminate(pid, grace).await;
        }
    }

    async fn halt(&self, rt: &mut ProjectRuntime, grace: Duration) {
        if let Some(handle) = self.detach(rt).await {
            info!(project = %rt.spec.name, pid = handle.pid, "stopping process");
            let record = process::terminate(handle.pid, grace).await;
            rt.last_exit = Some(record);
        }
    }

    async fn attach(&self, rt: &mut ProjectRuntime, handle: ProcessHandle) {
        self.managed.lock().await.insert(handle.pid);
        rt.handle = Some(handle);
    }

    async fn detach(&self, rt: &mut ProjectRuntime) -> Option<ProcessHandle> {
        let handle = rt.handle.take()?;
        self.managed.lock().await.remove(&handle.pid);
        Some(handle)
    }

    async fn slots(&self) -> Vec<(String, Slot)> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|name| table.slots.get(name).map(|s| (name.clone(), s.clone())))
            .collect()
    }

    async fn slot(&self, name: &str) -> Result<Slot> {
        self.table
            .read()
            .await
            .slots
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProject(name.to_string()))
    }

    pub async fn launch_spec(&self, name: &str) -> Result<LaunchSpec> {
        self.table
            .read()
            .await
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProject(name.to_string()))
    }

    pub async fn status(&self) -> Vec<ProjectStatus> {
        let mut out = Vec::new();
        for (_, slot) in self.slots().await {
            out.push(slot.lock().await.status());
        }
        out
    }

    pub async fn project_status(&self, name: &str) -> Result<ProjectStatus> {
        let slot = self.slot(name).await?;
        let status = slot.lock().await.status();
        Ok(status)
    }

    /// Whether the project's process is still running. An exit is recorded the way a
    /// liveness sweep would record it; the restart is left to the next sweep.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name).await?;
        let mut rt = slot.lock().await;
        let Some(pid) = rt.handle.as_ref().map(|h| h.pid) else {
            return Ok(false);
        };
        match process::poll_exit(pid) {
            ExitState::Running => Ok(true),
            ExitState::Exited(record) => {
                warn!(
                    project = %rt.spec.name,
                    pid,
                    "process exited ({})",
                    describe_exit(&record)
                );
                self.detach(&mut rt).await;
                rt.last_exit = Some(record);
                rt.observed = ObservedState::Exited;
                Ok(false)
            }
        }
    }

    /// PIDs of every process currently held by a project.
    pub async fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.managed.lock().await.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub async fn last_crash_loop(&self) -> Option<Instant> {
        *self.last_crash_loop.lock().await
    }

    /// Confirm or condemn a freshly committed configuration. A crash loop after the commit
    /// marks it unhealthy; surviving the health grace gets it backed up.
    pub async fn check_config_health(&self, store: &ConfigStore) -> Result<()> {
        let ConfigPhase::Committed { since } = store.phase().await else {
            return Ok(());
        };
        if self.last_crash_loop().await.is_some_and(|at| at >= since) {
            store.mark_unhealthy().await;
            self.notifier.notify(Notice::ConfigUnhealthy).await;
            return Ok(());
        }
        if since.elapsed() >= self.settings().await.health_grace() {
            store.confirm_healthy().await?;
        }
        Ok(())
    }

    /// Hold every project lock and stop liveness sweeps until the returned guard is
    /// dropped. Used right before the supervisor replaces itself.
    pub async fn freeze_for_handoff(&self) -> HandoffFreeze<'_> {
        self.frozen.store(true, Ordering::SeqCst);
        let _sweep = self.sweep.lock().await;
        let mut guards = Vec::new();
        for (_, slot) in self.slots().await {
            guards.push(slot.lock_owned().await);
        }
        info!("supervisor frozen with {} projects", guards.len());
        HandoffFreeze {
            supervisor: self,
            guards,
        }
    }

    /// Attach the processes listed in a handoff record without launching anything.
    pub async fn adopt(&self, record: &HandoffRecord) -> AdoptionReport {
        let grace = self.settings().await.stop_grace();
        let mut report = AdoptionReport::default();
        for entry in &record.entries {
            let Ok(slot) = self.slot(&entry.name).await else {
                if identity(entry).is_ok() {
                    warn!(
                        project = %entry.name,
                        pid = entry.pid,
                        "project is no longer registered, terminating its process"
                    );
                    process::terminate(entry.pid, grace).await;
                }
                report.orphaned.push(entry.name.clone());
                continue;
            };

            let mut rt = slot.lock().await;
            let result = identity(entry).and_then(|()| {
                if entry.signature.digest == LaunchSignature::of(&rt.spec).digest {
                    Ok(())
                } else {
                    Err(Mismatch::SpecChanged)
                }
            });
            match result {
                Ok(()) => {
                    let handle = ProcessHandle {
                        pid: entry.pid,
                        signature: entry.signature.clone(),
                        started_at: entry.started_at,
                        proc_start_time: entry.proc_start_time,
                        adopted: true,
                    };
                    self.attach(&mut rt, handle).await;
                    rt.desired = DesiredState::Running;
                    rt.observed = ObservedState::Alive;
                    info!(project = %entry.name, pid = entry.pid, "adopted running process");
                    report.adopted.push(entry.name.clone());
                }
                Err(Mismatch::SpecChanged) => {
                    warn!(
                        project = %entry.name,
                        pid = entry.pid,
                        "launch spec changed across the handoff, replacing the process"
                    );
                    process::terminate(entry.pid, grace).await;
                    report.fresh.push(entry.name.clone());
                }
                Err(Mismatch::NotTheSame(reason)) => {
                    warn!(project = %entry.name, pid = entry.pid, "not adopting: {reason}");
                    // reap it if it is our exited child.
                    let _ = process::poll_exit(entry.pid);
                    report.fresh.push(entry.name.clone());
                }
            }
        }
        info!(
            "adoption finished: adopted {:?}, fresh {:?}, orphaned {:?}",
            report.adopted, report.fresh, report.orphaned
        );
        report
    }

    /// Stop every managed process. Used on daemon exit.
    pub async fn shutdown(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        let grace = self.settings().await.stop_grace();
        let slots = self.slots().await;
        join_all(slots.into_iter().map(|(_, slot)| async move {
            let mut rt = slot.lock().await;
            self.halt(&mut rt, grace).await;
            rt.observed = ObservedState::Stopped;
        }))
        .await;
        info!("all managed processes stopped");
    }
}

fn defer(rt: &mut ProjectRuntime, settings: &SupervisorSettings) {
    rt.failures += 1;
    let delay = settings.backoff(rt.failures);
    rt.next_attempt = Some(Instant::now() + delay);
    warn!(
        project = %rt.spec.name,
        failures = rt.failures,
        "launch failed, next attempt in {delay:?}"
    );
}

fn describe_exit(record: &ExitRecord) -> String {
    match (record.code, record.signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => "exit status unknown".to_string(),
    }
}

enum Mismatch {
    NotTheSame(String),
    SpecChanged,
}

/// Is the PID in `entry` still the very process that was recorded?
fn identity(entry: &HandoffEntry) -> std::result::Result<(), Mismatch> {
    if !process::is_alive(entry.pid) {
        return Err(Mismatch::NotTheSame("process is gone".to_string()));
    }
    let info = process::inspect(entry.pid)
        .ok_or_else(|| Mismatch::NotTheSame("process is not visible".to_string()))?;
    if info.cmd != entry.signature.argv() {
        return Err(Mismatch::NotTheSame(format!(
            "command line is now {:?}",
            info.cmd
        )));
    }
    if let Some(expected) = entry.proc_start_time
        && info.start_time != expected
    {
        return Err(Mismatch::NotTheSame(
            "start time differs, the pid was reused".to_string(),
        ));
    }
    if let Some(cwd) = &info.cwd {
        let recorded = std::fs::canonicalize(&entry.signature.working_dir)
            .unwrap_or_else(|_| entry.signature.working_dir.clone());
        if *cwd != recorded {
            debug!(
                pid = entry.pid,
                "working directory moved from {} to {}",
                recorded.display(),
                cwd.display()
            );
        }
    }
    Ok(())
}

/// Every project lock, held. Dropping it thaws the supervisor.
pub struct HandoffFreeze<'a> {
    supervisor: &'a Supervisor,
    guards: Vec<OwnedMutexGuard<ProjectRuntime>>,
}

impl HandoffFreeze<'_> {
    pub fn entries(&self) -> Vec<HandoffEntry> {
        self.guards
            .iter()
            .filter_map(|rt| {
                rt.handle.as_ref().map(|h| HandoffEntry {
                    name: rt.spec.name.clone(),
                    pid: h.pid,
                    signature: h.signature.clone(),
                    started_at: h.started_at,
                    proc_start_time: h.proc_start_time,
                })
            })
            .collect()
    }

    pub fn thaw(self) {}
}

impl Drop for HandoffFreeze<'_> {
    fn drop(&mut self) {
        self.supervisor.frozen.store(false, Ordering::SeqCst);
        info!("supervisor thawed");
    }
}
