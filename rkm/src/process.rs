//! OS-level process primitives used by the supervisor.
//!
//! Exit detection goes through `waitpid(WNOHANG)` so that children spawned by this
//! process and children inherited across `exec` are handled the same way. The
//! `std::process::Child` returned by spawn is dropped right away; the PID is the handle.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ExitRecord, LaunchSpec};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, System};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// What a process was started with. The digest identifies the launch spec across restarts
/// of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSignature {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub digest: String,
}

impl LaunchSignature {
    pub fn of(spec: &LaunchSpec) -> Self {
        let canonical = serde_json::json!([spec.program, spec.args, spec.working_dir]).to_string();
        LaunchSignature {
            program: spec.program.clone(),
            args: spec.args.clone(),
            working_dir: spec.working_dir.clone(),
            digest: sha256::digest(canonical),
        }
    }

    /// The command line as the kernel reports it.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Exclusive handle to a running OS process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub signature: LaunchSignature,
    pub started_at: DateTime<Utc>,
    /// Kernel start time (seconds since epoch) as reported by sysinfo.
    pub proc_start_time: Option<u64>,
    pub adopted: bool,
}

pub enum ExitState {
    Running,
    Exited(ExitRecord),
}

/// Spawn the process described by `spec`, detached from our stdin and in its own process
/// group so a terminal interrupt aimed at the supervisor does not reach it.
pub fn spawn(spec: &LaunchSpec) -> std::io::Result<ProcessHandle> {
    let signature = LaunchSignature::of(spec);
    let child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()?;
    let pid = child.id();
    drop(child);

    let proc_start_time = inspect(pid).map(|info| info.start_time);
    info!(
        project = %spec.name,
        pid,
        "spawned {} {}",
        spec.program,
        spec.args.join(" ")
    );
    Ok(ProcessHandle {
        pid,
        signature,
        started_at: Utc::now(),
        proc_start_time,
        adopted: false,
    })
}

fn exit_record(code: Option<i32>, signal: Option<i32>) -> ExitRecord {
    ExitRecord {
        at: Utc::now(),
        code,
        signal,
    }
}

/// Non-blocking exit check. Reaps the process if it is our child and has exited.
pub fn poll_exit(pid: u32) -> ExitState {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => ExitState::Exited(exit_record(Some(code), None)),
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            ExitState::Exited(exit_record(None, Some(sig as i32)))
        }
        Ok(_) => ExitState::Running,
        Err(Errno::ECHILD) => {
            // Not our child; the exit code is lost, only presence can be checked.
            if is_alive(pid) {
                ExitState::Running
            } else {
                ExitState::Exited(exit_record(None, None))
            }
        }
        Err(e) => {
            warn!(pid, "waitpid failed: {e}");
            ExitState::Running
        }
    }
}

pub fn is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns the recorded exit.
pub async fn terminate(pid: u32, grace: Duration) -> ExitRecord {
    if let ExitState::Exited(record) = poll_exit(pid) {
        return record;
    }
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, "SIGTERM failed: {e}");
    }
    if let Some(record) = wait_exit(pid, grace).await {
        return record;
    }

    warn!(pid, "process ignored SIGTERM for {grace:?}, sending SIGKILL");
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        debug!(pid, "SIGKILL failed: {e}");
    }
    wait_exit(pid, KILL_WAIT)
        .await
        .unwrap_or_else(|| exit_record(None, Some(Signal::SIGKILL as i32)))
}

async fn wait_exit(pid: u32, limit: Duration) -> Option<ExitRecord> {
    let deadline = Instant::now() + limit;
    loop {
        if let ExitState::Exited(record) = poll_exit(pid) {
            return Some(record);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// What the kernel says about a PID.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub start_time: u64,
}

pub fn inspect(pid: u32) -> Option<ProcessInfo> {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut sys = System::new();
    if !sys.refresh_process_specifics(pid, ProcessRefreshKind::everything()) {
        return None;
    }
    let process = sys.process(pid)?;
    Some(ProcessInfo {
        cmd: process.cmd().to_vec(),
        cwd: process.cwd().map(Path::to_path_buf),
        start_time: process.start_time(),
    })
}

/// PIDs of processes whose command line runs `entry`, other than this process and `exclude`.
pub fn find_strays(entry: &Path, exclude: &[u32]) -> Vec<u32> {
    let needle = entry.to_string_lossy();
    let own = std::process::id();
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::everything());
    sys.processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process))
        .filter(|(pid, _)| *pid != own && !exclude.contains(pid))
        .filter(|(_, process)| process.cmd().iter().any(|arg| *arg == needle))
        .map(|(pid, _)| pid)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            name: "t".to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            entry: PathBuf::from(program),
            source: None,
        }
    }

    #[test]
    fn test_signature_digest_tracks_spec() {
        let a = LaunchSignature::of(&spec("sh", &["-c", "sleep 1"]));
        let b = LaunchSignature::of(&spec("sh", &["-c", "sleep 2"]));
        assert_ne!(a.digest, b.digest);
        assert_eq!(a, LaunchSignature::of(&spec("sh", &["-c", "sleep 1"])));
        assert_eq!(a.argv(), vec!["sh", "-c", "sleep 1"]);
    }

    #[tokio::test]
    async fn test_exit_code_is_collected() {
        let handle = spawn(&spec("sh", &["-c", "exit 3"])).unwrap();
        let record = wait_exit(handle.pid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.code, Some(3));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let handle = spawn(&spec("sh", &["-c", "trap '' TERM; exec sleep 30"])).unwrap();
        sleep(Duration::from_millis(200)).await;
        let record = terminate(handle.pid, Duration::from_millis(300)).await;
        assert_eq!(record.signal, Some(Signal::SIGKILL as i32));
        assert!(!is_alive(handle.pid));
    }
}
