use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use async_trait::async_trait;

use crate::error::Error;

/// Set on the re-executed supervisor so it does not daemonize a second time.
pub const RELAUNCHED_ENV: &str = "RKM_RELAUNCHED";

#[async_trait]
pub trait Relauncher: Send + Sync {
    /// Replace the running supervisor with `executable`. Only returns if that failed.
    async fn relaunch(&self, executable: &Path) -> Error;
}

/// Re-executes in place with the current arguments. The PID stays the same, so the
/// managed processes remain our children and two supervisors never run side by side.
#[derive(Debug, Default, Clone)]
pub struct ExecRelauncher;

#[async_trait]
impl Relauncher for ExecRelauncher {
    async fn relaunch(&self, executable: &Path) -> Error {
        let err = Command::new(executable)
            .args(std::env::args_os().skip(1))
            .env(RELAUNCHED_ENV, "1")
            .exec();
        Error::SelfUpdateFailed(format!("cannot exec {}: {err}", executable.display()))
    }
}
