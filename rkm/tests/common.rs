#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Configuration, LaunchSpec, SupervisorSettings};
use rkm::config_store::ConfigStore;
use rkm::error::{Error, Result};
use rkm::notify::{Notice, Notifier};
use rkm::rootpath::StateLayout;
use rkm::supervisor::Supervisor;
use rkm::update::relaunch::Relauncher;
use rkm::update::source::{CodeSource, Revision, SourceTarget};
use serde_json::{Value, json};
use tempfile::TempDir;

pub const TOKEN: &str = "rkm-test-token-0123456789-abcdefghijklmnopqrstuvwxyz";
pub const GROUP: u64 = 4242;
pub const OPERATOR: u64 = 7;

pub const LONG_RUNNING: &str = "while true; do sleep 1; done\n";
pub const IGNORES_TERM: &str = "trap '' TERM\nwhile true; do sleep 1; done\n";
pub const CRASHING: &str = "exit 3\n";
/// Survives the settle delay, then fails.
pub const DIES_AFTER_START: &str = "sleep 0.3\nexit 1\n";

/// An isolated state directory with a `scripts/` folder for managed programs.
pub struct Fixture {
    pub dir: TempDir,
    pub layout: StateLayout,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("scripts")).unwrap();
        Fixture {
            dir,
            layout: StateLayout::new(root),
        }
    }

    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.layout.root.join("scripts").join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    pub fn store(&self) -> ConfigStore {
        ConfigStore::new(self.layout.config_file(), self.layout.backup_dir())
    }

    pub fn write_config(&self, raw: &str) {
        std::fs::write(self.layout.config_file(), raw).unwrap();
    }
}

/// Settings small enough for tests to run in well under a second per launch.
pub fn fast_settings() -> Value {
    json!({
        "settle_delay_ms": 200,
        "stop_grace_ms": 500,
        "crash_loop_threshold": 3,
        "crash_loop_window_secs": 60,
        "backoff_initial_ms": 10,
        "backoff_max_secs": 1,
        "health_grace_secs": 3600,
        "kill_strays": false,
        "backup_retention": 3
    })
}

/// A `sh` project running `script`; the project is named after the script's stem.
pub fn project(script: &Path) -> Value {
    json!({
        "local_path": script,
        "interpreter": "sh",
        "github_path": "https://github.com/acme/widgets",
    })
}

pub fn config_json(projects: Vec<Value>) -> String {
    serde_json::to_string_pretty(&json!({
        "GUILD_ID": GROUP,
        "TOKEN": TOKEN,
        "AUTHORIZED_LIST": [OPERATOR],
        "PROJECTS": projects,
        "CHECK_INTERVAL": 1,
        "SUPERVISOR": fast_settings(),
        "UPDATES": {
            "alive_window_secs": 2,
            "default_ref": "main",
            "fetch_timeout_secs": 5,
            "relaunch_confirm_secs": 60
        }
    }))
    .unwrap()
}

pub fn parse(raw: &str) -> Configuration {
    common::parse(raw).unwrap()
}

pub fn specs(config: &Configuration, fixture: &Fixture) -> Vec<LaunchSpec> {
    config.launch_specs(&fixture.layout.root)
}

pub async fn supervisor_for(
    config: &Configuration,
    fixture: &Fixture,
    notifier: Arc<RecordingNotifier>,
) -> Arc<Supervisor> {
    let supervisor = Arc::new(Supervisor::new(config.supervisor_settings(), notifier));
    supervisor
        .register(config.supervisor_settings(), specs(config, fixture))
        .await;
    supervisor
}

pub fn settings_of(config: &Configuration) -> SupervisorSettings {
    config.supervisor_settings()
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// Replaces the entry file with `new_body` on fetch, keeping the old bytes for revert.
pub struct FakeSource {
    pub new_body: String,
    pub fail_fetch: bool,
    saved: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl FakeSource {
    pub fn new(new_body: &str) -> Self {
        FakeSource {
            new_body: new_body.to_string(),
            fail_fetch: false,
            saved: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing() -> Self {
        FakeSource {
            fail_fetch: true,
            ..FakeSource::new("")
        }
    }
}

#[async_trait]
impl CodeSource for FakeSource {
    async fn revision(&self, target: &SourceTarget) -> Result<Revision> {
        let bytes = std::fs::read(&target.entry)?;
        Ok(Revision(sha256::digest(bytes.as_slice())))
    }

    async fn fetch(&self, target: &SourceTarget, _source_ref: &str) -> Result<Revision> {
        if self.fail_fetch {
            return Err(Error::FetchFailed {
                target: target.label.clone(),
                reason: "remote unreachable".to_string(),
            });
        }
        let old = std::fs::read(&target.entry)?;
        self.saved.lock().unwrap().insert(target.entry.clone(), old);
        std::fs::write(&target.entry, &self.new_body)?;
        self.revision(target).await
    }

    async fn revert(&self, target: &SourceTarget, _to: &Revision) -> Result<()> {
        let old = self
            .saved
            .lock()
            .unwrap()
            .remove(&target.entry)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("nothing to revert")))?;
        std::fs::write(&target.entry, old)?;
        Ok(())
    }
}

/// Records the relaunch and then never returns, like a successful `exec`.
#[derive(Default)]
pub struct FakeRelauncher {
    pub launched: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Relauncher for FakeRelauncher {
    async fn relaunch(&self, executable: &Path) -> Error {
        self.launched.lock().unwrap().push(executable.to_path_buf());
        std::future::pending::<Error>().await
    }
}

/// Relauncher whose `exec` always fails.
pub struct BrokenRelauncher;

#[async_trait]
impl Relauncher for BrokenRelauncher {
    async fn relaunch(&self, executable: &Path) -> Error {
        Error::SelfUpdateFailed(format!("cannot exec {}", executable.display()))
    }
}

pub async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
