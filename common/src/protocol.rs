use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CallerId, Violation};

/// An operator command, as received from the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Command {
    RebootSelf,
    Reboot {
        project: String,
    },
    Pull {
        project: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_ref: Option<String>,
    },
    PullSelf {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_ref: Option<String>,
    },
    GetConfig,
    SetConfig {
        content: String,
    },
    RestoreConfig,
    GetLogs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
    },
    /// Without a library, every library listed by a project is upgraded.
    Upgrade {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        library: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Status,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RebootSelf => "reboot_self",
            Command::Reboot { .. } => "reboot",
            Command::Pull { .. } => "pull",
            Command::PullSelf { .. } => "pull_self",
            Command::GetConfig => "get_config",
            Command::SetConfig { .. } => "set_config",
            Command::RestoreConfig => "restore_config",
            Command::GetLogs { .. } => "get_logs",
            Command::Upgrade { .. } => "upgrade",
            Command::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Target group the command is addressed to; must match `GUILD_ID`.
    pub group: u64,
    pub caller: CallerId,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    ConfigCorrupt,
    NoBackupAvailable,
    Unauthorized,
    UnknownProject,
    LaunchFailed,
    FetchFailed,
    MergeConflict,
    SelfUpdateFailed,
    SupervisorRestarting,
    UpgradeFailed,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: ErrorKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResponse {
    Ok(CommandOutput),
    Error(CommandFailure),
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandResponse::Ok(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandOutput {
    Message {
        text: String,
    },
    Config {
        content: String,
    },
    Logs {
        file: String,
        text: String,
    },
    Update(UpdateRequest),
    Upgrade {
        runs: Vec<UpgradeRun>,
    },
    Status {
        projects: Vec<ProjectStatus>,
    },
}

/// One package-manager invocation. A non-zero exit is reported here, not as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRun {
    pub library: String,
    pub command: Vec<String>,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTarget {
    Project(String),
    #[serde(rename = "self")]
    SelfTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateOutcome {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

/// A pull request against a project or the supervisor itself, carried until its outcome is
/// terminal and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub target: UpdateTarget,
    pub source_ref: String,
    pub requester: CallerId,
    pub outcome: UpdateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_after: Option<String>,
    #[serde(default)]
    pub detail: String,
}

impl UpdateRequest {
    pub fn new(target: UpdateTarget, source_ref: impl Into<String>, requester: CallerId) -> Self {
        UpdateRequest {
            target,
            source_ref: source_ref.into(),
            requester,
            outcome: UpdateOutcome::Pending,
            revision_before: None,
            revision_after: None,
            detail: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Stopped,
    Starting,
    Alive,
    Exited,
    Restarting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub at: DateTime<Utc>,
    /// `None` when the exit status could not be collected (not our child, or killed by signal).
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub name: String,
    pub desired: DesiredState,
    pub observed: ObservedState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitRecord>,
    #[serde(default)]
    pub adopted: bool,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_names() {
        let cmd: Command =
            serde_json::from_value(json!({ "name": "pull", "project": "alpha" })).unwrap();
        assert_eq!(
            cmd,
            Command::Pull {
                project: "alpha".to_string(),
                source_ref: None
            }
        );
        assert_eq!(cmd.name(), "pull");
        let cmd: Command = serde_json::from_value(json!({ "name": "reboot_self" })).unwrap();
        assert_eq!(cmd, Command::RebootSelf);
    }

    #[test]
    fn test_response_shape() {
        let resp = CommandResponse::Error(CommandFailure {
            kind: ErrorKind::ConfigInvalid,
            detail: "bad".to_string(),
            violations: vec![Violation::new("AUTHORIZED_LIST", "required key is missing")],
        });
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["error"]["kind"], "config_invalid");
        assert_eq!(v["error"]["violations"][0]["field"], "AUTHORIZED_LIST");

        let mut update = UpdateRequest::new(UpdateTarget::SelfTarget, "main", 1);
        update.outcome = UpdateOutcome::RolledBack;
        let v = serde_json::to_value(CommandResponse::Ok(CommandOutput::Update(update))).unwrap();
        assert_eq!(v["ok"]["type"], "update");
        assert_eq!(v["ok"]["outcome"], "rolled-back");
        assert_eq!(v["ok"]["target"], "self");
    }
}
