use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use common::{CallerId, Command, CommandRequest, CommandResponse, Violation};

#[derive(Parser, Debug)]
#[command(name = "rkm")]
#[command(version, about = "A self-updating process supervisor", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run the supervisor")]
    Daemon(DaemonArgs),
    #[command(about = "Check a configuration file without applying it")]
    Validate {
        #[arg(value_name = "CONFIG_JSON")]
        file: PathBuf,
    },
    #[command(about = "Send a command to a running supervisor")]
    Ctl(CtlArgs),
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Directory holding config.json, backups, logs and the handoff record
    #[arg(long, env = "RKM_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Command channel listening address
    #[arg(long, env = "RKM_LISTEN", default_value = "127.0.0.1:7878")]
    pub listen: SocketAddr,

    /// Detach from the terminal
    #[arg(long)]
    pub detach: bool,

    /// Write the log files as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Args, Debug)]
pub struct CtlArgs {
    /// Supervisor command channel
    #[arg(long, env = "RKM_URL", default_value = "http://127.0.0.1:7878")]
    pub url: String,

    /// Bearer token (the configuration's TOKEN)
    #[arg(long, env = "RKM_TOKEN")]
    pub token: String,

    /// Target group (the configuration's GUILD_ID)
    #[arg(long, env = "RKM_GROUP")]
    pub group: u64,

    /// Identity to act as
    #[arg(long, env = "RKM_CALLER")]
    pub caller: CallerId,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Subcommand, Debug)]
pub enum CtlCommand {
    #[command(about = "Restart the supervisor itself")]
    RebootSelf,
    #[command(about = "Restart a project")]
    Reboot { project: String },
    #[command(about = "Update a project from its remote source")]
    Pull {
        project: String,
        #[arg(long = "ref")]
        source_ref: Option<String>,
    },
    #[command(about = "Update the supervisor from its remote source")]
    PullSelf {
        #[arg(long = "ref")]
        source_ref: Option<String>,
    },
    #[command(about = "Print the active configuration")]
    GetConfig,
    #[command(about = "Replace the configuration with a file's content")]
    SetConfig {
        #[arg(value_name = "CONFIG_JSON")]
        file: PathBuf,
    },
    #[command(about = "Roll the configuration back to the newest backup")]
    RestoreConfig,
    #[command(about = "Print the tail of the newest log file")]
    GetLogs {
        #[arg(long)]
        lines: Option<usize>,
    },
    #[command(
        about = "Upgrade a library through the configured package manager, or every library the projects list"
    )]
    Upgrade {
        library: Option<String>,
        version: Option<String>,
    },
    #[command(about = "Show every project's state")]
    Status,
}

impl CtlCommand {
    pub fn into_command(self) -> anyhow::Result<Command> {
        Ok(match self {
            CtlCommand::RebootSelf => Command::RebootSelf,
            CtlCommand::Reboot { project } => Command::Reboot { project },
            CtlCommand::Pull {
                project,
                source_ref,
            } => Command::Pull {
                project,
                source_ref,
            },
            CtlCommand::PullSelf { source_ref } => Command::PullSelf { source_ref },
            CtlCommand::GetConfig => Command::GetConfig,
            CtlCommand::SetConfig { file } => Command::SetConfig {
                content: std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
            },
            CtlCommand::RestoreConfig => Command::RestoreConfig,
            CtlCommand::GetLogs { lines } => Command::GetLogs { lines },
            CtlCommand::Upgrade { library, version } => Command::Upgrade { library, version },
            CtlCommand::Status => Command::Status,
        })
    }
}

/// Post one command to the supervisor and decode its answer.
pub async fn send(args: CtlArgs) -> anyhow::Result<CommandResponse> {
    let request = CommandRequest {
        group: args.group,
        caller: args.caller,
        command: args.command.into_command()?,
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let url = format!("{}/v1/commands", args.url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .bearer_auth(&args.token)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    let status = response.status();
    let body = response.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| anyhow!("unexpected answer ({status}): {e}: {body}"))
}

/// Validate a configuration file, returning its violations.
pub fn validate_file(file: &PathBuf) -> anyhow::Result<Vec<Violation>> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(common::validate(&raw))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_ctl_pull() {
        let cli = Cli::try_parse_from([
            "rkm", "ctl", "--token", "t", "--group", "7", "--caller", "42", "pull", "bot",
            "--ref", "main",
        ])
        .unwrap();
        let Commands::Ctl(args) = cli.command else {
            panic!("expected ctl");
        };
        assert_eq!(args.caller, 42);
        assert_eq!(
            args.command.into_command().unwrap(),
            Command::Pull {
                project: "bot".to_string(),
                source_ref: Some("main".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_ctl_upgrade_without_library() {
        let cli = Cli::try_parse_from([
            "rkm", "ctl", "--token", "t", "--group", "7", "--caller", "42", "upgrade",
        ])
        .unwrap();
        let Commands::Ctl(args) = cli.command else {
            panic!("expected ctl");
        };
        assert_eq!(
            args.command.into_command().unwrap(),
            Command::Upgrade {
                library: None,
                version: None,
            }
        );
    }

    #[test]
    fn test_daemon_defaults() {
        let cli = Cli::try_parse_from(["rkm", "daemon"]).unwrap();
        let Commands::Daemon(args) = cli.command else {
            panic!("expected daemon");
        };
        assert!(!args.detach);
        assert_eq!(args.listen.port(), 7878);
    }
}
