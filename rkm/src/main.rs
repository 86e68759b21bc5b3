use std::fs::OpenOptions;

use anyhow::Context;
use clap::Parser;
use daemonize::Daemonize;
use rkm::cli::{Cli, Commands};
use rkm::rootpath::{self, StateLayout};
use rkm::update::RELAUNCHED_ENV;
use rkm::{cli, daemon, logging};

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let violations = cli::validate_file(&file)?;
            if violations.is_empty() {
                println!("{}: ok", file.display());
                return Ok(());
            }
            for v in &violations {
                eprintln!("{v}");
            }
            std::process::exit(1);
        }
        Commands::Ctl(args) => {
            let runtime = tokio::runtime::Runtime::new()?;
            let response = runtime.block_on(cli::send(args))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.is_ok() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Daemon(args) => {
            let layout = StateLayout::new(rootpath::determine(args.state_dir)?);
            // a relaunched supervisor is already detached.
            if args.detach && std::env::var_os(RELAUNCHED_ENV).is_none() {
                let out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(layout.root.join("rkm.out"))
                    .context("Failed to open daemon output file")?;
                let err = out.try_clone()?;
                Daemonize::new()
                    .pid_file(layout.root.join("rkm.pid"))
                    .working_directory(std::env::current_dir()?)
                    .stdout(out)
                    .stderr(err)
                    .start()?;
            }
            let _guard = logging::init(Some(&layout.log_dir()), args.log_json)?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(daemon::run(layout, args.listen))
        }
    }
}
