use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;

use common::{CommandOutput, Configuration, UpgradeRun, UpgradeSettings};
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{Error, Result};

// PEP 508 distribution names, plus a conservative version charset.
static LIBRARY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?(\[[A-Za-z0-9._,-]+\])?$")
        .expect("valid regex")
});
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.+!*-]*$").expect("valid regex"));

/// Expand the configured command template for `library`.
pub fn render_command(
    settings: &UpgradeSettings,
    library: &str,
    version: Option<&str>,
) -> Result<Vec<String>> {
    if !LIBRARY_NAME.is_match(library) {
        return Err(Error::BadRequest(format!(
            "`{library}` is not a valid library name"
        )));
    }
    let template = match version {
        Some(v) if !VERSION.is_match(v) => {
            return Err(Error::BadRequest(format!("`{v}` is not a valid version")));
        }
        Some(_) => &settings.pinned_command,
        None => &settings.command,
    };
    if template.is_empty() {
        return Err(Error::UpgradeFailed("no upgrade command configured".to_string()));
    }
    Ok(template
        .iter()
        .map(|part| {
            part.replace("{library}", library)
                .replace("{version}", version.unwrap_or_default())
        })
        .collect())
}

/// Every library named in some project's `libraries`, once each.
pub fn project_libraries(config: &Configuration) -> Vec<String> {
    config
        .projects
        .iter()
        .flat_map(|p| p.libraries.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Upgrade `library`, or every library the projects list when none is named.
pub async fn upgrade(
    config: &Configuration,
    library: Option<&str>,
    version: Option<&str>,
) -> Result<CommandOutput> {
    let runs = match library {
        Some(library) => vec![run(&config.upgrade, library, version).await?],
        None if version.is_some() => {
            return Err(Error::BadRequest(
                "a version can only be pinned for a named library".to_string(),
            ));
        }
        None => {
            let libraries = project_libraries(config);
            if libraries.is_empty() {
                return Err(Error::BadRequest(
                    "no project lists any libraries".to_string(),
                ));
            }
            let mut runs = Vec::with_capacity(libraries.len());
            for library in &libraries {
                runs.push(run(&config.upgrade, library, None).await?);
            }
            runs
        }
    };
    Ok(CommandOutput::Upgrade { runs })
}

/// Run the package manager once. A non-zero exit is reported in the run, not as an
/// error; only failing to run it at all is `UpgradeFailed`.
pub async fn run(
    settings: &UpgradeSettings,
    library: &str,
    version: Option<&str>,
) -> Result<UpgradeRun> {
    let command = render_command(settings, library, version)?;
    let Some((program, args)) = command.split_first() else {
        return Err(Error::UpgradeFailed("empty upgrade command".to_string()));
    };
    info!("upgrading {library}: {}", command.join(" "));
    let limit = Duration::from_secs(settings.timeout_secs);
    let output = timeout(
        limit,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| Error::UpgradeFailed(format!("timed out after {limit:?}")))?
    .map_err(|e| Error::UpgradeFailed(format!("cannot run {program}: {e}")))?;

    let success = output.status.success();
    if !success {
        warn!("upgrade of {library} exited with {}", output.status);
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(UpgradeRun {
        library: library.to_string(),
        command,
        success,
        output: text,
    })
}
