use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tokio::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::error::Result;

pub const LOG_PREFIX: &str = "monitor";
pub const LOG_SUFFIX: &str = "log";
const KEPT_FILES: usize = 3;
pub const DEFAULT_TAIL_LINES: usize = 200;
const MAX_TAIL_LINES: usize = 5_000;

/// Install the global subscriber: human-readable output on stderr, and when `log_dir` is
/// given a daily-rolling file sink. Keep the returned guard alive for the whole process.
pub fn init(log_dir: Option<&Path>, json: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = Builder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix(LOG_SUFFIX)
                .max_log_files(KEPT_FILES)
                .build(dir)
                .with_context(|| format!("Failed to open log files in {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            let layer = if json { layer.json().boxed() } else { layer.boxed() };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;
    Ok(guard)
}

/// The last `lines` lines of the newest log file, with that file's name.
pub async fn tail(log_dir: &Path, lines: Option<usize>) -> Result<(String, String)> {
    let lines = lines
        .unwrap_or(DEFAULT_TAIL_LINES)
        .clamp(1, MAX_TAIL_LINES);
    let newest = newest_log(log_dir)
        .await?
        .ok_or_else(|| anyhow!("no log file in {}", log_dir.display()))?;
    let bytes = fs::read(&newest).await?;
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    let name = newest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok((name, all[start..].join("\n")))
}

async fn newest_log(log_dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = match fs::read_dir(log_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(LOG_PREFIX) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if newest.as_ref().is_none_or(|(at, _)| modified > *at) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
