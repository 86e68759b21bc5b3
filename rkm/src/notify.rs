use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

/// Something operators should hear about without having asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notice {
    CrashLoop {
        project: String,
        restarts: usize,
        window_secs: u64,
    },
    ConfigRestored {
        reason: String,
    },
    ConfigUnhealthy,
    UpdateRolledBack {
        project: String,
        detail: String,
    },
    /// An update could not even be rolled back; the project needs a human.
    UpdateFailed {
        project: String,
        detail: String,
    },
    SelfUpdateConfirmed {
        adopted: Vec<String>,
        fresh: Vec<String>,
    },
    SelfUpdateFailed {
        detail: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice);
}

/// Publishes notices as structured log events.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: Notice) {
        let body = serde_json::to_string(&notice).unwrap_or_else(|_| format!("{notice:?}"));
        match notice {
            Notice::CrashLoop { .. }
            | Notice::UpdateFailed { .. }
            | Notice::SelfUpdateFailed { .. } => {
                error!(target: "rkm::notice", "{body}")
            }
            Notice::ConfigRestored { .. }
            | Notice::ConfigUnhealthy
            | Notice::UpdateRolledBack { .. } => warn!(target: "rkm::notice", "{body}"),
            Notice::SelfUpdateConfirmed { .. } => info!(target: "rkm::notice", "{body}"),
        }
    }
}
