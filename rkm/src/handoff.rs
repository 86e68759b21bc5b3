//! The process table written right before the supervisor re-executes itself, and read back
//! by the new instance to adopt the still-running children.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use common::CallerId;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;
use crate::fsutil::{atomic_write, remove_if_exists};
use crate::process::LaunchSignature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffEntry {
    pub name: String,
    pub pid: u32,
    pub signature: LaunchSignature,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_start_time: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandoffReason {
    RebootSelf {
        requested_by: CallerId,
    },
    PullSelf {
        requested_by: CallerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub written_at: DateTime<Utc>,
    pub confirm_deadline: DateTime<Utc>,
    pub reason: HandoffReason,
    pub supervisor_pid: u32,
    pub entries: Vec<HandoffEntry>,
}

impl HandoffRecord {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.confirm_deadline
    }

    /// An `exec` relaunch keeps the PID. A record left by another process means the
    /// listed processes are not our children and their exit codes cannot be collected.
    pub fn written_by(&self, pid: u32) -> bool {
        self.supervisor_pid == pid
    }
}

pub struct HandoffStore {
    path: PathBuf,
}

impl HandoffStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HandoffStore { path: path.into() }
    }

    pub async fn write(&self, record: &HandoffRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        atomic_write(&self.path, &bytes).await?;
        info!(
            "handoff record with {} entries written to {}",
            record.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read and delete the record. An unreadable record is discarded.
    pub async fn take(&self) -> Result<Option<HandoffRecord>> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = match serde_json::from_slice::<HandoffRecord>(&bytes) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Discarding unreadable handoff record {}: {e}", self.path.display());
                None
            }
        };
        self.discard().await?;
        Ok(record)
    }

    pub async fn discard(&self) -> Result<()> {
        remove_if_exists(&self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record() -> HandoffRecord {
        let now = Utc::now();
        HandoffRecord {
            written_at: now,
            confirm_deadline: now + chrono::Duration::seconds(60),
            reason: HandoffReason::PullSelf {
                requested_by: 7,
                revision: Some("abc123".to_string()),
            },
            supervisor_pid: 42,
            entries: vec![HandoffEntry {
                name: "alpha".to_string(),
                pid: 4242,
                signature: LaunchSignature {
                    program: "python".to_string(),
                    args: vec!["alpha.py".to_string()],
                    working_dir: PathBuf::from("/srv"),
                    digest: "d".to_string(),
                },
                started_at: now,
                proc_start_time: Some(1_700_000_000),
            }],
        }
    }

    #[tokio::test]
    async fn test_take_consumes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandoffStore::new(dir.path().join("handoff.json"));
        assert!(store.take().await.unwrap().is_none());

        let rec = record();
        store.write(&rec).await.unwrap();
        assert_eq!(store.take().await.unwrap(), Some(rec));
        assert!(store.take().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.json");
        fs::write(&path, b"{ half").await.unwrap();
        let store = HandoffStore::new(&path);
        assert!(store.take().await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_overdue() {
        let rec = record();
        assert!(!rec.is_overdue(rec.written_at));
        assert!(rec.is_overdue(rec.confirm_deadline + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_written_by() {
        let rec = record();
        assert!(rec.written_by(42));
        assert!(!rec.written_by(43));
    }
}
