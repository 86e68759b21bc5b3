use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{CallerId, CommandFailure, CommandResponse, ErrorKind, Violation};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration is invalid: {}", join(.0))]
    ConfigInvalid(Vec<Violation>),

    #[error("configuration is corrupt ({reason}); restored from backup: {restored}")]
    ConfigCorrupt { reason: String, restored: bool },

    #[error("no usable configuration backup exists")]
    NoBackupAvailable,

    #[error("caller {0} is not authorized")]
    Unauthorized(CallerId),

    #[error("unknown project `{0}`")]
    UnknownProject(String),

    #[error("failed to launch {project}: {reason}")]
    LaunchFailed { project: String, reason: String },

    #[error("fetch for {target} failed: {reason}")]
    FetchFailed { target: String, reason: String },

    #[error("update of {target} does not fast-forward: {reason}")]
    MergeConflict { target: String, reason: String },

    #[error("self update failed: {0}")]
    SelfUpdateFailed(String),

    #[error("supervisor is restarting")]
    SupervisorRestarting,

    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::ConfigCorrupt { .. } => ErrorKind::ConfigCorrupt,
            Self::NoBackupAvailable => ErrorKind::NoBackupAvailable,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::UnknownProject(_) => ErrorKind::UnknownProject,
            Self::LaunchFailed { .. } => ErrorKind::LaunchFailed,
            Self::FetchFailed { .. } => ErrorKind::FetchFailed,
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::SelfUpdateFailed(_) => ErrorKind::SelfUpdateFailed,
            Self::SupervisorRestarting => ErrorKind::SupervisorRestarting,
            Self::UpgradeFailed(_) => ErrorKind::UpgradeFailed,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn into_failure(self) -> CommandFailure {
        let kind = self.kind();
        let detail = self.to_string();
        let violations = match self {
            Self::ConfigInvalid(v) => v,
            _ => Vec::new(),
        };
        CommandFailure {
            kind,
            detail,
            violations,
        }
    }
}

pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::ConfigInvalid => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::UnknownProject => StatusCode::NOT_FOUND,
        ErrorKind::SupervisorRestarting => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::warn!("Generating response for error: {}", self);
        let failure = self.into_failure();
        (
            status_of(failure.kind),
            Json(CommandResponse::Error(failure)),
        )
            .into_response()
    }
}
