use std::path::PathBuf;

/// Directory or file creation failures inside the base directory.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} exists but is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("all 99 session slots for {date} are taken")]
    SessionsExhausted { date: String },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Malformed operator pose input.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 6 values (x y z rx ry rz), got {got}")]
    Arity { got: usize },
    #[error("'{token}' is not a number")]
    InvalidNumber { token: String },
    #[error("'{token}' is not a finite number")]
    NonFinite { token: String },
}

/// Session data is missing or inconsistent, so the solver was not invoked.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SolverInputError {
    #[error("no capture session has been allocated")]
    NoSession,
    #[error("session directory {session} is missing or unreadable")]
    MissingDirectory { session: String },
    #[error("session {session} has no pose log")]
    MissingPoseLog { session: String },
    #[error("session {session} has an empty pose log")]
    EmptyPoseLog { session: String },
    #[error("session {session} contains no images")]
    NoImages { session: String },
    #[error("session {session} has {images} images but {poses} poses")]
    CountMismatch {
        session: String,
        images: usize,
        poses: usize,
    },
}

/// Writing a calibration result report failed; no report file was left behind.
#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("write report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
