use std::io;
use thiserror::Error;
use crate::types::View;
use crate::commit_log::Marker;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OtError {
    #[error("op at {loc} is behind the cursor at {cursor}")]
    OutOfOrder { loc: usize, cursor: usize },
    #[error("op at {loc} is past the end of a {len} byte body")]
    OutOfBounds { loc: usize, len: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ApplyError {
    #[error("batch computed against view {view} but the document is only at {current}")]
    FutureView { view: View, current: View },
    #[error("batch computed against view {view} which is older than the log window starting at {oldest}")]
    StaleView { view: View, oldest: View },
    #[error(transparent)]
    Ops(#[from] OtError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log store io: {0}")]
    Io(#[from] io::Error),
    #[error("malformed log record on line {line}: {source}")]
    Decode { line: usize, source: serde_json::Error },
    #[error("could not encode log record: {0}")]
    Encode(serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The server must not start serving with this state.
    StartupFatal,
    /// Log it and try again next cycle.
    Retryable,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot encoding: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("snapshot covers {snapshot} log entries but the log store only has {store}")]
    Gap { snapshot: Marker, store: Marker },
}

impl PersistError {
    pub fn severity(&self) -> Severity {
        match self {
            PersistError::Gap { .. } => Severity::StartupFatal,
            PersistError::Codec(e) if e.is_io() => Severity::Retryable,
            // A snapshot we wrote ourselves that no longer parses can't be fixed by waiting.
            PersistError::Codec(_) => Severity::StartupFatal,
            PersistError::Store(StoreError::Decode { .. }) => Severity::StartupFatal,
            _ => Severity::Retryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection failed: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}
