use std::{io, sync::PoisonError};

use thiserror::Error;

use super::RequestId;
use crate::report::ReportError;

/// Failures raised while exchanging requests.
///
/// Only [`NetworkError::Recoverable`] leaves the connection usable; it describes
/// exactly one failed request. Every other variant means the connection is dead.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Recoverable(String),

    #[error("connection failed: {0}")]
    Unrecoverable(String),

    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),

    #[error("no request registered for id {0}")]
    UnknownRequest(RequestId),

    #[error("response loop stopped")]
    LoopStopped,
}

impl NetworkError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NetworkError::Recoverable(_))
    }

    /// Owned copy of this error, for handing the same failure to several threads.
    ///
    /// Transport and codec errors are not cloneable and collapse into
    /// [`NetworkError::Unrecoverable`] carrying their message.
    pub fn replicate(&self) -> NetworkError {
        match self {
            NetworkError::Recoverable(msg) => NetworkError::Recoverable(msg.clone()),
            NetworkError::Unrecoverable(msg) => NetworkError::Unrecoverable(msg.clone()),
            NetworkError::UnknownRequest(id) => NetworkError::UnknownRequest(*id),
            NetworkError::LoopStopped => NetworkError::LoopStopped,
            other => NetworkError::Unrecoverable(other.to_string()),
        }
    }
}

impl<T> From<PoisonError<T>> for NetworkError {
    fn from(_: PoisonError<T>) -> Self {
        NetworkError::Unrecoverable("lock poisoned by a panicking thread".into())
    }
}

/// Query failures are the caller's problem, the connection survives them.
impl From<ReportError> for NetworkError {
    fn from(err: ReportError) -> Self {
        NetworkError::Recoverable(err.to_string())
    }
}
