use std::io;

use crate::frames::FrameError;

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Nothing was received for twice the heartbeat interval
    #[error("Idle timeout")]
    IdleTimeout,

    /// A frame could not be encoded or decoded
    #[error(transparent)]
    Frame(FrameError),
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => Self::Io(err),
            err => Self::Frame(err),
        }
    }
}
