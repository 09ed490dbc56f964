use thiserror::Error;

/// Errors produced by termhub.
///
/// Unknown session ids are deliberately absent: operations that target a
/// missing session are silent no-ops, not failures.
#[derive(Debug, Error)]
pub enum HubError {
    /// The child process could not be started (bad executable, bad working
    /// directory, PTY allocation failure). Never retried automatically.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// `spawn` was called with an id that already maps to a live session.
    #[error("session already running: {0}")]
    DuplicateSession(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for HubError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        HubError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for HubError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        HubError::Codec(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
