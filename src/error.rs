use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Malformed envelope sender or recipient
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Temp file {path} unavailable: {source}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Internal failure: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn is_address_error(&self) -> bool {
        matches!(self, SessionError::InvalidAddress(_))
    }
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<SessionError>() {
            Ok(session_err) => session_err,
            Err(other) => SessionError::Internal(format!("{other:#}")),
        }
    }
}
