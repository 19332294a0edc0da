//! Interface to the wire protocol side of a session.

use crate::error::SessionError;
use crate::suspect::Suspect;
use std::path::PathBuf;

/// Obtains the message for a session and finalizes the session with
/// exactly one of commit, discard, reject or defer.
pub trait ProtocolHandler: Send {
    /// `Ok(None)` when the session ended before a message arrived.
    /// Envelope validation problems are reported as
    /// [`SessionError::InvalidAddress`].
    fn get_suspect(&mut self) -> Result<Option<Suspect>, SessionError>;

    /// Accept the message, applying `suspect.added_headers`.
    fn commit(&mut self, suspect: &Suspect) -> anyhow::Result<()>;

    fn discard(&mut self, message: &str) -> anyhow::Result<()>;

    fn reject(&mut self, message: &str) -> anyhow::Result<()>;

    fn defer(&mut self, message: &str) -> anyhow::Result<()>;

    fn incoming_port(&self) -> anyhow::Result<Option<u16>>;

    /// Spool file of a message that never became a suspect.
    fn temp_path(&self) -> Option<PathBuf>;

    fn remove_temp(&mut self) -> anyhow::Result<()>;
}
