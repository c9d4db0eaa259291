use crate::frame::FrameError;
use crate::link::LinkError;

/// Coarse classification shared by every error type in the workspace, so
/// callers can tell a fatal session failure from a recoverable timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure; the session is gone.
    Connection,
    /// Credentials or account status were rejected.
    Authentication,
    /// The peer sent something the cipher or parser cannot trust.
    Protocol,
    /// A caller-side wait expired. The session is still usable.
    Timeout,
    /// The caller passed invalid arguments.
    Usage,
}

impl ErrorKind {
    /// Whether the session must be discarded after an error of this kind.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Authentication | ErrorKind::Protocol
        )
    }
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Connection
    }
}
