use std::fmt;

use thiserror::Error;
use tonearm_core::{ErrorKind, LinkError, Truncated};

/// Account or credential rejections reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// The server refuses this client revision. `message` is the server's
    /// text; `suggested_revision` is parsed from the version string in it.
    UpgradeRequired {
        message: String,
        suggested_revision: Option<u32>,
    },
    NonexistentUser,
    AccountDisabled,
    IncompleteAccount,
    CountryMismatch,
    Unknown(u8),
    /// The final authentication response carried a non-zero status.
    BadCredentials(u8),
}

impl AuthFailure {
    /// Map a hello substatus byte to a failure. Substatus 0x01 is handled
    /// separately because it is followed by a message.
    pub fn from_substatus(substatus: u8) -> Self {
        match substatus {
            0x03 => AuthFailure::NonexistentUser,
            0x04 => AuthFailure::AccountDisabled,
            0x06 => AuthFailure::IncompleteAccount,
            0x09 => AuthFailure::CountryMismatch,
            other => AuthFailure::Unknown(other),
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::UpgradeRequired { message, .. } => {
                write!(f, "client upgrade required: {message}")
            }
            AuthFailure::NonexistentUser => f.write_str("nonexistent user"),
            AuthFailure::AccountDisabled => f.write_str("account has been disabled"),
            AuthFailure::IncompleteAccount => f.write_str("account details are incomplete"),
            AuthFailure::CountryMismatch => {
                f.write_str("current country does not match the profile country")
            }
            AuthFailure::Unknown(code) => write!(f, "unknown login error 0x{code:02x}"),
            AuthFailure::BadCredentials(code) => {
                write!(f, "authentication failed (status 0x{code:02x})")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("connection error during handshake: {0}")]
    Connection(#[from] LinkError),
    #[error("authentication rejected: {0}")]
    Authentication(AuthFailure),
    #[error("unexpected puzzle challenge type 0x{0:02x}")]
    UnexpectedPuzzle(u8),
    #[error("server hello padding length is zero")]
    InvalidPadding,
    #[error("auth response payload length is zero")]
    InvalidAuthResponse,
    #[error("peer public key is invalid")]
    InvalidPeerKey,
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("handshake message truncated: {0}")]
    Truncated(#[from] Truncated),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("puzzle solver failed: {0}")]
    Solver(String),
    #[error("handshake already finished in state {0:?}")]
    AlreadyFinished(crate::handshake::HandshakeState),
}

impl HandshakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Connection(_) => ErrorKind::Connection,
            HandshakeError::Authentication(_) => ErrorKind::Authentication,
            HandshakeError::AlreadyFinished(_) => ErrorKind::Usage,
            HandshakeError::UnexpectedPuzzle(_)
            | HandshakeError::InvalidPadding
            | HandshakeError::InvalidAuthResponse
            | HandshakeError::InvalidPeerKey
            | HandshakeError::Malformed(_)
            | HandshakeError::Truncated(_)
            | HandshakeError::KeyGeneration(_)
            | HandshakeError::Solver(_) => ErrorKind::Protocol,
        }
    }

    pub fn auth_failure(&self) -> Option<&AuthFailure> {
        match self {
            HandshakeError::Authentication(failure) => Some(failure),
            _ => None,
        }
    }
}
