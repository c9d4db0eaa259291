use std::io;
use std::time::Duration;

use thiserror::Error;
use tonearm_core::{ErrorKind, FrameError, LinkError, Truncated};
use tonearm_handshake::HandshakeError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] LinkError),
    #[error("login failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel {channel} ({purpose}) timed out after {timeout:?}")]
    ChannelTimeout {
        channel: u16,
        purpose: String,
        timeout: Duration,
    },
    #[error("channel {channel} ({purpose}) reported an error")]
    ChannelFailed { channel: u16, purpose: String },
    #[error("session not ready after {0:?}")]
    LoginTimeout(Duration),
    #[error("no free channel id")]
    ChannelsExhausted,
    #[error("substream range offset {offset} length {length} is not aligned to 4096 bytes")]
    InvalidRange { offset: u64, length: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection closed")]
    Closed,
    #[error("failed to inflate channel payload: {0}")]
    Decompress(#[source] io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connection(_) | ClientError::Closed => ErrorKind::Connection,
            ClientError::Handshake(err) => err.kind(),
            ClientError::Frame(_) | ClientError::Protocol(_) | ClientError::Decompress(_) => {
                ErrorKind::Protocol
            }
            ClientError::ChannelTimeout { .. } | ClientError::LoginTimeout(_) => {
                ErrorKind::Timeout
            }
            // The server refused one request; the session itself is intact.
            ClientError::ChannelFailed { .. } | ClientError::ChannelsExhausted => {
                ErrorKind::Timeout
            }
            ClientError::InvalidRange { .. } | ClientError::InvalidArgument(_) => ErrorKind::Usage,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol(message.into())
    }
}

impl From<Truncated> for ClientError {
    fn from(err: Truncated) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonearm_handshake::AuthFailure;

    #[test]
    fn timeouts_are_not_fatal() {
        let err = ClientError::ChannelTimeout {
            channel: 3,
            purpose: "search".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.kind().is_fatal());
    }

    #[test]
    fn handshake_errors_keep_their_kind() {
        let err = ClientError::from(HandshakeError::Authentication(AuthFailure::NonexistentUser));
        assert_eq!(err.kind(), ErrorKind::Authentication);
        let err = ClientError::from(LinkError::Closed);
        assert_eq!(err.kind(), ErrorKind::Connection);
        let err = ClientError::from(FrameError::MacMismatch { counter: 7 });
        assert!(err.kind().is_fatal());
    }

    #[test]
    fn misaligned_range_is_usage() {
        let err = ClientError::InvalidRange {
            offset: 100,
            length: 4096,
        };
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
