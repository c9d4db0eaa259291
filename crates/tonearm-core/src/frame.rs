use std::fmt;

use bytes::Bytes;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::shannon::Shannon;

/// Command byte plus big-endian payload length.
pub const FRAME_HEADER_LEN: usize = 3;

/// Authentication tag appended after the encrypted frame.
pub const FRAME_MAC_LEN: usize = 4;

/// The length field is 16 bits wide.
pub const FRAME_MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short")]
    TooShort,
    #[error("frame payload of {0} bytes exceeds protocol limits")]
    PayloadTooLarge(usize),
    #[error("frame length field does not match buffer size (declared {declared}, got {actual})")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame MAC mismatch at counter {counter}")]
    MacMismatch { counter: u32 },
    #[error("cipher sequence counter exhausted")]
    CounterExhausted,
}

/// A decrypted, authenticated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Bytes,
}

/// Send direction: Shannon state plus the nonce counter for outgoing frames.
pub struct SendCipher {
    cipher: Shannon,
    counter: u32,
}

impl SendCipher {
    pub fn new(key: &[u8]) -> Self {
        Self {
            cipher: Shannon::new(key),
            counter: 0,
        }
    }

    /// Counter that the next sealed frame will use as its nonce.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Encrypt one frame and advance the counter. The returned buffer is the
    /// complete wire image including the trailing MAC.
    pub fn seal(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        if payload.len() > FRAME_MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let next = self
            .counter
            .checked_add(1)
            .ok_or(FrameError::CounterExhausted)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_MAC_LEN);
        frame.push(command);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);

        self.cipher.nonce(&self.counter.to_be_bytes());
        self.cipher.encrypt(&mut frame);
        let mut mac = [0u8; FRAME_MAC_LEN];
        self.cipher.finish(&mut mac);
        frame.extend_from_slice(&mac);

        self.counter = next;
        Ok(frame)
    }
}

impl fmt::Debug for SendCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Receive direction. Frames are opened in two steps because the payload
/// length is only known after the header has been decrypted.
pub struct RecvCipher {
    cipher: Shannon,
    counter: u32,
}

impl RecvCipher {
    pub fn new(key: &[u8]) -> Self {
        Self {
            cipher: Shannon::new(key),
            counter: 0,
        }
    }

    /// Counter expected on the next incoming frame.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Decrypt a frame header. The returned guard must be completed with the
    /// frame body before another header can be opened.
    pub fn open_header(
        &mut self,
        mut header: [u8; FRAME_HEADER_LEN],
    ) -> Result<OpenFrame<'_>, FrameError> {
        if self.counter == u32::MAX {
            return Err(FrameError::CounterExhausted);
        }
        self.cipher.nonce(&self.counter.to_be_bytes());
        self.cipher.decrypt(&mut header);
        Ok(OpenFrame {
            command: header[0],
            len: usize::from(u16::from_be_bytes([header[1], header[2]])),
            cipher: self,
        })
    }

    /// Decrypt a complete wire image in one call.
    pub fn open(&mut self, frame: &[u8]) -> Result<Frame, FrameError> {
        if frame.len() < FRAME_HEADER_LEN + FRAME_MAC_LEN {
            return Err(FrameError::TooShort);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let pending = self.open_header(header)?;
        let rest = &frame[FRAME_HEADER_LEN..];
        if rest.len() != pending.body_len() {
            return Err(FrameError::LengthMismatch {
                declared: pending.len,
                actual: rest.len().saturating_sub(FRAME_MAC_LEN),
            });
        }
        let mut body = rest.to_vec();
        let command = pending.command;
        let payload = pending.complete(&mut body)?;
        Ok(Frame {
            command,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

impl fmt::Debug for RecvCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// A frame whose header has been decrypted but whose body is still pending.
#[derive(Debug)]
pub struct OpenFrame<'a> {
    pub command: u8,
    pub len: usize,
    cipher: &'a mut RecvCipher,
}

impl OpenFrame<'_> {
    /// Bytes still to read from the wire: payload plus MAC.
    pub fn body_len(&self) -> usize {
        self.len + FRAME_MAC_LEN
    }

    /// Decrypt the payload in place, verify the MAC and advance the receive
    /// counter. Returns the plaintext payload slice of `body`.
    pub fn complete<'b>(self, body: &'b mut [u8]) -> Result<&'b mut [u8], FrameError> {
        if body.len() != self.body_len() {
            return Err(FrameError::LengthMismatch {
                declared: self.len,
                actual: body.len().saturating_sub(FRAME_MAC_LEN),
            });
        }
        let counter = self.cipher.counter;
        let (payload, mac) = body.split_at_mut(self.len);
        self.cipher.cipher.decrypt(payload);
        let mut expected = [0u8; FRAME_MAC_LEN];
        self.cipher.cipher.finish(&mut expected);
        if expected[..].ct_eq(&mac[..]).unwrap_u8() == 0 {
            return Err(FrameError::MacMismatch { counter });
        }
        self.cipher.counter = counter + 1;
        Ok(payload)
    }
}
