//! Transport primitives for the tonearm protocol client.
//!
//! The Shannon stream cipher, the per-direction cipher contexts that seal and
//! open frames, the command table, and the byte links the protocol runs on.

pub mod command;
pub mod error;
pub mod frame;
pub mod link;
pub mod shannon;
pub mod wire;

pub use command::{Command, CommandError};
pub use error::ErrorKind;
pub use frame::{
    Frame, FrameError, OpenFrame, RecvCipher, SendCipher, FRAME_HEADER_LEN, FRAME_MAC_LEN,
    FRAME_MAX_PAYLOAD,
};
pub use link::{
    connect, connect_any, memory_link_pair, read_exact, write_all, ByteLink, LinkError,
    LinkHandle,
};
pub use shannon::Shannon;
pub use wire::{Truncated, WireReader};
