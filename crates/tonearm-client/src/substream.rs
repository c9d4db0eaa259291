//! Audio substream decryption.
//!
//! The server stripes every 1024-byte block as four 256-byte quarters:
//! byte `4i + k` of the ciphertext travels at position `256k + i`. Blocks
//! are de-interleaved first and then decrypted with AES-128 in counter mode,
//! the counter starting at a fixed IV plus the stream offset in 16-byte
//! units.

use std::fmt;
use std::sync::Arc;

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelListener};
use crate::error::ClientError;
use crate::store::ChunkStore;

/// Addressable unit of decrypted audio.
pub const CHUNK_SIZE: usize = 4096;

/// Interleaving unit on the wire.
pub const BLOCK_SIZE: usize = 1024;

const STRIPE: usize = BLOCK_SIZE / 4;

/// Bytes requested per range by default: 25 chunks.
pub const SUBSTREAM_SIZE: u64 = 102_400;

pub const AUDIO_KEY_LEN: usize = 16;

/// Initial counter block for every audio file.
pub const AUDIO_IV: [u8; 16] = [
    0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d, 0x93,
];

/// Header entry type carrying the total stream length in 32-bit words.
const LENGTH_HEADER: u8 = 0x03;

/// Undo the 4x256 striping of one block. Both slices are `BLOCK_SIZE` long.
pub fn deinterleave(block: &[u8], out: &mut [u8]) {
    for i in 0..STRIPE {
        for k in 0..4 {
            out[4 * i + k] = block[k * STRIPE + i];
        }
    }
}

/// Stripe one block the way the server does.
pub fn interleave(block: &[u8], out: &mut [u8]) {
    for i in 0..STRIPE {
        for k in 0..4 {
            out[k * STRIPE + i] = block[4 * i + k];
        }
    }
}

/// AES-CTR keystream for one audio file.
#[derive(Clone)]
pub struct AudioDecryptor {
    cipher: Aes128,
}

impl AudioDecryptor {
    pub fn new(key: &[u8]) -> Result<Self, ClientError> {
        let cipher = Aes128::new_from_slice(key).map_err(|_| {
            ClientError::protocol(format!(
                "audio key must be {AUDIO_KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Counter block for the 16-byte unit containing stream `offset`.
    pub fn counter_at(offset: u64) -> u128 {
        u128::from_be_bytes(AUDIO_IV).wrapping_add(u128::from(offset / 16))
    }

    /// XOR the keystream for stream position `offset` into `buf`. `offset`
    /// must be 16-byte aligned. Encryption and decryption are the same
    /// operation.
    pub fn apply_keystream(&self, offset: u64, buf: &mut [u8]) {
        let mut counter = Self::counter_at(offset);
        for unit in buf.chunks_mut(16) {
            let mut keystream = Block::from(counter.to_be_bytes());
            self.cipher.encrypt_block(&mut keystream);
            for (byte, key) in unit.iter_mut().zip(keystream.iter()) {
                *byte ^= key;
            }
            counter = counter.wrapping_add(1);
        }
    }

    /// De-interleave and decrypt wire bytes that start at stream `offset`.
    /// A trailing partial block cannot be de-interleaved and is dropped.
    pub fn decrypt(&self, offset: u64, wire: &[u8]) -> Vec<u8> {
        let full = wire.len() - wire.len() % BLOCK_SIZE;
        let mut plain = vec![0u8; full];
        for (src, dst) in wire[..full]
            .chunks_exact(BLOCK_SIZE)
            .zip(plain.chunks_exact_mut(BLOCK_SIZE))
        {
            deinterleave(src, dst);
        }
        self.apply_keystream(offset, &mut plain);
        plain
    }

    /// Inverse of [`AudioDecryptor::decrypt`] for whole blocks; what a
    /// server does before sending.
    pub fn encrypt(&self, offset: u64, plain: &[u8]) -> Vec<u8> {
        let full = plain.len() - plain.len() % BLOCK_SIZE;
        let mut cipher = plain[..full].to_vec();
        self.apply_keystream(offset, &mut cipher);
        let mut wire = vec![0u8; full];
        for (src, dst) in cipher
            .chunks_exact(BLOCK_SIZE)
            .zip(wire.chunks_exact_mut(BLOCK_SIZE))
        {
            interleave(src, dst);
        }
        wire
    }
}

impl fmt::Debug for AudioDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDecryptor").finish_non_exhaustive()
    }
}

struct Progress {
    pending: Vec<u8>,
    next_index: u64,
    received: u64,
    stored: u64,
}

/// Channel listener for one requested range. Splits the incoming bytes into
/// chunks, decrypts each and stores it under its index.
pub struct RangeLoader {
    store: Arc<ChunkStore>,
    decryptor: Arc<AudioDecryptor>,
    offset: u64,
    length: u64,
    progress: Mutex<Progress>,
}

impl RangeLoader {
    /// `offset` and `length` must already be chunk aligned.
    pub fn new(
        store: Arc<ChunkStore>,
        decryptor: Arc<AudioDecryptor>,
        offset: u64,
        length: u64,
    ) -> Self {
        Self {
            store,
            decryptor,
            offset,
            length,
            progress: Mutex::new(Progress {
                pending: Vec::with_capacity(CHUNK_SIZE),
                next_index: offset / CHUNK_SIZE as u64,
                received: 0,
                stored: 0,
            }),
        }
    }

    fn finish(&self, channel: &Channel, progress: &mut Progress) {
        if !progress.pending.is_empty() {
            let wire = std::mem::take(&mut progress.pending);
            self.store_chunk(progress, &wire);
        }
        debug!(
            target: "tonearm::substream",
            channel = channel.id(),
            offset = self.offset,
            requested = self.length,
            received = progress.received,
            "range complete"
        );
        self.store
            .complete_range(self.offset, self.length, progress.stored);
    }

    fn store_chunk(&self, progress: &mut Progress, wire: &[u8]) {
        let index = progress.next_index;
        let plain = self
            .decryptor
            .decrypt(index * CHUNK_SIZE as u64, wire);
        progress.next_index += 1;
        if plain.is_empty() {
            return;
        }
        progress.stored += plain.len() as u64;
        trace!(target: "tonearm::substream", index, len = plain.len(), "chunk decrypted");
        self.store.insert(index, Bytes::from(plain));
    }
}

impl ChannelListener for RangeLoader {
    fn on_header(&self, channel: &Channel, header: &[u8]) {
        if header.first() == Some(&LENGTH_HEADER) && header.len() >= 5 {
            let words = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
            let length = u64::from(words) << 2;
            debug!(target: "tonearm::substream", channel = channel.id(), length, "stream length");
            self.store.set_stream_length(length);
        }
    }

    fn on_data(&self, channel: &Channel, data: &[u8]) {
        let mut progress = self.progress.lock();
        let room = self.length.saturating_sub(progress.received);
        let take = data.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        if take < data.len() {
            debug!(
                target: "tonearm::substream",
                channel = channel.id(),
                extra = data.len() - take,
                "ignoring bytes past the requested range"
            );
        }
        progress.received += take as u64;
        progress.pending.extend_from_slice(&data[..take]);
        while progress.pending.len() >= CHUNK_SIZE {
            let wire: Vec<u8> = progress.pending.drain(..CHUNK_SIZE).collect();
            self.store_chunk(&mut progress, &wire);
        }
    }

    fn on_end(&self, channel: &Channel) {
        let mut progress = self.progress.lock();
        self.finish(channel, &mut progress);
    }

    /// Bytes that did arrive are kept and the range ends short, the same as
    /// an early end. A range that produced nothing stays retryable.
    fn on_error(&self, channel: &Channel) {
        let mut progress = self.progress.lock();
        if progress.received == 0 {
            debug!(target: "tonearm::substream", channel = channel.id(), offset = self.offset, "range failed");
            self.store.fail_range(channel.id());
            return;
        }
        debug!(
            target: "tonearm::substream",
            channel = channel.id(),
            received = progress.received,
            "range failed partway; keeping what arrived"
        );
        self.finish(channel, &mut progress);
    }

    fn on_disconnect(&self, _channel: &Channel) {
        self.store.disconnect();
    }
}

impl fmt::Debug for RangeLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeLoader")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
