//! Sparse chunk store and the seekable reader on top of it.
//!
//! The receive loop inserts decrypted chunks by index; a reader copies out
//! of whatever contiguous run starts at its cursor and, when the cursor
//! chunk is missing, asks its [`RangeSource`] for the next range and waits
//! for the store to change.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::substream::{CHUNK_SIZE, SUBSTREAM_SIZE};

const CHUNK: u64 = CHUNK_SIZE as u64;

#[derive(Debug, Clone, Copy)]
struct InFlight {
    offset: u64,
    channel: Option<u16>,
}

#[derive(Default)]
struct StoreState {
    chunks: HashMap<u64, Bytes>,
    stream_length: Option<u64>,
    in_flight: Option<InFlight>,
    failed_channel: Option<u16>,
    disconnected: bool,
}

/// What the cursor sees in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cursor {
    Copied(usize),
    End,
    Missing,
}

/// Decrypted chunks keyed by index. A chunk is immutable once inserted.
pub struct ChunkStore {
    state: Mutex<StoreState>,
    changed: watch::Sender<u64>,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(StoreState::default()),
            changed,
        }
    }

    fn signal(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Store `chunk` at `index`. Returns false, keeping the first copy, if
    /// the index is already present.
    pub fn insert(&self, index: u64, chunk: Bytes) -> bool {
        let inserted = {
            let mut state = self.state.lock();
            match state.chunks.get(&index) {
                Some(existing) => {
                    if *existing != chunk {
                        debug!(target: "tonearm::substream", index, "conflicting copy of stored chunk ignored");
                    }
                    false
                }
                None => {
                    state.chunks.insert(index, chunk);
                    true
                }
            }
        };
        self.signal();
        inserted
    }

    pub fn chunk(&self, index: u64) -> Option<Bytes> {
        self.state.lock().chunks.get(&index).cloned()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.state.lock().chunks.contains_key(&index)
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn stream_length(&self) -> Option<u64> {
        self.state.lock().stream_length
    }

    pub fn set_stream_length(&self, length: u64) {
        self.state.lock().stream_length = Some(length);
        self.signal();
    }

    /// Bytes readable from `position` without waiting: the rest of the
    /// cursor chunk plus every directly following chunk.
    pub fn available_at(&self, position: u64) -> u64 {
        let state = self.state.lock();
        let limit = state.stream_length.unwrap_or(u64::MAX);
        if position >= limit {
            return 0;
        }
        let mut index = position / CHUNK;
        let mut skip = position % CHUNK;
        let mut total = 0u64;
        while let Some(chunk) = state.chunks.get(&index) {
            let len = chunk.len() as u64;
            total += len.saturating_sub(skip);
            if len < CHUNK {
                break;
            }
            skip = 0;
            index += 1;
        }
        total.min(limit - position)
    }

    /// Copy the contiguous run at `position` into `buf`.
    pub(crate) fn read_at(&self, position: u64, buf: &mut [u8]) -> Cursor {
        let state = self.state.lock();
        let limit = state.stream_length.unwrap_or(u64::MAX);
        if position >= limit {
            return Cursor::End;
        }
        let wanted = (buf.len() as u64).min(limit - position) as usize;
        let mut index = position / CHUNK;
        let mut skip = (position % CHUNK) as usize;
        let mut copied = 0;
        while copied < wanted {
            let Some(chunk) = state.chunks.get(&index) else {
                break;
            };
            if skip >= chunk.len() {
                break;
            }
            let n = (chunk.len() - skip).min(wanted - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[skip..skip + n]);
            copied += n;
            if chunk.len() < CHUNK_SIZE {
                break;
            }
            skip = 0;
            index += 1;
        }
        if copied > 0 {
            return Cursor::Copied(copied);
        }
        match state.chunks.get(&(position / CHUNK)) {
            // A short chunk is the tail of the file.
            Some(chunk) if (position % CHUNK) as usize >= chunk.len() => Cursor::End,
            _ => Cursor::Missing,
        }
    }

    /// Claim the single in-flight slot. Returns false if a range is already
    /// loading.
    pub(crate) fn begin_range(&self, offset: u64) -> bool {
        let mut state = self.state.lock();
        if state.in_flight.is_some() {
            return false;
        }
        state.in_flight = Some(InFlight {
            offset,
            channel: None,
        });
        state.failed_channel = None;
        true
    }

    pub(crate) fn attach_channel(&self, offset: u64, channel: u16) {
        let mut state = self.state.lock();
        if let Some(in_flight) = state.in_flight.as_mut() {
            if in_flight.offset == offset {
                in_flight.channel = Some(channel);
            }
        }
    }

    pub(crate) fn cancel_range(&self) {
        self.state.lock().in_flight = None;
        self.signal();
    }

    /// The range at `offset` ended. Fewer stored bytes than requested means
    /// the file ends inside it.
    pub fn complete_range(&self, offset: u64, requested: u64, stored: u64) {
        {
            let mut state = self.state.lock();
            state.in_flight = None;
            if stored < requested {
                let end = offset + stored;
                let length = state.stream_length.map_or(end, |known| known.min(end));
                state.stream_length = Some(length);
                trace!(target: "tonearm::substream", offset, stored, length, "short range marks end of stream");
            }
        }
        self.signal();
    }

    pub fn fail_range(&self, channel: u16) {
        {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.failed_channel = Some(channel);
        }
        self.signal();
    }

    /// The connection carrying the ranges is gone.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.disconnected = true;
        }
        self.signal();
    }

    fn pending(&self) -> (Option<InFlight>, Option<u16>, bool) {
        let state = self.state.lock();
        (state.in_flight, state.failed_channel, state.disconnected)
    }

    fn take_failure(&self) -> Option<u16> {
        self.state.lock().failed_channel.take()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChunkStore")
            .field("chunks", &state.chunks.len())
            .field("stream_length", &state.stream_length)
            .field("loading", &state.in_flight.is_some())
            .finish()
    }
}

/// Issues range requests whose chunks end up in a [`ChunkStore`].
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Request `length` bytes at `offset` (both chunk aligned) and return
    /// the channel id carrying them.
    async fn request_range(
        &self,
        store: &Arc<ChunkStore>,
        offset: u64,
        length: u64,
    ) -> Result<u16, ClientError>;
}

/// Seekable, chunk-cached reader over one audio file.
pub struct SubstreamReader {
    store: Arc<ChunkStore>,
    source: Arc<dyn RangeSource>,
    position: u64,
    mark: Option<u64>,
    request_size: u64,
    wait_timeout: Duration,
    closed: bool,
}

impl SubstreamReader {
    pub fn new(store: Arc<ChunkStore>, source: Arc<dyn RangeSource>) -> Self {
        Self {
            store,
            source,
            position: 0,
            mark: None,
            request_size: SUBSTREAM_SIZE,
            wait_timeout: Duration::from_secs(10),
            closed: false,
        }
    }

    /// Bytes per range request, rounded up to whole chunks.
    pub fn with_request_size(mut self, bytes: u64) -> Self {
        self.request_size = bytes.max(1).div_ceil(CHUNK) * CHUNK;
        self
    }

    /// Longest wait for one range to make progress.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn stream_length(&self) -> Option<u64> {
        self.store.stream_length()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Read into `buf`, waiting for data if the cursor chunk has not
    /// arrived. Returns 0 at the end of the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ClientError> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut changes = self.store.subscribe();
        loop {
            changes.borrow_and_update();
            match self.store.read_at(self.position, buf) {
                Cursor::Copied(n) => {
                    self.position += n as u64;
                    return Ok(n);
                }
                Cursor::End => return Ok(0),
                Cursor::Missing => {}
            }

            let (in_flight, failed, disconnected) = self.store.pending();
            if disconnected {
                return Err(ClientError::Closed);
            }
            match in_flight {
                None => {
                    if let Some(channel) = failed {
                        self.store.take_failure();
                        return Err(ClientError::ChannelFailed {
                            channel,
                            purpose: "substream".into(),
                        });
                    }
                    self.request_at_cursor().await?;
                    continue;
                }
                Some(loading) => {
                    let waited = tokio::time::timeout(self.wait_timeout, changes.changed()).await;
                    if waited.is_err() {
                        return Err(ClientError::ChannelTimeout {
                            channel: loading.channel.unwrap_or_default(),
                            purpose: "substream".into(),
                            timeout: self.wait_timeout,
                        });
                    }
                }
            }
        }
    }

    async fn request_at_cursor(&mut self) -> Result<(), ClientError> {
        let offset = self.position / CHUNK * CHUNK;
        let length = match self.store.stream_length() {
            Some(total) => {
                let remaining = total.saturating_sub(offset).div_ceil(CHUNK) * CHUNK;
                self.request_size.min(remaining)
            }
            None => self.request_size,
        };
        if length == 0 || !self.store.begin_range(offset) {
            return Ok(());
        }
        debug!(target: "tonearm::substream", offset, length, "requesting range");
        match self.source.request_range(&self.store, offset, length).await {
            Ok(channel) => {
                self.store.attach_channel(offset, channel);
                Ok(())
            }
            Err(err) => {
                self.store.cancel_range();
                Err(err)
            }
        }
    }

    /// Move the cursor. Cached chunks are kept.
    pub fn seek(&mut self, position: u64) -> Result<u64, ClientError> {
        self.ensure_open()?;
        if let Some(length) = self.store.stream_length() {
            if position > length {
                return Err(ClientError::InvalidArgument(format!(
                    "seek to {position} beyond stream length {length}"
                )));
            }
        }
        self.position = position;
        Ok(position)
    }

    /// Advance up to `n` bytes, clamped to the known length.
    pub fn skip(&mut self, n: u64) -> Result<u64, ClientError> {
        self.ensure_open()?;
        let n = match self.store.stream_length() {
            Some(length) => n.min(length.saturating_sub(self.position)),
            None => n,
        };
        self.position = self.position.saturating_add(n);
        Ok(n)
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn available(&self) -> Result<u64, ClientError> {
        self.ensure_open()?;
        Ok(self.store.available_at(self.position))
    }

    pub fn mark(&mut self) {
        self.mark = Some(self.position);
    }

    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mark = self
            .mark
            .ok_or_else(|| ClientError::InvalidArgument("reset without a mark".into()))?;
        self.position = mark;
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl fmt::Debug for SubstreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstreamReader")
            .field("position", &self.position)
            .field("mark", &self.mark)
            .field("closed", &self.closed)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// `std::io::Read + Seek` over a [`SubstreamReader`], for decoders running
/// on their own thread. Must not be used from inside the runtime.
#[derive(Debug)]
pub struct BlockingReader {
    runtime: Handle,
    reader: SubstreamReader,
}

impl BlockingReader {
    pub fn new(reader: SubstreamReader, runtime: Handle) -> Self {
        Self { runtime, reader }
    }

    pub fn get_ref(&self) -> &SubstreamReader {
        &self.reader
    }

    pub fn into_inner(self) -> SubstreamReader {
        self.reader
    }
}

fn into_io(err: ClientError) -> io::Error {
    let kind = match &err {
        ClientError::ChannelTimeout { .. } => io::ErrorKind::TimedOut,
        ClientError::Closed | ClientError::Connection(_) => io::ErrorKind::ConnectionAborted,
        ClientError::InvalidArgument(_) | ClientError::InvalidRange { .. } => {
            io::ErrorKind::InvalidInput
        }
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl io::Read for BlockingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let reader = &mut self.reader;
        self.runtime.block_on(reader.read(buf)).map_err(into_io)
    }
}

impl io::Seek for BlockingReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let base = match pos {
            io::SeekFrom::Start(offset) => return self.reader.seek(offset).map_err(into_io),
            io::SeekFrom::Current(delta) => (self.reader.tell(), delta),
            io::SeekFrom::End(delta) => {
                let length = self.reader.stream_length().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "stream length not known yet")
                })?;
                (length, delta)
            }
        };
        let target = base
            .0
            .checked_add_signed(base.1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;
        self.reader.seek(target).map_err(into_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk_bytes(index: u64) -> Bytes {
        Bytes::from(
            (0..CHUNK_SIZE)
                .map(|i| (i as u64 + index * 7) as u8)
                .collect::<Vec<_>>(),
        )
    }

    /// Serves ranges from memory, optionally truncated at `file_len`.
    struct MemorySource {
        file_len: u64,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl RangeSource for MemorySource {
        async fn request_range(
            &self,
            store: &Arc<ChunkStore>,
            offset: u64,
            length: u64,
        ) -> Result<u16, ClientError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let store = Arc::clone(store);
            let file_len = self.file_len;
            tokio::spawn(async move {
                let end = (offset + length).min(file_len);
                let mut stored = 0;
                let mut index = offset / CHUNK;
                while index * CHUNK < end {
                    let take = (end - index * CHUNK).min(CHUNK) as usize;
                    store.insert(index, chunk_bytes(index).slice(..take));
                    stored += take as u64;
                    index += 1;
                }
                store.complete_range(offset, length, stored);
            });
            Ok(9)
        }
    }

    struct SilentSource;

    #[async_trait]
    impl RangeSource for SilentSource {
        async fn request_range(
            &self,
            _store: &Arc<ChunkStore>,
            _offset: u64,
            _length: u64,
        ) -> Result<u16, ClientError> {
            Ok(4)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl RangeSource for FailingSource {
        async fn request_range(
            &self,
            store: &Arc<ChunkStore>,
            _offset: u64,
            _length: u64,
        ) -> Result<u16, ClientError> {
            store.fail_range(6);
            Ok(6)
        }
    }

    fn memory_reader(file_len: u64) -> (SubstreamReader, Arc<MemorySource>) {
        let source = Arc::new(MemorySource {
            file_len,
            requests: AtomicUsize::new(0),
        });
        let reader = SubstreamReader::new(Arc::new(ChunkStore::new()), source.clone())
            .with_request_size(2 * CHUNK);
        (reader, source)
    }

    async fn read_all(reader: &mut SubstreamReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 3000];
        loop {
            let n = reader.read(&mut buf).await.expect("read");
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn duplicate_insert_keeps_first_copy() {
        let store = ChunkStore::new();
        assert!(store.insert(0, chunk_bytes(0)));
        assert!(!store.insert(0, chunk_bytes(0)));
        assert!(!store.insert(0, chunk_bytes(5)));
        assert_eq!(store.chunk(0), Some(chunk_bytes(0)));
        assert_eq!(store.chunk_count(), 1);
    }

    #[test]
    fn available_counts_the_contiguous_run() {
        let store = ChunkStore::new();
        store.insert(0, chunk_bytes(0));
        store.insert(1, chunk_bytes(1));
        store.insert(3, chunk_bytes(3));
        assert_eq!(store.available_at(0), 2 * CHUNK);
        assert_eq!(store.available_at(100), 2 * CHUNK - 100);
        assert_eq!(store.available_at(2 * CHUNK), 0);
        assert_eq!(store.available_at(3 * CHUNK + 1), CHUNK - 1);
        store.set_stream_length(CHUNK + 10);
        assert_eq!(store.available_at(0), CHUNK + 10);
    }

    #[tokio::test]
    async fn sequential_read_spans_ranges() {
        let file_len = 5 * CHUNK + 123;
        let (mut reader, source) = memory_reader(file_len);
        let data = read_all(&mut reader).await;
        assert_eq!(data.len() as u64, file_len);
        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            assert_eq!(chunk, &chunk_bytes(index as u64)[..chunk.len()]);
        }
        assert_eq!(reader.stream_length(), Some(file_len));
        assert_eq!(source.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn seek_matches_sequential_read() {
        let file_len = 6 * CHUNK;
        let (mut sequential, _) = memory_reader(file_len);
        let all = read_all(&mut sequential).await;

        for k in [0u64, 1, 3, 5] {
            let (mut reader, _) = memory_reader(file_len);
            reader.seek(k * CHUNK).expect("seek");
            let tail = read_all(&mut reader).await;
            assert_eq!(tail, all[(k * CHUNK) as usize..]);
        }
    }

    #[tokio::test]
    async fn backward_seek_reuses_cached_chunks() {
        let (mut reader, source) = memory_reader(4 * CHUNK);
        let first = read_all(&mut reader).await;
        let before = source.requests.load(Ordering::SeqCst);
        reader.seek(100).expect("seek back");
        let again = read_all(&mut reader).await;
        assert_eq!(again, first[100..]);
        assert_eq!(source.requests.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn seek_past_known_length_fails() {
        let (mut reader, _) = memory_reader(CHUNK);
        read_all(&mut reader).await;
        assert!(reader.seek(CHUNK).is_ok());
        assert!(matches!(
            reader.seek(CHUNK + 1),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn mark_reset_skip_and_close() {
        // A short first range makes the length known.
        let (mut reader, _) = memory_reader(CHUNK + 10);
        assert!(reader.reset().is_err());
        let mut buf = [0u8; 10];
        reader.read(&mut buf).await.expect("read");
        reader.mark();
        reader.read(&mut buf).await.expect("read");
        reader.reset().expect("reset");
        assert_eq!(reader.tell(), 10);

        assert_eq!(reader.stream_length(), Some(CHUNK + 10));
        assert_eq!(reader.skip(u64::MAX).expect("skip"), CHUNK);
        assert_eq!(reader.read(&mut buf).await.expect("eof"), 0);

        reader.close();
        assert!(matches!(reader.available(), Err(ClientError::Closed)));
        assert!(matches!(reader.read(&mut buf).await, Err(ClientError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_range_times_out() {
        let mut reader = SubstreamReader::new(Arc::new(ChunkStore::new()), Arc::new(SilentSource))
            .with_wait_timeout(Duration::from_secs(2));
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.expect_err("no data");
        assert!(matches!(err, ClientError::ChannelTimeout { channel: 4, .. }));
        assert_eq!(err.kind(), tonearm_core::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn failed_range_is_reported_once() {
        let mut reader =
            SubstreamReader::new(Arc::new(ChunkStore::new()), Arc::new(FailingSource));
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.expect_err("range failed");
        assert!(matches!(err, ClientError::ChannelFailed { channel: 6, .. }));
    }

    #[tokio::test]
    async fn disconnected_store_reports_closed() {
        let store = Arc::new(ChunkStore::new());
        store.disconnect();
        let mut reader = SubstreamReader::new(store, Arc::new(SilentSource));
        let mut buf = [0u8; 4];
        assert!(matches!(reader.read(&mut buf).await, Err(ClientError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_adapter_reads_and_seeks() {
        use std::io::{Read, Seek, SeekFrom};

        let (reader, _) = memory_reader(CHUNK + 100);
        let handle = Handle::current();
        let (head, tail) = tokio::task::spawn_blocking(move || {
            let mut blocking = BlockingReader::new(reader, handle);
            let mut head = vec![0u8; 50];
            blocking.read_exact(&mut head).expect("head");
            blocking.seek(SeekFrom::End(-20)).expect("seek from end");
            let mut tail = Vec::new();
            blocking.read_to_end(&mut tail).expect("tail");
            (head, tail)
        })
        .await
        .expect("join");
        assert_eq!(head, chunk_bytes(0)[..50]);
        assert_eq!(tail, chunk_bytes(1)[80..100]);
    }
}
