//! Listeners that collect a channel's response for a waiting caller.
//!
//! The receive loop only appends and releases; the caller waits on a
//! semaphore that is released exactly once, by end, error or disconnect.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::channel::{Channel, ChannelListener};
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    End,
    Error,
    Disconnected,
}

struct ReleaseOnce {
    outcome: Mutex<Option<Outcome>>,
    done: Semaphore,
}

impl ReleaseOnce {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Semaphore::new(0),
        }
    }

    fn release(&self, outcome: Outcome) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.done.add_permits(1);
        true
    }

    fn is_released(&self) -> bool {
        self.outcome.lock().is_some()
    }

    async fn wait(&self, channel: &Channel, timeout: Duration) -> Result<(), ClientError> {
        let permit = tokio::time::timeout(timeout, self.done.acquire())
            .await
            .map_err(|_| ClientError::ChannelTimeout {
                channel: channel.id(),
                purpose: channel.purpose().to_string(),
                timeout,
            })?
            .map_err(|_| ClientError::Closed)?;
        // Dropping the permit returns it, so a repeated wait sees the same
        // outcome.
        drop(permit);
        match *self.outcome.lock() {
            Some(Outcome::End) => Ok(()),
            Some(Outcome::Error) => Err(ClientError::ChannelFailed {
                channel: channel.id(),
                purpose: channel.purpose().to_string(),
            }),
            Some(Outcome::Disconnected) | None => Err(ClientError::Closed),
        }
    }
}

/// A channel listener a request can wait on for its result.
#[async_trait]
pub trait Response: ChannelListener + 'static {
    type Output: Send;

    async fn wait_for(&self, channel: &Channel, timeout: Duration)
        -> Result<Self::Output, ClientError>;
}

/// Accumulates `on_data` bytes until the channel ends.
pub struct ChannelCallback {
    buffer: Mutex<BytesMut>,
    result: Mutex<Option<Bytes>>,
    release: ReleaseOnce,
}

impl Default for ChannelCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelCallback {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::new()),
            result: Mutex::new(None),
            release: ReleaseOnce::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.release.is_released()
    }

    /// Wait at most `timeout` for the channel to finish and return the
    /// collected bytes. On timeout the channel is left registered; the
    /// caller decides whether to abort it.
    pub async fn wait(&self, channel: &Channel, timeout: Duration) -> Result<Bytes, ClientError> {
        self.release.wait(channel, timeout).await?;
        Ok(self.result.lock().clone().unwrap_or_default())
    }
}

#[async_trait]
impl Response for ChannelCallback {
    type Output = Bytes;

    async fn wait_for(&self, channel: &Channel, timeout: Duration) -> Result<Bytes, ClientError> {
        self.wait(channel, timeout).await
    }
}

impl ChannelListener for ChannelCallback {
    fn on_data(&self, _channel: &Channel, data: &[u8]) {
        self.buffer.lock().extend_from_slice(data);
    }

    fn on_end(&self, _channel: &Channel) {
        let collected = self.buffer.lock().split().freeze();
        *self.result.lock() = Some(collected);
        self.release.release(Outcome::End);
    }

    fn on_error(&self, _channel: &Channel) {
        self.release.release(Outcome::Error);
    }

    fn on_disconnect(&self, _channel: &Channel) {
        self.release.release(Outcome::Disconnected);
    }
}

impl fmt::Debug for ChannelCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCallback")
            .field("buffered", &self.buffer.lock().len())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Header entry type that carries an HTTP stream part URL.
const STREAM_URL_HEADER: u8 = 0x07;

/// Collects stream part URLs from a channel's header entries and ignores
/// its data.
pub struct HeaderCallback {
    urls: Mutex<Vec<String>>,
    release: ReleaseOnce,
}

impl Default for HeaderCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCallback {
    pub fn new() -> Self {
        Self {
            urls: Mutex::new(Vec::new()),
            release: ReleaseOnce::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.release.is_released()
    }

    pub async fn wait(
        &self,
        channel: &Channel,
        timeout: Duration,
    ) -> Result<Vec<String>, ClientError> {
        self.release.wait(channel, timeout).await?;
        Ok(self.urls.lock().clone())
    }
}

#[async_trait]
impl Response for HeaderCallback {
    type Output = Vec<String>;

    async fn wait_for(
        &self,
        channel: &Channel,
        timeout: Duration,
    ) -> Result<Vec<String>, ClientError> {
        self.wait(channel, timeout).await
    }
}

impl ChannelListener for HeaderCallback {
    fn on_header(&self, _channel: &Channel, header: &[u8]) {
        // header[1] is the part number.
        if header.len() > 2 && header[0] == STREAM_URL_HEADER {
            self.urls
                .lock()
                .push(String::from_utf8_lossy(&header[2..]).into_owned());
        }
    }

    fn on_end(&self, _channel: &Channel) {
        self.release.release(Outcome::End);
    }

    fn on_error(&self, _channel: &Channel) {
        self.release.release(Outcome::Error);
    }

    fn on_disconnect(&self, _channel: &Channel) {
        self.release.release(Outcome::Disconnected);
    }
}

impl fmt::Debug for HeaderCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderCallback")
            .field("urls", &self.urls.lock().len())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRegistry, ChannelType};
    use std::sync::Arc;

    fn open(registry: &ChannelRegistry, listener: Arc<dyn ChannelListener>) -> Channel {
        registry
            .open("test", ChannelType::Search, listener)
            .expect("open channel")
    }

    fn message(id: u16, body: &[u8]) -> Vec<u8> {
        let mut out = id.to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn collects_until_end() {
        let registry = ChannelRegistry::new();
        let callback = Arc::new(ChannelCallback::new());
        let channel = open(&registry, callback.clone());
        let id = channel.id();

        registry.dispatch(0x09, &message(id, &[0, 0]));
        registry.dispatch(0x09, &message(id, b"hello "));
        registry.dispatch(0x09, &message(id, b"world"));
        assert!(!callback.is_done());
        registry.dispatch(0x09, &message(id, b""));

        let data = callback
            .wait(&channel, Duration::from_secs(1))
            .await
            .expect("collected");
        assert_eq!(&data[..], b"hello world");
        let again = callback
            .wait(&channel, Duration::from_millis(10))
            .await
            .expect("second wait sees the same result");
        assert_eq!(again, data);
    }

    #[tokio::test]
    async fn released_once_even_if_events_repeat() {
        let callback = ChannelCallback::new();
        let registry = ChannelRegistry::new();
        let channel = open(&registry, Arc::new(ChannelCallback::new()));
        callback.on_error(&channel);
        callback.on_end(&channel);
        let err = callback
            .wait(&channel, Duration::from_secs(1))
            .await
            .expect_err("error wins");
        assert!(matches!(err, ClientError::ChannelFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_channel_registered() {
        let registry = ChannelRegistry::new();
        let callback = Arc::new(ChannelCallback::new());
        let channel = open(&registry, callback.clone());

        let err = callback
            .wait(&channel, Duration::from_secs(10))
            .await
            .expect_err("nothing arrives");
        assert!(matches!(err, ClientError::ChannelTimeout { channel: id, .. } if id == channel.id()));
        assert!(registry.contains(channel.id()));

        // A late completion is still accepted.
        registry.dispatch(0x09, &message(channel.id(), &[0, 0]));
        registry.dispatch(0x09, &message(channel.id(), b""));
        assert!(callback.is_done());
    }

    #[tokio::test]
    async fn disconnect_reports_closed() {
        let registry = ChannelRegistry::new();
        let callback = Arc::new(ChannelCallback::new());
        let channel = open(&registry, callback.clone());
        registry.disconnect_all();
        let err = callback
            .wait(&channel, Duration::from_secs(1))
            .await
            .expect_err("connection gone");
        assert!(matches!(err, ClientError::Closed));
    }

    #[tokio::test]
    async fn header_callback_collects_stream_urls() {
        let registry = ChannelRegistry::new();
        let callback = Arc::new(HeaderCallback::new());
        let channel = open(&registry, callback.clone());
        let id = channel.id();

        let url = b"http://example.invalid/part0";
        let mut headers = Vec::new();
        headers.extend_from_slice(&((url.len() + 2) as u16).to_be_bytes());
        headers.extend_from_slice(&[0x07, 0x00]);
        headers.extend_from_slice(url);
        headers.extend_from_slice(&3u16.to_be_bytes());
        headers.extend_from_slice(&[0x01, 0x02, 0x03]);
        headers.extend_from_slice(&0u16.to_be_bytes());
        registry.dispatch(0x09, &message(id, &headers));
        registry.dispatch(0x09, &message(id, b"ignored"));
        registry.dispatch(0x09, &message(id, b""));

        let urls = callback
            .wait(&channel, Duration::from_secs(1))
            .await
            .expect("urls");
        assert_eq!(urls, vec!["http://example.invalid/part0".to_string()]);
    }
}
