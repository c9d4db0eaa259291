//! Logical channels multiplexed over one connection.
//!
//! A request allocates a 16-bit channel id, embeds it in the outgoing
//! command and registers a listener. Channel-data, channel-error and the
//! AES key responses are routed back to that listener by id. Events for ids
//! that are no longer registered are dropped; they are the expected result
//! of a local abort or timeout racing the server.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tonearm_core::{Command, Truncated, WireReader};
use tracing::debug;

use crate::connection::{command_label, CommandListener};
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Search,
    Browse,
    Image,
    Playlist,
    AesKey,
    Substream,
    Ad,
    Toplist,
}

impl ChannelType {
    pub fn name(self) -> &'static str {
        match self {
            ChannelType::Search => "search",
            ChannelType::Browse => "browse",
            ChannelType::Image => "image",
            ChannelType::Playlist => "playlist",
            ChannelType::AesKey => "aes-key",
            ChannelType::Substream => "substream",
            ChannelType::Ad => "ad",
            ChannelType::Toplist => "toplist",
        }
    }
}

/// Handle for one open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    id: u16,
    purpose: Arc<str>,
    kind: ChannelType,
}

impl Channel {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    pub fn kind(&self) -> ChannelType {
        self.kind
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.purpose, self.id)
    }
}

/// Channel events. Invoked on the receive loop: implementations hand the
/// data off and return, they never wait.
pub trait ChannelListener: Send + Sync {
    fn on_header(&self, _channel: &Channel, _header: &[u8]) {}

    fn on_data(&self, _channel: &Channel, _data: &[u8]) {}

    fn on_end(&self, channel: &Channel);

    fn on_error(&self, channel: &Channel);

    /// The connection went away while the channel was open.
    fn on_disconnect(&self, channel: &Channel) {
        self.on_error(channel);
    }
}

struct ChannelEntry {
    channel: Channel,
    listener: Arc<dyn ChannelListener>,
    in_data: AtomicBool,
}

/// Live channels of one connection, keyed by id.
pub struct ChannelRegistry {
    entries: DashMap<u16, Arc<ChannelEntry>>,
    next_id: Mutex<u16>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: Mutex::new(0),
        }
    }

    /// Allocate a free id and register `listener` under it. Ids are handed
    /// out round-robin so a just-released id is not reused immediately.
    pub fn open(
        &self,
        purpose: &str,
        kind: ChannelType,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Channel, ClientError> {
        let mut next_id = self.next_id.lock();
        for step in 0..=u16::MAX {
            let id = next_id.wrapping_add(step);
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                let channel = Channel {
                    id,
                    purpose: Arc::from(purpose),
                    kind,
                };
                slot.insert(Arc::new(ChannelEntry {
                    channel: channel.clone(),
                    listener,
                    in_data: AtomicBool::new(false),
                }));
                *next_id = id.wrapping_add(1);
                debug!(target: "tonearm::channel", channel = id, purpose, kind = kind.name(), "channel opened");
                return Ok(channel);
            }
        }
        Err(ClientError::ChannelsExhausted)
    }

    /// Release `id`. Returns false if it was not registered.
    pub fn close(&self, id: u16) -> bool {
        let removed = self.entries.remove(&id).is_some();
        if removed {
            debug!(target: "tonearm::channel", channel = id, "channel closed");
        }
        removed
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Route a channel-multiplexed command. Returns false for commands that
    /// do not address a channel.
    pub fn dispatch(&self, command: u8, payload: &[u8]) -> bool {
        let Ok(command) = Command::try_from(command) else {
            return false;
        };
        let result = match command {
            Command::ChannelData => self.channel_data(payload),
            Command::ChannelError => self.channel_error(payload),
            Command::AesKey => self.aes_key(payload),
            Command::AesKeyError => self.aes_key_error(payload),
            _ => return false,
        };
        if let Err(err) = result {
            debug!(
                target: "tonearm::channel",
                command = %command_label(command.as_u8()),
                error = %err,
                "dropping malformed channel message"
            );
        }
        true
    }

    /// Fail every open channel; used when the connection is gone.
    pub fn disconnect_all(&self) {
        let ids: Vec<u16> = self.entries.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.listener.on_disconnect(&entry.channel);
            }
        }
    }

    fn lookup(&self, id: u16) -> Option<Arc<ChannelEntry>> {
        let entry = self.entries.get(&id).map(|entry| Arc::clone(entry.value()));
        if entry.is_none() {
            debug!(target: "tonearm::channel", channel = id, "event for unknown channel dropped");
        }
        entry
    }

    fn take(&self, id: u16) -> Option<Arc<ChannelEntry>> {
        let entry = self.entries.remove(&id).map(|(_, entry)| entry);
        if entry.is_none() {
            debug!(target: "tonearm::channel", channel = id, "event for unknown channel dropped");
        }
        entry
    }

    fn channel_data(&self, payload: &[u8]) -> Result<(), Truncated> {
        let mut reader = WireReader::new(payload);
        let id = reader.u16()?;
        let Some(entry) = self.lookup(id) else {
            return Ok(());
        };

        if !entry.in_data.load(Ordering::Acquire) {
            while reader.remaining() >= 2 {
                let len = usize::from(reader.u16()?);
                if len == 0 {
                    break;
                }
                let header = reader.bytes(len)?;
                entry.listener.on_header(&entry.channel, header);
            }
            entry.in_data.store(true, Ordering::Release);
            let rest = reader.rest();
            if !rest.is_empty() {
                entry.listener.on_data(&entry.channel, rest);
            }
            return Ok(());
        }

        let body = reader.rest();
        if body.is_empty() {
            if let Some(entry) = self.take(id) {
                debug!(target: "tonearm::channel", channel = id, purpose = entry.channel.purpose(), "channel end");
                entry.listener.on_end(&entry.channel);
            }
        } else {
            entry.listener.on_data(&entry.channel, body);
        }
        Ok(())
    }

    fn channel_error(&self, payload: &[u8]) -> Result<(), Truncated> {
        let mut reader = WireReader::new(payload);
        let id = reader.u16()?;
        let code = reader.u16().ok();
        if let Some(entry) = self.take(id) {
            debug!(target: "tonearm::channel", channel = id, purpose = entry.channel.purpose(), code, "channel error");
            entry.listener.on_error(&entry.channel);
        }
        Ok(())
    }

    fn aes_key(&self, payload: &[u8]) -> Result<(), Truncated> {
        let mut reader = WireReader::new(payload);
        reader.skip(2)?;
        let id = reader.u16()?;
        let key = reader.rest();
        if let Some(entry) = self.take(id) {
            entry.listener.on_data(&entry.channel, key);
            entry.listener.on_end(&entry.channel);
        }
        Ok(())
    }

    fn aes_key_error(&self, payload: &[u8]) -> Result<(), Truncated> {
        let mut reader = WireReader::new(payload);
        reader.skip(2)?;
        let id = reader.u16()?;
        if let Some(entry) = self.take(id) {
            debug!(target: "tonearm::channel", channel = id, "aes key refused");
            entry.listener.on_error(&entry.channel);
        }
        Ok(())
    }
}

impl CommandListener for ChannelRegistry {
    fn on_command(&self, command: u8, payload: &Bytes) {
        self.dispatch(command, payload);
    }

    fn on_closed(&self) {
        self.disconnect_all();
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("open", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Header(Vec<u8>),
        Data(Vec<u8>),
        End,
        Error,
        Disconnect,
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl ChannelListener for Recorder {
        fn on_header(&self, _channel: &Channel, header: &[u8]) {
            self.events.lock().push(Event::Header(header.to_vec()));
        }

        fn on_data(&self, _channel: &Channel, data: &[u8]) {
            self.events.lock().push(Event::Data(data.to_vec()));
        }

        fn on_end(&self, _channel: &Channel) {
            self.events.lock().push(Event::End);
        }

        fn on_error(&self, _channel: &Channel) {
            self.events.lock().push(Event::Error);
        }

        fn on_disconnect(&self, _channel: &Channel) {
            self.events.lock().push(Event::Disconnect);
        }
    }

    fn data_message(id: u16, body: &[u8]) -> Vec<u8> {
        let mut message = id.to_be_bytes().to_vec();
        message.extend_from_slice(body);
        message
    }

    #[test]
    fn live_ids_never_collide() {
        let registry = ChannelRegistry::new();
        let listener = Arc::new(Recorder::default());
        let mut live = HashSet::new();
        for _ in 0..8 {
            let channel = registry
                .open("search", ChannelType::Search, listener.clone())
                .expect("open");
            assert!(live.insert(channel.id()));
        }
        assert!(registry.close(3));
        live.remove(&3);
        for _ in 0..8 {
            let channel = registry
                .open("image", ChannelType::Image, listener.clone())
                .expect("open");
            assert!(live.insert(channel.id()), "id {} reused while live", channel.id());
        }
        assert_eq!(registry.len(), live.len());
    }

    #[test]
    fn released_id_becomes_available_again() {
        let registry = ChannelRegistry::new();
        let listener: Arc<dyn ChannelListener> = Arc::new(Recorder::default());
        let mut ids = Vec::new();
        for _ in 0..=u16::MAX {
            ids.push(
                registry
                    .open("fill", ChannelType::Browse, listener.clone())
                    .expect("open")
                    .id(),
            );
        }
        assert!(matches!(
            registry.open("overflow", ChannelType::Browse, listener.clone()),
            Err(ClientError::ChannelsExhausted)
        ));
        registry.close(1234);
        let channel = registry
            .open("again", ChannelType::Browse, listener)
            .expect("freed id");
        assert_eq!(channel.id(), 1234);
    }

    #[test]
    fn close_is_idempotent() {
        let registry = ChannelRegistry::new();
        let channel = registry
            .open("search", ChannelType::Search, Arc::new(Recorder::default()))
            .expect("open");
        assert!(registry.close(channel.id()));
        assert!(!registry.close(channel.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn headers_then_data_then_end() {
        let registry = ChannelRegistry::new();
        let listener = Arc::new(Recorder::default());
        let channel = registry
            .open("substream", ChannelType::Substream, listener.clone())
            .expect("open");
        let id = channel.id();

        let mut header = Vec::new();
        header.extend_from_slice(&5u16.to_be_bytes());
        header.extend_from_slice(&[0x03, 0, 0, 0x10, 0]);
        header.extend_from_slice(&2u16.to_be_bytes());
        header.extend_from_slice(&[0x07, 0x01]);
        header.extend_from_slice(&0u16.to_be_bytes());
        assert!(registry.dispatch(0x09, &data_message(id, &header)));
        assert!(registry.dispatch(0x09, &data_message(id, b"chunk")));
        assert!(registry.dispatch(0x09, &data_message(id, b"")));

        assert_eq!(
            listener.events(),
            vec![
                Event::Header(vec![0x03, 0, 0, 0x10, 0]),
                Event::Header(vec![0x07, 0x01]),
                Event::Data(b"chunk".to_vec()),
                Event::End,
            ]
        );
        assert!(!registry.contains(id));
    }

    #[test]
    fn header_section_may_end_with_the_message() {
        let registry = ChannelRegistry::new();
        let listener = Arc::new(Recorder::default());
        let id = registry
            .open("image", ChannelType::Image, listener.clone())
            .expect("open")
            .id();
        let mut header = 1u16.to_be_bytes().to_vec();
        header.push(0x01);
        registry.dispatch(0x09, &data_message(id, &header));
        registry.dispatch(0x09, &data_message(id, b"jpeg"));
        assert_eq!(
            listener.events(),
            vec![Event::Header(vec![0x01]), Event::Data(b"jpeg".to_vec())]
        );
    }

    #[test]
    fn unknown_channels_are_dropped() {
        let registry = ChannelRegistry::new();
        assert!(registry.dispatch(0x09, &data_message(77, b"late")));
        assert!(registry.dispatch(0x0a, &data_message(77, &[0, 1])));
        assert!(registry.dispatch(0x09, &[0x00]));
        assert!(!registry.dispatch(0x04, &[0, 0, 0, 0]));
    }

    #[test]
    fn channel_error_fails_and_releases() {
        let registry = ChannelRegistry::new();
        let listener = Arc::new(Recorder::default());
        let id = registry
            .open("browse", ChannelType::Browse, listener.clone())
            .expect("open")
            .id();
        registry.dispatch(0x0a, &data_message(id, &[0x00, 0x02]));
        registry.dispatch(0x09, &data_message(id, b"ignored"));
        assert_eq!(listener.events(), vec![Event::Error]);
        assert!(!registry.contains(id));
    }

    #[test]
    fn aes_key_is_data_then_end() {
        let registry = ChannelRegistry::new();
        let listener = Arc::new(Recorder::default());
        let id = registry
            .open("aes-key", ChannelType::AesKey, listener.clone())
            .expect("open")
            .id();
        let mut payload = vec![0xaa, 0xbb];
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&[0x42; 16]);
        registry.dispatch(0x0d, &payload);
        assert_eq!(
            listener.events(),
            vec![Event::Data(vec![0x42; 16]), Event::End]
        );

        let id = registry
            .open("aes-key", ChannelType::AesKey, listener.clone())
            .expect("open")
            .id();
        let mut payload = vec![0, 0];
        payload.extend_from_slice(&id.to_be_bytes());
        registry.dispatch(0x0e, &payload);
        assert_eq!(listener.events().last(), Some(&Event::Error));
    }

    #[test]
    fn disconnect_reaches_every_open_channel() {
        let registry = ChannelRegistry::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        registry
            .open("a", ChannelType::Search, first.clone())
            .expect("open");
        registry
            .open("b", ChannelType::Image, second.clone())
            .expect("open");
        registry.on_closed();
        assert_eq!(first.events(), vec![Event::Disconnect]);
        assert_eq!(second.events(), vec![Event::Disconnect]);
        assert!(registry.is_empty());
    }
}
