//! Client runtime for the tonearm protocol.
//!
//! A [`Client`] connects, runs the login handshake and starts a
//! [`Connection`] whose receive loop feeds the [`ChannelRegistry`] and the
//! session command handler. Every request opens a channel, sends one
//! command and waits on a release-once callback; audio is read through a
//! seekable [`SubstreamReader`].

mod callback;
mod channel;
mod connection;
mod error;
pub mod request;
mod session;
mod store;
mod substream;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use tonearm_core::{connect_any, Command, LinkHandle};
use tonearm_handshake::ClientHandshake;
use tracing::{debug, info, warn};

pub use callback::{ChannelCallback, HeaderCallback, Response};
pub use channel::{Channel, ChannelListener, ChannelRegistry, ChannelType};
pub use connection::{read_frame, write_frame, CommandListener, Connection, FrameSender};
pub use error::ClientError;
pub use request::{
    AdKind, BrowseKind, EntityId, FileId, ImageId, PlaylistChange, TrackId, CACHE_HASH,
};
pub use session::SessionInfo;
pub use tonearm_handshake::{ClientIdentity, Credentials, HandshakeConfig};
pub use store::{BlockingReader, ChunkStore, RangeSource, SubstreamReader};
pub use substream::{
    deinterleave, interleave, AudioDecryptor, RangeLoader, AUDIO_IV, AUDIO_KEY_LEN, BLOCK_SIZE,
    CHUNK_SIZE, SUBSTREAM_SIZE,
};

use session::SessionHandler;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` candidates, tried in order.
    pub servers: Vec<String>,
    pub connect_timeout: Duration,
    /// How long login waits for the country code and product info.
    pub login_timeout: Duration,
    pub channel_timeout: Duration,
    pub aes_key_timeout: Duration,
    /// Bytes per substream range request.
    pub substream_size: u64,
    pub handshake: HandshakeConfig,
    pub cache_hash: Option<[u8; 20]>,
}

impl ClientConfig {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    pub fn with_aes_key_timeout(mut self, timeout: Duration) -> Self {
        self.aes_key_timeout = timeout;
        self
    }

    pub fn with_substream_size(mut self, bytes: u64) -> Self {
        self.substream_size = bytes;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.handshake = self.handshake.with_identity(identity);
        self
    }

    pub fn with_cache_hash(mut self, hash: [u8; 20]) -> Self {
        self.cache_hash = Some(hash);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            connect_timeout: Duration::from_secs(1),
            login_timeout: Duration::from_secs(10),
            channel_timeout: Duration::from_secs(10),
            aes_key_timeout: Duration::from_secs(1),
            substream_size: SUBSTREAM_SIZE,
            handshake: HandshakeConfig::default(),
            cache_hash: None,
        }
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the first reachable server and log in.
    pub async fn login(&self, credentials: Credentials) -> Result<ClientSession, ClientError> {
        if self.config.servers.is_empty() {
            return Err(ClientError::InvalidArgument("no servers configured".into()));
        }
        let (link, addr) = connect_any(&self.config.servers, self.config.connect_timeout).await?;
        debug!(target: "tonearm::client", %addr, "logging in");
        self.login_over(link, credentials).await
    }

    /// Log in over an already connected link.
    pub async fn login_over(
        &self,
        mut link: LinkHandle,
        credentials: Credentials,
    ) -> Result<ClientSession, ClientError> {
        let mut handshake = ClientHandshake::new(self.config.handshake.clone(), credentials)?;
        let authenticated = handshake.run(&mut link).await?;
        let username = authenticated.username().to_string();
        let modulus = *authenticated.rsa_modulus();
        let (send, recv) = authenticated.into_ciphers();

        let registry = Arc::new(ChannelRegistry::new());
        let mut handler = None;
        let connection = Connection::start_with(link, send, recv, |sender| {
            let session = Arc::new(SessionHandler::new(
                sender.clone(),
                username.clone(),
                modulus,
                self.config.cache_hash,
            ));
            handler = Some(Arc::clone(&session));
            vec![
                Arc::clone(&registry) as Arc<dyn CommandListener>,
                session as Arc<dyn CommandListener>,
            ]
        });
        let handler = handler.ok_or(ClientError::Closed)?;

        let session = ClientSession {
            connection,
            registry,
            handler,
            config: self.config.clone(),
        };
        match session.handler.wait_ready(self.config.login_timeout).await {
            Ok(info) => {
                info!(
                    target: "tonearm::client",
                    username = %info.username,
                    country = info.country.as_deref().unwrap_or(""),
                    "logged in"
                );
                Ok(session)
            }
            Err(err) => {
                warn!(target: "tonearm::client", error = %err, "session did not become ready");
                session.close().await;
                Err(err)
            }
        }
    }
}

/// A logged-in connection.
pub struct ClientSession {
    connection: Connection,
    registry: Arc<ChannelRegistry>,
    handler: Arc<SessionHandler>,
    config: ClientConfig,
}

impl ClientSession {
    pub fn info(&self) -> SessionInfo {
        self.handler.info()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.connection.close_reason()
    }

    /// Wait until the connection goes away.
    pub async fn closed(&self) {
        self.connection.closed().await
    }

    pub async fn close(&self) {
        self.connection.close().await
    }

    /// Open a channel, send `command` with the payload `build` makes for
    /// the channel id, and collect the response.
    async fn request<F>(
        &self,
        purpose: &str,
        kind: ChannelType,
        command: Command,
        timeout: Duration,
        build: F,
    ) -> Result<Bytes, ClientError>
    where
        F: FnOnce(u16) -> Result<Bytes, ClientError>,
    {
        let callback = Arc::new(ChannelCallback::new());
        self.exchange(purpose, kind, command, timeout, callback, build)
            .await
    }

    async fn exchange<L, F>(
        &self,
        purpose: &str,
        kind: ChannelType,
        command: Command,
        timeout: Duration,
        callback: Arc<L>,
        build: F,
    ) -> Result<L::Output, ClientError>
    where
        L: Response,
        F: FnOnce(u16) -> Result<Bytes, ClientError>,
    {
        let channel = self.registry.open(purpose, kind, callback.clone())?;
        let payload = match build(channel.id()) {
            Ok(payload) => payload,
            Err(err) => {
                self.registry.close(channel.id());
                return Err(err);
            }
        };
        let _pending = PendingChannel {
            registry: Arc::clone(&self.registry),
            sender: self.connection.sender(),
            id: channel.id(),
        };
        self.connection.send(command, &payload).await?;
        match callback.wait_for(&channel, timeout).await {
            Err(err @ ClientError::ChannelTimeout { .. }) => {
                warn!(target: "tonearm::client", channel = %channel, "request timed out; aborting channel");
                self.abort(channel.id()).await;
                Err(err)
            }
            other => other,
        }
    }

    /// Forget channel `id` locally and tell the server to stop sending.
    /// Frames still in flight for it are dropped as unknown.
    pub async fn abort(&self, id: u16) {
        self.registry.close(id);
        if let Err(err) = self
            .connection
            .send(Command::ChannelAbort, &request::channel_abort(id))
            .await
        {
            debug!(target: "tonearm::client", channel = id, error = %err, "abort not sent");
        }
    }

    /// Search results as XML.
    pub async fn search(&self, query: &str, offset: i32, limit: i32) -> Result<Bytes, ClientError> {
        let data = self
            .request(
                "search",
                ChannelType::Search,
                Command::Search,
                self.config.channel_timeout,
                |id| request::search_request(id, query, offset, limit),
            )
            .await?;
        inflate(&data)
    }

    /// Raw image bytes.
    pub async fn image(&self, image: &ImageId) -> Result<Bytes, ClientError> {
        self.request(
            "image",
            ChannelType::Image,
            Command::Image,
            self.config.channel_timeout,
            |id| Ok(request::image_request(id, image)),
        )
        .await
    }

    /// Artist, album or track metadata as XML.
    pub async fn browse(&self, kind: BrowseKind, ids: &[EntityId]) -> Result<Bytes, ClientError> {
        let data = self
            .request(
                "browse",
                ChannelType::Browse,
                Command::Browse,
                self.config.channel_timeout,
                |id| request::browse_request(id, kind, ids),
            )
            .await?;
        inflate(&data)
    }

    pub async fn toplist(&self, params: &[(&str, &str)]) -> Result<Bytes, ClientError> {
        let data = self
            .request(
                "toplist",
                ChannelType::Toplist,
                Command::GetToplist,
                self.config.channel_timeout,
                |id| request::toplist_request(id, params),
            )
            .await?;
        inflate(&data)
    }

    pub async fn ad(&self, kind: AdKind) -> Result<Bytes, ClientError> {
        let data = self
            .request(
                "ad",
                ChannelType::Ad,
                Command::RequestAd,
                self.config.channel_timeout,
                |id| Ok(request::ad_request(id, kind)),
            )
            .await?;
        inflate(&data)
    }

    /// Playlist XML, or the playlist container when `playlist` is `None`.
    pub async fn playlist(&self, playlist: Option<&EntityId>) -> Result<Bytes, ClientError> {
        self.request(
            "playlist",
            ChannelType::Playlist,
            Command::GetPlaylist,
            self.config.channel_timeout,
            |id| Ok(request::playlist_request(id, playlist)),
        )
        .await
    }

    /// Returns the server's confirmation XML.
    pub async fn change_playlist(&self, change: &PlaylistChange<'_>) -> Result<Bytes, ClientError> {
        self.request(
            "change-playlist",
            ChannelType::Playlist,
            Command::ChangePlaylist,
            self.config.channel_timeout,
            |id| Ok(request::change_playlist_request(id, change)),
        )
        .await
    }

    pub async fn create_playlist(
        &self,
        playlist: &EntityId,
        collaborative: bool,
        xml: &str,
    ) -> Result<Bytes, ClientError> {
        self.request(
            "create-playlist",
            ChannelType::Playlist,
            Command::ChangePlaylist,
            self.config.channel_timeout,
            |id| Ok(request::create_playlist_request(id, playlist, collaborative, xml)),
        )
        .await
    }

    /// The AES key for one file of a track.
    pub async fn aes_key(
        &self,
        file: &FileId,
        track: &TrackId,
    ) -> Result<[u8; AUDIO_KEY_LEN], ClientError> {
        let data = self
            .request(
                "aes-key",
                ChannelType::AesKey,
                Command::RequestKey,
                self.config.aes_key_timeout,
                |id| Ok(request::aes_key_request(id, file, track)),
            )
            .await?;
        <[u8; AUDIO_KEY_LEN]>::try_from(&data[..]).map_err(|_| {
            ClientError::protocol(format!(
                "aes key response of {} bytes, expected {AUDIO_KEY_LEN}",
                data.len()
            ))
        })
    }

    /// One range of a file exactly as served: interleaved and encrypted.
    pub async fn substream(
        &self,
        file: &FileId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, ClientError> {
        self.request(
            "substream",
            ChannelType::Substream,
            Command::GetSubstream,
            self.config.channel_timeout,
            |id| request::substream_request(id, file, offset, length),
        )
        .await
    }

    /// Stream part URLs the server lists in the headers of a substream
    /// response. The audio on the channel is discarded.
    pub async fn stream_urls(
        &self,
        file: &FileId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<String>, ClientError> {
        self.exchange(
            "stream-urls",
            ChannelType::Substream,
            Command::GetSubstream,
            self.config.channel_timeout,
            Arc::new(HeaderCallback::new()),
            |id| request::substream_request(id, file, offset, length),
        )
        .await
    }

    /// Fetch the file key and open a seekable reader over the decrypted
    /// audio.
    pub async fn open_stream(
        &self,
        file: &FileId,
        track: &TrackId,
    ) -> Result<SubstreamReader, ClientError> {
        let key = self.aes_key(file, track).await?;
        self.open_stream_with_key(file, &key)
    }

    pub fn open_stream_with_key(
        &self,
        file: &FileId,
        key: &[u8],
    ) -> Result<SubstreamReader, ClientError> {
        let source = ChannelRanges {
            registry: Arc::clone(&self.registry),
            sender: self.connection.sender(),
            file: *file,
            decryptor: Arc::new(AudioDecryptor::new(key)?),
        };
        Ok(
            SubstreamReader::new(Arc::new(ChunkStore::new()), Arc::new(source))
                .with_request_size(self.config.substream_size)
                .with_wait_timeout(self.config.channel_timeout),
        )
    }

    /// Tell the server playback has started on this connection.
    pub async fn request_play(&self) -> Result<(), ClientError> {
        self.connection.send(Command::RequestPlay, &[]).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("connection", &self.connection)
            .field("channels", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// A request channel the server may still be sending on. Dropped before
/// the response completes, it releases the id and asks the server to stop.
struct PendingChannel {
    registry: Arc<ChannelRegistry>,
    sender: FrameSender,
    id: u16,
}

impl Drop for PendingChannel {
    fn drop(&mut self) {
        // Completed, failed and aborted channels are already gone.
        if !self.registry.close(self.id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(target: "tonearm::client", channel = self.id, "abort not sent: no runtime");
            return;
        };
        let sender = self.sender.clone();
        let id = self.id;
        runtime.spawn(async move {
            if let Err(err) = sender
                .send(Command::ChannelAbort, &request::channel_abort(id))
                .await
            {
                debug!(target: "tonearm::client", channel = id, error = %err, "abort not sent");
            }
        });
        debug!(target: "tonearm::client", channel = id, "request dropped; channel released");
    }
}

/// Issues substream requests for one file over a live connection.
struct ChannelRanges {
    registry: Arc<ChannelRegistry>,
    sender: FrameSender,
    file: FileId,
    decryptor: Arc<AudioDecryptor>,
}

#[async_trait]
impl RangeSource for ChannelRanges {
    async fn request_range(
        &self,
        store: &Arc<ChunkStore>,
        offset: u64,
        length: u64,
    ) -> Result<u16, ClientError> {
        let loader = Arc::new(RangeLoader::new(
            Arc::clone(store),
            Arc::clone(&self.decryptor),
            offset,
            length,
        ));
        let channel = self
            .registry
            .open("substream", ChannelType::Substream, loader)?;
        let sent = match request::substream_request(channel.id(), &self.file, offset, length) {
            Ok(payload) => self.sender.send(Command::GetSubstream, &payload).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(_) => Ok(channel.id()),
            Err(err) => {
                self.registry.close(channel.id());
                Err(err)
            }
        }
    }
}

/// Gunzip a search, browse, toplist or ad result.
fn inflate(data: &[u8]) -> Result<Bytes, ClientError> {
    if data.is_empty() {
        return Ok(Bytes::new());
    }
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(ClientError::Decompress)?;
    Ok(Bytes::from(out))
}
