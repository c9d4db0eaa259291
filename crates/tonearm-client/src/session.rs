//! Connection-level commands that are not tied to a channel: keepalive,
//! the secret block acknowledgement and the login facts the server pushes
//! right after authentication.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tonearm_core::Command;
use tonearm_handshake::RSA_MODULUS_LEN;
use tracing::{debug, info, trace, warn};

use crate::connection::{command_label, CommandListener, FrameSender};
use crate::error::ClientError;
use crate::request;

const SECRET_BLOCK_LEN: usize = 336;
const SECRET_BLOCK_MODULUS_AT: usize = 16;
const NOTIFY_HEADER_LEN: usize = 11;
const PREVIEW_LEN: usize = 32;

/// Facts about the logged-in account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub username: String,
    pub country: Option<String>,
    /// Raw product info XML.
    pub product_info: Option<Bytes>,
    pub notification: Option<String>,
}

pub(crate) struct SessionHandler {
    sender: FrameSender,
    rsa_modulus: [u8; RSA_MODULUS_LEN],
    cache_hash: Option<[u8; 20]>,
    info: Mutex<SessionInfo>,
    country_ready: Semaphore,
    product_ready: Semaphore,
}

impl SessionHandler {
    pub(crate) fn new(
        sender: FrameSender,
        username: String,
        rsa_modulus: [u8; RSA_MODULUS_LEN],
        cache_hash: Option<[u8; 20]>,
    ) -> Self {
        Self {
            sender,
            rsa_modulus,
            cache_hash,
            info: Mutex::new(SessionInfo {
                username,
                ..SessionInfo::default()
            }),
            country_ready: Semaphore::new(0),
            product_ready: Semaphore::new(0),
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        self.info.lock().clone()
    }

    /// Wait until both the country code and the product info have arrived.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<SessionInfo, ClientError> {
        let ready = async {
            // Permits go back on drop so later waits return at once.
            let _country = self.country_ready.acquire().await?;
            let _product = self.product_ready.acquire().await?;
            Ok::<_, tokio::sync::AcquireError>(())
        };
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(self.info()),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::LoginTimeout(timeout)),
        }
    }

    fn reply(&self, command: Command, payload: Vec<u8>) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            if let Err(err) = sender.send(command, &payload).await {
                debug!(target: "tonearm::client", command = %command, error = %err, "reply not sent");
            }
        });
    }

    fn on_secret_block(&self, payload: &[u8]) {
        if payload.len() != SECRET_BLOCK_LEN {
            warn!(target: "tonearm::client", len = payload.len(), "unexpected secret block length");
        } else {
            let modulus = &payload[SECRET_BLOCK_MODULUS_AT..SECRET_BLOCK_MODULUS_AT + RSA_MODULUS_LEN];
            if modulus != self.rsa_modulus {
                warn!(target: "tonearm::client", "secret block does not carry our RSA modulus");
            }
        }
        let hash = self.cache_hash.unwrap_or_else(request::cache_hash);
        self.reply(Command::CacheHash, hash.to_vec());
    }

    fn on_country(&self, payload: &[u8]) {
        let country = String::from_utf8_lossy(payload).into_owned();
        debug!(target: "tonearm::client", %country, "country code");
        self.info.lock().country = Some(country);
        if self.country_ready.available_permits() == 0 {
            self.country_ready.add_permits(1);
        }
    }

    fn on_product_info(&self, payload: &Bytes) {
        debug!(target: "tonearm::client", len = payload.len(), "product info");
        self.info.lock().product_info = Some(payload.clone());
        if self.product_ready.available_permits() == 0 {
            self.product_ready.add_permits(1);
        }
    }

    fn on_notify(&self, payload: &[u8]) {
        let Some(text) = payload.get(NOTIFY_HEADER_LEN..) else {
            debug!(target: "tonearm::client", len = payload.len(), "short notification dropped");
            return;
        };
        let text = String::from_utf8_lossy(text).into_owned();
        info!(target: "tonearm::client", notification = %text, "server notification");
        self.info.lock().notification = Some(text);
    }
}

impl CommandListener for SessionHandler {
    fn on_command(&self, command: u8, payload: &Bytes) {
        let Ok(known) = Command::try_from(command) else {
            debug!(
                target: "tonearm::client",
                command = %command_label(command),
                len = payload.len(),
                preview = %hex::encode(&payload[..payload.len().min(PREVIEW_LEN)]),
                "unhandled command"
            );
            return;
        };
        match known {
            Command::SecretBlock => self.on_secret_block(payload),
            Command::Ping => {
                trace!(target: "tonearm::client", "ping");
                self.reply(Command::Pong, request::pong().to_vec());
            }
            Command::CountryCode => self.on_country(payload),
            Command::ProductInfo => self.on_product_info(payload),
            Command::Notify => self.on_notify(payload),
            Command::PlaylistChanged => {
                debug!(target: "tonearm::client", playlist = %hex::encode(payload), "playlist changed");
            }
            Command::PongAck
            | Command::Welcome
            | Command::ShaHash
            | Command::P2pInitBlock
            | Command::Pause => {}
            // The channel registry owns these.
            Command::ChannelData
            | Command::ChannelError
            | Command::AesKey
            | Command::AesKeyError => {}
            other => {
                debug!(
                    target: "tonearm::client",
                    command = %other,
                    len = payload.len(),
                    preview = %hex::encode(&payload[..payload.len().min(PREVIEW_LEN)]),
                    "unhandled command"
                );
            }
        }
    }

    fn on_closed(&self) {
        self.country_ready.close();
        self.product_ready.close();
    }
}

impl fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandler")
            .field("info", &*self.info.lock())
            .finish_non_exhaustive()
    }
}
