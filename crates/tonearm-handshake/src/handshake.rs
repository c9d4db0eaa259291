use std::fmt;
use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite};
use tonearm_core::write_all;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{
    auth_hash, hmac_sha1, DhKeyPair, ExpansionInput, HmacSha1Expansion, KeyExpansion,
    PuzzleSolver, RsaKeyPair, Sha1Puzzle,
};
use crate::error::HandshakeError;
use crate::messages::{
    auth_trailer, encode_auth_packet, read_auth_response, read_server_hello, ClientHello,
    ClientIdentity, CLIENT_RANDOM_LEN,
};
use crate::session::{AuthenticatedSession, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    HelloSent,
    HelloReceived,
    PuzzleSolved,
    AuthSent,
    Authenticated,
    Failed,
}

/// Handshake parameters. Key expansion and the puzzle are pluggable so a
/// recorded transcript can be replayed against an alternative schedule.
#[derive(Clone)]
pub struct HandshakeConfig {
    identity: ClientIdentity,
    key_expansion: Arc<dyn KeyExpansion>,
    puzzle_solver: Arc<dyn PuzzleSolver>,
    rsa_key: Option<RsaKeyPair>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            key_expansion: Arc::new(HmacSha1Expansion),
            puzzle_solver: Arc::new(Sha1Puzzle::default()),
            rsa_key: None,
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("identity", &self.identity)
            .field("key_expansion", &self.key_expansion)
            .field("puzzle_solver", &self.puzzle_solver)
            .field("reuses_rsa_key", &self.rsa_key.is_some())
            .finish()
    }
}

impl HandshakeConfig {
    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_key_expansion(mut self, expansion: Arc<dyn KeyExpansion>) -> Self {
        self.key_expansion = expansion;
        self
    }

    pub fn with_puzzle_solver(mut self, solver: Arc<dyn PuzzleSolver>) -> Self {
        self.puzzle_solver = solver;
        self
    }

    /// Reuse an existing RSA key instead of generating one per attempt.
    pub fn with_rsa_key(mut self, key: RsaKeyPair) -> Self {
        self.rsa_key = Some(key);
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn key_expansion(&self) -> &Arc<dyn KeyExpansion> {
        &self.key_expansion
    }

    pub fn puzzle_solver(&self) -> &Arc<dyn PuzzleSolver> {
        &self.puzzle_solver
    }
}

#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Client side of the key exchange and login.
#[derive(Debug)]
pub struct ClientHandshake {
    config: HandshakeConfig,
    credentials: Credentials,
    state: HandshakeState,
    session: Session,
}

impl ClientHandshake {
    /// Prepare a fresh attempt: new randoms, a new DH pair and, unless the
    /// config carries one, a new RSA key.
    pub fn new(config: HandshakeConfig, credentials: Credentials) -> Result<Self, HandshakeError> {
        let mut client_random = [0u8; CLIENT_RANDOM_LEN];
        OsRng.fill_bytes(&mut client_random);
        let rsa = match &config.rsa_key {
            Some(key) => key.clone(),
            None => RsaKeyPair::generate()?,
        };
        let session = Session::new(client_random, DhKeyPair::generate(), rsa);
        Ok(Self {
            config,
            credentials,
            state: HandshakeState::Disconnected,
            session,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Drive the whole exchange over `link`. On failure the state becomes
    /// [`HandshakeState::Failed`] and nothing further is written.
    pub async fn run<L>(&mut self, link: &mut L) -> Result<AuthenticatedSession, HandshakeError>
    where
        L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        if self.state != HandshakeState::Disconnected {
            return Err(HandshakeError::AlreadyFinished(self.state));
        }
        match self.drive(link).await {
            Ok(session) => Ok(session),
            Err(err) => {
                let previous = self.state;
                self.state = HandshakeState::Failed;
                if err.auth_failure().is_some() {
                    warn!(target: "tonearm::handshake", username = %self.credentials.username, error = %err, "login rejected");
                } else {
                    debug!(target: "tonearm::handshake", state = ?previous, error = %err, "handshake failed");
                }
                Err(err)
            }
        }
    }

    async fn drive<L>(&mut self, link: &mut L) -> Result<AuthenticatedSession, HandshakeError>
    where
        L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        self.send_hello(link).await?;
        self.receive_hello(link).await?;
        self.solve_puzzle().await?;
        self.derive_keys()?;
        self.send_auth(link).await?;
        self.receive_auth(link).await
    }

    async fn send_hello<L>(&mut self, link: &mut L) -> Result<(), HandshakeError>
    where
        L: AsyncWrite + Unpin + ?Sized,
    {
        let hello = ClientHello {
            identity: self.config.identity,
            client_random: self.session.client_random,
            dh_public: *self.session.dh.public_bytes(),
            rsa_modulus: *self.session.rsa.modulus(),
            username: self.credentials.username.clone(),
        };
        let packet = hello.encode()?;
        write_all(link, &packet).await?;
        self.session.initial_client_packet = packet;
        self.state = HandshakeState::HelloSent;
        debug!(target: "tonearm::handshake", len = self.session.initial_client_packet.len(), "client hello sent");
        Ok(())
    }

    async fn receive_hello<L>(&mut self, link: &mut L) -> Result<(), HandshakeError>
    where
        L: AsyncRead + Unpin + ?Sized,
    {
        let hello = read_server_hello(link).await?;
        debug!(
            target: "tonearm::handshake",
            username = %hello.username,
            denominator = hello.puzzle.denominator,
            len = hello.raw.len(),
            "server hello received"
        );
        self.session.server_hello = Some(hello);
        self.state = HandshakeState::HelloReceived;
        Ok(())
    }

    async fn solve_puzzle(&mut self) -> Result<(), HandshakeError> {
        let hello = self.server_hello()?;
        let server_random = hello.server_random;
        let challenge = hello.puzzle;
        let solver = Arc::clone(&self.config.puzzle_solver);
        let solution =
            tokio::task::spawn_blocking(move || solver.solve(&server_random, &challenge))
                .await
                .map_err(|err| HandshakeError::Solver(err.to_string()))??;
        self.session.puzzle_solution = Some(solution);
        self.state = HandshakeState::PuzzleSolved;
        debug!(target: "tonearm::handshake", "puzzle solved");
        Ok(())
    }

    fn derive_keys(&mut self) -> Result<(), HandshakeError> {
        let hello = self.server_hello()?;
        let shared = self.session.dh.shared_secret(&hello.dh_public)?;
        let auth_hash = auth_hash(&hello.salt, self.credentials.password.as_bytes());
        let keys = self.config.key_expansion.expand(&ExpansionInput {
            shared_secret: &shared[..],
            auth_hash: &auth_hash,
            client_random: &self.session.client_random,
            server_random: &hello.server_random,
        })?;
        self.session.keys = Some(keys);
        Ok(())
    }

    async fn send_auth<L>(&mut self, link: &mut L) -> Result<(), HandshakeError>
    where
        L: AsyncWrite + Unpin + ?Sized,
    {
        let (Some(keys), Some(solution), Some(hello)) = (
            self.session.keys.as_ref(),
            self.session.puzzle_solution.as_ref(),
            self.session.server_hello.as_ref(),
        ) else {
            return Err(HandshakeError::Malformed("auth attempted before key derivation".into()));
        };
        let auth_hmac = hmac_sha1(
            &keys.hmac_key,
            &[
                &self.session.initial_client_packet,
                &hello.raw,
                &auth_trailer(solution),
            ],
        )?;
        write_all(link, &encode_auth_packet(&auth_hmac, solution)).await?;
        self.state = HandshakeState::AuthSent;
        debug!(target: "tonearm::handshake", "auth packet sent");
        Ok(())
    }

    async fn receive_auth<L>(&mut self, link: &mut L) -> Result<AuthenticatedSession, HandshakeError>
    where
        L: AsyncRead + Unpin + ?Sized,
    {
        let payload = read_auth_response(link).await?;
        let hello = self
            .session
            .server_hello
            .take()
            .ok_or_else(|| HandshakeError::Malformed("server hello missing".into()))?;
        let keys = self
            .session
            .keys
            .take()
            .ok_or_else(|| HandshakeError::Malformed("session keys missing".into()))?;
        self.state = HandshakeState::Authenticated;
        debug!(target: "tonearm::handshake", username = %hello.username, len = payload.len(), "authenticated");
        Ok(AuthenticatedSession::new(
            hello.username,
            *self.session.rsa.modulus(),
            hello.blob,
            keys,
        ))
    }

    fn server_hello(&self) -> Result<&crate::messages::ServerHello, HandshakeError> {
        self.session
            .server_hello
            .as_ref()
            .ok_or_else(|| HandshakeError::Malformed("server hello missing".into()))
    }
}
