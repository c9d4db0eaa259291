//! Server side of the handshake. Only what a loopback test needs: it
//! accepts one client, checks the puzzle and the HMAC, and yields the
//! mirrored cipher contexts.

use std::sync::Arc;

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tonearm_core::{read_exact, write_all, RecvCipher, SendCipher};
use tracing::debug;

use crate::crypto::{
    auth_hash, hmac_sha1, DhKeyPair, ExpansionInput, HmacSha1Expansion, KeyExpansion,
    PuzzleChallenge, PuzzleSolver, SessionKeys, Sha1Puzzle, RSA_MODULUS_LEN,
};
use crate::error::{AuthFailure, HandshakeError};
use crate::messages::{
    auth_trailer, encode_auth_response, encode_rejection, read_auth_packet, ClientHello,
    ServerHello, SALT_LEN, SERVER_BLOB_LEN, SERVER_RANDOM_LEN,
};

/// Keys and client facts held by the server after a successful login.
#[derive(Debug)]
pub struct ServerSession {
    pub username: String,
    pub client_rsa_modulus: [u8; RSA_MODULUS_LEN],
    keys: SessionKeys,
}

impl ServerSession {
    /// Keys from the server's point of view: its send key is the client's
    /// receive key.
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn into_ciphers(self) -> (SendCipher, RecvCipher) {
        (
            SendCipher::new(&self.keys.send_key),
            RecvCipher::new(&self.keys.recv_key),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ServerHandshake {
    password: String,
    puzzle: PuzzleChallenge,
    key_expansion: Arc<dyn KeyExpansion>,
    puzzle_solver: Arc<dyn PuzzleSolver>,
}

impl ServerHandshake {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            puzzle: PuzzleChallenge {
                denominator: 4,
                magic: 0x5a5a_5a5a,
            },
            key_expansion: Arc::new(HmacSha1Expansion),
            puzzle_solver: Arc::new(Sha1Puzzle::default()),
        }
    }

    pub fn with_puzzle(mut self, puzzle: PuzzleChallenge) -> Self {
        self.puzzle = puzzle;
        self
    }

    pub fn with_key_expansion(mut self, expansion: Arc<dyn KeyExpansion>) -> Self {
        self.key_expansion = expansion;
        self
    }

    /// Run the server half of the handshake over `link`.
    pub async fn accept<L>(&self, link: &mut L) -> Result<ServerSession, HandshakeError>
    where
        L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let client_packet = read_client_hello(link).await?;
        let hello = ClientHello::decode(&client_packet)?;

        let dh = DhKeyPair::generate();
        let mut server_random = [0u8; SERVER_RANDOM_LEN];
        OsRng.fill_bytes(&mut server_random);
        server_random[0] = 0;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut blob = vec![0u8; SERVER_BLOB_LEN];
        OsRng.fill_bytes(&mut blob);

        let server_hello = ServerHello::build(
            server_random,
            *dh.public_bytes(),
            blob,
            salt,
            &hello.username,
            self.puzzle,
            &[0x2a; 4],
        )?;
        write_all(link, &server_hello.raw).await?;
        debug!(target: "tonearm::handshake", username = %hello.username, "peer sent server hello");

        let shared = dh.shared_secret(&hello.dh_public)?;
        let auth_hash = auth_hash(&salt, self.password.as_bytes());
        let client_keys = self.key_expansion.expand(&ExpansionInput {
            shared_secret: &shared[..],
            auth_hash: &auth_hash,
            client_random: &hello.client_random,
            server_random: &server_random,
        })?;

        let auth = read_auth_packet(link).await?;
        let expected = hmac_sha1(
            &client_keys.hmac_key,
            &[&client_packet, &server_hello.raw, &auth_trailer(&auth.solution)],
        )?;
        let puzzle_ok = self
            .puzzle_solver
            .verify(&server_random, &self.puzzle, &auth.solution);
        if expected[..].ct_eq(&auth.hmac[..]).unwrap_u8() == 0 || !puzzle_ok {
            write_all(link, &encode_auth_response(0x01, &[])).await?;
            return Err(HandshakeError::Authentication(AuthFailure::BadCredentials(
                0x01,
            )));
        }

        write_all(link, &encode_auth_response(0x00, &[0x00; 4])).await?;
        debug!(target: "tonearm::handshake", username = %hello.username, "peer accepted login");
        Ok(ServerSession {
            username: hello.username,
            client_rsa_modulus: hello.rsa_modulus,
            keys: client_keys.reversed(),
        })
    }
}

/// Read one client hello and return its raw bytes.
pub async fn read_client_hello<L>(link: &mut L) -> Result<Vec<u8>, HandshakeError>
where
    L: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 4];
    read_exact(link, &mut head).await?;
    let total = usize::from(u16::from_be_bytes([head[2], head[3]]));
    if total < head.len() {
        return Err(HandshakeError::Malformed(format!("hello length {total}")));
    }
    let mut packet = vec![0u8; total];
    packet[..4].copy_from_slice(&head);
    read_exact(link, &mut packet[4..]).await?;
    Ok(packet)
}

/// Read the client hello and answer with a status rejection.
pub async fn scripted_rejection<L>(link: &mut L, substatus: u8) -> Result<ClientHello, HandshakeError>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let packet = read_client_hello(link).await?;
    write_all(link, &encode_rejection(substatus, None)).await?;
    ClientHello::decode(&packet)
}

/// Read the client hello and answer with an upgrade-required notice.
pub async fn scripted_upgrade<L>(link: &mut L, message: &str) -> Result<ClientHello, HandshakeError>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let packet = read_client_hello(link).await?;
    write_all(link, &encode_rejection(0x01, Some(message))).await?;
    ClientHello::decode(&packet)
}
