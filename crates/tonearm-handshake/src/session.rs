use std::fmt;

use tonearm_core::{RecvCipher, SendCipher};

use crate::crypto::{
    DhKeyPair, PuzzleChallenge, RsaKeyPair, SessionKeys, PUZZLE_SOLUTION_LEN, RSA_MODULUS_LEN,
};
use crate::messages::{ServerHello, CLIENT_RANDOM_LEN};

/// Everything one login attempt accumulates. Created per attempt and never
/// reused across connections.
pub(crate) struct Session {
    pub client_random: [u8; CLIENT_RANDOM_LEN],
    pub dh: DhKeyPair,
    pub rsa: RsaKeyPair,
    pub initial_client_packet: Vec<u8>,
    pub server_hello: Option<ServerHello>,
    pub puzzle_solution: Option<[u8; PUZZLE_SOLUTION_LEN]>,
    pub keys: Option<SessionKeys>,
}

impl Session {
    pub fn new(client_random: [u8; CLIENT_RANDOM_LEN], dh: DhKeyPair, rsa: RsaKeyPair) -> Self {
        Self {
            client_random,
            dh,
            rsa,
            initial_client_packet: Vec::new(),
            server_hello: None,
            puzzle_solution: None,
            keys: None,
        }
    }

    pub fn puzzle(&self) -> Option<PuzzleChallenge> {
        self.server_hello.as_ref().map(|hello| hello.puzzle)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("hello_sent", &!self.initial_client_packet.is_empty())
            .field("puzzle", &self.puzzle())
            .field("keys_derived", &self.keys.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of a completed handshake: the two cipher contexts plus the facts
/// later stages need.
pub struct AuthenticatedSession {
    username: String,
    rsa_modulus: [u8; RSA_MODULUS_LEN],
    server_blob: Vec<u8>,
    keys: SessionKeys,
}

impl AuthenticatedSession {
    pub(crate) fn new(
        username: String,
        rsa_modulus: [u8; RSA_MODULUS_LEN],
        server_blob: Vec<u8>,
        keys: SessionKeys,
    ) -> Self {
        Self {
            username,
            rsa_modulus,
            server_blob,
            keys,
        }
    }

    /// Canonical username as echoed by the server.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Client RSA modulus; the server echoes it in the secret block.
    pub fn rsa_modulus(&self) -> &[u8; RSA_MODULUS_LEN] {
        &self.rsa_modulus
    }

    /// The signed blob from the server hello, exactly as received. The
    /// signature is not checked during login; callers that hold the
    /// server's verification key must validate it themselves.
    pub fn server_blob(&self) -> &[u8] {
        &self.server_blob
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Build the independent send and receive cipher contexts.
    pub fn into_ciphers(self) -> (SendCipher, RecvCipher) {
        (
            SendCipher::new(&self.keys.send_key),
            RecvCipher::new(&self.keys.recv_key),
        )
    }
}

impl fmt::Debug for AuthenticatedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedSession")
            .field("username", &self.username)
            .field("server_blob_len", &self.server_blob.len())
            .finish_non_exhaustive()
    }
}
