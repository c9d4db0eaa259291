//! Login handshake for the tonearm protocol client.
//!
//! Diffie-Hellman key agreement, the SHA-1 puzzle, HMAC key expansion and
//! the authentication exchange. The result is a pair of Shannon cipher
//! contexts for the framed connection.

mod crypto;
mod error;
mod handshake;
mod messages;
pub mod peer;
mod session;

pub use crypto::{
    auth_hash, hmac_sha1, sha1, DhKeyPair, ExpansionInput, HmacSha1Expansion, KeyExpansion,
    PuzzleChallenge, PuzzleSolver, RsaKeyPair, SessionKeys, Sha1Puzzle, DH_KEY_LEN,
    MAX_PUZZLE_ATTEMPTS, PUZZLE_SOLUTION_LEN, RSA_MODULUS_LEN, SHA1_LEN,
};
pub use error::{AuthFailure, HandshakeError};
pub use handshake::{ClientHandshake, Credentials, HandshakeConfig, HandshakeState};
pub use messages::{
    suggested_revision, ClientHello, ClientIdentity, ServerHello, CLIENT_RANDOM_LEN, SALT_LEN,
    SERVER_BLOB_LEN, SERVER_RANDOM_LEN,
};
pub use session::AuthenticatedSession;
