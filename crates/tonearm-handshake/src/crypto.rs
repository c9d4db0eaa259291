use std::fmt;

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use rsa::{traits::PublicKeyParts, BigUint, RsaPrivateKey};
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, Zeroizing};

use crate::error::HandshakeError;

type HmacSha1 = Hmac<Sha1>;

pub const SHA1_LEN: usize = 20;
pub const DH_KEY_LEN: usize = 96;
pub const RSA_BITS: usize = 1024;
pub const RSA_MODULUS_LEN: usize = RSA_BITS / 8;
pub const PUZZLE_SOLUTION_LEN: usize = 8;
pub const SEND_KEY_LEN: usize = 32;
pub const RECV_KEY_LEN: usize = 32;

const DH_GENERATOR: u32 = 2;

/// 768-bit MODP group (RFC 2409 group 1).
const DH_PRIME_BYTES: [u8; DH_KEY_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x3a, 0x36, 0x20, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

static DH_PRIME: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&DH_PRIME_BYTES));

pub fn sha1(parts: &[&[u8]]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Result<[u8; SHA1_LEN], HandshakeError> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|err| HandshakeError::KeyGeneration(err.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// `SHA1(salt || ' ' || password)`.
pub fn auth_hash(salt: &[u8], password: &[u8]) -> [u8; SHA1_LEN] {
    sha1(&[salt, b" ", password])
}

fn left_pad<const N: usize>(value: &BigUint) -> [u8; N] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; N];
    let start = N.saturating_sub(bytes.len());
    let skip = bytes.len().saturating_sub(N);
    out[start..].copy_from_slice(&bytes[skip..]);
    out
}

/// Ephemeral Diffie-Hellman key pair over the fixed 768-bit group.
pub struct DhKeyPair {
    private: BigUint,
    public: [u8; DH_KEY_LEN],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; DH_KEY_LEN - 1]);
        OsRng.fill_bytes(&mut secret[..]);
        Self::from_private_bytes(&secret[..])
    }

    pub fn from_private_bytes(secret: &[u8]) -> Self {
        let private = BigUint::from_bytes_be(secret);
        let public = BigUint::from(DH_GENERATOR).modpow(&private, &DH_PRIME);
        Self {
            private,
            public: left_pad(&public),
        }
    }

    pub fn public_bytes(&self) -> &[u8; DH_KEY_LEN] {
        &self.public
    }

    /// Shared secret with the peer's public value, left-padded to the group
    /// size. Degenerate peer values are rejected.
    pub fn shared_secret(
        &self,
        peer_public: &[u8],
    ) -> Result<Zeroizing<[u8; DH_KEY_LEN]>, HandshakeError> {
        let peer = BigUint::from_bytes_be(peer_public);
        let one = BigUint::from(1u32);
        let upper = &*DH_PRIME - &one;
        if peer <= one || peer >= upper {
            return Err(HandshakeError::InvalidPeerKey);
        }
        let shared = peer.modpow(&self.private, &DH_PRIME);
        Ok(Zeroizing::new(left_pad(&shared)))
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair").finish_non_exhaustive()
    }
}

/// Client RSA key. Only the modulus travels on the wire; the server echoes
/// it back inside the secret block.
#[derive(Clone)]
pub struct RsaKeyPair {
    modulus: [u8; RSA_MODULUS_LEN],
    _private: RsaPrivateKey,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self, HandshakeError> {
        let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|err| HandshakeError::KeyGeneration(err.to_string()))?;
        Ok(Self {
            modulus: left_pad(private.n()),
            _private: private,
        })
    }

    pub fn modulus(&self) -> &[u8; RSA_MODULUS_LEN] {
        &self.modulus
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &RSA_BITS)
            .finish_non_exhaustive()
    }
}

/// Secrets produced by key expansion.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SessionKeys {
    pub hmac_key: [u8; SHA1_LEN],
    pub send_key: [u8; SEND_KEY_LEN],
    pub recv_key: [u8; RECV_KEY_LEN],
}

impl SessionKeys {
    /// Same keys seen from the server side.
    pub fn reversed(&self) -> Self {
        Self {
            hmac_key: self.hmac_key,
            send_key: self.recv_key,
            recv_key: self.send_key,
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Inputs to key expansion.
pub struct ExpansionInput<'a> {
    pub shared_secret: &'a [u8],
    pub auth_hash: &'a [u8; SHA1_LEN],
    pub client_random: &'a [u8],
    pub server_random: &'a [u8],
}

/// Turns the DH secret and handshake randoms into session keys. Both peers
/// must run the same schedule bit for bit.
pub trait KeyExpansion: Send + Sync + fmt::Debug {
    fn expand(&self, input: &ExpansionInput<'_>) -> Result<SessionKeys, HandshakeError>;
}

/// Five chained HMAC-SHA1 rounds keyed by the DH secret. Each round's output
/// replaces the head of the message for the next round.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha1Expansion;

impl KeyExpansion for HmacSha1Expansion {
    fn expand(&self, input: &ExpansionInput<'_>) -> Result<SessionKeys, HandshakeError> {
        let mut message = Zeroizing::new(Vec::with_capacity(
            SHA1_LEN + input.client_random.len() + input.server_random.len() + 1,
        ));
        message.extend_from_slice(input.auth_hash);
        message.extend_from_slice(input.client_random);
        message.extend_from_slice(input.server_random);
        message.push(0);

        let mut output = Zeroizing::new([0u8; 5 * SHA1_LEN]);
        let last = message.len() - 1;
        for round in 0..5u8 {
            message[last] = round + 1;
            let digest = hmac_sha1(input.shared_secret, &[message.as_slice()])?;
            let at = usize::from(round) * SHA1_LEN;
            output[at..at + SHA1_LEN].copy_from_slice(&digest);
            message[..SHA1_LEN].copy_from_slice(&digest);
        }

        let mut keys = SessionKeys {
            hmac_key: [0; SHA1_LEN],
            send_key: [0; SEND_KEY_LEN],
            recv_key: [0; RECV_KEY_LEN],
        };
        keys.hmac_key.copy_from_slice(&output[..SHA1_LEN]);
        keys.send_key
            .copy_from_slice(&output[SHA1_LEN..SHA1_LEN + SEND_KEY_LEN]);
        keys.recv_key.copy_from_slice(
            &output[SHA1_LEN + SEND_KEY_LEN..SHA1_LEN + SEND_KEY_LEN + RECV_KEY_LEN],
        );
        Ok(keys)
    }
}

/// Server-supplied proof-of-work parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PuzzleChallenge {
    pub denominator: u8,
    pub magic: u32,
}

impl PuzzleChallenge {
    pub fn mask(&self) -> u32 {
        if self.denominator >= 32 {
            u32::MAX
        } else {
            (1u32 << self.denominator) - 1
        }
    }
}

pub trait PuzzleSolver: Send + Sync + fmt::Debug {
    fn solve(
        &self,
        server_random: &[u8],
        challenge: &PuzzleChallenge,
    ) -> Result<[u8; PUZZLE_SOLUTION_LEN], HandshakeError>;

    fn verify(
        &self,
        server_random: &[u8],
        challenge: &PuzzleChallenge,
        solution: &[u8; PUZZLE_SOLUTION_LEN],
    ) -> bool;
}

/// Candidates tried before giving up on a challenge.
pub const MAX_PUZZLE_ATTEMPTS: u64 = 1 << 28;

/// Random search for a solution whose `SHA1(server_random || solution)`
/// tail word, xored with the magic, is zero in the low `denominator` bits.
#[derive(Debug, Clone, Copy)]
pub struct Sha1Puzzle {
    max_attempts: u64,
}

impl Sha1Puzzle {
    pub fn with_max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = attempts;
        self
    }
}

impl Default for Sha1Puzzle {
    fn default() -> Self {
        Self {
            max_attempts: MAX_PUZZLE_ATTEMPTS,
        }
    }
}

impl PuzzleSolver for Sha1Puzzle {
    fn solve(
        &self,
        server_random: &[u8],
        challenge: &PuzzleChallenge,
    ) -> Result<[u8; PUZZLE_SOLUTION_LEN], HandshakeError> {
        let mut candidate = [0u8; PUZZLE_SOLUTION_LEN];
        for _ in 0..self.max_attempts {
            OsRng.fill_bytes(&mut candidate);
            if self.verify(server_random, challenge, &candidate) {
                return Ok(candidate);
            }
        }
        Err(HandshakeError::Solver(format!(
            "no solution for denominator {} in {} attempts",
            challenge.denominator, self.max_attempts
        )))
    }

    fn verify(
        &self,
        server_random: &[u8],
        challenge: &PuzzleChallenge,
        solution: &[u8; PUZZLE_SOLUTION_LEN],
    ) -> bool {
        let digest = sha1(&[server_random, solution]);
        let tail = u32::from_be_bytes([digest[16], digest[17], digest[18], digest[19]]);
        (tail ^ challenge.magic) & challenge.mask() == 0
    }
}
