//! Cleartext handshake messages: client hello, server hello, the
//! authentication packet and its response.

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncRead;
use tonearm_core::{read_exact, WireReader};

use crate::crypto::{PuzzleChallenge, DH_KEY_LEN, PUZZLE_SOLUTION_LEN, RSA_MODULUS_LEN, SHA1_LEN};
use crate::error::{AuthFailure, HandshakeError};

pub const PROTOCOL_VERSION: u16 = 3;
pub const CLIENT_RANDOM_LEN: usize = 16;
pub const SERVER_RANDOM_LEN: usize = 16;
pub const SERVER_BLOB_LEN: usize = 256;
pub const SALT_LEN: usize = 10;

const PROTOCOL_MINOR: u8 = 0x5f;
const PUZZLE_SHA1: u8 = 0x01;
const SUBSTATUS_UPGRADE: u8 = 0x01;
const UPGRADE_BLOCK_LEN: usize = 0x11a;
const CLIENT_HELLO_FIXED_LEN: usize =
    2 + 2 + 4 * 7 + CLIENT_RANDOM_LEN + DH_KEY_LEN + RSA_MODULUS_LEN + 1 + 1 + 2 + 1;

/// Platform and build numbers announced in the client hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity {
    pub os: u32,
    pub revision: u32,
    pub client_id: u32,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            os: 0x0000_0000,
            revision: 0xffff_ffff,
            client_id: 0x0104_0101,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub identity: ClientIdentity,
    pub client_random: [u8; CLIENT_RANDOM_LEN],
    pub dh_public: [u8; DH_KEY_LEN],
    pub rsa_modulus: [u8; RSA_MODULUS_LEN],
    pub username: String,
}

impl ClientHello {
    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        let username = self.username.as_bytes();
        let username_len = u8::try_from(username.len())
            .map_err(|_| HandshakeError::Malformed("username longer than 255 bytes".into()))?;
        let total = CLIENT_HELLO_FIXED_LEN + username.len();

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(total as u16);
        buf.put_u32(self.identity.os);
        buf.put_u32(0);
        buf.put_u32(self.identity.revision);
        buf.put_u32(0x1541_ecd0);
        buf.put_u32(0x0100_0000);
        buf.put_u32(self.identity.client_id);
        buf.put_u32(1);
        buf.put_slice(&self.client_random);
        buf.put_slice(&self.dh_public);
        buf.put_slice(&self.rsa_modulus);
        buf.put_u8(0);
        buf.put_u8(username_len);
        buf.put_u16(0x0100);
        buf.put_slice(username);
        buf.put_u8(PROTOCOL_MINOR);
        Ok(buf.to_vec())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HandshakeError> {
        let mut reader = WireReader::new(buf);
        let version = reader.u16()?;
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::Malformed(format!(
                "unsupported hello version {version}"
            )));
        }
        let declared = usize::from(reader.u16()?);
        if declared != buf.len() {
            return Err(HandshakeError::Malformed(format!(
                "hello length {declared} does not match {} received",
                buf.len()
            )));
        }
        let os = reader.u32()?;
        reader.skip(4)?;
        let revision = reader.u32()?;
        reader.skip(8)?;
        let client_id = reader.u32()?;
        reader.skip(4)?;
        let client_random = reader.array()?;
        let dh_public = reader.array()?;
        let rsa_modulus = reader.array()?;
        let random_len = usize::from(reader.u8()?);
        let username_len = usize::from(reader.u8()?);
        reader.skip(2)?;
        reader.skip(random_len)?;
        let username = String::from_utf8(reader.bytes(username_len)?.to_vec())
            .map_err(|_| HandshakeError::Malformed("username is not UTF-8".into()))?;
        Ok(Self {
            identity: ClientIdentity {
                os,
                revision,
                client_id,
            },
            client_random,
            dh_public,
            rsa_modulus,
            username,
        })
    }
}

/// Successful server hello. `raw` holds every byte received, which feeds
/// the authentication HMAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_random: [u8; SERVER_RANDOM_LEN],
    pub dh_public: [u8; DH_KEY_LEN],
    pub blob: Vec<u8>,
    pub salt: [u8; SALT_LEN],
    pub username: String,
    pub puzzle: PuzzleChallenge,
    pub raw: Vec<u8>,
}

impl ServerHello {
    /// Build a hello the way a server lays it out. `server_random[0]` must
    /// be zero, since a non-zero first byte signals a status.
    pub fn build(
        server_random: [u8; SERVER_RANDOM_LEN],
        dh_public: [u8; DH_KEY_LEN],
        blob: Vec<u8>,
        salt: [u8; SALT_LEN],
        username: &str,
        puzzle: PuzzleChallenge,
        padding: &[u8],
    ) -> Result<Self, HandshakeError> {
        if server_random[0] != 0 {
            return Err(HandshakeError::Malformed(
                "server random must start with a zero byte".into(),
            ));
        }
        if blob.len() != SERVER_BLOB_LEN {
            return Err(HandshakeError::Malformed("server blob must be 256 bytes".into()));
        }
        let padding_len = u8::try_from(padding.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or(HandshakeError::InvalidPadding)?;
        let username_len = u8::try_from(username.len())
            .map_err(|_| HandshakeError::Malformed("username longer than 255 bytes".into()))?;

        let mut challenge = BytesMut::with_capacity(6);
        challenge.put_u8(PUZZLE_SHA1);
        challenge.put_u8(puzzle.denominator);
        challenge.put_u32(puzzle.magic);

        let mut raw = BytesMut::new();
        raw.put_slice(&server_random);
        raw.put_slice(&dh_public);
        raw.put_slice(&blob);
        raw.put_slice(&salt);
        raw.put_u8(padding_len);
        raw.put_u8(username_len);
        raw.put_u16(challenge.len() as u16);
        raw.put_u16(0);
        raw.put_u16(0);
        raw.put_u16(0);
        raw.put_slice(padding);
        raw.put_slice(username.as_bytes());
        raw.put_slice(&challenge);

        Ok(Self {
            server_random,
            dh_public,
            blob,
            salt,
            username: username.to_string(),
            puzzle,
            raw: raw.to_vec(),
        })
    }
}

/// Read a server hello from the link. A status reply is turned into
/// [`HandshakeError::Authentication`].
pub async fn read_server_hello<R>(reader: &mut R) -> Result<ServerHello, HandshakeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    read_exact(reader, &mut head).await?;
    if head[0] != 0 {
        let failure = if head[1] == SUBSTATUS_UPGRADE {
            read_upgrade_notice(reader).await?
        } else {
            AuthFailure::from_substatus(head[1])
        };
        return Err(HandshakeError::Authentication(failure));
    }

    let mut server_random = [0u8; SERVER_RANDOM_LEN];
    server_random[..2].copy_from_slice(&head);
    read_exact(reader, &mut server_random[2..]).await?;
    let mut raw = server_random.to_vec();

    let mut dh_public = [0u8; DH_KEY_LEN];
    read_exact(reader, &mut dh_public).await?;
    raw.extend_from_slice(&dh_public);

    let mut blob = vec![0u8; SERVER_BLOB_LEN];
    read_exact(reader, &mut blob).await?;
    raw.extend_from_slice(&blob);

    let mut salt = [0u8; SALT_LEN];
    read_exact(reader, &mut salt).await?;
    raw.extend_from_slice(&salt);

    let mut lengths = [0u8; 10];
    read_exact(reader, &mut lengths).await?;
    raw.extend_from_slice(&lengths);
    let mut fields = WireReader::new(&lengths);
    let padding_len = usize::from(fields.u8()?);
    let username_len = usize::from(fields.u8()?);
    let puzzle_len = usize::from(fields.u16()?);
    let unknown_len = usize::from(fields.u16()?)
        + usize::from(fields.u16()?)
        + usize::from(fields.u16()?);
    if padding_len == 0 {
        return Err(HandshakeError::InvalidPadding);
    }

    let mut tail = vec![0u8; padding_len + username_len + puzzle_len + unknown_len];
    read_exact(reader, &mut tail).await?;
    raw.extend_from_slice(&tail);

    let mut rest = WireReader::new(&tail);
    rest.skip(padding_len)?;
    let username = String::from_utf8_lossy(rest.bytes(username_len)?).into_owned();
    let mut challenge = WireReader::new(rest.bytes(puzzle_len)?);
    let puzzle_type = challenge.u8()?;
    if puzzle_type != PUZZLE_SHA1 {
        return Err(HandshakeError::UnexpectedPuzzle(puzzle_type));
    }
    let puzzle = PuzzleChallenge {
        denominator: challenge.u8()?,
        magic: challenge.u32()?,
    };

    Ok(ServerHello {
        server_random,
        dh_public,
        blob,
        salt,
        username,
        puzzle,
        raw,
    })
}

async fn read_upgrade_notice<R>(reader: &mut R) -> Result<AuthFailure, HandshakeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut block = vec![0u8; UPGRADE_BLOCK_LEN];
    read_exact(reader, &mut block).await?;
    let mut message = vec![0u8; usize::from(block[UPGRADE_BLOCK_LEN - 1])];
    read_exact(reader, &mut message).await?;
    let message = String::from_utf8_lossy(&message).into_owned();
    Ok(AuthFailure::UpgradeRequired {
        suggested_revision: suggested_revision(&message),
        message,
    })
}

/// Status reply a server sends instead of a hello.
pub fn encode_rejection(substatus: u8, upgrade_message: Option<&str>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(0x01);
    buf.put_u8(substatus);
    if let Some(message) = upgrade_message {
        let message = &message.as_bytes()[..message.len().min(255)];
        let mut block = vec![0u8; UPGRADE_BLOCK_LEN];
        block[UPGRADE_BLOCK_LEN - 1] = message.len() as u8;
        buf.put_slice(&block);
        buf.put_slice(message);
    }
    buf.to_vec()
}

/// Extract a client revision from a `a.b.c.d.hash` version string as
/// `b * 10_000_000 + c * 100_000 + d`.
pub fn suggested_revision(message: &str) -> Option<u32> {
    let bytes = message.as_bytes();
    (0..bytes.len()).find_map(|start| match_version(&bytes[start..]))
}

fn match_version(text: &[u8]) -> Option<u32> {
    let mut groups = [0u32; 4];
    let mut pos = 0;
    for group in groups.iter_mut() {
        let digits = text[pos..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        *group = std::str::from_utf8(&text[pos..pos + digits]).ok()?.parse().ok()?;
        pos += digits;
        if text.get(pos) != Some(&b'.') {
            return None;
        }
        pos += 1;
    }
    if !text
        .get(pos)
        .is_some_and(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
    {
        return None;
    }
    groups[1]
        .checked_mul(10_000_000)?
        .checked_add(groups[2].checked_mul(100_000)?)?
        .checked_add(groups[3])
}

/// Bytes following the HMAC in the authentication packet. They are also
/// the final part of the HMAC input.
pub fn auth_trailer(solution: &[u8; PUZZLE_SOLUTION_LEN]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + PUZZLE_SOLUTION_LEN);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u16(PUZZLE_SOLUTION_LEN as u16);
    buf.put_u32(0);
    buf.put_slice(solution);
    buf.to_vec()
}

pub fn encode_auth_packet(
    auth_hmac: &[u8; SHA1_LEN],
    solution: &[u8; PUZZLE_SOLUTION_LEN],
) -> Vec<u8> {
    let mut packet = auth_hmac.to_vec();
    packet.extend_from_slice(&auth_trailer(solution));
    packet
}

/// Authentication packet as received by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    pub hmac: [u8; SHA1_LEN],
    pub solution: [u8; PUZZLE_SOLUTION_LEN],
}

pub async fn read_auth_packet<R>(reader: &mut R) -> Result<AuthPacket, HandshakeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; SHA1_LEN + 8];
    read_exact(reader, &mut head).await?;
    let mut fields = WireReader::new(&head);
    let hmac = fields.array()?;
    let random_len = usize::from(fields.u8()?);
    fields.skip(1)?;
    let solution_len = usize::from(fields.u16()?);
    if solution_len != PUZZLE_SOLUTION_LEN {
        return Err(HandshakeError::Malformed(format!(
            "puzzle solution of {solution_len} bytes"
        )));
    }
    let mut tail = vec![0u8; random_len + solution_len];
    read_exact(reader, &mut tail).await?;
    let mut solution = [0u8; PUZZLE_SOLUTION_LEN];
    solution.copy_from_slice(&tail[random_len..]);
    Ok(AuthPacket { hmac, solution })
}

/// Read the server's verdict on the authentication packet.
pub async fn read_auth_response<R>(reader: &mut R) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    read_exact(reader, &mut head).await?;
    if head[0] != 0 {
        return Err(HandshakeError::Authentication(AuthFailure::BadCredentials(
            head[0],
        )));
    }
    if head[1] == 0 {
        return Err(HandshakeError::InvalidAuthResponse);
    }
    let mut payload = vec![0u8; usize::from(head[1])];
    read_exact(reader, &mut payload).await?;
    Ok(payload)
}

pub fn encode_auth_response(status: u8, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(255)];
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u8(status);
    buf.put_u8(payload.len() as u8);
    buf.put_slice(payload);
    buf.to_vec()
}
