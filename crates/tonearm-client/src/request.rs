//! Payload builders for the channel request commands.
//!
//! Every builder takes the channel id it embeds; argument checks happen
//! here, before a channel is opened or anything is sent.

use bytes::{BufMut, Bytes, BytesMut};
use rand::{rngs::OsRng, RngCore};

use crate::error::ClientError;
use crate::substream::CHUNK_SIZE;

/// Acknowledgement for the secret block. The first byte is randomized per
/// session.
pub const CACHE_HASH: [u8; 20] = [
    0xf4, 0xc2, 0xaa, 0x05, 0xe8, 0x25, 0xa7, 0xb5, 0xe4, 0xe6, 0x59, 0x0f, 0x3d, 0xd0, 0xbe, 0x0a,
    0xef, 0x20, 0x51, 0x95,
];

pub const FILE_ID_LEN: usize = 20;
pub const TRACK_ID_LEN: usize = 16;
pub const IMAGE_ID_LEN: usize = 20;
pub const ENTITY_ID_LEN: usize = 16;

pub type FileId = [u8; FILE_ID_LEN];
pub type TrackId = [u8; TRACK_ID_LEN];
pub type ImageId = [u8; IMAGE_ID_LEN];
pub type EntityId = [u8; ENTITY_ID_LEN];

/// Decode a hex identifier of exactly `N` bytes.
pub fn parse_id<const N: usize>(hex_id: &str) -> Result<[u8; N], ClientError> {
    let mut id = [0u8; N];
    hex::decode_to_slice(hex_id, &mut id).map_err(|err| {
        ClientError::InvalidArgument(format!("id {hex_id:?} is not {N} hex-encoded bytes: {err}"))
    })?;
    Ok(id)
}

pub fn cache_hash() -> [u8; 20] {
    let mut hash = CACHE_HASH;
    let mut first = [0u8; 1];
    OsRng.fill_bytes(&mut first);
    hash[0] = first[0];
    hash
}

pub fn pong() -> [u8; 4] {
    [0; 4]
}

pub fn channel_abort(channel: u16) -> [u8; 2] {
    channel.to_be_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdKind {
    Audio = 0,
    Banner = 1,
    FullscreenBanner = 2,
}

pub fn ad_request(channel: u16, kind: AdKind) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u16(channel);
    buf.put_u8(kind as u8);
    buf.freeze()
}

/// Toplist query. `params` must contain a `type` entry.
pub fn toplist_request(channel: u16, params: &[(&str, &str)]) -> Result<Bytes, ClientError> {
    if !params.iter().any(|(key, _)| *key == "type") {
        return Err(ClientError::InvalidArgument(
            "toplist request needs a `type` parameter".into(),
        ));
    }
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16(channel);
    buf.put_u32(0);
    for (key, value) in params {
        let key_len = u8::try_from(key.len()).map_err(|_| {
            ClientError::InvalidArgument(format!("toplist parameter name {key:?} too long"))
        })?;
        let value_len = u16::try_from(value.len()).map_err(|_| {
            ClientError::InvalidArgument(format!("toplist parameter {key:?} value too long"))
        })?;
        buf.put_u8(key_len);
        buf.put_u16(value_len);
        buf.put_slice(key.as_bytes());
        buf.put_slice(value.as_bytes());
    }
    Ok(buf.freeze())
}

pub fn image_request(channel: u16, image: &ImageId) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + IMAGE_ID_LEN);
    buf.put_u16(channel);
    buf.put_u16(0);
    buf.put_slice(image);
    buf.freeze()
}

/// Search query. `limit` is -1 for no limit, otherwise positive.
pub fn search_request(
    channel: u16,
    query: &str,
    offset: i32,
    limit: i32,
) -> Result<Bytes, ClientError> {
    if offset < 0 {
        return Err(ClientError::InvalidArgument(format!(
            "search offset {offset} is negative"
        )));
    }
    if limit == 0 || limit < -1 {
        return Err(ClientError::InvalidArgument(format!(
            "search limit {limit} must be -1 or positive"
        )));
    }
    let query_len = u8::try_from(query.len()).map_err(|_| {
        ClientError::InvalidArgument(format!("search query of {} bytes is too long", query.len()))
    })?;
    let mut buf = BytesMut::with_capacity(31 + query.len());
    buf.put_u16(channel);
    buf.put_u16(0);
    buf.put_i32(offset);
    buf.put_i32(limit);
    buf.put_u32(0);
    buf.put_u32(0xffff_ffff);
    buf.put_u32(0);
    buf.put_u32(0xffff_ffff);
    buf.put_u16(0);
    buf.put_u8(query_len);
    buf.put_slice(query.as_bytes());
    Ok(buf.freeze())
}

pub fn aes_key_request(channel: u16, file: &FileId, track: &TrackId) -> Bytes {
    let mut buf = BytesMut::with_capacity(FILE_ID_LEN + TRACK_ID_LEN + 6);
    buf.put_slice(file);
    buf.put_slice(track);
    buf.put_u16(0);
    buf.put_u16(channel);
    buf.put_u16(0);
    buf.freeze()
}

/// Byte range request. Offset and length travel as 32-bit word counts and
/// must both be multiples of the chunk size.
pub fn substream_request(
    channel: u16,
    file: &FileId,
    offset: u64,
    length: u64,
) -> Result<Bytes, ClientError> {
    let chunk = CHUNK_SIZE as u64;
    if offset % chunk != 0 || length % chunk != 0 || length == 0 {
        return Err(ClientError::InvalidRange { offset, length });
    }
    let end = offset
        .checked_add(length)
        .map(|end| end >> 2)
        .and_then(|end| u32::try_from(end).ok())
        .ok_or(ClientError::InvalidRange { offset, length })?;
    let start = u32::try_from(offset >> 2).map_err(|_| ClientError::InvalidRange { offset, length })?;

    let mut buf = BytesMut::with_capacity(2 + 12 + 4 + FILE_ID_LEN + 8);
    buf.put_u16(channel);
    buf.put_u16(0x0800);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0x4e20);
    buf.put_u32(200_000);
    buf.put_slice(file);
    buf.put_u32(start);
    buf.put_u32(end);
    Ok(buf.freeze())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseKind {
    Artist = 1,
    Album = 2,
    Tracks = 3,
}

/// Metadata request. Artist and album browses take exactly one id.
pub fn browse_request(
    channel: u16,
    kind: BrowseKind,
    ids: &[EntityId],
) -> Result<Bytes, ClientError> {
    let single = matches!(kind, BrowseKind::Artist | BrowseKind::Album);
    if ids.is_empty() || (single && ids.len() != 1) {
        return Err(ClientError::InvalidArgument(format!(
            "{kind:?} browse takes {} id(s), got {}",
            if single { "exactly one" } else { "one or more" },
            ids.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(5 + ids.len() * ENTITY_ID_LEN + 4);
    buf.put_u16(channel);
    buf.put_u16(0);
    buf.put_u8(kind as u8);
    for id in ids {
        buf.put_slice(id);
    }
    if single {
        buf.put_u32(0);
    }
    Ok(buf.freeze())
}

const PLAYLIST_MARKER: u8 = 0x02;
const CONTAINER_MARKER: u8 = 0x00;

fn put_playlist_target(buf: &mut BytesMut, playlist: Option<&EntityId>) {
    match playlist {
        Some(id) => {
            buf.put_slice(id);
            buf.put_u8(PLAYLIST_MARKER);
        }
        None => {
            buf.put_slice(&[0u8; ENTITY_ID_LEN]);
            buf.put_u8(CONTAINER_MARKER);
        }
    }
}

/// Fetch a playlist, or the user's playlist container when `playlist` is
/// `None`.
pub fn playlist_request(channel: u16, playlist: Option<&EntityId>) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + ENTITY_ID_LEN + 1 + 13);
    buf.put_u16(channel);
    put_playlist_target(&mut buf, playlist);
    buf.put_i32(-1);
    buf.put_i32(0);
    buf.put_i32(1);
    buf.put_u8(0);
    buf.freeze()
}

/// An edit to a playlist (or to the container when `playlist` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistChange<'a> {
    pub playlist: Option<EntityId>,
    pub revision: u32,
    pub entries: u32,
    pub checksum: u32,
    pub collaborative: bool,
    pub xml: &'a str,
}

pub fn change_playlist_request(channel: u16, change: &PlaylistChange<'_>) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + ENTITY_ID_LEN + 15 + change.xml.len());
    buf.put_u16(channel);
    put_playlist_target(&mut buf, change.playlist.as_ref());
    buf.put_u32(change.revision);
    buf.put_u32(change.entries);
    buf.put_u32(change.checksum);
    buf.put_u8(u8::from(change.collaborative));
    buf.put_u8(0x03);
    buf.put_slice(change.xml.as_bytes());
    buf.freeze()
}

/// Create a playlist: a change with zero revision and entries and an
/// all-ones checksum.
pub fn create_playlist_request(
    channel: u16,
    playlist: &EntityId,
    collaborative: bool,
    xml: &str,
) -> Bytes {
    change_playlist_request(
        channel,
        &PlaylistChange {
            playlist: Some(*playlist),
            revision: 0,
            entries: 0,
            checksum: 0xffff_ffff,
            collaborative,
            xml,
        },
    )
}
