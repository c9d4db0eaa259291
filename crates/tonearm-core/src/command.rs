use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown command byte 0x{0:02x}")]
pub struct CommandError(pub u8);

macro_rules! commands {
    ($($variant:ident = $value:literal => $name:literal,)+) => {
        /// Command identifiers carried in the first byte of every frame.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Command {
            $($variant = $value,)+
        }

        impl Command {
            pub const fn as_u8(self) -> u8 {
                self as u8
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Command::$variant => $name,)+
                }
            }
        }

        impl TryFrom<u8> for Command {
            type Error = CommandError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Command::$variant),)+
                    other => Err(CommandError(other)),
                }
            }
        }
    };
}

commands! {
    SecretBlock = 0x02 => "secret-block",
    Ping = 0x04 => "ping",
    GetSubstream = 0x08 => "get-substream",
    ChannelData = 0x09 => "channel-data",
    ChannelError = 0x0a => "channel-error",
    ChannelAbort = 0x0b => "channel-abort",
    RequestKey = 0x0c => "request-key",
    AesKey = 0x0d => "aes-key",
    AesKeyError = 0x0e => "aes-key-error",
    CacheHash = 0x0f => "cache-hash",
    ShaHash = 0x10 => "sha-hash",
    Image = 0x19 => "image",
    CountryCode = 0x1b => "country-code",
    P2pSetup = 0x20 => "p2p-setup",
    P2pInitBlock = 0x21 => "p2p-initblk",
    Browse = 0x30 => "browse",
    SearchOld = 0x31 => "search-old",
    PlaylistChanged = 0x34 => "playlist-changed",
    GetPlaylist = 0x35 => "get-playlist",
    ChangePlaylist = 0x36 => "change-playlist",
    GetToplist = 0x38 => "get-toplist",
    Search = 0x39 => "search",
    Notify = 0x42 => "notify",
    Log = 0x48 => "log",
    Pong = 0x49 => "pong",
    PongAck = 0x4a => "pong-ack",
    Pause = 0x4b => "pause",
    RequestAd = 0x4e => "request-ad",
    RequestPlay = 0x4f => "request-play",
    ProductInfo = 0x50 => "prod-info",
    Welcome = 0x69 => "welcome",
}

impl From<Command> for u8 {
    fn from(command: Command) -> Self {
        command.as_u8()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_bytes_map_to_commands() {
        assert_eq!(Command::try_from(0x39), Ok(Command::Search));
        assert_eq!(Command::try_from(0x0d), Ok(Command::AesKey));
        assert_eq!(u8::from(Command::Welcome), 0x69);
    }

    #[test]
    fn unknown_byte_is_an_error() {
        assert_eq!(Command::try_from(0xff), Err(CommandError(0xff)));
    }

    #[test]
    fn display_includes_name_and_value() {
        assert_eq!(Command::GetSubstream.to_string(), "get-substream(0x08)");
    }
}
