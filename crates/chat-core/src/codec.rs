//! Binary wire protocol.
//!
//! Every frame is `[u32 length][u8 type][payload]`, big-endian throughout.
//! `length` counts the type byte and the payload but not itself. Text fields
//! are UTF-16BE, so byte lengths are always even and the last text field of a
//! frame is recovered from whatever bytes the length leaves over.
//!
//! ```text
//! Chat            i64 timestamp | u32 name bytes | name | text
//! ClientExchange  [u8; 4] ipv4  | u16 port       | name
//! Disconnect      -
//! Handshake       PROTOCOL_ID   | u16 listen port | name
//! KeepAlive       -
//! ```

use std::io;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CodecError;

/// Identifier every handshake starts with.
pub const PROTOCOL_ID: &str = "Super Chat Master";

/// Largest frame body a reader buffers unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1 << 20;

/// Bytes of the outer length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

const CHAT_FIXED_LEN: u32 = 1 + 8 + 4;
const CLIENT_EXCHANGE_FIXED_LEN: u32 = 1 + 4 + 2;
const HANDSHAKE_FIXED_LEN: u32 = 1 + 2;

/// One-byte type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Chat = 0,
    ClientExchange = 1,
    Disconnect = 2,
    Handshake = 3,
    KeepAlive = 4,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Chat => "Chat",
            MessageKind::ClientExchange => "Client Exchange",
            MessageKind::Disconnect => "Disconnect",
            MessageKind::Handshake => "Handshake",
            MessageKind::KeepAlive => "Keep-Alive",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::Chat),
            1 => Ok(MessageKind::ClientExchange),
            2 => Ok(MessageKind::Disconnect),
            3 => Ok(MessageKind::Handshake),
            4 => Ok(MessageKind::KeepAlive),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Chat {
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
        username: String,
        text: String,
    },
    ClientExchange {
        address: Ipv4Addr,
        port: u16,
        username: String,
    },
    Disconnect,
    Handshake {
        username: String,
        listen_port: u16,
    },
    KeepAlive,
}

impl Message {
    /// A chat message stamped with the current wall-clock time.
    pub fn chat(username: impl Into<String>, text: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Message::Chat {
            timestamp,
            username: username.into(),
            text: text.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Chat { .. } => MessageKind::Chat,
            Message::ClientExchange { .. } => MessageKind::ClientExchange,
            Message::Disconnect => MessageKind::Disconnect,
            Message::Handshake { .. } => MessageKind::Handshake,
            Message::KeepAlive => MessageKind::KeepAlive,
        }
    }

    /// Value of the length prefix: type byte plus payload.
    pub fn length(&self) -> u32 {
        match self {
            Message::Chat { username, text, .. } => CHAT_FIXED_LEN
                .saturating_add(utf16_len(username))
                .saturating_add(utf16_len(text)),
            Message::ClientExchange { username, .. } => {
                CLIENT_EXCHANGE_FIXED_LEN.saturating_add(utf16_len(username))
            }
            Message::Handshake { username, .. } => HANDSHAKE_FIXED_LEN
                .saturating_add(utf16_len(PROTOCOL_ID))
                .saturating_add(utf16_len(username)),
            Message::Disconnect | Message::KeepAlive => 1,
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}){}", self.length(), self.kind().name())?;
        match self {
            Message::Chat { username, text, .. } => write!(f, " {}: {}", username, text),
            Message::ClientExchange {
                address,
                port,
                username,
            } => write!(f, " {}@{}:{}", username, address, port),
            Message::Handshake {
                username,
                listen_port,
            } => write!(f, " {}:{}", username, listen_port),
            Message::Disconnect | Message::KeepAlive => Ok(()),
        }
    }
}

fn utf16_len(s: &str) -> u32 {
    u32::try_from(s.encode_utf16().count() * 2).unwrap_or(u32::MAX)
}

fn put_utf16(buf: &mut BytesMut, s: &str) {
    for unit in s.encode_utf16() {
        buf.put_u16(unit);
    }
}

fn utf16_string(bytes: &[u8], field: &'static str) -> Result<String, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddStringLength(field));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| CodecError::InvalidUtf16(field))
}

fn ensure(body: &[u8], needed: usize, field: &'static str) -> Result<(), CodecError> {
    if body.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            available: body.remaining(),
        });
    }
    Ok(())
}

/// Serializes a message into one complete frame.
pub fn encode(message: &Message) -> Bytes {
    let length = message.length();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + length as usize);
    buf.put_u32(length);
    buf.put_u8(message.kind() as u8);

    match message {
        Message::Chat {
            timestamp,
            username,
            text,
        } => {
            buf.put_i64(*timestamp);
            buf.put_u32(utf16_len(username));
            put_utf16(&mut buf, username);
            put_utf16(&mut buf, text);
        }
        Message::ClientExchange {
            address,
            port,
            username,
        } => {
            buf.put_slice(&address.octets());
            buf.put_u16(*port);
            put_utf16(&mut buf, username);
        }
        Message::Handshake {
            username,
            listen_port,
        } => {
            put_utf16(&mut buf, PROTOCOL_ID);
            buf.put_u16(*listen_port);
            put_utf16(&mut buf, username);
        }
        Message::Disconnect | Message::KeepAlive => {}
    }

    debug_assert_eq!(buf.len(), LENGTH_PREFIX_LEN + length as usize);
    buf.freeze()
}

/// Decodes one complete frame, length prefix included.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    let mut cursor = frame;
    ensure(cursor, LENGTH_PREFIX_LEN, "length prefix")?;
    let length = cursor.get_u32() as usize;
    if length == 0 {
        return Err(CodecError::ZeroLength);
    }
    ensure(cursor, length, "frame")?;
    decode_body(&cursor[..length])
}

/// Decodes a frame body: the type byte followed by the payload. The body is
/// exactly `length` bytes long, so every error here leaves the stream
/// aligned on the next frame.
pub fn decode_body(mut body: &[u8]) -> Result<Message, CodecError> {
    ensure(body, 1, "type")?;
    let kind = MessageKind::try_from(body.get_u8())?;

    match kind {
        MessageKind::Chat => {
            ensure(body, 12, "chat header")?;
            let timestamp = body.get_i64();
            let name_len = body.get_u32() as usize;
            ensure(body, name_len, "chat username")?;
            let username = utf16_string(&body[..name_len], "chat username")?;
            body.advance(name_len);
            let text = utf16_string(body, "chat text")?;
            Ok(Message::Chat {
                timestamp,
                username,
                text,
            })
        }
        MessageKind::ClientExchange => {
            ensure(body, 6, "client exchange header")?;
            let mut octets = [0u8; 4];
            body.copy_to_slice(&mut octets);
            let port = body.get_u16();
            let username = utf16_string(body, "client exchange username")?;
            Ok(Message::ClientExchange {
                address: Ipv4Addr::from(octets),
                port,
                username,
            })
        }
        MessageKind::Handshake => {
            let id_len = utf16_len(PROTOCOL_ID) as usize;
            ensure(body, id_len + 2, "handshake header")?;
            let protocol_id = utf16_string(&body[..id_len], "protocol identifier")
                .unwrap_or_else(|_| String::from_utf8_lossy(&body[..id_len]).into_owned());
            if protocol_id != PROTOCOL_ID {
                return Err(CodecError::ProtocolMismatch(protocol_id));
            }
            body.advance(id_len);
            let listen_port = body.get_u16();
            let username = utf16_string(body, "handshake username")?;
            Ok(Message::Handshake {
                username,
                listen_port,
            })
        }
        MessageKind::Disconnect => Ok(Message::Disconnect),
        MessageKind::KeepAlive => Ok(Message::KeepAlive),
    }
}

/// Reads exactly one frame from `reader` and decodes it.
///
/// A stream that ends before the first byte of a frame yields
/// [`CodecError::Closed`]; one that ends inside a frame yields an I/O error.
/// A frame longer than `max_frame_len` is read past and reported as
/// [`CodecError::FrameTooLarge`].
pub async fn read_message<R>(reader: &mut R, max_frame_len: u32) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Err(CodecError::Closed);
    }
    reader.read_exact(&mut prefix[first..]).await?;

    let length = u32::from_be_bytes(prefix);
    if length == 0 {
        return Err(CodecError::ZeroLength);
    }
    if length > max_frame_len {
        // read past the body so the stream stays on a frame boundary
        let mut body = (&mut *reader).take(u64::from(length));
        let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if skipped < u64::from(length) {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        return Err(CodecError::FrameTooLarge {
            len: length,
            max: max_frame_len,
        });
    }

    let mut body = vec![0u8; length as usize];
    reader.read_exact(&mut body).await?;
    decode_body(&body)
}
