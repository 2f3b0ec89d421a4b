//! Low level Postgres wire protocol. Defines the framing of the messages
//! relayed between clients and backends.
//!
//! The gateway is bit-transparent: message bodies are carried as opaque bytes
//! and re-emitted verbatim. Only the pieces needed for routing are decoded
//! here (message type bytes, the query text of `Query` and `Parse`, and the
//! authentication subtype of backend `R` messages).

use std::borrow::Cow;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Backend `ReadyForQuery`: terminates a request/response cycle.
pub const READY_FOR_QUERY: u8 = b'Z';

/// Backend `Authentication` family.
pub const AUTHENTICATION: u8 = b'R';

/// Magic protocol code of the `SSLRequest` startup packet.
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Same bound the server applies to startup packets.
pub const MAX_STARTUP_PACKET_LEN: u32 = 10_000;

/// Frontend messages the session dispatches on.
///
/// Anything else is carried through to the primary untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendMessage {
    Query,
    Parse,
    Bind,
    Execute,
    Describe,
    Close,
    Sync,
    Flush,
    Terminate,
    Other(u8),
}

impl From<u8> for FrontendMessage {
    fn from(ty: u8) -> Self {
        // https://www.postgresql.org/docs/current/protocol-message-formats.html
        match ty {
            b'Q' => FrontendMessage::Query,
            b'P' => FrontendMessage::Parse,
            b'B' => FrontendMessage::Bind,
            b'E' => FrontendMessage::Execute,
            b'D' => FrontendMessage::Describe,
            b'C' => FrontendMessage::Close,
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'X' => FrontendMessage::Terminate,
            other => FrontendMessage::Other(other),
        }
    }
}

/// One framed protocol message: a type byte plus an opaque body.
///
/// On the wire the body is preceded by a big-endian `u32` length that counts
/// itself but not the type byte.
#[derive(Debug, Clone)]
pub struct Frame {
    pub ty: u8,
    pub body: Bytes,
}

impl Frame {
    pub fn new(ty: u8, body: impl Into<Bytes>) -> Frame {
        Frame {
            ty,
            body: body.into(),
        }
    }
}

/// Read one framed message.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary; an EOF anywhere
/// inside a message is an error.
pub async fn read_frame<R>(stream: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let ty = match stream.read_u8().await {
        Ok(ty) => ty,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };

    let length = stream.read_u32().await?;
    if length < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {length} below protocol minimum"),
        ));
    }

    let mut body = vec![0u8; (length - 4) as usize];
    stream.read_exact(&mut body).await?;

    Ok(Some(Frame {
        ty,
        body: body.into(),
    }))
}

/// Write one framed message, byte-for-byte as it was read.
pub async fn write_frame<W>(stream: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 5];
    header[0] = frame.ty;
    header[1..].copy_from_slice(&(frame.body.len() as u32 + 4).to_be_bytes());

    stream.write_all(&header).await?;
    stream.write_all(&frame.body).await
}

/// Query text of a simple `Query` body (the trailing NUL stripped).
pub fn query_text(body: &[u8]) -> Cow<'_, str> {
    let body = body.strip_suffix(&[0]).unwrap_or(body);
    String::from_utf8_lossy(body)
}

/// Query text of a `Parse` body: a NUL-terminated statement name followed by
/// a NUL-terminated query string. Returns `None` when either terminator is
/// missing.
pub fn parse_statement(body: &[u8]) -> Option<Cow<'_, str>> {
    let name_end = memchr::memchr(0, body)?;
    let rest = &body[name_end + 1..];
    let query_end = memchr::memchr(0, rest)?;
    Some(String::from_utf8_lossy(&rest[..query_end]))
}

/// Whether an `Authentication` body announces a step the client must answer.
///
/// Subtype 0 (`AuthenticationOk`) and 12 (`AuthenticationSASLFinal`) are
/// informational; the server keeps talking on its own after them.
pub fn authentication_needs_reply(body: &[u8]) -> bool {
    const AUTH_OK: u32 = 0;
    const AUTH_SASL_FINAL: u32 = 12;

    let Some(code) = body.get(..4) else {
        return false;
    };
    let code = u32::from_be_bytes([code[0], code[1], code[2], code[3]]);
    code != AUTH_OK && code != AUTH_SASL_FINAL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(ty: u8, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![ty];
        raw.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        raw.extend_from_slice(body);
        raw
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let raw = framed(b'Q', b"SELECT 1\0");

        let frame = read_frame(&mut raw.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.ty, b'Q');
        assert_eq!(&frame.body[..], b"SELECT 1\0");

        let (mut near, mut far) = tokio::io::duplex(64);
        write_frame(&mut near, &frame).await.unwrap();
        drop(near);

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut far, &mut out)
            .await
            .unwrap();
        assert_eq!(out, raw);
    }

    #[tokio::test]
    async fn minimum_length_is_an_empty_body() {
        let raw = framed(b'S', b"");
        let frame = read_frame(&mut raw.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.ty, b'S');
        assert!(frame.body.is_empty());
    }

    #[tokio::test]
    async fn length_below_minimum_is_rejected() {
        let mut raw = vec![b'Q'];
        raw.extend_from_slice(&3u32.to_be_bytes());

        let err = read_frame(&mut raw.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_clean() {
        let empty: &[u8] = &[];
        assert!(read_frame(&mut &*empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let mut raw = framed(b'Q', b"SELECT 1\0");
        raw.truncate(7);

        assert!(read_frame(&mut raw.as_slice()).await.is_err());
    }

    #[test]
    fn query_text_strips_the_trailing_nul() {
        assert_eq!(query_text(b"SELECT 1\0"), "SELECT 1");
        assert_eq!(query_text(b"\0"), "");
        assert_eq!(query_text(b""), "");
    }

    #[test]
    fn parse_statement_extracts_the_query() {
        assert_eq!(
            parse_statement(b"stmt\0SELECT $1\0\0\0").as_deref(),
            Some("SELECT $1")
        );
        assert_eq!(parse_statement(b"\0SELECT 1\0").as_deref(), Some("SELECT 1"));
        assert_eq!(parse_statement(b"no terminators"), None);
    }

    #[test]
    fn authentication_subtypes() {
        assert!(!authentication_needs_reply(&0u32.to_be_bytes()));
        assert!(!authentication_needs_reply(&12u32.to_be_bytes()));
        // cleartext password, md5, SASL, SASL continue
        for code in [3u32, 5, 10, 11] {
            assert!(authentication_needs_reply(&code.to_be_bytes()));
        }
        assert!(!authentication_needs_reply(b""));
    }
}
