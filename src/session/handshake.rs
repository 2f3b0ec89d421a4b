//! Startup prologue: SSL refusal and the verbatim startup packet.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{MAX_STARTUP_PACKET_LEN, SSL_REQUEST_CODE};

/// Consume the startup prologue and return the startup message, verbatim,
/// including its leading length field.
///
/// An `SSLRequest` is answered with the single-byte refusal `'N'`, after
/// which the client is expected to retry in cleartext; each iteration
/// consumes exactly one startup-framed packet.
pub async fn read_startup<S>(stream: &mut S) -> io::Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let length = stream.read_u32().await?;
        if length < 8 || length > MAX_STARTUP_PACKET_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("startup packet length {length} out of range"),
            ));
        }

        let code = stream.read_u32().await?;
        if code == SSL_REQUEST_CODE {
            stream.write_all(b"N").await?;
            continue;
        }

        let mut packet = vec![0u8; length as usize];
        packet[..4].copy_from_slice(&length.to_be_bytes());
        packet[4..8].copy_from_slice(&code.to_be_bytes());
        stream.read_exact(&mut packet[8..]).await?;

        return Ok(packet.into());
    }
}
