use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ReaderError, Result};

/// Protocol 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;
const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Largest backend message accepted. Anything bigger is a corrupt length word.
pub const MAX_BACKEND_MESSAGE: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

/// Split one complete backend message off the front of `buf`, if present.
///
/// Leaves `buf` untouched (apart from reserving room) when the message is
/// still incomplete.
pub fn try_parse_backend_message(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_BACKEND_MESSAGE {
        return Err(ReaderError::MalformedFrame(format!(
            "invalid backend message length {len} for tag 0x{:02x}",
            buf[0]
        )));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let mut frame = buf.split_to(total);
    let tag = frame.get_u8();
    frame.advance(4);
    Ok(Some(BackendMessage {
        tag,
        payload: frame.freeze(),
    }))
}

/// Read the next backend message, buffering partial reads in `buf`.
///
/// Cancel-safe: dropping the future (e.g. on a receive timeout) never loses
/// bytes, they stay in `buf` for the next call.
pub async fn read_backend_message<R: AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
) -> Result<BackendMessage> {
    loop {
        if let Some(msg) = try_parse_backend_message(buf)? {
            return Ok(msg);
        }
        if rd.read_buf(buf).await? == 0 {
            return Err(ReaderError::Connection(
                "server closed the connection".into(),
            ));
        }
    }
}

fn tagged(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32((body.len() + 4) as i32);
    buf.extend_from_slice(body);
    buf
}

async fn write_all_flush<W: AsyncWrite + Unpin>(wr: &mut W, buf: &[u8]) -> Result<()> {
    wr.write_all(buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_ssl_request<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(8);
    buf.put_i32(SSL_REQUEST_CODE);
    write_all_flush(wr, &buf).await
}

pub fn encode_startup_message(protocol_version: i32, params: &[(&str, &str)]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);
    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    params: &[(&str, &str)],
) -> Result<()> {
    write_all_flush(wr, &encode_startup_message(PROTOCOL_VERSION, params)).await
}

pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut body = Vec::with_capacity(sql.len() + 1);
    body.extend_from_slice(sql.as_bytes());
    body.push(0);
    write_all_flush(wr, &tagged(b'Q', &body)).await
}

pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    write_all_flush(wr, &tagged(b'p', payload)).await
}

pub fn encode_copy_data(payload: &[u8]) -> BytesMut {
    tagged(b'd', payload)
}

pub async fn write_copy_data<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> Result<()> {
    write_all_flush(wr, &encode_copy_data(payload)).await
}

pub async fn write_copy_done<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    write_all_flush(wr, &tagged(b'c', &[])).await
}

pub async fn write_terminate<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    write_all_flush(wr, &tagged(b'X', &[])).await
}

/// Single byte answer to an SSLRequest: `S` or `N`.
pub async fn read_ssl_response<R: AsyncRead + Unpin>(rd: &mut R) -> Result<u8> {
    Ok(rd.read_u8().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_waits_for_complete_message() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'd', 0, 0, 0, 7, 1, 2]);
        assert!(try_parse_backend_message(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(&[3, b'Z']);
        let msg = try_parse_backend_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg.tag, b'd');
        assert_eq!(&msg.payload[..], &[1, 2, 3]);
        // trailing byte of the next message stays buffered
        assert_eq!(&buf[..], &[b'Z']);
    }

    #[test]
    fn parse_rejects_short_length_word() {
        let mut buf = BytesMut::from(&[b'd', 0, 0, 0, 3][..]);
        let err = try_parse_backend_message(&mut buf).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn parse_rejects_negative_length_word() {
        let mut buf = BytesMut::from(&[b'd', 0xFF, 0xFF, 0xFF, 0xFF][..]);
        assert!(try_parse_backend_message(&mut buf).is_err());
    }

    #[test]
    fn startup_message_layout() {
        let buf = encode_startup_message(PROTOCOL_VERSION, &[("user", "u")]);
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len());
        assert_eq!(&buf[4..8], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(&buf[8..], b"user\0u\0\0");
    }

    #[test]
    fn copy_data_length_counts_itself() {
        let buf = encode_copy_data(b"abc");
        assert_eq!(buf[0], b'd');
        assert_eq!(&buf[1..5], &7i32.to_be_bytes());
        assert_eq!(&buf[5..], b"abc");
    }

    #[tokio::test]
    async fn read_handles_split_delivery() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            server.write_all(&[b'c', 0, 0]).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&[0, 4]).await.unwrap();
        });
        let mut buf = BytesMut::new();
        let msg = read_backend_message(&mut client, &mut buf).await.unwrap();
        assert_eq!(msg.tag, b'c');
        assert!(msg.payload.is_empty());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_reports_eof_as_connection_error() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let mut buf = BytesMut::new();
        let err = read_backend_message(&mut client, &mut buf).await.unwrap_err();
        assert!(err.is_connection());
    }
}
