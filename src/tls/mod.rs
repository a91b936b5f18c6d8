//! Optional TLS upgrade of the replication socket.
//!
//! PostgreSQL negotiates TLS in-band: the client sends an SSLRequest and the
//! server answers a single byte, `S` to proceed with a handshake or `N` to
//! stay in plaintext. [`connect_stream`] does that negotiation according to
//! [`SslMode`] and hands back one stream type either way.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::config::{SslMode, TlsConfig};
use crate::error::Result;

#[cfg(feature = "tls-rustls")]
mod rustls;

pub enum MaybeTlsStream {
    Plain(TcpStream),
    #[cfg(feature = "tls-rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        !matches!(self, MaybeTlsStream::Plain(_))
    }
}

/// Apply the configured TLS policy to a fresh TCP connection.
pub async fn connect_stream(tcp: TcpStream, tls: &TlsConfig, host: &str) -> Result<MaybeTlsStream> {
    if tls.mode == SslMode::Disable {
        return Ok(MaybeTlsStream::Plain(tcp));
    }

    #[cfg(feature = "tls-rustls")]
    {
        return self::rustls::upgrade(tcp, tls, host).await;
    }

    #[cfg(not(feature = "tls-rustls"))]
    {
        let _ = host;
        if tls.mode == SslMode::Prefer {
            return Ok(MaybeTlsStream::Plain(tcp));
        }
        Err(crate::error::ReaderError::Tls(
            "tls-rustls feature disabled".into(),
        ))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls-rustls")]
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
