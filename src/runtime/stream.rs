use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{lookup_host, TcpStream},
};

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
};

/// A stream usable as the inner transport of a connection: anything that can be read from and
/// written to asynchronously. Streams produced by a [`TlsConnect`] factory must implement this.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> RawStream for T {}

/// A factory that wraps an established TCP stream in a secure transport. The driver performs no
/// TLS configuration of its own; callers supply an already-configured factory via
/// [`ClientOptions`](crate::options::ClientOptions).
pub trait TlsConnect: Send + Sync {
    /// Perform the client-side secure-transport handshake over `tcp`.
    fn connect<'a>(
        &'a self,
        host: &'a str,
        tcp: TcpStream,
    ) -> BoxFuture<'a, Result<Box<dyn RawStream>>>;
}

/// A stream to a server, either plain TCP or wrapped by the configured secure-transport factory.
pub(crate) enum AsyncStream {
    Tcp(TcpStream),
    Tls(Box<dyn RawStream>),
}

impl std::fmt::Debug for AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(..) => f.write_str("AsyncStream::Tcp"),
            Self::Tls(..) => f.write_str("AsyncStream::Tls"),
        }
    }
}

async fn try_connect(address: &SocketAddr, timeout: Duration) -> Result<TcpStream> {
    // A zero duration indicates no timeout.
    let stream = if timeout == Duration::ZERO {
        TcpStream::connect(address).await?
    } else {
        tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ErrorKind::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out dialing {} after {:?}", address, timeout),
                ))
            })??
    };

    Ok(stream)
}

async fn connect_tcp(address: &ServerAddress, connect_timeout: Duration) -> Result<TcpStream> {
    let mut socket_addrs: Vec<_> = lookup_host(address.to_string()).await?.collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses resolved for {}", address),
        ))
        .into());
    }

    // Try each resolved address in sequence with a preference for IPv4, like other drivers do.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;

    for socket_addr in &socket_addrs {
        connect_error = match try_connect(socket_addr, connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    // socket_addrs is non-empty, so at least one attempt ran.
    Err(connect_error.unwrap())
}

impl AsyncStream {
    /// Dials `address` and, if a secure-transport factory is supplied, wraps the stream with it.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Duration,
        tls: Option<&Arc<dyn TlsConnect>>,
    ) -> Result<Self> {
        let inner = connect_tcp(address, connect_timeout).await?;
        inner.set_nodelay(true)?;

        match tls {
            Some(factory) => {
                let stream = factory.connect(address.host(), inner).await?;
                Ok(Self::Tls(stream))
            }
            None => Ok(Self::Tcp(inner)),
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<tokio::io::Result<usize>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<tokio::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<tokio::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}
