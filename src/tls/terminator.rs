//! Passive TLS termination
//!
//! A connection whose first bytes look like a TLS handshake is terminated
//! with the identity configured for its port. The resulting stream reports
//! the handshake and copies every decrypted read into an `Event`. Anything
//! else is returned as-is with its peeked bytes intact.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::certs::{self, SelfSigned};
use super::listener::PendingConnection;
use super::peek::PeekableStream;
use super::{is_tls_prefix, TLS_PEEK_LEN};
use crate::config::TlsConfig;
use crate::core::{Event, EventSink};
use crate::error::{Error, Op, OpError, Result};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-port TLS identities with an optional default
#[derive(Clone)]
pub struct TlsTerminator {
    default: Option<Arc<ServerConfig>>,
    ports: HashMap<u16, Arc<ServerConfig>>,
    peek_timeout: Option<Duration>,
    handshake_timeout: Duration,
}

impl Default for TlsTerminator {
    fn default() -> Self {
        Self {
            default: None,
            ports: HashMap::new(),
            peek_timeout: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl fmt::Debug for TlsTerminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ports: Vec<_> = self.ports.keys().copied().collect();
        ports.sort_unstable();
        f.debug_struct("TlsTerminator")
            .field("default", &self.default.is_some())
            .field("ports", &ports)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TlsTerminator {
    /// Terminator with no identities; every connection passes through
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration
    ///
    /// Disabled TLS yields a pass-through terminator. Enabled TLS without a
    /// default identity gets a generated self-signed certificate.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        if !config.enabled {
            debug!("TLS termination disabled");
            return Ok(Self::new());
        }

        let default = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => certs::load_identity(cert, key)?,
            (None, None) => SelfSigned::generate(&config.common_name)?.server_config()?,
            _ => {
                return Err(Error::Config(
                    "tls.cert_path and tls.key_path must be set together".to_string(),
                ))
            }
        };

        let mut terminator = Self::new()
            .with_default(default)
            .with_handshake_timeout(config.handshake_timeout());
        for (port, identity) in &config.ports {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid tls port {:?}", port)))?;
            let server = certs::load_identity(&identity.cert_path, &identity.key_path)?;
            terminator = terminator.with_port(port, server);
        }

        info!(
            "TLS termination enabled ({} port-specific identities)",
            terminator.ports.len()
        );
        Ok(terminator)
    }

    pub fn with_default(mut self, config: Arc<ServerConfig>) -> Self {
        self.default = Some(config);
        self
    }

    pub fn with_port(mut self, port: u16, config: Arc<ServerConfig>) -> Self {
        self.ports.insert(port, config);
        self
    }

    /// Bound the wait for a client's first bytes
    pub fn with_peek_timeout(mut self, timeout: Duration) -> Self {
        self.peek_timeout = Some(timeout);
        self
    }

    /// Bound the TLS handshake of a connection that looked like TLS
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.default.is_some() || !self.ports.is_empty()
    }

    /// Identity for a local port, falling back to the default
    pub fn config_for(&self, port: u16) -> Option<Arc<ServerConfig>> {
        self.ports.get(&port).or(self.default.as_ref()).cloned()
    }

    /// Terminate TLS on `conn` if it is configured for `port` and looks like TLS
    pub async fn maybe_tls<S>(
        &self,
        mut conn: PendingConnection<S>,
        port: u16,
        events: Arc<dyn EventSink>,
    ) -> Result<MaybeTlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(server) = self.config_for(port) else {
            return Ok(MaybeTlsStream::Plain(conn));
        };

        let remote = conn.remote_addr();
        let local = conn.local_addr();
        let peek = conn.stream_mut().peek(TLS_PEEK_LEN);
        let peeked = match self.peek_timeout {
            Some(limit) => match tokio::time::timeout(limit, peek).await {
                Ok(res) => res.map(<[u8]>::to_vec),
                Err(_) => Ok(Vec::new()),
            },
            None => peek.await.map(<[u8]>::to_vec),
        }
        .map_err(|e| OpError::new(Op::Handshake, "tcp", Some(remote), e))?;

        if !is_tls_prefix(&peeked) {
            debug!("{} on port {} is not TLS", remote, port);
            return Ok(MaybeTlsStream::Plain(conn));
        }

        let handshake = TlsAcceptor::from(server).accept(conn.into_stream());
        let tls = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "tls handshake timed out",
            )),
        }
        .map_err(|e| {
            warn!("TLS handshake with {} failed: {}", remote, e);
            OpError::new(Op::Handshake, "tcp", Some(remote), e)
        })?;

        let (_, session) = tls.get_ref();
        let version = session
            .protocol_version()
            .map(|v| format!("{:?}", v))
            .unwrap_or_default();
        let cipher = session
            .negotiated_cipher_suite()
            .map(|c| format!("{:?}", c.suite()))
            .unwrap_or_default();
        let sni = session.server_name().unwrap_or_default().to_string();

        debug!(
            "TLS handshake with {} done: {} {} sni={:?}",
            remote, version, cipher, sni
        );

        events.publish(
            Event::new("tcp")
                .with_src(Some(remote.ip()), Some(remote.port()))
                .with_dst(local.map(|a| a.ip()), Some(port))
                .field("type", "tls")
                .field("version", version)
                .field("cipher", cipher)
                .field("sni", sni)
                .field("signature", hex::encode(&peeked)),
        );

        Ok(MaybeTlsStream::Tls(Box::new(EventedTlsStream {
            inner: tls,
            events,
            remote,
            local,
            port,
        })))
    }
}

/// Terminated TLS stream that reports every decrypted read
pub struct EventedTlsStream<S> {
    inner: TlsStream<PeekableStream<S>>,
    events: Arc<dyn EventSink>,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    port: u16,
}

impl<S> EventedTlsStream<S> {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// SNI sent by the client, if any
    pub fn server_name(&self) -> Option<&str> {
        self.inner.get_ref().1.server_name()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for EventedTlsStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let data = &buf.filled()[before..];
            if !data.is_empty() {
                this.events.publish(
                    Event::new("tcp")
                        .with_src(Some(this.remote.ip()), Some(this.remote.port()))
                        .with_dst(this.local.map(|a| a.ip()), Some(this.port))
                        .field("type", "tls.read")
                        .field("len", data.len())
                        .with_payload(data),
                );
            }
        }
        res
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for EventedTlsStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Either the original connection or its terminated TLS stream
pub enum MaybeTlsStream<S> {
    Plain(PendingConnection<S>),
    Tls(Box<EventedTlsStream<S>>),
}

impl<S> MaybeTlsStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            MaybeTlsStream::Plain(conn) => conn.remote_addr(),
            MaybeTlsStream::Tls(tls) => tls.remote_addr(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(conn) => Pin::new(conn).poll_read(cx, buf),
            MaybeTlsStream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(conn) => Pin::new(conn).poll_write(cx, data),
            MaybeTlsStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(conn) => Pin::new(conn).poll_flush(cx),
            MaybeTlsStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(conn) => Pin::new(conn).poll_shutdown(cx),
            MaybeTlsStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}
