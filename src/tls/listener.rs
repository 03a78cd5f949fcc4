//! Accept loop that sniffs the first bytes of every connection
//!
//! `SniffingListener::accept` waits for a completed connection, peeks at its
//! first three bytes (bounded by the peek timeout) and hands it out tagged as
//! TLS or not, with the peeked bytes still unread.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::peek::PeekableStream;
use super::{is_tls_prefix, TLS_PEEK_LEN};
use crate::config::ListenerConfig;
use crate::error::{Error, Op, OpError, Result};

/// Accept primitive of a listening socket
pub trait Acceptor: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Poll for the next completed connection
    ///
    /// When no connection is ready the waker must be registered before
    /// returning `Pending` or a "would block" error.
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

impl<A: Acceptor> Acceptor for std::sync::Arc<A> {
    type Stream = A::Stream;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(A::Stream, SocketAddr)>> {
        (**self).poll_accept(cx)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

struct QueueState<S> {
    conns: VecDeque<(S, SocketAddr)>,
    wakers: Vec<Waker>,
    closed: bool,
}

/// In-process queue of completed connections
///
/// The virtual stack pushes connections it has finished handshaking; a
/// `SniffingListener` built on the queue accepts them.
pub struct ConnQueue<S> {
    local: SocketAddr,
    state: Mutex<QueueState<S>>,
}

impl<S> fmt::Debug for ConnQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnQueue")
            .field("local", &self.local)
            .field("pending", &state.conns.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<S> ConnQueue<S> {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            state: Mutex::new(QueueState {
                conns: VecDeque::new(),
                wakers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Queue a completed connection; returns false once the queue is closed
    pub fn push(&self, stream: S, remote: SocketAddr) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.conns.push_back((stream, remote));
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Stop accepting; pending accepts fail once the queue drains
    pub fn close(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> Acceptor for ConnQueue<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(S, SocketAddr)>> {
        let mut state = self.state.lock();
        if let Some(conn) = state.conns.pop_front() {
            return Poll::Ready(Ok(conn));
        }
        if state.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection queue closed",
            )));
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Accepted connection with its first bytes peeked
#[derive(Debug)]
pub struct PendingConnection<S> {
    stream: PeekableStream<S>,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    is_tls: bool,
}

impl<S> PendingConnection<S> {
    /// Wrap a stream that has not been peeked yet
    pub fn new(stream: S, remote: SocketAddr, local: Option<SocketAddr>) -> Self {
        Self::from_peekable(PeekableStream::new(stream), remote, local)
    }

    fn from_peekable(stream: PeekableStream<S>, remote: SocketAddr, local: Option<SocketAddr>) -> Self {
        let is_tls = is_tls_prefix(stream.peeked());
        Self {
            stream,
            remote,
            local,
            is_tls,
        }
    }

    /// Whether the first bytes looked like a TLS handshake
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Bytes peeked at accept time, still unread
    pub fn peeked(&self) -> &[u8] {
        self.stream.peeked()
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn into_stream(self) -> PeekableStream<S> {
        self.stream
    }

    pub(crate) fn stream_mut(&mut self) -> &mut PeekableStream<S> {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PendingConnection<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PendingConnection<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// TCP listener that tags accepted connections as TLS or not
pub struct SniffingListener<A> {
    acceptor: A,
    net: &'static str,
    peek_timeout: Duration,
    accept_timeout: Option<Duration>,
    cancel: watch::Sender<bool>,
}

impl<A: Acceptor> fmt::Debug for SniffingListener<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniffingListener")
            .field("local", &self.acceptor.local_addr().ok())
            .field("peek_timeout", &self.peek_timeout)
            .field("accept_timeout", &self.accept_timeout)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl SniffingListener<TcpListener> {
    /// Bind a TCP listener
    pub async fn bind(addr: SocketAddr, config: &ListenerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| OpError::new(Op::Listen, "tcp", Some(addr), e))?;
        debug!("listening on {}", addr);
        Ok(Self::new(listener, config))
    }
}

impl<A: Acceptor> SniffingListener<A> {
    pub fn new(acceptor: A, config: &ListenerConfig) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            acceptor,
            net: "tcp",
            peek_timeout: config.peek_timeout(),
            accept_timeout: config.accept_timeout(),
            cancel,
        }
    }

    pub fn with_peek_timeout(mut self, timeout: Duration) -> Self {
        self.peek_timeout = timeout;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn acceptor(&self) -> &A {
        &self.acceptor
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.acceptor.local_addr()?)
    }

    /// Unblock every pending and future accept with `Error::Canceled`
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Accept the next connection and peek at its first bytes
    ///
    /// Cancellation only interrupts the wait for a connection. A connection
    /// already taken from the acceptor is always peeked and returned.
    pub async fn accept(&self) -> Result<PendingConnection<A::Stream>> {
        let mut canceled = self.cancel.subscribe();
        if *canceled.borrow_and_update() {
            return Err(Error::Canceled);
        }

        let local = self.acceptor.local_addr().ok();
        let (stream, remote) = tokio::select! {
            biased;
            _ = canceled.wait_for(|c| *c) => return Err(Error::Canceled),
            res = self.accept_with_deadline(local) => res?,
        };

        Ok(self.peek_connection(stream, remote, local).await)
    }

    async fn accept_with_deadline(
        &self,
        local: Option<SocketAddr>,
    ) -> Result<(A::Stream, SocketAddr)> {
        let accepted = match self.accept_timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.accept_stream())
                .await
                .map_err(|_| {
                    OpError::new(
                        Op::Accept,
                        self.net,
                        local,
                        io::Error::new(io::ErrorKind::TimedOut, "accept deadline exceeded"),
                    )
                })?,
            None => self.accept_stream().await,
        };
        accepted.map_err(|e| OpError::new(Op::Accept, self.net, local, e).into())
    }

    async fn peek_connection(
        &self,
        stream: A::Stream,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> PendingConnection<A::Stream> {
        let mut stream = PeekableStream::new(stream);
        match tokio::time::timeout(self.peek_timeout, stream.peek(TLS_PEEK_LEN)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("peek from {} failed: {}", remote, e),
            Err(_) => trace!("no data from {} within {:?}", remote, self.peek_timeout),
        }

        let conn = PendingConnection::from_peekable(stream, remote, local);
        debug!(
            "accepted {} connection from {} (tls: {})",
            self.net,
            remote,
            conn.is_tls()
        );
        conn
    }

    /// Wait for a connection
    ///
    /// "Would block" is treated like `Pending`: the acceptor has registered
    /// the waker and wakes it once a connection may be ready.
    async fn accept_stream(&self) -> io::Result<(A::Stream, SocketAddr)> {
        std::future::poll_fn(|cx| match self.acceptor.poll_accept(cx) {
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("accept would block");
                Poll::Pending
            }
            other => other,
        })
        .await
    }
}
