use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Connection-level operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Bind,
    Listen,
    Accept,
    Handshake,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Bind => write!(f, "bind"),
            Op::Listen => write!(f, "listen"),
            Op::Accept => write!(f, "accept"),
            Op::Handshake => write!(f, "handshake"),
        }
    }
}

/// A failed bind/listen/accept/handshake, tagged with where it happened.
#[derive(Debug, Error)]
#[error("{op} {net} {}: {source}", display_addr(.addr))]
pub struct OpError {
    pub op: Op,
    pub net: &'static str,
    pub addr: Option<SocketAddr>,
    #[source]
    pub source: io::Error,
}

fn display_addr(addr: &Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

impl OpError {
    pub fn new(op: Op, net: &'static str, addr: Option<SocketAddr>, source: io::Error) -> Self {
        Self {
            op,
            net,
            addr,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Op(#[from] OpError),

    #[error("write timed out after {attempts} attempts")]
    WriteTimeout { attempts: u32 },

    #[error("endpoint creation failed: {0}")]
    Endpoint(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("no async runtime: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is the cancellation signal rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Certificate(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
