//! TLS sniffing for accepted TCP connections
//!
//! - `peek` - stream wrapper that replays bytes read ahead of time
//! - `listener` - accept loop that tags each connection as TLS or not
//! - `terminator` - passive TLS termination with decrypted-read events
//! - `certs` - PEM identities and self-signed certificate generation

pub mod certs;
pub mod listener;
pub mod peek;
pub mod terminator;

pub use listener::{Acceptor, ConnQueue, PendingConnection, SniffingListener};
pub use peek::PeekableStream;
pub use terminator::{EventedTlsStream, MaybeTlsStream, TlsTerminator};

/// Bytes needed to recognize a TLS record header
pub const TLS_PEEK_LEN: usize = 3;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const TLS_MAJOR_VERSION: u8 = 0x03;
const TLS_MAX_MINOR_VERSION: u8 = 0x03;

/// Whether the first bytes of a stream look like a TLS handshake record
/// (content type 0x16, version 3.0 through 3.3)
pub fn is_tls_prefix(bytes: &[u8]) -> bool {
    bytes.len() >= TLS_PEEK_LEN
        && bytes[0] == TLS_HANDSHAKE_RECORD
        && bytes[1] == TLS_MAJOR_VERSION
        && bytes[2] <= TLS_MAX_MINOR_VERSION
}
