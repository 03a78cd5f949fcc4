use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::DatagramEndpoint;
use crate::config::UdpConfig;
use crate::error::{Error, Result};

/// Write capability handed to a flow handler
///
/// A write is attempted immediately. On "would block" it waits up to
/// `write_wait` for the endpoint to become writable and retries, giving up
/// with `Error::WriteTimeout` after `attempts` waits.
#[derive(Clone)]
pub struct FlowWriter {
    endpoint: Arc<dyn DatagramEndpoint>,
    remote: SocketAddr,
    write_wait: Duration,
    attempts: u32,
}

impl fmt::Debug for FlowWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowWriter")
            .field("remote", &self.remote)
            .field("write_wait", &self.write_wait)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl FlowWriter {
    pub fn new(endpoint: Arc<dyn DatagramEndpoint>, remote: SocketAddr, config: &UdpConfig) -> Self {
        Self {
            endpoint,
            remote,
            write_wait: config.write_wait(),
            attempts: config.write_attempts,
        }
    }

    /// Peer of the flow
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Send `data` to `dest`
    pub async fn write(&self, data: &[u8], dest: SocketAddr) -> Result<usize> {
        let mut waits = 0;
        loop {
            match self.endpoint.try_send_to(data, dest) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if waits >= self.attempts {
                        return Err(Error::WriteTimeout { attempts: waits });
                    }
                    waits += 1;
                    trace!("write to {} would block (wait {}/{})", dest, waits, self.attempts);
                    match tokio::time::timeout(self.write_wait, self.endpoint.writable()).await {
                        Ok(Ok(())) | Err(_) => {}
                        Ok(Err(e)) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send `data` back to the flow's peer
    pub async fn reply(&self, data: &[u8]) -> Result<usize> {
        self.write(data, self.remote).await
    }
}
