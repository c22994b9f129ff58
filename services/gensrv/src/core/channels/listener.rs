//! Inbound listener for one channel port

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};

use crate::core::config::parse_host;
use crate::error::{GenSrvError, Result};

/// Pending connections the kernel may queue. The bridge is the only client.
const BACKLOG: u32 = 1;

/// Listening socket for one channel
#[derive(Debug)]
pub struct ChannelListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ChannelListener {
    /// Bind with SO_REUSEADDR so a restart does not wait out TIME_WAIT
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| GenSrvError::io(format!("Failed to create socket: {}", e)))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| GenSrvError::io(format!("Failed to set SO_REUSEADDR: {}", e)))?;
        socket
            .bind(addr)
            .map_err(|e| GenSrvError::io(format!("Failed to bind to {}: {}", addr, e)))?;
        let listener = socket
            .listen(BACKLOG)
            .map_err(|e| GenSrvError::io(format!("Failed to listen on {}: {}", addr, e)))?;

        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Bind `host:port`; `host` is an IPv4 or IPv6 literal
    pub fn bind_host(host: &str, port: u16) -> Result<Self> {
        Self::bind(SocketAddr::new(parse_host(host)?, port))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to `timeout` for the bridge to connect
    pub async fn accept(&self, timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY not applied for {}: {}", peer, e);
                }
                info!("Device connected from {}", peer);
                Ok((stream, peer))
            },
            Ok(Err(e)) => Err(GenSrvError::io(format!("Accept failed: {}", e))),
            Err(_) => Err(GenSrvError::AcceptTimeout(timeout)),
        }
    }
}
