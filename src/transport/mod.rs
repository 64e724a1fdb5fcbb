//! TCP binding for the hub.
//!
//! Each connection carries checksummed frames (see [`crate::frame`]). A
//! connection either publishes any number of events, or turns into a single
//! subscriber stream after its `Subscribe` request.

mod client;
mod protocol;
mod server;

pub use client::{HubClient, RemoteSubscription};
pub use protocol::{Request, Response};
pub use server::HubServer;

use std::net::SocketAddr;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Largest accepted request frame body
    pub max_frame_size: usize,

    /// Buffer in front of each connection's write half
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6000)),
            max_connections: 0,
            tcp_nodelay: true,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_buffer_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 6000);
        assert_eq!(config.max_connections, 0);
        assert!(config.tcp_nodelay);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_builder() {
        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let config = ServerConfig::with_addr(addr)
            .max_connections(8)
            .tcp_nodelay(false)
            .max_frame_size(1024);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_connections, 8);
        assert!(!config.tcp_nodelay);
        assert_eq!(config.max_frame_size, 1024);
    }
}
