//! Client configuration.

use std::time::Duration;

pub const DEFAULT_CONNECTIONS_COUNT: usize = 4;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_REQUEST_QUEUE_SIZE: usize = 1024;
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for a single-server [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend endpoint, `"host:port"`.
    pub connect_addr: String,
    /// Number of pipelined connections to the backend.
    pub connections_count: usize,
    /// Buffered-reader capacity per connection.
    pub read_buffer_size: usize,
    /// Buffered-writer capacity per connection.
    pub write_buffer_size: usize,
    /// Outstanding requests allowed per pipeline before senders block.
    pub request_queue_size: usize,
    /// Initial redial delay; grows linearly and caps at one second.
    pub reconnect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_addr: "127.0.0.1:11211".to_string(),
            connections_count: DEFAULT_CONNECTIONS_COUNT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            request_queue_size: DEFAULT_REQUEST_QUEUE_SIZE,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
        }
    }
}

/// Configuration for a [`DistributedClient`](crate::DistributedClient):
/// the per-backend knobs of [`ClientConfig`] minus the address, which comes
/// from membership.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    pub connections_count: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub request_queue_size: usize,
    pub reconnect_timeout: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            connections_count: DEFAULT_CONNECTIONS_COUNT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            request_queue_size: DEFAULT_REQUEST_QUEUE_SIZE,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
        }
    }
}

impl DistributedConfig {
    /// The per-backend client configuration for one member address.
    pub(crate) fn client_config(&self, connect_addr: &str) -> ClientConfig {
        ClientConfig {
            connect_addr: connect_addr.to_string(),
            connections_count: self.connections_count,
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            request_queue_size: self.request_queue_size,
            reconnect_timeout: self.reconnect_timeout,
        }
    }
}
