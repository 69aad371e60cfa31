//! Server configuration.

use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Server configuration, loadable from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address to listen on, e.g. `"127.0.0.1:11211"`.
    pub listen_addr: String,

    /// Buffered-reader capacity per connection.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Buffered-writer capacity per connection.
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Engine sizing, consumed by the server binary.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Engine sizing knobs for the built-in `HashCache`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of items held at once.
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// Total key+value byte budget.
    #[serde(default = "default_data_size")]
    pub data_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            data_size: default_data_size(),
        }
    }
}

impl Config {
    /// Config with defaults for everything but the listen address.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            cache: CacheConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_write_buffer_size() -> usize {
    DEFAULT_WRITE_BUFFER_SIZE
}

fn default_max_items() -> usize {
    1_000_000
}

fn default_data_size() -> usize {
    64 * 1024 * 1024
}
