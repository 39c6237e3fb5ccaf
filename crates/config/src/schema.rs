//! Config schema for a ferry server. Every section defaults field by field,
//! so a file only needs the keys it wants to change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub app_name: String,
    pub host: String,
    /// Listen ports, one listener each. Kept as strings so an invalid entry
    /// can be reported verbatim.
    pub ports: Vec<String>,
    /// Codec name, see [`ferry_protocol::CodecType::from_name`].
    pub codec_type: String,
    /// Maximum number of concurrently open sessions.
    pub session_number: usize,
    /// Idle sessions are closed after this long; also the housekeeping period.
    #[serde(with = "duration")]
    pub session_timeout: Duration,
    /// Upper bound on graceful shutdown before the process is terminated.
    #[serde(with = "duration")]
    pub fail_fast_timeout: Duration,
    pub session: SessionConfig,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app_name: "ferry".into(),
            host: "127.0.0.1".into(),
            ports: Vec::new(),
            codec_type: "json".into(),
            session_number: 700,
            session_timeout: Duration::from_secs(20),
            fail_fast_timeout: Duration::from_secs(3),
            session: SessionConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Per-connection transport tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deflate-compress every frame payload.
    pub compress_encoding: bool,
    pub tcp_no_delay: bool,
    pub tcp_keep_alive: bool,
    /// Only applied when `tcp_keep_alive` is set.
    #[serde(with = "duration")]
    pub keep_alive_period: Duration,
    pub tcp_read_buffer: usize,
    pub tcp_write_buffer: usize,
    /// Inbound frames buffered between the reader and the dispatcher.
    pub read_queue_len: usize,
    /// Outbound frames buffered between the dispatcher and the writer.
    pub write_queue_len: usize,
    #[serde(with = "duration")]
    pub tcp_read_timeout: Duration,
    #[serde(with = "duration")]
    pub tcp_write_timeout: Duration,
    /// Grace period for flushing queued replies when a session closes.
    #[serde(with = "duration")]
    pub wait_timeout: Duration,
    pub max_msg_len: usize,
    pub session_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compress_encoding: false,
            tcp_no_delay: true,
            tcp_keep_alive: true,
            keep_alive_period: Duration::from_secs(180),
            tcp_read_buffer: 256 * 1024,
            tcp_write_buffer: 64 * 1024,
            read_queue_len: 1024,
            write_queue_len: 512,
            tcp_read_timeout: Duration::from_secs(1),
            tcp_write_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(1),
            max_msg_len: 1024 * 1024,
            session_name: "ferry-rpc-server".into(),
        }
    }
}

/// Discovery registry connection. Publishing is disabled while `addr` is
/// empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `etcd` or `zookeeper`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Comma-separated endpoint list.
    pub addr: String,
    #[serde(with = "duration")]
    pub keepalive_timeout: Duration,
    /// Namespace root for every published key.
    pub root: String,
    /// Group (data-center) tag published with each service.
    pub idc: String,
    /// Prefix for node identifiers; the listen address is appended.
    pub node_id: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            addr: String::new(),
            keepalive_timeout: Duration::from_secs(10),
            root: "/ferry".into(),
            idc: "default".into(),
            node_id: "ferry-node".into(),
        }
    }
}
