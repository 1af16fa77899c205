//! Configuration for listeners and client pools.
//!
//! Both structs deserialize from TOML so deployments can keep limits in a
//! config file; every field has a default matching the reference limits.

use serde::Deserialize;
use std::time::Duration;

/// Tuning knobs for a [`Listener`](crate::Listener).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Upper bound on per-connection buffered input, in bytes.
    #[serde(default = "default_max_bytes")]
    pub request_max_bytes: usize,
    /// Idle seconds before TCP keepalive probes start.
    #[serde(default = "default_keepalive_secs")]
    pub tcp_keepalive_secs: u64,
    /// Close connections idle for longer than this many seconds (0 disables).
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_max_bytes: default_max_bytes(),
            tcp_keepalive_secs: default_keepalive_secs(),
            idle_timeout_secs: 0,
        }
    }
}

impl ServerConfig {
    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_secs))
        }
    }
}

/// Tuning knobs for a [`Client`](crate::client::Client) pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Maximum simultaneously open upstream sockets.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound on per-connection buffered replies, in bytes.
    #[serde(default = "default_max_bytes")]
    pub response_max_bytes: usize,
    /// AUTH secret sent as the first command on every fresh socket.
    #[serde(default)]
    pub auth: Option<String>,
    /// Per-request death timer in milliseconds (0 disables).
    #[serde(default)]
    pub timeout_millis: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            response_max_bytes: default_max_bytes(),
            auth: None,
            timeout_millis: 0,
        }
    }
}

impl ClientConfig {
    pub(crate) fn timeout(&self) -> Option<Duration> {
        if self.timeout_millis == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_millis))
        }
    }
}

fn default_max_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_pool_size() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.request_max_bytes, 1024 * 1024);
        assert_eq!(config.tcp_keepalive_secs, 60);
        assert_eq!(config.idle_timeout(), None);

        let config = ClientConfig::default();
        assert_eq!(config.response_max_bytes, 1024 * 1024);
        assert_eq!(config.pool_size, 16);
        assert!(config.auth.is_none());
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            request_max_bytes = 2097152
            tcp_keepalive_secs = 30
            idle_timeout_secs = 120
        "#;

        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.request_max_bytes, 2 * 1024 * 1024);
        assert_eq!(config.tcp_keepalive_secs, 30);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_toml_client_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            pool_size = 4
            auth = "pwd"
            timeout_millis = 5000
        "#,
        )
        .unwrap();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.auth.as_deref(), Some("pwd"));
        assert_eq!(config.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(config.response_max_bytes, 1024 * 1024);
    }
}
