use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 3000;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;
pub const DEFAULT_SSE_KEEP_ALIVE_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub outbound_buffer: usize,
    pub sse_keep_alive_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_OUTBOUND_BUFFER must be a positive integer")]
    InvalidOutboundBuffer,
    #[error("MCP_SSE_KEEP_ALIVE_SECS must be a non-negative integer")]
    InvalidKeepAlive,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = read("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_port = read("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(DEFAULT_BIND_PORT);
        let outbound_buffer = read("MCP_OUTBOUND_BUFFER")
            .map(|value| {
                value
                    .parse::<usize>()
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or(ConfigError::InvalidOutboundBuffer)
            })
            .transpose()?
            .unwrap_or(DEFAULT_OUTBOUND_BUFFER);
        let sse_keep_alive_secs = read("MCP_SSE_KEEP_ALIVE_SECS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidKeepAlive)
            })
            .transpose()?
            .unwrap_or(DEFAULT_SSE_KEEP_ALIVE_SECS);

        let config = Self {
            bind_addr,
            bind_port,
            outbound_buffer,
            sse_keep_alive_secs,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    /// `None` disables SSE keep-alive comments.
    pub fn sse_keep_alive(&self) -> Option<Duration> {
        (self.sse_keep_alive_secs > 0).then(|| Duration::from_secs(self.sse_keep_alive_secs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = config_from(&[]).expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 3000);
        assert_eq!(config.outbound_buffer, 64);
        assert_eq!(config.sse_keep_alive(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn parse_overrides() {
        let config = config_from(&[
            ("BIND_ADDR", "0.0.0.0"),
            ("BIND_PORT", "8080"),
            ("MCP_OUTBOUND_BUFFER", "8"),
            ("MCP_SSE_KEEP_ALIVE_SECS", "0"),
        ])
        .expect("config should parse");

        assert_eq!(
            config.bind_socket().expect("valid socket"),
            "0.0.0.0:8080".parse().expect("valid addr")
        );
        assert_eq!(config.outbound_buffer, 8);
        assert_eq!(config.sse_keep_alive(), None);
    }

    #[test]
    fn invalid_port_fails() {
        let err = config_from(&[("BIND_PORT", "70000")]).expect_err("expected invalid port");
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn zero_outbound_buffer_fails() {
        let err = config_from(&[("MCP_OUTBOUND_BUFFER", "0")])
            .expect_err("expected invalid outbound buffer");
        assert!(matches!(err, ConfigError::InvalidOutboundBuffer));
    }

    #[test]
    fn invalid_bind_addr_fails() {
        let err = config_from(&[("BIND_ADDR", "not an address")])
            .expect_err("expected invalid socket");
        assert!(matches!(err, ConfigError::InvalidSocket));
    }
}
