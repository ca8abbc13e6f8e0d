use crate::{ConfigError, FromEnv, env_or_default, env_parse};
use std::net::Ipv4Addr;

/// Where the health and metrics endpoints listen
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// "host:port", ready for `TcpListener::bind`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// `HEALTH_HOST` (default 0.0.0.0) and `HEALTH_PORT` (default 8082)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: env_or_default("HEALTH_HOST", &defaults.host),
            port: env_parse("HEALTH_PORT", defaults.port)?,
        })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED.to_string(), 8082)
    }
}
