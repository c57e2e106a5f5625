//! Configuration management

use crate::tunnel::{Framing, ManagerSettings};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client endpoints (local listener, remote tunnel server)
    pub client: Option<EndpointConfig>,
    /// Server endpoints (tunnel listener, target service)
    pub server: Option<EndpointConfig>,
    /// Tunnel behaviour shared by both ends
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values that would only fail later at socket setup
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.client.is_none() && self.server.is_none() {
            return Err(crate::Error::Config(
                "Config needs a [client] or [server] section".to_string(),
            ));
        }
        for (name, endpoint) in [("client", &self.client), ("server", &self.server)] {
            if let Some(endpoint) = endpoint {
                endpoint.validate(name)?;
            }
        }
        if self.tunnel.connect_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "tunnel.connect_timeout_secs must be positive".to_string(),
            ));
        }
        if self.tunnel.max_events == 0 {
            return Err(crate::Error::Config(
                "tunnel.max_events must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One end's pair of addresses.
///
/// Client: `listen` faces local applications, `remote` is the tunnel server.
/// Server: `listen` faces the tunnel, `remote` is the target service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl EndpointConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_port)
    }

    fn validate(&self, section: &str) -> Result<(), crate::Error> {
        if self.remote_port == 0 {
            return Err(crate::Error::Config(format!(
                "[{}] remote_port must not be 0",
                section
            )));
        }
        if self.remote_ip.is_unspecified() {
            return Err(crate::Error::Config(format!(
                "[{}] remote_ip {} is not connectable",
                section, self.remote_ip
            )));
        }
        Ok(())
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Frame boundary convention, must match the other end
    pub framing: Framing,
    /// Close streams idle for this many seconds (0 disables)
    pub idle_timeout_secs: u64,
    /// Client startup connect timeout
    pub connect_timeout_secs: u64,
    /// Readiness events handled per poll
    pub max_events: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            idle_timeout_secs: crate::DEFAULT_IDLE_TIMEOUT_SECS,
            connect_timeout_secs: 10,
            max_events: crate::reactor::DEFAULT_MAX_EVENTS,
        }
    }
}

impl TunnelConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Settings handed to the connection manager
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            framing: self.framing,
            idle_timeout: self.idle_timeout(),
        }
    }
}

/// Log output style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let loopback = IpAddr::from([127, 0, 0, 1]);
    Config {
        client: Some(EndpointConfig {
            listen_ip: loopback,
            listen_port: 8080,
            remote_ip: IpAddr::from([192, 0, 2, 10]),
            remote_port: 9000,
        }),
        server: Some(EndpointConfig {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            listen_port: 9000,
            remote_ip: loopback,
            remote_port: 80,
        }),
        tunnel: TunnelConfig::default(),
        logging: LoggingConfig::default(),
    }
}
