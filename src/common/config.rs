use config::ConfigError as ConfigLibError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Config library error: {0}")]
    ConfigLibError(#[from] ConfigLibError),
}

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Listen address, `host:port` or `:port`
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Local address for outgoing connections, empty lets the OS pick
    #[serde(default)]
    pub bind_address: String,
    /// Log configuration
    #[serde(default)]
    pub log: LoggerConfig,
    /// Read buffer size per client connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Concurrent session cap, unlimited when absent
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Send SOCKS5 failure replies instead of just closing
    #[serde(default)]
    pub error_replies: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggerConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path, empty logs to stderr only
    #[serde(default)]
    pub path: String,
    /// Log file archive pattern
    #[serde(default = "default_archive_pattern")]
    pub archive_pattern: String,
    /// Number of log files to keep
    #[serde(default = "default_file_count")]
    pub file_count: u32,
    /// Size of each log file (MB)
    #[serde(default = "default_file_size")]
    pub file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            bind_address: String::new(),
            log: LoggerConfig::default(),
            buffer_size: default_buffer_size(),
            max_connections: None,
            error_replies: false,
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: String::new(),
            archive_pattern: default_archive_pattern(),
            file_count: default_file_count(),
            file_size: default_file_size(),
        }
    }
}

fn default_listen_address() -> String {
    ":1080".to_string()
}

fn default_log_level() -> String {
    "Info".to_string()
}

fn default_archive_pattern() -> String {
    "logs/archive/socks5-relay-{}.log".to_string()
}

fn default_file_count() -> u32 {
    5
}

/// Default file size in MB
fn default_file_size() -> u64 {
    10
}

fn default_buffer_size() -> usize {
    4096
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigLibError)?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// The address to hand to the listener. A bare `:port` listens on all
    /// IPv4 interfaces.
    pub fn listen_socket_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    pub fn bind_ip(&self) -> Result<Option<IpAddr>, ConfigError> {
        let bind = self.bind_address.trim();
        if bind.is_empty() {
            return Ok(None);
        }
        bind.parse::<IpAddr>().map(Some).map_err(|_| {
            ConfigError::InvalidConfig(format!("Invalid bind address: {}", self.bind_address))
        })
    }

    /// Validate if configuration is valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        let listen = self.listen_socket_address();
        let port_ok = match listen.rsplit_once(':') {
            Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        };
        if !port_ok {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid listen address format: {}",
                self.listen_address
            )));
        }

        self.bind_ip()?;

        if self.buffer_size == 0 || self.buffer_size > 65536 {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid buffer size: {}. Must be between 1 and 65536",
                self.buffer_size
            )));
        }

        if self.max_connections == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_socket_address(), "0.0.0.0:1080");
        assert_eq!(config.bind_ip().unwrap(), None);
        assert!(!config.error_replies);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.listen_address = "1080".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let mut config = Config::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_ip_and_listen_forms() {
        let mut config = Config::default();
        config.bind_address = "::1".to_string();
        config.listen_address = "[::1]:9050".to_string();
        assert_eq!(config.bind_ip().unwrap(), Some("::1".parse().unwrap()));
        assert_eq!(config.listen_socket_address(), "[::1]:9050");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("socks5-relay-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "listen_address = \"127.0.0.1:1081\"\nbind_address = \"127.0.0.1\"\nerror_replies = true\n\n[log]\nlevel = \"debug\""
        )
        .unwrap();
        drop(file);

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.listen_address, "127.0.0.1:1081");
        assert_eq!(config.bind_ip().unwrap(), Some("127.0.0.1".parse().unwrap()));
        assert!(config.error_replies);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.buffer_size, 4096);
    }
}
