//! Configuration system for the Pie CLI.

use pie_core::Protocol;
use pie_discovery::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pie configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// PEM certificate path
    #[serde(default = "default_cert_path")]
    pub cert_file: PathBuf,
    /// PEM private key path
    #[serde(default = "default_key_path")]
    pub key_file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// Bootstrap trackers (`host:port`)
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Trackers queried per lookup round
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Seconds to wait for a lookup response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Seconds to wait for a tracker connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Candidates returned when answering lookups
    #[serde(default = "default_response_candidates")]
    pub response_candidates: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path, appended to instead of stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn pie_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pie")
}

fn default_cert_path() -> PathBuf {
    pie_dir().join("cert.pem")
}

fn default_key_path() -> PathBuf {
    pie_dir().join("key.pem")
}

fn default_listen_addr() -> String {
    "0.0.0.0:4433".to_string()
}

fn default_fanout() -> usize {
    pie_core::ALPHA
}

fn default_request_timeout() -> u64 {
    pie_discovery::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_connect_timeout() -> u64 {
    pie_discovery::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_response_candidates() -> usize {
    pie_core::K
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cert_file: default_cert_path(),
            key_file: default_key_path(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            fanout: default_fanout(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            response_candidates: default_response_candidates(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        pie_dir().join("config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Library discovery settings for a node identified by `local_id`
    #[must_use]
    pub fn discovery_config(&self, local_id: pie_core::Id) -> DiscoveryConfig {
        DiscoveryConfig {
            protocol: Protocol::Tracker,
            fanout: self.discovery.fanout,
            request_timeout: Duration::from_secs(self.discovery.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.discovery.connect_timeout_secs),
            response_candidates: self.discovery.response_candidates,
            local_id: Some(local_id),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        for tracker in &self.discovery.bootstrap {
            validate_host_port(tracker)?;
        }

        self.discovery_config(pie_core::Id::ZERO).validate()?;
        Ok(())
    }
}

fn validate_host_port(addr: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("Bootstrap tracker '{}' missing port (expected format: host:port)", addr);
    };
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("Bootstrap tracker '{}' has invalid port: {}", addr, port))?;
    if port == 0 {
        anyhow::bail!("Bootstrap tracker '{}' has invalid port: 0", addr);
    }
    if host.is_empty() {
        anyhow::bail!("Bootstrap tracker '{}' has empty hostname", addr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_addr, "0.0.0.0:4433");
        assert_eq!(config.discovery.fanout, 3);
        assert_eq!(config.discovery.response_candidates, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.discovery.bootstrap = vec!["tracker.example.org".to_string()];
        assert!(config.validate().is_err());

        config.discovery.bootstrap = vec!["tracker.example.org:4433".to_string()];
        assert!(config.validate().is_ok());

        config.discovery.fanout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[discovery]\nbootstrap = [\"10.0.0.1:4433\"]\n\n[logging]\nlevel = \"debug\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.discovery.bootstrap, vec!["10.0.0.1:4433".to_string()]);
        assert_eq!(config.discovery.fanout, 3);
        assert_eq!(config.network.listen_addr, "0.0.0.0:4433");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.logging.file = Some(dir.path().join("pie.log"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.logging.file, config.logging.file);
        assert_eq!(loaded.node.cert_file, config.node.cert_file);
    }
}
