use std::{
    fmt::Display,
    fs,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};

use serde::Deserialize;
use tracing::info;

/// Top-level configuration for Authgate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// SMTP host configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Host name of this MTA, also used as the authserv-id.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Largest message accepted in DATA, in bytes.
    #[serde(default = "default_max_message_size", alias = "maxMessageSize")]
    pub max_message_size: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Authentication pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Minimum acceptable key size for DKIM and ARC signatures.
    #[serde(default = "default_min_bit_length", alias = "minBitLength")]
    pub min_bit_length: u32,

    /// Deadline applied to each collaborator call, unbounded when absent.
    #[serde(default, alias = "stageTimeoutSecs")]
    pub stage_timeout_secs: Option<u64>,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl AuthConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            min_bit_length: default_min_bit_length(),
            stage_timeout_secs: None,
            dns: DnsConfig::default(),
        }
    }
}

/// DNS limits for the verification collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Maximum number of DNS lookups a single SPF evaluation may trigger.
    #[serde(default = "default_max_lookups", alias = "maxLookups")]
    pub max_lookups: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            max_lookups: default_max_lookups(),
        }
    }
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smtp.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "smtp.max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.auth.min_bit_length == 0 {
            return Err(ConfigError::Invalid(
                "auth.min_bit_length must be greater than zero".to_string(),
            ));
        }
        if self.auth.dns.max_lookups == 0 {
            return Err(ConfigError::Invalid(
                "auth.dns.max_lookups must be greater than zero".to_string(),
            ));
        }
        if self.auth.stage_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "auth.stage_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    Config::from_toml(&content)
}

/// Loads configuration from a TOML file, falling back to defaults when the
/// file does not exist.
pub fn load_config_or_default(path: &Path) -> Result<Config, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Config::from_toml(&content),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(error) => Err(ConfigError::Io(error)),
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    Io(std::io::Error),
    /// A parse error occurred deserializing TOML.
    Parse(toml::de::Error),
    /// The document parsed but holds an unusable value.
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "Config parse error: {e}"),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// An immutable configuration version.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Config,
}

/// Holder of the current configuration snapshot.
///
/// Replacing the configuration publishes a new [`ConfigSnapshot`]; readers
/// keep whichever snapshot they captured, so a reload never tears a value
/// observed by an in-flight stage.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 1, config })),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Publishes `config` as the next version, returning that version.
    pub fn replace(&self, config: Config) -> u64 {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let version = guard.version + 1;
        *guard = Arc::new(ConfigSnapshot { version, config });
        version
    }

    /// Reloads from `path`. On error the current snapshot stays in place.
    pub fn reload(&self, path: &Path) -> Result<u64, ConfigError> {
        let config = load_config(path)?;
        let version = self.replace(config);
        info!(path = %path.display(), version = version, "Configuration reloaded");
        Ok(version)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2525
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024
}

fn default_min_bit_length() -> u32 {
    1024
}

fn default_max_lookups() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.smtp.host, "127.0.0.1");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.hostname, "localhost");
        assert_eq!(config.smtp.max_message_size, 25 * 1024 * 1024);
        assert_eq!(config.auth.min_bit_length, 1024);
        assert_eq!(config.auth.dns.max_lookups, 10);
        assert_eq!(config.auth.stage_timeout(), None);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[smtp]
host = "0.0.0.0"
port = 25
hostname = "mx.example.org"
max_message_size = 1048576

[auth]
min_bit_length = 2048
stage_timeout_secs = 15

[auth.dns]
max_lookups = 2
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.smtp.host, "0.0.0.0");
        assert_eq!(config.smtp.port, 25);
        assert_eq!(config.smtp.hostname, "mx.example.org");
        assert_eq!(config.smtp.max_message_size, 1_048_576);
        assert_eq!(config.auth.min_bit_length, 2048);
        assert_eq!(config.auth.stage_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.auth.dns.max_lookups, 2);
    }

    #[test]
    fn test_parse_camel_case_aliases() {
        let toml = r#"
[auth]
minBitLength = 512

[auth.dns]
maxLookups = 4
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.auth.min_bit_length, 512);
        assert_eq!(config.auth.dns.max_lookups, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let error = Config::from_toml("[auth.dns]\nmax_lookups = 0\n").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error = Config::from_toml("[auth]\nmin_bit_length = 0\n").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error = Config::from_toml("[smtp]\nmaxMessageSize = 0\n").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));

        let error = Config::from_toml("[auth]\nmin_bit_length = \"big\"\n").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn test_store_snapshot_survives_replace() {
        let store = ConfigStore::default();
        let captured = store.snapshot();
        assert_eq!(captured.version, 1);

        let mut config = Config::default();
        config.auth.dns.max_lookups = 3;
        assert_eq!(store.replace(config), 2);

        assert_eq!(captured.config.auth.dns.max_lookups, 10);
        assert_eq!(store.snapshot().config.auth.dns.max_lookups, 3);
        assert_eq!(store.snapshot().version, 2);
    }

    #[test]
    fn test_store_reload_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[auth]\nmin_bit_length = 2048").unwrap();

        let store = ConfigStore::default();
        assert_eq!(store.reload(file.path()).unwrap(), 2);
        assert_eq!(store.snapshot().config.auth.min_bit_length, 2048);
    }

    #[test]
    fn test_store_reload_failure_keeps_snapshot() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[auth.dns]\nmax_lookups = 0").unwrap();

        let store = ConfigStore::default();
        assert!(store.reload(file.path()).is_err());
        assert_eq!(store.snapshot().version, 1);
        assert_eq!(store.snapshot().config.auth.dns.max_lookups, 10);
    }

    #[test]
    fn test_load_config_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.smtp.port, 2525);
    }
}
