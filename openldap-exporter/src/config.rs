//! Configuration for the OpenLDAP exporter.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ldap_monitor::{CaCertificate, ServerConfig, TransportMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Ldap(#[from] ldap_monitor::ConfigError),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Monitored server settings.
    #[serde(default)]
    pub ldap: LdapConfig,

    /// Metrics endpoint settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Scrape loop settings.
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings for the monitored directory server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Server address as `host:port` (default: "localhost:389").
    #[serde(default = "default_ldap_address")]
    pub address: String,

    /// PEM file with the CA that signed the server certificate.
    #[serde(default)]
    pub ca_cert: Option<String>,

    /// Bind DN. Unset or empty binds anonymously.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Upgrade the plain connection with StartTLS.
    #[serde(default)]
    pub start_tls: bool,

    /// Connect over implicit TLS (ldaps).
    #[serde(default)]
    pub tls: bool,

    /// Accept any server certificate.
    #[serde(default)]
    pub skip_verify: bool,

    /// Timeout for connect, bind and search, in seconds (default: 10).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ldap_address() -> String {
    "localhost:389".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            address: default_ldap_address(),
            ca_cert: None,
            username: None,
            password: None,
            start_tls: false,
            tls: false,
            skip_verify: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Metrics HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: ":9330", all interfaces).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: "openldap").
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Labels added to every mapped sample.
    #[serde(default)]
    pub default_labels: BTreeMap<String, String>,
}

fn default_listen() -> String {
    ":9330".to_string()
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_prefix() -> String {
    "openldap".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: default_prefix(),
            default_labels: BTreeMap::new(),
        }
    }
}

/// Scrape loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Time between scrape cycles, in seconds (default: 30).
    #[serde(rename = "interval_secs", default = "default_interval", with = "seconds")]
    pub interval: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub prom_addr: Option<String>,
    pub ldap_addr: Option<String>,
    pub ldap_ca_crt: Option<String>,
    pub ldap_user: Option<String>,
    pub ldap_pass: Option<String>,
    pub start_tls: bool,
    pub tls: bool,
    pub skip_verify: bool,
    pub interval: Option<Duration>,
    pub log_level: Option<String>,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line overrides, then re-validate.
    pub fn apply_overrides(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        if let Some(listen) = overrides.prom_addr {
            self.prometheus.listen = listen;
        }
        if let Some(address) = overrides.ldap_addr {
            self.ldap.address = address;
        }
        if let Some(ca_cert) = overrides.ldap_ca_crt {
            self.ldap.ca_cert = Some(ca_cert);
        }
        if let Some(username) = overrides.ldap_user {
            self.ldap.username = Some(username);
        }
        if let Some(password) = overrides.ldap_pass {
            self.ldap.password = Some(password);
        }
        self.ldap.start_tls |= overrides.start_tls;
        self.ldap.tls |= overrides.tls;
        self.ldap.skip_verify |= overrides.skip_verify;
        if let Some(interval) = overrides.interval {
            self.scrape.interval = interval;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        self.validate()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scrape.interval.is_zero() {
            return Err(ConfigError::Validation(
                "scrape interval must be > 0".to_string(),
            ));
        }

        if self.ldap.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.ldap.start_tls && self.ldap.tls {
            return Err(ConfigError::Validation(
                "start_tls and tls are mutually exclusive".to_string(),
            ));
        }

        ldap_monitor::parse_addr(&self.ldap.address)?;
        self.listen_addr()?;

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }

        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {} (expected trace, debug, info, warn or error)",
                self.logging.level
            )));
        }

        if self.prometheus.prefix.is_empty() {
            return Err(ConfigError::Validation(
                "Metric prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the listen address. A bare `:port` listens on all interfaces.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let listen = &self.prometheus.listen;
        let normalized = match listen.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => listen.clone(),
        };

        if let Ok(addr) = normalized.parse::<SocketAddr>() {
            return Ok(addr);
        }

        normalized
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::Validation(format!("Invalid listen address: {listen}")))
    }

    /// Build the connection settings for the monitored server.
    ///
    /// Loads and validates the CA certificate, so an unreadable file fails here.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let ldap = &self.ldap;

        let transport = if ldap.tls {
            TransportMode::Tls
        } else if ldap.start_tls {
            TransportMode::StartTls
        } else {
            TransportMode::Plain
        };

        let mut server = ServerConfig::from_addr(&ldap.address)?
            .with_transport(transport)
            .with_verify_tls(!ldap.skip_verify)
            .with_timeout(Duration::from_secs(ldap.timeout_secs));

        if let Some(path) = &ldap.ca_cert {
            server = server.with_ca_cert(CaCertificate::load(path)?);
        }

        if let Some(username) = &ldap.username {
            server = server.with_credentials(
                username.as_str(),
                ldap.password.clone().unwrap_or_default(),
            );
        }

        Ok(server)
    }
}

/// Parse a duration such as `30s`, `1m`, `500ms`, `1h` or bare seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;

    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{other}' in '{input}'")),
    };

    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("duration must be positive: '{input}'"));
    }

    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{input}': {e}"))
}

/// Serde helper storing a `Duration` as floating-point seconds.
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FIXTURE_CA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../ldap-monitor/tests/fixtures/ca.pem");

    #[test]
    fn test_parse_minimal_config() {
        let config = ExporterConfig::parse("{}").unwrap();

        assert_eq!(config.ldap.address, "localhost:389");
        assert_eq!(config.ldap.timeout_secs, 10);
        assert_eq!(config.prometheus.listen, ":9330");
        assert_eq!(config.prometheus.path, "/metrics");
        assert_eq!(config.prometheus.prefix, "openldap");
        assert_eq!(config.scrape.interval, Duration::from_secs(30));
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            ldap: {
                address: "ldap.example.com:636",
                username: "cn=monitor,dc=example,dc=com",
                password: "secret",
                tls: true,
                skip_verify: true,
                timeout_secs: 5,
            },
            prometheus: {
                listen: "127.0.0.1:9331",
                path: "/ldap/metrics",
                prefix: "ldap",
                default_labels: { instance: "ldap01" },
            },
            scrape: { interval_secs: 15 },
            logging: { level: "debug", format: "json" },
        }"#;

        let config = ExporterConfig::parse(json).unwrap();

        assert_eq!(config.ldap.address, "ldap.example.com:636");
        assert!(config.ldap.tls);
        assert_eq!(config.prometheus.prefix, "ldap");
        assert_eq!(
            config.prometheus.default_labels.get("instance"),
            Some(&"ldap01".to_string())
        );
        assert_eq!(config.scrape.interval, Duration::from_secs(15));
        assert_eq!(config.logging.format, LogFormat::Json);

        let server = config.server_config().unwrap();
        assert_eq!(server.transport(), TransportMode::Tls);
        assert!(!server.verify_tls());
        assert_eq!(server.timeout(), Duration::from_secs(5));
        assert_eq!(
            server.credentials().unwrap().username,
            "cn=monitor,dc=example,dc=com"
        );
    }

    #[test]
    fn test_fractional_interval() {
        let config = ExporterConfig::parse("{ scrape: { interval_secs: 0.5 } }").unwrap();
        assert_eq!(config.scrape.interval, Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ ldap: {{ address: \"10.0.0.5:389\" }} }}").unwrap();

        let config = ExporterConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.ldap.address, "10.0.0.5:389");
    }

    #[test]
    fn test_load_missing_file() {
        let result = ExporterConfig::load_from_file("/nonexistent/exporter.json5");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_validate_tls_modes_exclusive() {
        let result = ExporterConfig::parse("{ ldap: { start_tls: true, tls: true } }");
        assert!(result.unwrap_err().to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_validate_malformed_ldap_address() {
        let result = ExporterConfig::parse(r#"{ ldap: { address: "no-port" } }"#);
        assert!(matches!(result, Err(ConfigError::Ldap(_))));
    }

    #[test]
    fn test_validate_invalid_path() {
        let result = ExporterConfig::parse(r#"{ prometheus: { path: "metrics" } }"#);
        assert!(result.unwrap_err().to_string().contains("must start with /"));
    }

    #[test]
    fn test_validate_zero_interval() {
        assert!(ExporterConfig::parse("{ scrape: { interval_secs: 0 } }").is_err());
    }

    #[test]
    fn test_listen_addr_bare_port() {
        let config = ExporterConfig::default();
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:9330".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_listen_addr_invalid() {
        let mut config = ExporterConfig::default();
        config.prometheus.listen = "not an address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = ExporterConfig::default();
        config
            .apply_overrides(Overrides {
                prom_addr: Some("127.0.0.1:9999".to_string()),
                ldap_addr: Some("ldap01:389".to_string()),
                ldap_user: Some("cn=admin".to_string()),
                ldap_pass: Some("pw".to_string()),
                start_tls: true,
                interval: Some(Duration::from_secs(60)),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.prometheus.listen, "127.0.0.1:9999");
        assert_eq!(config.ldap.address, "ldap01:389");
        assert_eq!(config.scrape.interval, Duration::from_secs(60));

        let server = config.server_config().unwrap();
        assert_eq!(server.transport(), TransportMode::StartTls);
        assert_eq!(server.host(), "ldap01");
        assert_eq!(server.credentials().unwrap().password, "pw");
    }

    #[test]
    fn test_override_conflicting_tls_flags() {
        let mut config = ExporterConfig::parse("{ ldap: { tls: true } }").unwrap();
        let result = config.apply_overrides(Overrides {
            start_tls: true,
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_server_config_with_ca() {
        let mut config = ExporterConfig::default();
        config.ldap.ca_cert = Some(FIXTURE_CA.to_string());
        config.ldap.start_tls = true;

        let server = config.server_config().unwrap();
        assert!(server.ca_cert().is_some());
    }

    #[test]
    fn test_server_config_unreadable_ca() {
        let mut config = ExporterConfig::default();
        config.ldap.ca_cert = Some("/nonexistent/ca.pem".to_string());

        let err = config.server_config().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Ldap(ldap_monitor::ConfigError::CaCertRead { .. })
        ));
    }

    #[test]
    fn test_server_config_anonymous() {
        let config = ExporterConfig::default();
        let server = config.server_config().unwrap();
        assert!(server.credentials().is_none());
        assert_eq!(server.transport(), TransportMode::Plain);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let config = ExporterConfig::parse(r#"{ logging: { level: "WARN" } }"#).unwrap();
        assert_eq!(config.logging.level, "WARN");

        let result = ExporterConfig::parse(r#"{ logging: { level: "verbose" } }"#);
        assert!(result.unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_override_invalid_log_level() {
        let mut config = ExporterConfig::default();
        let result = config.apply_overrides(Overrides {
            log_level: Some("loud".to_string()),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
