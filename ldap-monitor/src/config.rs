//! Target server configuration.

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default per-operation timeout for connect, bind and search.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the connection to the directory server is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    /// Plain TCP (`ldap://`).
    #[default]
    Plain,
    /// Plain TCP upgraded in-place with the StartTLS extended operation.
    StartTls,
    /// TLS from the first byte (`ldaps://`).
    Tls,
}

impl TransportMode {
    /// URL scheme used to reach the server in this mode.
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportMode::Plain | TransportMode::StartTls => "ldap",
            TransportMode::Tls => "ldaps",
        }
    }

    /// Whether a TLS session is negotiated at all.
    pub fn uses_tls(&self) -> bool {
        !matches!(self, TransportMode::Plain)
    }
}

/// A CA certificate loaded and validated at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaCertificate {
    path: String,
    pem: Vec<u8>,
}

impl CaCertificate {
    /// Read a PEM encoded CA certificate, rejecting files that do not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let pem = std::fs::read(path).map_err(|source| ConfigError::CaCertRead {
            path: display.clone(),
            source,
        })?;

        native_tls::Certificate::from_pem(&pem).map_err(|source| ConfigError::CaCertParse {
            path: display.clone(),
            source,
        })?;

        Ok(Self { path: display, pem })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pem(&self) -> &[u8] {
        &self.pem
    }
}

/// Simple-bind credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to reach and authenticate against the monitored server.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    host: String,
    port: u16,
    ca_cert: Option<CaCertificate>,
    credentials: Option<Credentials>,
    transport: TransportMode,
    verify_tls: bool,
    timeout: Duration,
}

impl ServerConfig {
    /// Create a plain, anonymous configuration for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ca_cert: None,
            credentials: None,
            transport: TransportMode::Plain,
            verify_tls: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a configuration from a `host:port` address.
    pub fn from_addr(addr: &str) -> Result<Self, ConfigError> {
        let (host, port) = parse_addr(addr)?;
        Ok(Self::new(host, port))
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_start_tls(self) -> Self {
        self.with_transport(TransportMode::StartTls)
    }

    pub fn with_ca_cert(mut self, ca_cert: CaCertificate) -> Self {
        self.ca_cert = Some(ca_cert);
        self
    }

    /// Authenticate with a simple bind. An empty username keeps the connection anonymous.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let username = username.into();
        self.credentials = if username.is_empty() {
            None
        } else {
            Some(Credentials {
                username,
                password: password.into(),
            })
        };
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ca_cert(&self) -> Option<&CaCertificate> {
        self.ca_cert.as_ref()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn transport(&self) -> TransportMode {
        self.transport
    }

    pub fn verify_tls(&self) -> bool {
        self.verify_tls
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// LDAP URL for this server, e.g. `ldaps://ldap.example.com:636`.
    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.transport.scheme(), self.host, self.port)
        } else {
            format!("{}://{}:{}", self.transport.scheme(), self.host, self.port)
        }
    }
}

/// Split a `host:port` address. IPv6 hosts must be bracketed (`[::1]:389`).
pub fn parse_addr(addr: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = addr.trim().rsplit_once(':').ok_or_else(|| invalid("missing port"))?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("unterminated IPv6 bracket"))?
    } else if host.contains(':') {
        return Err(invalid("IPv6 hosts must be enclosed in brackets"));
    } else {
        host
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    if port == 0 {
        return Err(invalid("port must be > 0"));
    }

    Ok((host.to_string(), port))
}
