//! Error types for reaching the monitored server.

use std::time::Duration;

use thiserror::Error;

/// Startup configuration errors. Fatal: the exporter never starts scraping.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid LDAP address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Failed to read CA certificate '{path}': {source}")]
    CaCertRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid CA certificate '{path}': {source}")]
    CaCertParse {
        path: String,
        #[source]
        source: native_tls::Error,
    },
}

/// Failure to establish an authenticated connection. Recoverable per cycle.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection to {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: ldap3::LdapError,
    },

    #[error("Failed to set up TLS for {target}: {source}")]
    Tls {
        target: String,
        #[source]
        source: native_tls::Error,
    },

    #[error("Bind as '{user}' to {target} failed: {source}")]
    Bind {
        target: String,
        user: String,
        #[source]
        source: ldap3::LdapError,
    },

    #[error("Bind as '{user}' to {target} timed out after {after:?}")]
    BindTimeout {
        target: String,
        user: String,
        after: Duration,
    },
}

impl ConnectError {
    /// Name of the step that failed, for logs and self-metrics.
    pub fn step(&self) -> &'static str {
        match self {
            ConnectError::Bind { .. } | ConnectError::BindTimeout { .. } => "bind",
            _ => "connect",
        }
    }

    /// Whether the network connection itself was established before the failure.
    pub fn dialed(&self) -> bool {
        matches!(
            self,
            ConnectError::Bind { .. } | ConnectError::BindTimeout { .. }
        )
    }
}

/// Failure of the monitoring search on a live connection. Recoverable per cycle.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Search of '{base}' timed out after {after:?}")]
    Timeout { base: String, after: Duration },

    #[error("Search of '{base}' failed: {source}")]
    Transport {
        base: String,
        #[source]
        source: ldap3::LdapError,
    },

    #[error("Search of '{base}' rejected by server: {source}")]
    Rejected {
        base: String,
        #[source]
        source: ldap3::LdapError,
    },
}

/// Anything that can go wrong fetching monitoring entries in one cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl FetchError {
    /// Name of the step that failed: "connect", "bind" or "query".
    pub fn step(&self) -> &'static str {
        match self {
            FetchError::Connect(e) => e.step(),
            FetchError::Query(_) => "query",
        }
    }

    /// Whether the network connection was established.
    pub fn dialed(&self) -> bool {
        match self {
            FetchError::Connect(e) => e.dialed(),
            FetchError::Query(_) => true,
        }
    }

    /// Whether authentication succeeded (or was never needed).
    pub fn bound(&self) -> bool {
        matches!(self, FetchError::Query(_))
    }
}
