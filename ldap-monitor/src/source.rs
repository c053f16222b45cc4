//! Per-cycle access to monitoring entries.

use async_trait::async_trait;
use tracing::debug;

use crate::config::ServerConfig;
use crate::connection::MonitorConnection;
use crate::error::FetchError;
use crate::query::MonitoringEntry;

/// Something that can produce the current monitoring entries of a server.
///
/// Each call to [`fetch`](Self::fetch) is independent: implementations must not
/// carry connections or partial results from one call to the next.
#[async_trait]
pub trait MonitorSource: Send + Sync {
    /// Human-readable target, used in logs.
    fn target(&self) -> String;

    /// Whether fetching involves an authenticated bind.
    fn authenticates(&self) -> bool {
        false
    }

    /// Connect, query the monitoring subtree and disconnect.
    async fn fetch(&self) -> Result<Vec<MonitoringEntry>, FetchError>;
}

/// Reads `cn=Monitor` over a fresh LDAP connection on every fetch.
#[derive(Debug, Clone)]
pub struct LdapMonitorSource {
    config: ServerConfig,
}

impl LdapMonitorSource {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[async_trait]
impl MonitorSource for LdapMonitorSource {
    fn target(&self) -> String {
        self.config.url()
    }

    fn authenticates(&self) -> bool {
        self.config.credentials().is_some()
    }

    async fn fetch(&self) -> Result<Vec<MonitoringEntry>, FetchError> {
        let mut connection = MonitorConnection::open(&self.config).await?;

        let result = connection.search_monitor().await;
        connection.close().await;

        let entries = result?;
        debug!(server = %self.config.url(), entries = entries.len(), "Fetched monitor entries");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_authenticates_only_with_username() {
        let anonymous = LdapMonitorSource::new(ServerConfig::new("localhost", 389));
        assert!(!anonymous.authenticates());

        let bound = LdapMonitorSource::new(
            ServerConfig::new("localhost", 389).with_credentials("cn=monitor", "secret"),
        );
        assert!(bound.authenticates());
        assert_eq!(bound.target(), "ldap://localhost:389");
    }

    #[tokio::test]
    async fn test_fetch_unreachable_is_connect_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let source = LdapMonitorSource::new(
            ServerConfig::new("127.0.0.1", port).with_timeout(Duration::from_secs(2)),
        );

        let err = source.fetch().await.unwrap_err();
        assert_eq!(err.step(), "connect");
        assert!(!err.dialed());
    }
}
