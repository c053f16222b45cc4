//! Connection setup: transport security and authentication.

use std::time::Duration;

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::{Credentials, ServerConfig, TransportMode};
use crate::error::ConnectError;

/// Upper bound on the courtesy unbind sent when closing.
const UNBIND_TIMEOUT: Duration = Duration::from_secs(1);

/// A live, authenticated connection to the monitored server.
///
/// The connection is released when dropped; [`close`](Self::close) additionally
/// sends an unbind first. Every error path in [`open`](Self::open) releases the
/// connection before returning.
pub struct MonitorConnection {
    pub(crate) ldap: Ldap,
    pub(crate) target: String,
    pub(crate) timeout: Duration,
    driver: JoinHandle<()>,
}

impl MonitorConnection {
    /// Connect to the server described by `config` and authenticate.
    ///
    /// Plain mode opens a TCP connection, StartTLS upgrades it in place and TLS
    /// mode negotiates TLS immediately. A configured username triggers a simple
    /// bind; otherwise the connection stays anonymous.
    pub async fn open(config: &ServerConfig) -> Result<Self, ConnectError> {
        let target = config.url();
        let settings = connection_settings(config, &target)?;

        trace!(server = %target, mode = ?config.transport(), "Connecting");

        let (conn, ldap) = timeout(
            config.timeout(),
            LdapConnAsync::with_settings(settings, &target),
        )
        .await
        .map_err(|_| ConnectError::Timeout {
            target: target.clone(),
            after: config.timeout(),
        })?
        .map_err(|source| ConnectError::Connect {
            target: target.clone(),
            source,
        })?;

        let driver_target = target.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                debug!(server = %driver_target, error = %e, "LDAP connection closed with error");
            }
        });

        let mut connection = Self {
            ldap,
            target,
            timeout: config.timeout(),
            driver,
        };

        if let Some(credentials) = config.credentials() {
            if let Err(e) = connection.bind(credentials).await {
                connection.close().await;
                return Err(e);
            }
        }

        Ok(connection)
    }

    async fn bind(&mut self, credentials: &Credentials) -> Result<(), ConnectError> {
        let target = self.target.clone();
        let user = credentials.username.clone();
        let bind_error = |source| ConnectError::Bind {
            target: target.clone(),
            user: user.clone(),
            source,
        };

        let result = timeout(
            self.timeout,
            self.ldap
                .simple_bind(&credentials.username, &credentials.password),
        )
        .await
        .map_err(|_| ConnectError::BindTimeout {
            target: target.clone(),
            user: user.clone(),
            after: self.timeout,
        })?
        .map_err(bind_error)?;

        result.success().map_err(bind_error)?;

        debug!(server = %self.target, user = %credentials.username, "Bound");
        Ok(())
    }

    /// Target URL this connection was opened against.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Unbind and release the connection.
    pub async fn close(mut self) {
        if let Err(e) = timeout(UNBIND_TIMEOUT, self.ldap.unbind()).await.unwrap_or(Ok(())) {
            trace!(server = %self.target, error = %e, "Unbind failed");
        }
    }
}

impl Drop for MonitorConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Build ldap3 settings for the configured transport mode.
fn connection_settings(
    config: &ServerConfig,
    target: &str,
) -> Result<LdapConnSettings, ConnectError> {
    let mut settings = LdapConnSettings::new()
        .set_conn_timeout(config.timeout())
        .set_starttls(config.transport() == TransportMode::StartTls)
        .set_no_tls_verify(!config.verify_tls());

    if config.transport().uses_tls() {
        settings = settings.set_connector(tls_connector(config, target)?);
    }

    Ok(settings)
}

/// TLS connector trusting the configured CA (in addition to the system roots).
fn tls_connector(
    config: &ServerConfig,
    target: &str,
) -> Result<native_tls::TlsConnector, ConnectError> {
    let tls_error = |source| ConnectError::Tls {
        target: target.to_string(),
        source,
    };

    let mut builder = native_tls::TlsConnector::builder();

    if let Some(ca) = config.ca_cert() {
        let cert = native_tls::Certificate::from_pem(ca.pem()).map_err(tls_error)?;
        builder.add_root_certificate(cert);
    }

    if !config.verify_tls() {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    builder.build().map_err(tls_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaCertificate;
    use tokio::net::TcpListener;

    const FIXTURE_CA: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/ca.pem");

    /// A listener that accepts connections and never answers.
    async fn silent_server() -> (u16, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (port, handle)
    }

    #[test]
    fn test_tls_connector_with_ca() {
        let config = ServerConfig::new("localhost", 636)
            .with_transport(TransportMode::Tls)
            .with_ca_cert(CaCertificate::load(FIXTURE_CA).unwrap());

        assert!(tls_connector(&config, "ldaps://localhost:636").is_ok());
    }

    #[test]
    fn test_tls_connector_skip_verify() {
        let config = ServerConfig::new("localhost", 636)
            .with_transport(TransportMode::Tls)
            .with_verify_tls(false);

        assert!(tls_connector(&config, "ldaps://localhost:636").is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Grab a free port, then close it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let config = ServerConfig::new("127.0.0.1", port).with_timeout(Duration::from_secs(2));
        let result = MonitorConnection::open(&config).await;

        assert!(matches!(result, Err(ConnectError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_bind_timeout_against_silent_server() {
        let (port, server) = silent_server().await;

        let config = ServerConfig::new("127.0.0.1", port)
            .with_credentials("cn=admin,dc=example,dc=com", "secret")
            .with_timeout(Duration::from_millis(200));
        let result = MonitorConnection::open(&config).await;

        match result {
            Err(e @ ConnectError::BindTimeout { .. }) => assert_eq!(e.step(), "bind"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("bind against a silent server should not succeed"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn test_start_tls_timeout_against_silent_server() {
        let (port, server) = silent_server().await;

        let config = ServerConfig::new("127.0.0.1", port)
            .with_start_tls()
            .with_timeout(Duration::from_millis(200));
        let result = MonitorConnection::open(&config).await;

        // Either our deadline or the client's own connect timeout may fire first.
        match result {
            Err(e) => assert_eq!(e.step(), "connect"),
            Ok(_) => panic!("StartTLS against a silent server should not succeed"),
        }

        server.abort();
    }
}
