//! Client for the OpenLDAP monitoring backend.
//!
//! This crate knows how to reach a directory server and read the entries it
//! publishes under `cn=Monitor`:
//!
//! - [`config`] - target address, transport security and credentials ([`ServerConfig`])
//! - [`connection`] - authenticated, optionally encrypted connections ([`MonitorConnection`])
//! - [`query`] - the monitoring subtree search and its entries ([`MonitoringEntry`])
//! - [`source`] - one-connection-per-fetch access used by the exporter ([`MonitorSource`])
//! - [`error`] - error types
//!
//! # Example
//!
//! ```ignore
//! use ldap_monitor::{LdapMonitorSource, MonitorSource, ServerConfig};
//!
//! let config = ServerConfig::from_addr("ldap.example.com:389")?.with_start_tls();
//! let source = LdapMonitorSource::new(config);
//! let entries = source.fetch().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod query;
pub mod source;

pub use config::{CaCertificate, Credentials, ServerConfig, TransportMode, parse_addr};
pub use connection::MonitorConnection;
pub use error::{ConfigError, ConnectError, FetchError, QueryError};
pub use query::{ALL_ATTRIBUTES, MONITOR_BASE_DN, MONITOR_FILTER, MonitoringEntry};
pub use source::{LdapMonitorSource, MonitorSource};
