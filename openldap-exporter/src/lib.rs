//! Prometheus exporter for OpenLDAP `cn=Monitor` statistics.
//!
//! On a fixed interval the exporter opens a fresh connection to the directory
//! server, reads the monitor subtree, maps the entries it knows to metric
//! samples and atomically replaces the registry snapshot. The HTTP endpoint
//! serializes whatever snapshot is current and never triggers a scrape.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  slapd          │────>│    Scheduler    │────>│    Registry     │────>│   HTTP Server   │
//! │  (cn=Monitor)   │     │  (map, update)  │     │   (snapshot)    │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! openldap-exporter --ldap-addr ldap.example.com:389 --ldap-use-start-tls
//! openldap-exporter --config exporter.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod mapping;
pub mod registry;
pub mod sample;
pub mod scraper;

pub use config::ExporterConfig;
pub use http::ExpositionServer;
pub use mapping::{MappingWarning, MetricMapper};
pub use registry::{MetricsRegistry, SharedRegistry};
pub use sample::{MetricKind, MetricSample, MetricsSnapshot};
pub use scraper::{ScrapeError, ScrapeScheduler};
