//! Monitoring subtree search.

use std::collections::BTreeMap;

use ldap3::{Scope, SearchEntry};
use tokio::time::timeout;
use tracing::trace;

use crate::connection::MonitorConnection;
use crate::error::QueryError;

/// Base of the monitoring subtree published by OpenLDAP's back-monitor.
pub const MONITOR_BASE_DN: &str = "cn=Monitor";

/// Filter matching every entry under the base.
pub const MONITOR_FILTER: &str = "(objectClass=*)";

/// All user attributes plus all operational attributes.
///
/// The monitor counters (`monitorCounter`, `monitoredInfo`, `monitorOp*`) are
/// operational attributes, so `*` alone would not return them.
pub const ALL_ATTRIBUTES: [&str; 2] = ["*", "+"];

/// One entry of the monitoring subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringEntry {
    /// Distinguished name, as returned by the server.
    pub dn: String,
    /// Attribute name to values, in server order.
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl MonitoringEntry {
    /// Create an entry with no attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute with the given values.
    pub fn with_attribute<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Values of an attribute, looked up case-insensitively.
    ///
    /// Returns an empty slice when the attribute is absent.
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }
}

impl From<SearchEntry> for MonitoringEntry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attributes: entry.attrs.into_iter().collect(),
        }
    }
}

impl MonitorConnection {
    /// Search the whole monitoring subtree and return its entries in server order.
    pub async fn search_monitor(&mut self) -> Result<Vec<MonitoringEntry>, QueryError> {
        let base = MONITOR_BASE_DN.to_string();

        let result = timeout(
            self.timeout,
            self.ldap.search(
                MONITOR_BASE_DN,
                Scope::Subtree,
                MONITOR_FILTER,
                ALL_ATTRIBUTES.to_vec(),
            ),
        )
        .await
        .map_err(|_| QueryError::Timeout {
            base: base.clone(),
            after: self.timeout,
        })?
        .map_err(|source| QueryError::Transport {
            base: base.clone(),
            source,
        })?;

        let (entries, _) = result
            .success()
            .map_err(|source| QueryError::Rejected { base, source })?;

        let entries: Vec<MonitoringEntry> = entries
            .into_iter()
            .map(|e| MonitoringEntry::from(SearchEntry::construct(e)))
            .collect();

        trace!(server = %self.target, entries = entries.len(), "Monitor search complete");
        Ok(entries)
    }
}
