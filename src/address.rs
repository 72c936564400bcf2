//! Server addresses and failover pools
//!
//! `ServerActive` lists clusters separated by `,`; addresses within one
//! cluster are separated by `;` and share one [`AddressPool`]. Each pool is
//! read by the refresh and delivery paths and rotated on failure, so its
//! state sits behind a mutex.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

/// Port used for active checks when none is given
pub const DEFAULT_ACTIVE_PORT: u16 = 10051;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty address in \"{0}\"")]
    Empty(String),

    #[error("invalid port in address \"{0}\"")]
    InvalidPort(String),

    #[error("invalid address \"{0}\"")]
    Invalid(String),

    #[error("address \"{0}\" specified more than once")]
    Duplicate(String),
}

/// A candidate endpoint; `revision` is non-zero only for server redirects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub revision: u64,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            revision: 0,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    pub fn parse(text: &str, default_port: u16) -> Result<Self, AddressError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddressError::Empty(text.to_string()));
        }

        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressError::Invalid(text.to_string()))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(AddressError::Invalid(text.to_string())),
                },
            }
        } else if text.matches(':').count() > 1 {
            // bare IPv6 without brackets
            (text, None)
        } else {
            match text.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(AddressError::Invalid(text.to_string()));
        }

        let port = match port {
            None => default_port,
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| AddressError::InvalidPort(text.to_string()))?,
        };

        Ok(Self::new(host, port))
    }

    pub fn is_redirect(&self) -> bool {
        self.revision != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a `ServerActive`-style list into clusters
pub fn parse_server_active(text: &str, default_port: u16) -> Result<Vec<Vec<Address>>, AddressError> {
    let mut seen = HashSet::new();
    let mut clusters = Vec::new();

    if text.trim().is_empty() {
        return Ok(clusters);
    }

    for cluster in text.split(',') {
        let mut addresses = Vec::new();
        for entry in cluster.split(';') {
            let address = Address::parse(entry, default_port)?;
            if !seen.insert((address.host.to_ascii_lowercase(), address.port)) {
                return Err(AddressError::Duplicate(address.to_string()));
            }
            addresses.push(address);
        }
        clusters.push(addresses);
    }

    Ok(clusters)
}

/// Ordered failover candidates for one destination
#[derive(Debug)]
pub struct AddressPool {
    addresses: Mutex<VecDeque<Address>>,
}

impl AddressPool {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            addresses: Mutex::new(addresses.into_iter().collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Address>> {
        self.addresses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current candidate
    pub fn get(&self) -> Option<Address> {
        self.lock().front().cloned()
    }

    /// Move past the current candidate after a failure
    ///
    /// A failed redirect is forgotten; a static address moves to the back.
    pub fn next(&self) -> Option<Address> {
        let mut addresses = self.lock();
        if let Some(head) = addresses.pop_front() {
            if head.is_redirect() {
                debug!("dropping failed redirect to {}", head);
            } else {
                addresses.push_back(head);
            }
        }
        addresses.front().cloned()
    }

    /// Put a server-issued redirect at the front of the pool
    ///
    /// Returns `false` when the current redirect carries a newer revision.
    pub fn add_redirect(&self, host: impl Into<String>, port: u16, revision: u64) -> bool {
        let mut addresses = self.lock();

        if let Some(head) = addresses.front() {
            if head.is_redirect() {
                if head.revision > revision {
                    debug!(
                        "ignoring redirect revision {} older than current {}",
                        revision, head.revision
                    );
                    return false;
                }
                addresses.pop_front();
            }
        }

        let redirect = Address {
            host: host.into(),
            port,
            revision,
        };
        debug!("redirected to {} (revision {})", redirect, revision);
        addresses.push_front(redirect);
        true
    }

    /// Drop the active redirect and fall back to the static addresses
    pub fn reset(&self) {
        let mut addresses = self.lock();
        if addresses.front().is_some_and(Address::is_redirect) {
            if let Some(redirect) = addresses.pop_front() {
                debug!("redirect to {} reset", redirect);
            }
        }
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn pool(names: &[&str]) -> AddressPool {
        AddressPool::new(names.iter().map(|n| Address::new(*n, DEFAULT_ACTIVE_PORT)))
    }

    fn hosts(pool: &AddressPool) -> Vec<String> {
        pool.addresses().into_iter().map(|a| a.host).collect()
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(Address::parse("zabbix", 10051).unwrap(), Address::new("zabbix", 10051));
        assert_eq!(Address::parse("10.0.0.1:20051", 10051).unwrap().port, 20051);
        assert_eq!(Address::parse("[::1]:1234", 10051).unwrap(), Address::new("::1", 1234));
        assert_eq!(Address::parse("[::1]", 10051).unwrap().port, 10051);
        assert_eq!(Address::parse("fe80::1", 10051).unwrap().host, "fe80::1");
        assert_matches!(Address::parse("host:0", 1), Err(AddressError::InvalidPort(_)));
        assert_matches!(Address::parse("host:99999", 1), Err(AddressError::InvalidPort(_)));
        assert_matches!(Address::parse(" ", 1), Err(AddressError::Empty(_)));
        assert_matches!(Address::parse("[::1", 1), Err(AddressError::Invalid(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new("::1", 10051).to_string(), "[::1]:10051");
        assert_eq!(Address::new("srv", 80).to_string(), "srv:80");
    }

    #[test]
    fn test_parse_server_active_clusters() {
        let clusters = parse_server_active("a;b:20051,c", DEFAULT_ACTIVE_PORT).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![Address::new("a", 10051), Address::new("b", 20051)]);
        assert_eq!(clusters[1], vec![Address::new("c", 10051)]);

        assert!(parse_server_active("", DEFAULT_ACTIVE_PORT).unwrap().is_empty());
        assert_matches!(
            parse_server_active("a,A:10051", DEFAULT_ACTIVE_PORT),
            Err(AddressError::Duplicate(_))
        );
        assert_matches!(
            parse_server_active("a;;b", DEFAULT_ACTIVE_PORT),
            Err(AddressError::Empty(_))
        );
    }

    #[test]
    fn test_rotation_is_a_cycle() {
        let pool = pool(&["A", "B", "C"]);
        assert_eq!(pool.next().unwrap().host, "B");
        assert_eq!(pool.next().unwrap().host, "C");
        assert_eq!(pool.next().unwrap().host, "A");
        assert_eq!(hosts(&pool), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_older_redirect_is_rejected() {
        let pool = pool(&["A", "B"]);
        assert!(pool.add_redirect("D", 10051, 5));
        assert!(!pool.add_redirect("D2", 10051, 3));
        assert_eq!(pool.get().unwrap().host, "D");

        // equal revision replaces
        assert!(pool.add_redirect("D3", 10051, 5));
        assert_eq!(hosts(&pool), vec!["D3", "A", "B"]);
    }

    #[test]
    fn test_failed_redirect_is_dropped() {
        let pool = pool(&["A", "B"]);
        pool.add_redirect("D", 10051, 1);
        assert_eq!(pool.next().unwrap().host, "A");
        assert_eq!(hosts(&pool), vec!["A", "B"]);
    }

    #[test]
    fn test_reset_only_removes_redirect() {
        let pool = pool(&["A", "B"]);
        pool.reset();
        assert_eq!(hosts(&pool), vec!["A", "B"]);

        pool.add_redirect("D", 10051, 2);
        pool.reset();
        assert_eq!(hosts(&pool), vec!["A", "B"]);
    }
}
