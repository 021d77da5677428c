//! sniproxy/src/backend.rs
//! The ordered regex routing table (SPEC_FULL.md §4.C), grounded on the
//! `(pattern, address, flags)` backend entries of the distilled source and
//! on the regex-driven rule tables elsewhere in the retrieval pack.

use regex::Regex;
use std::net::{IpAddr, SocketAddr};

/// Either a resolved socket address or a hostname whose resolution is
/// deferred to the resolver shim (component D).
#[derive(Debug, Clone)]
pub enum Address {
    Socket(SocketAddr),
    Hostname { host: String, port: u16 },
}

impl Address {
    /// Parses `host:port`; a numeric host parses directly to a `SocketAddr`,
    /// anything else is deferred DNS.
    pub fn parse(s: &str) -> Option<Address> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(Address::Socket(addr));
        }
        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Address::Hostname {
            host: host.to_string(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(a) => a.port(),
            Address::Hostname { port, .. } => *port,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendFlags {
    pub use_proxy_header: bool,
    pub use_proxy_socks5: bool,
    pub use_proxy_socks5_remote_resolv: bool,
    pub source_address: Option<IpAddr>,
}

/// One routing entry: `(pattern, address, flags)`.
pub struct Backend {
    pattern: Regex,
    pub pattern_source: String,
    pub address: Address,
    pub flags: BackendFlags,
}

impl Backend {
    pub fn new(pattern: &str, address: Address, flags: BackendFlags) -> Result<Backend, regex::Error> {
        // Case-insensitive by default, per SPEC_FULL.md §4.C.
        let compiled = Regex::new(&format!("(?i){pattern}"))?;
        Ok(Backend {
            pattern: compiled,
            pattern_source: pattern.to_string(),
            address,
            flags,
        })
    }

    fn matches(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

/// The decision returned by [`BackendTable::lookup`]: a borrowed reference
/// to the winning backend, or an explicit "no route" when neither the table
/// nor the listener's fallback matched.
pub enum LookupResult<'a> {
    Matched(&'a Backend),
    NoRoute,
}

/// An ordered, immutable sequence of [`Backend`] entries plus an optional
/// fallback, owned by the Listener and shared (read-only) across every
/// Connection it accepts.
pub struct BackendTable {
    entries: Vec<Backend>,
    fallback: Option<Backend>,
}

impl BackendTable {
    pub fn new(entries: Vec<Backend>, fallback: Option<Backend>) -> BackendTable {
        BackendTable { entries, fallback }
    }

    /// Returns the FIRST matching entry in insertion order; empty input
    /// matches patterns that accept the empty string (typically wildcard
    /// fallbacks). Falls back to the listener's fallback address if nothing
    /// in `entries` matched, and reports `NoRoute` only if that is absent
    /// too.
    pub fn lookup(&self, name: Option<&str>) -> LookupResult<'_> {
        let name = name.unwrap_or("");
        for backend in &self.entries {
            if backend.matches(name) {
                return LookupResult::Matched(backend);
            }
        }
        match &self.fallback {
            Some(fallback) => LookupResult::Matched(fallback),
            None => LookupResult::NoRoute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(pattern: &str, port: u16) -> Backend {
        Backend::new(
            pattern,
            Address::Socket(format!("127.0.0.1:{port}").parse().unwrap()),
            BackendFlags::default(),
        )
        .unwrap()
    }

    #[test]
    fn first_match_wins_in_insertion_order() {
        let table = BackendTable::new(
            vec![backend("^a\\.test$", 1), backend("^.*\\.test$", 2)],
            None,
        );
        match table.lookup(Some("a.test")) {
            LookupResult::Matched(b) => assert_eq!(b.address.port(), 1),
            LookupResult::NoRoute => panic!("expected a match"),
        }
    }

    #[test]
    fn removing_earlier_entry_cannot_change_later_winner() {
        let full = BackendTable::new(
            vec![backend("^a\\.test$", 1), backend("^b\\.test$", 2)],
            None,
        );
        let without_first = BackendTable::new(vec![backend("^b\\.test$", 2)], None);
        for table in [&full, &without_first] {
            match table.lookup(Some("b.test")) {
                LookupResult::Matched(b) => assert_eq!(b.address.port(), 2),
                LookupResult::NoRoute => panic!("expected b.test to match"),
            }
        }
    }

    #[test]
    fn empty_hostname_matches_wildcard() {
        let table = BackendTable::new(vec![backend(".*", 9)], None);
        match table.lookup(None) {
            LookupResult::Matched(b) => assert_eq!(b.address.port(), 9),
            LookupResult::NoRoute => panic!("wildcard should match empty input"),
        }
    }

    #[test]
    fn falls_back_when_nothing_matches() {
        let table = BackendTable::new(vec![backend("^ok\\.test$", 1)], Some(backend(".*", 2)));
        match table.lookup(Some("nope.test")) {
            LookupResult::Matched(b) => assert_eq!(b.address.port(), 2),
            LookupResult::NoRoute => panic!("expected fallback"),
        }
    }

    #[test]
    fn no_route_without_fallback() {
        let table = BackendTable::new(vec![backend("^ok\\.test$", 1)], None);
        assert!(matches!(table.lookup(Some("nope.test")), LookupResult::NoRoute));
    }

    #[test]
    fn case_insensitive_by_default() {
        let table = BackendTable::new(vec![backend("^example\\.com$", 1)], None);
        assert!(matches!(table.lookup(Some("EXAMPLE.COM")), LookupResult::Matched(_)));
    }

    #[test]
    fn address_parse_numeric_vs_hostname() {
        assert!(matches!(Address::parse("127.0.0.1:8443"), Some(Address::Socket(_))));
        match Address::parse("example.com:443") {
            Some(Address::Hostname { host, port }) => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
            }
            _ => panic!("expected deferred hostname"),
        }
    }
}
