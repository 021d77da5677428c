//! sniproxy/src/listener.rs
//! Assembles a runtime [`Listener`] — sniffer, backend table, and per-listener
//! flags — from a validated [`crate::config::ListenerConfig`]. Grounded on
//! how the teacher builds its own per-listener runtime options out of parsed
//! config in `state.rs`.

use crate::backend::{Address, Backend, BackendFlags, BackendTable};
use crate::config::{ListenerConfig, ProtocolKind};
use crate::error::ConfigError;
use crate::resolver::Resolver;
use crate::sniffer::{HttpSniffer, Sniffer, TlsSniffer};
use std::net::IpAddr;

/// Immutable after startup (SPEC_FULL.md §3): one bound socket's worth of
/// routing policy, shared read-only by every Connection it accepts.
pub struct Listener {
    pub name: String,
    pub sniffer: Box<dyn Sniffer>,
    pub backends: BackendTable,
    pub transparent_proxy: bool,
    pub log_bad_requests: bool,
    pub source_address: Option<IpAddr>,
    pub resolver: Resolver,
    /// The port this listener itself accepts on — the CONNECT port a SOCKS5
    /// backend receives in place of the real destination port (SPEC_FULL.md
    /// §4.E), filled in once the socket is actually bound.
    pub bind_port: u16,
}

fn parse_source_address(
    listener_name: &str,
    value: &Option<String>,
) -> Result<Option<IpAddr>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => raw
            .parse::<IpAddr>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidAddress {
                listener: listener_name.to_string(),
                address: raw.clone(),
                reason: "expected a bare IP address".to_string(),
            }),
    }
}

fn build_backend(
    listener_name: &str,
    index: usize,
    pattern: &str,
    address: &str,
    use_proxy_header: bool,
    use_proxy_socks5: bool,
    use_proxy_socks5_remote_resolv: bool,
    source_address: &Option<String>,
) -> Result<Backend, ConfigError> {
    let parsed_address = Address::parse(address).ok_or_else(|| ConfigError::InvalidAddress {
        listener: listener_name.to_string(),
        address: address.to_string(),
        reason: "expected host:port".to_string(),
    })?;
    let flags = BackendFlags {
        use_proxy_header,
        use_proxy_socks5,
        use_proxy_socks5_remote_resolv,
        source_address: parse_source_address(listener_name, source_address)?,
    };
    Backend::new(pattern, parsed_address, flags).map_err(|source| ConfigError::InvalidPattern {
        listener: listener_name.to_string(),
        index,
        pattern: pattern.to_string(),
        source,
    })
}

impl Listener {
    pub fn from_config(cfg: &ListenerConfig, resolver: Resolver) -> Result<Listener, ConfigError> {
        let sniffer: Box<dyn Sniffer> = match cfg.protocol {
            ProtocolKind::Tls => Box::new(TlsSniffer),
            ProtocolKind::Http => Box::new(HttpSniffer::default()),
        };

        let mut entries = Vec::with_capacity(cfg.backends.len());
        for (index, backend) in cfg.backends.iter().enumerate() {
            let pattern = backend.pattern.as_deref().unwrap_or("");
            entries.push(build_backend(
                &cfg.address,
                index,
                pattern,
                &backend.address,
                backend.use_proxy_header,
                backend.use_proxy_socks5,
                backend.use_proxy_socks5_remote_resolv,
                &backend.source_address,
            )?);
        }

        let fallback = match &cfg.fallback {
            Some(fallback) => Some(build_backend(
                &cfg.address,
                usize::MAX,
                ".*",
                &fallback.address,
                cfg.fallback_use_proxy_header,
                fallback.use_proxy_socks5,
                fallback.use_proxy_socks5_remote_resolv,
                &fallback.source_address,
            )?),
            None => None,
        };

        Ok(Listener {
            name: cfg.address.clone(),
            sniffer,
            backends: BackendTable::new(entries, fallback),
            transparent_proxy: cfg.transparent_proxy,
            log_bad_requests: cfg.log_bad_requests,
            source_address: parse_source_address(&cfg.address, &cfg.source_address)?,
            resolver,
            bind_port: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn listener_config() -> ListenerConfig {
        ListenerConfig {
            address: "0.0.0.0:443".to_string(),
            protocol: ProtocolKind::Tls,
            fallback: Some(BackendConfig {
                pattern: None,
                address: "127.0.0.1:9443".to_string(),
                ..Default::default()
            }),
            fallback_use_proxy_header: false,
            transparent_proxy: false,
            log_bad_requests: true,
            source_address: None,
            backends: vec![BackendConfig {
                pattern: Some("^a\\.test$".to_string()),
                address: "127.0.0.1:8443".to_string(),
                use_proxy_header: true,
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn builds_a_working_backend_table_from_config() {
        let resolver = Resolver::from_system_config().unwrap();
        let listener = Listener::from_config(&listener_config(), resolver).unwrap();
        match listener.backends.lookup(Some("a.test")) {
            crate::backend::LookupResult::Matched(b) => assert!(b.flags.use_proxy_header),
            crate::backend::LookupResult::NoRoute => panic!("expected a.test to match"),
        }
        match listener.backends.lookup(Some("unrelated.test")) {
            crate::backend::LookupResult::Matched(_) => {}
            crate::backend::LookupResult::NoRoute => panic!("expected the fallback to match"),
        }
    }

    #[tokio::test]
    async fn rejects_an_unparseable_source_address() {
        let mut cfg = listener_config();
        cfg.source_address = Some("not-an-ip".to_string());
        let resolver = Resolver::from_system_config().unwrap();
        let result = Listener::from_config(&cfg, resolver);
        assert!(matches!(result, Err(ConfigError::InvalidAddress { .. })));
    }
}
