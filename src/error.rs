//! sniproxy/src/error.rs
//! Typed error hierarchy for the proxy core.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the byte buffer (component A).
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer is full, {len} of {capacity} bytes in use")]
    Full { len: usize, capacity: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a protocol sniffer's `parse` call, folded into one error type
/// so `ConnectionError` can wrap it uniformly; `NeedMore` is not an error and
/// is represented separately in [`crate::sniffer::ParseResult`].
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("request carries no SNI/Host hostname")]
    NoHostname,
    #[error("malformed {protocol} request: {detail}")]
    Malformed {
        protocol: &'static str,
        detail: String,
    },
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no backend matched \"{hostname}\" and no fallback is configured")]
    NoRoute { hostname: String },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("DNS resolution of \"{name}\" failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },
    #[error("DNS resolution of \"{name}\" returned no addresses")]
    NoAddresses { name: String },
    #[error("DNS resolution of \"{name}\" was cancelled")]
    Cancelled { name: String },
}

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("SOCKS5 proxy {proxy} refused all offered authentication methods (reply {reply:#04x})")]
    MethodRejected { proxy: SocketAddr, reply: u8 },
    #[error("SOCKS5 proxy {proxy} rejected the CONNECT request (reply {reply:#04x})")]
    ConnectRejected { proxy: SocketAddr, reply: u8 },
    #[error("SOCKS5 proxy {proxy} sent an unexpected reply")]
    Protocol { proxy: SocketAddr },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors the connection state machine can raise; every variant is handled
/// locally by aborting the one connection (see SPEC_FULL.md §7) except
/// [`ConnectionError::Invariant`], which is a bug.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Sniff(#[from] SniffError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Socks5(#[from] Socks5Error),
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("listener {listener} backend #{index} has an invalid regex \"{pattern}\": {source}")]
    InvalidPattern {
        listener: String,
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("listener {listener} has an invalid address \"{address}\": {reason}")]
    InvalidAddress {
        listener: String,
        address: String,
        reason: String,
    },
    #[error("config declares no listeners")]
    NoListeners,
}
