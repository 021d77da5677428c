//! sniproxy/src/connection.rs
//! The per-connection state machine (SPEC_FULL.md §4.E): one Tokio task per
//! accepted socket, carrying it through ACCEPTED -> PARSED -> RESOLV{ING,ED}
//! -> CONNECTED -> {CLIENT,SERVER}_CLOSED -> CLOSED. Grounded on the
//! teacher's `handle_conn`/`copy_bidirectional_with_metrics` pair in its own
//! `connection.rs`: one task owns both sockets end to end, and forwarding is
//! a hand-rolled pump rather than `tokio::io::copy_bidirectional`, because
//! byte counts and an idle deadline have to be observed mid-copy.

use crate::access_log::{AccessLogEntry, write_all};
use crate::backend::{Address, Backend, LookupResult};
use crate::buffer::ByteBuffer;
use crate::error::{ConnectionError, RouteError, SniffError};
use crate::listener::Listener;
use crate::metrics;
use crate::registry::Registry;
use crate::resolver::ResolveMode;
use crate::sniffer::ParseResult;
use crate::socks5;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

/// The eleven states a Connection passes through. Not every state needs its
/// own branch in the task below — PROXY_SOCKET_CONNECTED through
/// PROXY_COMMAND_RESPONSE happen inside [`crate::socks5::connect`] as one
/// atomic step — but the task still logs its passage through each coarse
/// phase, which is the part of the machine worth keeping visible from
/// outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Parsed,
    Resolving,
    Resolved,
    Connected,
    ClientClosed,
    ServerClosed,
    Closed,
}

/// Parameters shared by every connection a listener accepts; a thin bundle
/// so `handle_connection`'s signature does not grow a parameter per config
/// knob.
pub struct ConnectionOptions {
    pub idle_timeout: Duration,
    pub buffer_capacity: usize,
}

/// Drives one accepted socket to completion. Never panics on a peer-caused
/// condition: every failure short of a local invariant violation ends the
/// connection, not the process (SPEC_FULL.md §7).
pub async fn handle_connection(
    listener: Arc<Listener>,
    mut inbound: TcpStream,
    client_addr: SocketAddr,
    registry: Arc<Registry>,
    access_log: Arc<crate::access_log::AccessLog>,
    options: ConnectionOptions,
) {
    let started = Instant::now();
    metrics::connection_accepted();
    let handle = registry.insert(listener.name.clone(), client_addr);
    let mut state = ConnState::Accepted;
    tracing::debug!(?state, %client_addr, listener = %listener.name, "connection accepted");

    let result = run(
        &listener,
        &mut inbound,
        client_addr,
        &handle,
        &options,
        &mut state,
        started,
    )
    .await;

    let mut abort_tx_bytes = 0u64;
    if let Err(err) = &result {
        tracing::warn!(%client_addr, listener = %listener.name, error = %err, "connection aborted");
        if listener.log_bad_requests {
            tracing::debug!(%client_addr, error = %err, "bad request detail");
        }
        // Invariant violations are this crate's stand-in for the reference
        // design's "fatal, confined to one connection" assertion failure:
        // no abort message is owed to a peer that triggered a local bug.
        if !matches!(err, ConnectionError::Invariant(_)) {
            let message = listener.sniffer.abort_message();
            if write_all(&mut inbound, message).await.is_ok() {
                abort_tx_bytes = message.len() as u64;
            }
        }
    }

    registry.remove(handle.id);
    metrics::connection_closed();

    let (mut tx_client, rx_client, tx_server, rx_server, server_addr, hostname, duration_secs) = result
        .ok()
        .flatten()
        .unwrap_or((0, 0, 0, 0, None, None, started.elapsed().as_secs_f64()));
    tx_client += abort_tx_bytes;
    access_log.write(&AccessLogEntry {
        client: client_addr,
        listener: &listener.name,
        server: server_addr,
        hostname: hostname.as_deref(),
        bytes_tx_client: tx_client,
        bytes_tx_server: tx_server,
        bytes_rx_client: rx_client,
        bytes_rx_server: rx_server,
        duration_secs,
    });
}

type RunOutcome = Option<(u64, u64, u64, u64, Option<SocketAddr>, Option<String>, f64)>;

async fn run(
    listener: &Arc<Listener>,
    inbound: &mut TcpStream,
    client_addr: SocketAddr,
    handle: &crate::registry::ConnectionHandle,
    options: &ConnectionOptions,
    state: &mut ConnState,
    started: Instant,
) -> Result<RunOutcome, ConnectionError> {
    let mut client_buf = ByteBuffer::with_capacity(options.buffer_capacity);

    let hostname = sniff(listener, inbound, &mut client_buf, handle, options.idle_timeout).await?;
    *state = ConnState::Parsed;
    tracing::debug!(?state, hostname = hostname.as_deref(), "request parsed");
    if let Some(name) = &hostname {
        *handle.hostname.lock().unwrap() = Some(name.clone());
    }

    let backend = match listener.backends.lookup(hostname.as_deref()) {
        LookupResult::Matched(backend) => backend,
        LookupResult::NoRoute => {
            return Err(RouteError::NoRoute {
                hostname: hostname.unwrap_or_default(),
            }
            .into());
        }
    };

    *state = ConnState::Resolving;
    let target = resolve_backend(listener, backend, client_addr).await?;
    *state = ConnState::Resolved;

    let mut outbound = connect_backend(listener, backend, &hostname, client_addr, target).await?;
    *state = ConnState::Connected;
    tracing::debug!(?state, %target, "connected to backend");

    if backend.flags.use_proxy_header {
        // The header's destination half is the listener endpoint the client
        // actually dialed (`getsockname` on the client socket in the C
        // original), not this proxy's own ephemeral source port on the
        // backend-facing leg.
        let listener_addr = inbound.local_addr().unwrap_or(target);
        let header = crate::proxy_header::build_v1_header(client_addr, listener_addr);
        ByteBuffer::write_through(&mut outbound, &header).await?;
    }

    let (tx_client, rx_client, tx_server, rx_server, last_recv) = pump(
        inbound,
        &mut outbound,
        client_buf,
        options.buffer_capacity,
        handle,
        options.idle_timeout,
    )
    .await?;
    *state = ConnState::Closed;

    // SPEC_FULL.md §9 "Access-log duration": measured against the later of
    // the two sides' last activity, not wall-clock time of the pump's own
    // return, so a lingering half-close on one side doesn't inflate it.
    let duration_secs = last_recv
        .map(|t| t.saturating_duration_since(started).as_secs_f64())
        .unwrap_or_else(|| started.elapsed().as_secs_f64());

    Ok(Some((
        tx_client,
        rx_client,
        tx_server,
        rx_server,
        Some(target),
        hostname,
        duration_secs,
    )))
}

/// Reads from the client until the listener's sniffer returns a verdict,
/// honoring both the idle deadline and an operator-requested shutdown.
async fn sniff(
    listener: &Arc<Listener>,
    inbound: &mut TcpStream,
    client_buf: &mut ByteBuffer,
    handle: &crate::registry::ConnectionHandle,
    idle_timeout: Duration,
) -> Result<Option<String>, ConnectionError> {
    loop {
        match listener.sniffer.parse(&client_buf.coalesce()) {
            ParseResult::Hostname { hostname, .. } => return Ok(Some(hostname)),
            ParseResult::NoHostname => return Ok(None),
            ParseResult::Malformed { detail } => {
                return Err(SniffError::Malformed {
                    protocol: listener.sniffer.name(),
                    detail,
                }
                .into());
            }
            ParseResult::NeedMore => {}
        }

        if client_buf.room() == 0 {
            return Err(SniffError::Malformed {
                protocol: listener.sniffer.name(),
                detail: "request exceeds the sniff buffer before a verdict was reached".into(),
            }
            .into());
        }

        tokio::select! {
            biased;
            _ = handle.shutdown_requested() => {
                return Err(ConnectionError::Invariant("shutdown requested while sniffing"));
            }
            result = timeout(idle_timeout, client_buf.recv(inbound)) => {
                let n = result.map_err(|_| ConnectionError::Invariant("idle timeout while sniffing"))??;
                handle.touch();
                if n == 0 {
                    return Err(SniffError::NoHostname.into());
                }
            }
        }
    }
}

fn families_match(a: SocketAddr, b: SocketAddr) -> bool {
    matches!(
        (a, b),
        (SocketAddr::V4(_), SocketAddr::V4(_)) | (SocketAddr::V6(_), SocketAddr::V6(_))
    )
}

async fn resolve_backend(
    listener: &Arc<Listener>,
    backend: &Backend,
    client_addr: SocketAddr,
) -> Result<SocketAddr, ConnectionError> {
    match &backend.address {
        Address::Socket(addr) => Ok(*addr),
        Address::Hostname { host, port } => {
            // Transparent proxy mode constrains resolution to the client's
            // own address family, since IP_TRANSPARENT cannot translate
            // between families (SPEC_FULL.md §4.E).
            let mode = if listener.transparent_proxy {
                match client_addr {
                    SocketAddr::V4(_) => ResolveMode::V4Only,
                    SocketAddr::V6(_) => ResolveMode::V6Only,
                }
            } else {
                ResolveMode::Default
            };
            let handle = listener.resolver.resolve(host.clone(), *port, mode);
            Ok(handle.wait().await.map_err(ConnectionError::from)?)
        }
    }
}

async fn connect_backend(
    listener: &Arc<Listener>,
    backend: &Backend,
    hostname: &Option<String>,
    client_addr: SocketAddr,
    target: SocketAddr,
) -> Result<TcpStream, ConnectionError> {
    if backend.flags.use_proxy_socks5 {
        let name = hostname.clone().unwrap_or_default();
        let stream = socks5::connect(target, &name, listener.bind_port).await?;
        return Ok(stream);
    }

    if listener.transparent_proxy && families_match(client_addr, target) {
        return Ok(connect_transparent(target, client_addr).await?);
    }

    let source = backend.flags.source_address.or(listener.source_address);
    match source {
        None => Ok(TcpStream::connect(target).await?),
        Some(ip) => Ok(connect_from_source(target, ip).await?),
    }
}

/// Binds an ephemeral source port before connecting, retrying a handful of
/// times on `EADDRINUSE` to ride out a transient clash on port 0 under
/// heavy churn (SPEC_FULL.md §4.E "Source-address binding").
async fn connect_from_source(target: SocketAddr, source_ip: std::net::IpAddr) -> std::io::Result<TcpStream> {
    const MAX_ATTEMPTS: u32 = 5;
    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    let mut attempt = 0;
    loop {
        match socket.bind(SocketAddr::new(source_ip, 0)) {
            Ok(()) => break,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse && attempt < MAX_ATTEMPTS => {
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
    socket.connect(target).await
}

/// Binds with `IP_TRANSPARENT` to the client's own source address and
/// connects to `target`, so the backend sees the original client's IP
/// rather than this proxy's. The raw socket option has no portable
/// equivalent in `tokio::net`, so the socket is built and connected with
/// `socket2` on a blocking thread and handed back to the reactor once
/// connected (SPEC_FULL.md §4.E). A failure to set the option is a fatal
/// per-connection error, never silently downgraded to a normal connect.
async fn connect_transparent(target: SocketAddr, client_addr: SocketAddr) -> std::io::Result<TcpStream> {
    let std_stream = tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
        let domain = if target.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        #[cfg(target_os = "linux")]
        socket.set_ip_transparent(true)?;
        socket.bind(&client_addr.into())?;
        socket.connect(&target.into())?;
        Ok(socket.into())
    })
    .await
    .map_err(std::io::Error::other)??;
    std_stream.set_nonblocking(true)?;
    TcpStream::from_std(std_stream)
}

/// The bidirectional byte pump. `client_buf` arrives already holding
/// whatever the sniffer saw — since sniffing never consumes bytes, those
/// same bytes are the first thing replayed to the backend.
async fn pump(
    inbound: &mut TcpStream,
    outbound: &mut TcpStream,
    mut client_buf: ByteBuffer,
    buffer_capacity: usize,
    handle: &crate::registry::ConnectionHandle,
    idle_timeout: Duration,
) -> Result<(u64, u64, u64, u64, Option<Instant>), ConnectionError> {
    let mut server_buf = ByteBuffer::with_capacity(buffer_capacity);
    let mut client_eof = false;
    let mut server_eof = false;

    loop {
        let client_drained = client_eof && client_buf.is_empty();
        let server_drained = server_eof && server_buf.is_empty();
        if client_drained && server_drained {
            break;
        }

        let can_recv_client = !client_eof && client_buf.room() > 0;
        let can_send_client = !client_buf.is_empty();
        let can_recv_server = !server_eof && server_buf.room() > 0;
        let can_send_server = !server_buf.is_empty();

        if !can_recv_client && !can_send_client && !can_recv_server && !can_send_server {
            // Both sides are idle-stalled (buffers full but peer not
            // reading, or both closed with nothing left): nothing left to
            // drive, treat as done.
            break;
        }

        tokio::select! {
            biased;

            _ = handle.shutdown_requested() => {
                break;
            }

            result = client_buf.recv(inbound), if can_recv_client => {
                let n = result?;
                handle.touch();
                if n == 0 { client_eof = true; }
            }

            result = client_buf.send(outbound), if can_send_client => {
                result?;
            }

            result = server_buf.recv(outbound), if can_recv_server => {
                let n = result?;
                handle.touch();
                if n == 0 { server_eof = true; }
            }

            result = server_buf.send(inbound), if can_send_server => {
                result?;
            }

            _ = tokio::time::sleep(idle_timeout) => {
                if handle.idle_for() >= idle_timeout {
                    break;
                }
            }
        }
    }

    metrics::add_bytes_recv(client_buf.rx_bytes());
    metrics::add_bytes_sent(client_buf.tx_bytes());
    metrics::add_bytes_recv(server_buf.rx_bytes());
    metrics::add_bytes_sent(server_buf.tx_bytes());

    let _ = inbound.shutdown().await;
    let _ = outbound.shutdown().await;

    let last_recv = match (client_buf.last_recv_time(), server_buf.last_recv_time()) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    // "tx"/"rx" name the direction bytes crossed the proxy's own wire, not
    // which buffer moved them: server_buf carries bytes outbound *to* the
    // client, client_buf carries bytes outbound *to* the server.
    Ok((
        server_buf.tx_bytes(),
        client_buf.rx_bytes(),
        client_buf.tx_bytes(),
        server_buf.rx_bytes(),
        last_recv,
    ))
}
