//! sniproxy/src/main.rs
//! Process entry point (SPEC_FULL.md §6.K): loads config, binds every
//! listener, and spawns one accept loop per listener plus a background idle
//! sweeper. Shutdown is cooperative: `ctrl_c` asks every live connection to
//! close and waits briefly for the registry to drain before exiting.

use sniproxy::access_log::AccessLog;
use sniproxy::config::Config;
use sniproxy::connection::{ConnectionOptions, handle_connection};
use sniproxy::listener::Listener;
use sniproxy::logging;
use sniproxy::registry::Registry;
use sniproxy::resolver::Resolver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener as TokioTcpListener;

fn parse_args() -> anyhow::Result<(PathBuf, String)> {
    let mut config_path = None;
    let mut log_level = "info".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--log-level" => {
                log_level = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--log-level expects a value"))?;
            }
            other => config_path = Some(PathBuf::from(other)),
        }
    }
    let config_path = config_path.ok_or_else(|| anyhow::anyhow!("usage: sniproxy <config-file> [--log-level <directive>]"))?;
    Ok((config_path, log_level))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config_path, log_level) = parse_args()?;
    logging::init_logging(&log_level);

    let config = Config::load(&config_path)?;
    let resolver = Resolver::from_system_config()?;
    let registry = Arc::new(Registry::new());
    let access_log = Arc::new(match &config.access_log {
        None => AccessLog::disabled(),
        Some(target) if target == "stdout" => AccessLog::to_stdout(),
        Some(path) => AccessLog::to_file(std::path::Path::new(path))?,
    });
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let buffer_capacity = config.buffer_capacity;

    let mut accept_tasks = Vec::new();
    for listener_config in &config.listeners {
        let mut listener = Listener::from_config(listener_config, resolver.clone())?;
        let tcp_listener = TokioTcpListener::bind(&listener_config.address).await?;
        listener.bind_port = tcp_listener.local_addr()?.port();
        let listener = Arc::new(listener);

        tracing::info!(address = %listener_config.address, protocol = ?listener_config.protocol, "listener bound");

        let registry = registry.clone();
        let access_log = access_log.clone();
        accept_tasks.push(tokio::spawn(async move {
            loop {
                let (inbound, client_addr) = match tcp_listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let listener = listener.clone();
                let registry = registry.clone();
                let access_log = access_log.clone();
                tokio::spawn(async move {
                    handle_connection(
                        listener,
                        inbound,
                        client_addr,
                        registry,
                        access_log,
                        ConnectionOptions {
                            idle_timeout,
                            buffer_capacity,
                        },
                    )
                    .await;
                });
            }
        }));
    }

    let sweeper_registry = registry.clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            sweeper_registry.sweep_idle(idle_timeout);
        }
    });

    #[cfg(unix)]
    {
        let dump_registry = registry.clone();
        tokio::spawn(async move {
            let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
                Ok(s) => s,
                Err(_) => return,
            };
            loop {
                signal.recv().await;
                tracing::info!("connection dump requested\n{}", dump_registry.dump());
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down, draining {} live connections", registry.len());
    registry.shutdown_all();
    tokio::time::sleep(Duration::from_secs(2)).await;

    sweeper.abort();
    for task in accept_tasks {
        task.abort();
    }

    Ok(())
}
