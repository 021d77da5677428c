//! sniproxy/src/access_log.rs
//! The dedicated access-log sink (SPEC_FULL.md §6.I): one line per
//! connection at CLOSED, in the literal format from SPEC_FULL.md §6,
//! independent of the `tracing` diagnostic channel — matching how the
//! distilled C source writes its access log separately from its
//! debug/info/warn logger.

use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub struct AccessLogEntry<'a> {
    pub client: SocketAddr,
    pub listener: &'a str,
    pub server: Option<SocketAddr>,
    pub hostname: Option<&'a str>,
    pub bytes_tx_client: u64,
    pub bytes_tx_server: u64,
    pub bytes_rx_client: u64,
    pub bytes_rx_server: u64,
    pub duration_secs: f64,
}

impl<'a> AccessLogEntry<'a> {
    /// Renders the literal line format:
    /// `<client> -> <listener> -> <server> [<hostname>] <tx_c>/<tx_s> bytes tx <rx_c>/<rx_s> bytes rx <d.ddd> seconds`
    pub fn render(&self) -> String {
        let server = self
            .server
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} -> {} -> {} [{}] {}/{} bytes tx {}/{} bytes rx {:.3} seconds",
            self.client,
            self.listener,
            server,
            self.hostname.unwrap_or(""),
            self.bytes_tx_client,
            self.bytes_tx_server,
            self.bytes_rx_client,
            self.bytes_rx_server,
            self.duration_secs,
        )
    }
}

/// A line-oriented sink. `Stdout` and `File` are the two concrete variants
/// a config can select (SPEC_FULL.md §6.H `access_log`); both are guarded
/// by a `Mutex` since several connection tasks write concurrently.
pub enum AccessLog {
    Disabled,
    Writer(Mutex<Box<dyn std::io::Write + Send>>),
}

impl AccessLog {
    pub fn disabled() -> AccessLog {
        AccessLog::Disabled
    }

    pub fn to_stdout() -> AccessLog {
        AccessLog::Writer(Mutex::new(Box::new(std::io::stdout())))
    }

    pub fn to_file(path: &std::path::Path) -> std::io::Result<AccessLog> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(AccessLog::Writer(Mutex::new(Box::new(file))))
    }

    pub fn write(&self, entry: &AccessLogEntry) {
        if let AccessLog::Writer(sink) = self {
            let line = entry.render();
            if let Ok(mut sink) = sink.lock() {
                let _ = writeln!(sink, "{line}");
            }
        }
    }
}

/// Writes `bytes` to an async stream, used for the synthesized abort
/// message on routing/parse failure (SPEC_FULL.md §4.E "Aborting a
/// connection").
pub async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_the_literal_access_log_format() {
        let entry = AccessLogEntry {
            client: "203.0.113.5:40000".parse().unwrap(),
            listener: "0.0.0.0:443".into(),
            server: Some("10.0.0.3:443".parse().unwrap()),
            hostname: Some("a.test"),
            bytes_tx_client: 517,
            bytes_tx_server: 1200,
            bytes_rx_client: 1200,
            bytes_rx_server: 517,
            duration_secs: 1.234,
        };
        assert_eq!(
            entry.render(),
            "203.0.113.5:40000 -> 0.0.0.0:443 -> 10.0.0.3:443 [a.test] 517/1200 bytes tx 1200/517 bytes rx 1.234 seconds"
        );
    }

    #[test]
    fn empty_hostname_renders_as_bracketed_nothing() {
        let entry = AccessLogEntry {
            client: "203.0.113.5:1".parse().unwrap(),
            listener: "l".into(),
            server: None,
            hostname: None,
            bytes_tx_client: 10,
            bytes_tx_server: 0,
            bytes_rx_client: 0,
            bytes_rx_server: 0,
            duration_secs: 0.0,
        };
        assert!(entry.render().contains("[]"));
    }
}
